//! Message orchestrator: the per-message pipeline and the event dispatch loop.
//!
//! Pipeline: filter → record → generate → attach response (best effort) → reply, with one
//! fallback reply when sending fails. Each message is handled at most once; nothing is requeued.

use crate::channels::{ChannelRegistry, InboundMessage, TransportEvent};
use crate::filter::MessageFilter;
use crate::responder::ResponseGenerator;
use crate::session::{SessionState, SessionTracker};
use crate::store::Persistence;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Sent when the generated reply could not be delivered.
pub const ERROR_REPLY: &str = "Sorry, something went wrong while processing your message.";

/// How one pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Rejected by the filter.
    Ignored,
    /// Dropped because the session is not connected (only with `require_connected`).
    NotConnected,
    /// The initial record could not be written; no reply was attempted.
    RecordFailed,
    Replied,
    /// The reply failed and the error reply went out instead.
    FallbackReplied,
    /// Both the reply and the error reply failed.
    ReplyFailed,
}

#[derive(Clone)]
pub struct Orchestrator {
    session: Arc<SessionTracker>,
    filter: Arc<MessageFilter>,
    persistence: Persistence,
    responder: ResponseGenerator,
    channels: Arc<ChannelRegistry>,
    require_connected: bool,
}

impl Orchestrator {
    pub fn new(
        session: Arc<SessionTracker>,
        filter: Arc<MessageFilter>,
        persistence: Persistence,
        responder: ResponseGenerator,
        channels: Arc<ChannelRegistry>,
    ) -> Self {
        Self {
            session,
            filter,
            persistence,
            responder,
            channels,
            require_connected: false,
        }
    }

    /// Drop messages that arrive while the session is not connected.
    pub fn require_connected(mut self, yes: bool) -> Self {
        self.require_connected = yes;
        self
    }

    /// Run the full pipeline for one message.
    pub async fn handle_message(&self, msg: InboundMessage) -> Outcome {
        if !self.filter.should_process(&msg).await {
            log::debug!("ignoring {} message from {}", msg.kind, msg.sender);
            return Outcome::Ignored;
        }
        if self.require_connected && self.session.state().await != SessionState::Connected {
            log::debug!("session not connected, dropping message from {}", msg.sender);
            return Outcome::NotConnected;
        }

        log::info!("message from {}: {}", msg.sender, msg.body);

        let record_id = match self.persistence.record_message(&msg).await {
            Ok(id) => id,
            Err(e) => {
                log::error!("failed to record message from {}: {}", msg.sender, e);
                return Outcome::RecordFailed;
            }
        };

        let reply = self.responder.generate(&msg.body).await;

        if let Err(e) = self.persistence.attach_response(record_id, &reply).await {
            log::warn!("failed to store response for record {}: {}", record_id, e);
        }

        match self
            .channels
            .reply(&msg.channel_id, &msg.conversation, &reply)
            .await
        {
            Ok(()) => {
                log::info!("reply sent to {}", msg.sender);
                Outcome::Replied
            }
            Err(e) => {
                log::warn!("reply to {} failed: {}", msg.sender, e);
                match self
                    .channels
                    .reply(&msg.channel_id, &msg.conversation, ERROR_REPLY)
                    .await
                {
                    Ok(()) => Outcome::FallbackReplied,
                    Err(e) => {
                        log::error!("error reply to {} failed too: {}", msg.sender, e);
                        Outcome::ReplyFailed
                    }
                }
            }
        }
    }

    /// Apply a lifecycle event to the session tracker.
    async fn apply_lifecycle(&self, event: TransportEvent) {
        match event {
            TransportEvent::PairingArtifact(artifact) => self.session.on_pairing_artifact(artifact).await,
            TransportEvent::Ready => self.session.on_ready().await,
            TransportEvent::Disconnected(reason) => self.session.on_disconnected(reason).await,
            TransportEvent::Message(_) => {}
        }
    }

    /// Dispatch events until the sender side closes. Lifecycle events are applied in order;
    /// each message gets its own task so slow pipelines do not block later events.
    /// A panicking pipeline is fatal and ends the loop with an error.
    pub async fn run(&self, mut events: mpsc::Receiver<TransportEvent>) -> Result<()> {
        let mut pipelines = JoinSet::new();
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        TransportEvent::Message(msg) => {
                            let this = self.clone();
                            pipelines.spawn(async move { this.handle_message(msg).await });
                        }
                        other => self.apply_lifecycle(other).await,
                    }
                }
                Some(done) = pipelines.join_next(), if !pipelines.is_empty() => {
                    check_pipeline(done)?;
                }
            }
        }
        while let Some(done) = pipelines.join_next().await {
            check_pipeline(done)?;
        }
        log::info!("event stream closed, dispatcher stopped");
        Ok(())
    }
}

fn check_pipeline(done: std::result::Result<Outcome, tokio::task::JoinError>) -> Result<()> {
    match done {
        Ok(outcome) => {
            log::debug!("pipeline finished: {:?}", outcome);
            Ok(())
        }
        Err(e) if e.is_panic() => anyhow::bail!("message pipeline panicked: {}", e),
        Err(e) => {
            log::debug!("pipeline task cancelled: {}", e);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ChannelError, ChannelHandle, ConversationRef};
    use crate::llm::{Generator, LlmError};
    use crate::responder::FALLBACK_REPLY;
    use crate::store::{MessageStore, NewMessage, RecordId, StoreError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        fail_record: bool,
        fail_attach: bool,
        records: Mutex<HashMap<i64, (NewMessage, Option<String>, bool)>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageStore for FakeStore {
        async fn record_message(&self, message: NewMessage) -> Result<RecordId, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_record {
                return Err(StoreError::Closed);
            }
            let mut g = self.records.lock().unwrap();
            let id = g.len() as i64 + 1;
            g.insert(id, (message, None, false));
            Ok(RecordId(id))
        }

        async fn attach_response(&self, id: RecordId, text: &str) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_attach {
                return Err(StoreError::Closed);
            }
            let mut g = self.records.lock().unwrap();
            let rec = g.get_mut(&id.0).ok_or(StoreError::NotFound(id))?;
            rec.1 = Some(text.to_string());
            rec.2 = true;
            Ok(())
        }

        async fn close(&self) {}
    }

    struct FakeGenerator {
        reply: Option<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Generator for FakeGenerator {
        fn name(&self) -> &str {
            "fake"
        }

        async fn generate(&self, _prompt: &str) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .map(String::from)
                .ok_or_else(|| LlmError::Api("boom".to_string()))
        }
    }

    /// Fails the first `failures` sends, records every attempt.
    struct FakeChannel {
        failures: usize,
        attempts: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChannelHandle for FakeChannel {
        fn id(&self) -> &str {
            "fake"
        }

        fn stop(&self) {}

        async fn reply(&self, conversation: &ConversationRef, text: &str) -> Result<(), ChannelError> {
            let mut g = self.attempts.lock().unwrap();
            g.push((conversation.chat_id.clone(), text.to_string()));
            if g.len() <= self.failures {
                Err(ChannelError::Api("transport down".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        session: Arc<SessionTracker>,
        store: Arc<FakeStore>,
        generator: Arc<FakeGenerator>,
        channel: Arc<FakeChannel>,
    }

    async fn harness(store: FakeStore, reply: Option<&'static str>, send_failures: usize) -> Harness {
        let session = Arc::new(SessionTracker::new());
        let store = Arc::new(store);
        let generator = Arc::new(FakeGenerator {
            reply,
            calls: AtomicUsize::new(0),
        });
        let channel = Arc::new(FakeChannel {
            failures: send_failures,
            attempts: Mutex::new(Vec::new()),
        });
        let registry = Arc::new(ChannelRegistry::new());
        registry.register("fake".to_string(), channel.clone()).await;
        let orchestrator = Orchestrator::new(
            session.clone(),
            Arc::new(MessageFilter::new(["text", "chat"])),
            Persistence::new(store.clone()),
            ResponseGenerator::new(generator.clone()),
            registry,
        );
        Harness {
            orchestrator,
            session,
            store,
            generator,
            channel,
        }
    }

    fn msg(kind: &str, body: &str) -> InboundMessage {
        InboundMessage {
            channel_id: "fake".to_string(),
            conversation: ConversationRef {
                chat_id: "5511999999999@c.us".to_string(),
                message_id: Some("m1".to_string()),
            },
            sender: "5511999999999@c.us".to_string(),
            sender_name: None,
            body: body.to_string(),
            kind: kind.to_string(),
            from_me: false,
        }
    }

    #[tokio::test]
    async fn happy_path_records_generates_and_replies() {
        let h = harness(FakeStore::default(), Some("hi there"), 0).await;
        let outcome = h.orchestrator.handle_message(msg("text", "hello")).await;
        assert_eq!(outcome, Outcome::Replied);

        let records = h.store.records.lock().unwrap();
        let (fields, response, sent) = records.get(&1).unwrap();
        assert_eq!(fields.text, "hello");
        assert_eq!(fields.from_name, "unknown");
        assert_eq!(response.as_deref(), Some("hi there"));
        assert!(*sent);

        assert_eq!(
            h.channel.attempts.lock().unwrap().as_slice(),
            &[("5511999999999@c.us".to_string(), "hi there".to_string())]
        );
    }

    #[tokio::test]
    async fn filtered_message_touches_nothing() {
        let h = harness(FakeStore::default(), Some("hi there"), 0).await;
        let outcome = h.orchestrator.handle_message(msg("image", "")).await;
        assert_eq!(outcome, Outcome::Ignored);
        assert_eq!(h.store.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
        assert!(h.channel.attempts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn generation_failure_still_replies_with_fallback() {
        let h = harness(FakeStore::default(), None, 0).await;
        let outcome = h.orchestrator.handle_message(msg("chat", "hello")).await;
        assert_eq!(outcome, Outcome::Replied);
        let records = h.store.records.lock().unwrap();
        assert_eq!(records.get(&1).unwrap().1.as_deref(), Some(FALLBACK_REPLY));
        assert_eq!(
            h.channel.attempts.lock().unwrap()[0].1,
            FALLBACK_REPLY.to_string()
        );
    }

    #[tokio::test]
    async fn record_failure_sends_nothing() {
        let store = FakeStore {
            fail_record: true,
            ..FakeStore::default()
        };
        let h = harness(store, Some("hi there"), 0).await;
        let outcome = h.orchestrator.handle_message(msg("text", "hello")).await;
        assert_eq!(outcome, Outcome::RecordFailed);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
        assert!(h.channel.attempts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn attach_failure_does_not_block_reply() {
        let store = FakeStore {
            fail_attach: true,
            ..FakeStore::default()
        };
        let h = harness(store, Some("hi there"), 0).await;
        let outcome = h.orchestrator.handle_message(msg("text", "hello")).await;
        assert_eq!(outcome, Outcome::Replied);
        assert_eq!(h.channel.attempts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reply_failure_gets_one_fallback() {
        let h = harness(FakeStore::default(), Some("hi there"), 1).await;
        let outcome = h.orchestrator.handle_message(msg("text", "hello")).await;
        assert_eq!(outcome, Outcome::FallbackReplied);
        let attempts = h.channel.attempts.lock().unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].1, "hi there");
        assert_eq!(attempts[1].1, ERROR_REPLY);
    }

    #[tokio::test]
    async fn fallback_failure_gives_up() {
        let h = harness(FakeStore::default(), Some("hi there"), usize::MAX).await;
        let outcome = h.orchestrator.handle_message(msg("text", "hello")).await;
        assert_eq!(outcome, Outcome::ReplyFailed);
        assert_eq!(h.channel.attempts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unregistered_channel_counts_as_reply_failure() {
        let h = harness(FakeStore::default(), Some("hi there"), 0).await;
        let mut m = msg("text", "hello");
        m.channel_id = "gone".to_string();
        assert_eq!(h.orchestrator.handle_message(m).await, Outcome::ReplyFailed);
    }

    #[tokio::test]
    async fn require_connected_gates_on_session_state() {
        let mut h = harness(FakeStore::default(), Some("hi there"), 0).await;
        h.orchestrator = h.orchestrator.clone().require_connected(true);
        assert_eq!(
            h.orchestrator.handle_message(msg("text", "hello")).await,
            Outcome::NotConnected
        );
        h.session.on_ready().await;
        assert_eq!(
            h.orchestrator.handle_message(msg("text", "hello")).await,
            Outcome::Replied
        );
    }

    #[tokio::test]
    async fn run_applies_lifecycle_and_handles_messages() {
        let h = harness(FakeStore::default(), Some("hi there"), 0).await;
        let (tx, rx) = mpsc::channel(8);
        tx.send(TransportEvent::PairingArtifact("qr".to_string())).await.unwrap();
        tx.send(TransportEvent::Ready).await.unwrap();
        tx.send(TransportEvent::Message(msg("text", "hello"))).await.unwrap();
        drop(tx);

        h.orchestrator.run(rx).await.unwrap();

        assert_eq!(h.session.state().await, SessionState::Connected);
        assert_eq!(h.session.pairing_artifact().await, None);
        assert_eq!(h.channel.attempts.lock().unwrap().len(), 1);
    }
}
