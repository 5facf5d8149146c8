//! Message filter: which inbound messages trigger automated handling.

use crate::channels::InboundMessage;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// True iff the type tag is accepted, the session did not send it, and the body is not blank.
pub fn accepts(accepted: &HashSet<String>, msg: &InboundMessage) -> bool {
    accepted.contains(&msg.kind) && !msg.from_me && !msg.body.trim().is_empty()
}

/// Accepted message types, replaceable at runtime.
pub struct MessageFilter {
    accepted: RwLock<Arc<HashSet<String>>>,
}

impl MessageFilter {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: HashSet<String> = types.into_iter().map(Into::into).collect();
        warn_if_empty(&set);
        Self {
            accepted: RwLock::new(Arc::new(set)),
        }
    }

    pub async fn should_process(&self, msg: &InboundMessage) -> bool {
        let accepted = self.accepted.read().await.clone();
        accepts(&accepted, msg)
    }

    /// Replace the accepted set. Only evaluations that start afterwards see the new set.
    pub async fn set_filters<I, S>(&self, types: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: HashSet<String> = types.into_iter().map(Into::into).collect();
        warn_if_empty(&set);
        let mut sorted: Vec<&String> = set.iter().collect();
        sorted.sort();
        log::info!("message filters updated: {:?}", sorted);
        *self.accepted.write().await = Arc::new(set);
    }

    /// Current accepted types, sorted.
    pub async fn filters(&self) -> Vec<String> {
        let mut v: Vec<String> = self.accepted.read().await.iter().cloned().collect();
        v.sort();
        v
    }
}

fn warn_if_empty(set: &HashSet<String>) {
    if set.is_empty() {
        log::warn!("message filter is empty: every inbound message will be ignored");
    }
}
