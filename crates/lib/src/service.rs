//! Service lifecycle: wire storage, LLM backend, transport, dispatcher and gateway together,
//! and tear them down in order.

use crate::channels::{BridgeChannel, ChannelRegistry, TelegramChannel, TransportEvent};
use crate::config::{self, Config, GenerationBackend, TransportKind};
use crate::filter::MessageFilter;
use crate::gateway::{self, BridgeIntake, GatewayState};
use crate::llm::{GeminiClient, Generator, OllamaClient};
use crate::orchestrator::Orchestrator;
use crate::responder::ResponseGenerator;
use crate::session::SessionTracker;
use crate::store::{Persistence, SqliteStore};
use anyhow::{anyhow, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const EVENT_QUEUE: usize = 64;

/// Build the configured generation backend. Gemini needs an API key.
pub fn build_generator(config: &Config) -> Result<Arc<dyn Generator>> {
    let generation = &config.generation;
    match generation.backend {
        GenerationBackend::Gemini => {
            let key = config::resolve_gemini_api_key(config).ok_or_else(|| {
                anyhow!("GEMINI_API_KEY not set (or generation.apiKey in the config file)")
            })?;
            let client = GeminiClient::new(key, generation.model.clone(), generation.base_url.clone())
                .context("building gemini client")?;
            log::info!("generation: gemini model {}", client.model());
            Ok(Arc::new(client))
        }
        GenerationBackend::Ollama => {
            let client = OllamaClient::new(generation.base_url.clone(), generation.model.clone());
            log::info!("generation: ollama model {}", client.model());
            Ok(Arc::new(client))
        }
    }
}

/// A running instance. Obtain with `start`, release with `stop`.
pub struct Service {
    local_addr: SocketAddr,
    channels: Arc<ChannelRegistry>,
    persistence: Persistence,
    events_tx: Option<mpsc::Sender<TransportEvent>>,
    channel_tasks: Vec<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<Result<()>>>,
    gateway: Option<JoinHandle<Result<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

enum Exit {
    Dispatcher(std::result::Result<Result<()>, tokio::task::JoinError>),
    Gateway(std::result::Result<Result<()>, tokio::task::JoinError>),
}

impl Service {
    /// Open storage, start the transport and dispatcher, and bind the gateway.
    pub async fn start(config: Config) -> Result<Self> {
        let bind = config.gateway.bind.trim().to_string();
        if !config::is_loopback_bind(&bind) && !config.gateway.allow_remote {
            anyhow::bail!(
                "refusing to bind gateway to {} (the status page shows the pairing code); set gateway.allowRemote to true to allow it",
                bind
            );
        }

        let generator = build_generator(&config)?;
        let telegram_token = match config.transport.kind {
            TransportKind::Telegram => Some(config::resolve_telegram_token(&config).ok_or_else(|| {
                anyhow!("TELEGRAM_BOT_TOKEN not set (or transport.telegram.botToken in the config file)")
            })?),
            TransportKind::Bridge => None,
        };

        // Bind before anything is spawned so a busy port leaves nothing running.
        let bind_addr = format!("{}:{}", bind, config.gateway.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("binding to {}", bind_addr))?;
        let local_addr = listener.local_addr()?;

        let db_path = config::resolve_db_path(&config);
        let store = SqliteStore::open(&db_path)
            .with_context(|| format!("opening message database {}", db_path.display()))?;
        let persistence = Persistence::new(Arc::new(store));

        let session = Arc::new(SessionTracker::new());
        let filter = Arc::new(MessageFilter::new(config.filters.accepted_types.clone()));
        let channels = Arc::new(ChannelRegistry::new());
        let (events_tx, events_rx) = mpsc::channel::<TransportEvent>(EVENT_QUEUE);

        let mut channel_tasks = Vec::new();
        let mut bridge = None;
        match telegram_token {
            Some(token) => {
                let telegram = Arc::new(TelegramChannel::new(token));
                channel_tasks.push(telegram.clone().start_inbound(events_tx.clone()));
                channels.register("telegram".to_string(), telegram).await;
                log::info!("telegram channel registered and getUpdates loop started");
            }
            None => {
                let channel = Arc::new(BridgeChannel::new(config.transport.bridge.url.clone()));
                channels
                    .register(crate::channels::BRIDGE_CHANNEL_ID.to_string(), channel)
                    .await;
                bridge = Some(BridgeIntake {
                    events_tx: events_tx.clone(),
                    secret: config::resolve_bridge_secret(&config),
                });
                log::info!(
                    "bridge channel registered; replies go to {}",
                    config.transport.bridge.url
                );
            }
        }

        let orchestrator = Orchestrator::new(
            session.clone(),
            filter.clone(),
            persistence.clone(),
            ResponseGenerator::new(generator),
            channels.clone(),
        )
        .require_connected(config.orchestrator.require_connected);
        let dispatcher = tokio::spawn(async move { orchestrator.run(events_rx).await });

        let app = gateway::router(GatewayState {
            port: local_addr.port(),
            session,
            filter: filter.clone(),
            bridge,
        });
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let gateway = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await
                .context("gateway server exited")
        });
        log::info!("gateway listening on {}", local_addr);
        log::info!(
            "message filters active: {:?}",
            filter.filters().await
        );

        Ok(Self {
            local_addr,
            channels,
            persistence,
            events_tx: Some(events_tx),
            channel_tasks,
            dispatcher: Some(dispatcher),
            gateway: Some(gateway),
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Resolves when the dispatcher or the gateway stops on its own, which is always fatal.
    pub async fn wait_for_failure(&mut self) -> anyhow::Error {
        let (Some(dispatcher), Some(gateway)) = (self.dispatcher.as_mut(), self.gateway.as_mut())
        else {
            return anyhow!("service is not running");
        };
        let exit = tokio::select! {
            r = dispatcher => Exit::Dispatcher(r),
            r = gateway => Exit::Gateway(r),
        };
        match exit {
            Exit::Dispatcher(r) => {
                self.dispatcher = None;
                task_failure("dispatcher", r)
            }
            Exit::Gateway(r) => {
                self.gateway = None;
                task_failure("gateway", r)
            }
        }
    }

    /// Orderly teardown: stop intake, drain the dispatcher so in-flight messages still get
    /// their reply, then stop channels and close storage.
    pub async fn stop(mut self) {
        log::info!("stopping: intake, dispatcher, channels, storage");
        self.channels.stop_intake_all().await;
        for h in std::mem::take(&mut self.channel_tasks) {
            let _ = h.await;
        }

        let _ = self.shutdown_tx.send(true);
        if let Some(gateway) = self.gateway.take() {
            match gateway.await {
                Ok(Err(e)) => log::warn!("gateway: {:#}", e),
                Err(e) => log::warn!("gateway task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        log::info!("intake stopped");

        // The dispatcher ends once every event sender is gone and in-flight pipelines finish.
        self.events_tx.take();
        if let Some(dispatcher) = self.dispatcher.take() {
            match dispatcher.await {
                Ok(Err(e)) => log::error!("dispatcher: {:#}", e),
                Err(e) => log::error!("dispatcher task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }

        self.channels.stop_all().await;
        self.persistence.close().await;
        log::info!("stopped");
    }
}

fn task_failure(
    name: &str,
    result: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> anyhow::Error {
    match result {
        Ok(Ok(())) => anyhow!("{} stopped unexpectedly", name),
        Ok(Err(e)) => e.context(format!("{} failed", name)),
        Err(e) => anyhow!("{} task failed: {}", name, e),
    }
}

/// Run until SIGINT/SIGTERM (clean exit) or a fatal failure (error), stopping in order either way.
pub async fn run(config: Config) -> Result<()> {
    let mut service = Service::start(config).await?;
    let result = tokio::select! {
        _ = shutdown_signal() => {
            log::info!("shutdown signal received");
            Ok(())
        }
        e = service.wait_for_failure() => {
            log::error!("fatal: {:#}", e);
            Err(e)
        }
    };
    service.stop().await;
    result
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ollama_backend_needs_no_key() {
        let mut config = Config::default();
        config.generation.backend = GenerationBackend::Ollama;
        let generator = build_generator(&config).unwrap();
        assert_eq!(generator.name(), "ollama");
    }

    #[test]
    fn gemini_backend_uses_configured_key() {
        let mut config = Config::default();
        config.generation.api_key = Some("from-config".to_string());
        let generator = build_generator(&config).unwrap();
        assert_eq!(generator.name(), "gemini");
    }

    #[tokio::test]
    async fn busy_port_fails_before_opening_storage() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dir = std::env::temp_dir().join(format!("parley-busy-{}", uuid::Uuid::new_v4()));
        let mut config = Config::default();
        config.generation.backend = GenerationBackend::Ollama;
        config.gateway.port = taken.local_addr().unwrap().port();
        config.storage.path = Some(dir.join("messages.db"));

        let err = Service::start(config).await.err().unwrap();
        assert!(format!("{:#}", err).contains("binding to"));
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn refuses_remote_bind_by_default() {
        let mut config = Config::default();
        config.generation.backend = GenerationBackend::Ollama;
        config.gateway.bind = "0.0.0.0".to_string();
        let err = Service::start(config).await.err().unwrap();
        assert!(err.to_string().contains("refusing to bind"));
    }
}
