//! Server orchestrator for wiring together all components.
//!
//! This module provides the `ServerOrchestrator` that builds the record
//! store, sandbox provider, deployment client, project registry and
//! WebSocket transport from a [`Config`], and runs them until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::RateLimiter;
use crate::config::Config;
use crate::deploy::{DeploymentClient, HttpDeploymentClient};
use crate::lock::KeyedMutex;
use crate::project::{ProjectRegistry, SessionDeps};
use crate::router::Router;
use crate::sandbox::LocalSandboxProvider;
use crate::store::JsonProjectStore;
use crate::transport::{Transport, TransportSettings};

/// How often expired sandboxes and rate-limit windows are pruned.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(600);

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Binding the listener and spawning tasks.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// The listener is bound.
    Listening(SocketAddr),
}

/// Server orchestrator that manages all subsystems.
pub struct ServerOrchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    store: Arc<JsonProjectStore>,
    provider: Arc<LocalSandboxProvider>,
    deploy: Option<Arc<HttpDeploymentClient>>,
    limiter: Arc<RateLimiter>,
    registry: Arc<ProjectRegistry>,
    transport: Arc<Transport>,
    local_addr: RwLock<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl ServerOrchestrator {
    /// Creates a new orchestrator from a validated configuration.
    pub fn new(config: Config) -> Result<Self> {
        let store = Arc::new(JsonProjectStore::new(&config.store.path));
        store.load().context("Failed to load project store")?;

        let provider = Arc::new(
            LocalSandboxProvider::new(
                &config.sandbox.root_dir,
                Some(config.sandbox.templates_dir.clone()),
                config.sandbox.preview_host.clone(),
            )
            .with_context(|| {
                format!(
                    "Failed to prepare sandbox root: {}",
                    config.sandbox.root_dir.display()
                )
            })?
            .with_default_shell(Some(config.session.default_shell.clone())),
        );

        let deploy = match &config.deploy.url {
            Some(url) => Some(Arc::new(
                HttpDeploymentClient::new(
                    url,
                    config.deploy.token.clone(),
                    Duration::from_secs(config.deploy.timeout_secs),
                )
                .context("Failed to create deployment client")?,
            )),
            None => {
                info!("No deployment service configured, deploy requests will be refused");
                None
            }
        };

        let limiter = Arc::new(RateLimiter::new(config.limits.by_event()));

        let deps = SessionDeps {
            provider: provider.clone(),
            records: store.clone(),
            locks: Arc::new(KeyedMutex::new()),
            deploy: deploy
                .clone()
                .map(|client| client as Arc<dyn DeploymentClient>),
            settings: config.session_settings(),
        };
        let registry = Arc::new(ProjectRegistry::new(deps));
        let router = Arc::new(Router::new(limiter.clone()));
        let transport = Arc::new(Transport::new(
            Arc::clone(&registry),
            store.clone(),
            router,
            TransportSettings {
                max_connections: config.server.max_connections,
                require_owner_presence: config.session.require_owner_presence,
            },
        ));

        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            store,
            provider,
            deploy,
            limiter,
            registry,
            transport,
            local_addr: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Address the listener is bound to, once started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    /// Binds the listener and spawns the accept and maintenance tasks.
    pub async fn start(&self) -> Result<SocketAddr> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting server orchestrator...");

        let listener = match TcpListener::bind(&self.config.server.bind).await {
            Ok(listener) => listener,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                return Err(e).with_context(|| format!("Failed to bind {}", self.config.server.bind));
            }
        };
        let addr = listener.local_addr().context("Failed to read listener address")?;
        *self.local_addr.write().await = Some(addr);
        self.emit_event(OrchestratorEvent::Listening(addr));

        let mut tasks = self.tasks.lock().await;

        let transport = Arc::clone(&self.transport);
        let token = self.shutdown_token.clone();
        tasks.push(tokio::spawn(async move {
            transport.serve(listener, token).await;
        }));

        if let Some(client) = self.deploy.clone() {
            tasks.push(tokio::spawn(async move {
                client.connect().await;
            }));
        }

        tasks.push(self.spawn_maintenance());
        debug!("Started maintenance task");

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!(addr = %addr, "Server orchestrator started successfully");
        Ok(addr)
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let provider = Arc::clone(&self.provider);
        let limiter = Arc::clone(&self.limiter);
        let retention = self.config.sandbox.retention();
        let token = self.shutdown_token.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        match provider.prune_expired(retention).await {
                            Ok(0) => {}
                            Ok(removed) => info!(removed, "Pruned expired sandboxes"),
                            Err(e) => warn!(error = %e, "Failed to prune sandboxes"),
                        }
                        let windows = limiter.prune();
                        debug!(windows, "Pruned rate-limit windows");
                    }
                }
            }
        })
    }

    /// Stops accepting, disconnects every project and waits for tasks.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping server orchestrator...");

        // Signal shutdown to all tasks
        self.shutdown_token.cancel();

        let sessions = self.registry.shutdown().await;
        debug!(sessions, "Disconnected project sessions");

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Orchestrator task failed: {}", e);
            }
        }

        if let Err(e) = self.store.save() {
            warn!("Error saving project store: {:#}", e);
        }

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Server orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the project record store.
    pub fn store(&self) -> &Arc<JsonProjectStore> {
        &self.store
    }

    /// Returns the project registry.
    pub fn registry(&self) -> &Arc<ProjectRegistry> {
        &self.registry
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
