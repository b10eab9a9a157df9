//! v086 connection admission
//!
//! Turns a HELLO from the connect server into a running session: registers
//! the user with the lobby, binds a session port from the pool (retrying on
//! ports the OS refuses), and starts the session handler.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::handler::{ClientHandler, HandlerError, HandlerRegistry};
use super::port_pool::PortPool;
use crate::action::ActionTable;
use crate::config::ServerConfig;
use crate::lobby::{Lobby, ServerError};
use crate::metrics::Metrics;

/// Why a connection was not admitted
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("controller is not running")]
    NotRunning,
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("no session ports available")]
    NoPortsAvailable,
    #[error("failed to bind a session port after {attempts} attempts")]
    BindFailed { attempts: usize },
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl AdmissionError {
    /// Whether the client should be told the server is full
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            AdmissionError::Server(ServerError::ServerFull)
                | AdmissionError::NoPortsAvailable
                | AdmissionError::BindFailed { .. }
        )
    }
}

/// State shared between the controller and its sessions
pub(crate) struct ControllerShared {
    pub config: ServerConfig,
    pub lobby: Arc<Lobby>,
    pub actions: ActionTable,
    pub pool: PortPool,
    pub handlers: HandlerRegistry,
    pub metrics: Arc<Metrics>,
}

impl ControllerShared {
    pub(crate) fn new(config: ServerConfig, lobby: Arc<Lobby>, metrics: Arc<Metrics>, pool: PortPool) -> Self {
        Self {
            config,
            lobby,
            actions: ActionTable::new(),
            pool,
            handlers: HandlerRegistry::default(),
            metrics,
        }
    }
}

/// Admission controller for protocol v086
pub struct V086Controller {
    shared: Arc<ControllerShared>,
    running: AtomicBool,
}

impl V086Controller {
    pub const VERSION: &'static str = "v086";

    /// Controller leasing ports from the configured session range
    pub fn new(config: ServerConfig, lobby: Arc<Lobby>, metrics: Arc<Metrics>) -> Self {
        let end = u16::try_from(config.port_range_end()).unwrap_or(u16::MAX);
        let pool = PortPool::from_range(config.port_range_start..=end);
        Self::with_port_pool(config, lobby, metrics, pool)
    }

    pub fn with_port_pool(config: ServerConfig, lobby: Arc<Lobby>, metrics: Arc<Metrics>, pool: PortPool) -> Self {
        Self {
            shared: Arc::new(ControllerShared::new(config, lobby, metrics, pool)),
            running: AtomicBool::new(false),
        }
    }

    pub fn version(&self) -> &'static str {
        Self::VERSION
    }

    pub fn client_types(&self) -> &[String] {
        &self.shared.config.client_types
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.config.buffer_size
    }

    pub fn lobby(&self) -> &Arc<Lobby> {
        &self.shared.lobby
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.shared.metrics
    }

    pub fn actions(&self) -> &ActionTable {
        &self.shared.actions
    }

    /// Live sessions
    pub fn num_clients(&self) -> usize {
        self.shared.handlers.len()
    }

    pub fn available_ports(&self) -> usize {
        self.shared.pool.available()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
        info!(
            "{} controller started with {} session ports",
            Self::VERSION,
            self.shared.pool.capacity()
        );
    }

    /// Stop every session and wait for them to clean up
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let handlers = self.shared.handlers.drain();
        info!("{} controller stopping {} sessions", Self::VERSION, handlers.len());
        for handler in &handlers {
            handler.stop();
        }
        for handler in &handlers {
            handler.join().await;
        }
    }

    /// Admit a client that sent HELLO; returns the session port it should use
    pub async fn new_connection(&self, remote: SocketAddr, protocol: &str) -> Result<u16, AdmissionError> {
        let result = self.admit(remote, protocol).await;
        let counter = match &result {
            Ok(_) => &self.shared.metrics.connections_admitted,
            Err(_) => &self.shared.metrics.connections_rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    async fn admit(&self, remote: SocketAddr, protocol: &str) -> Result<u16, AdmissionError> {
        if !self.is_running() {
            return Err(AdmissionError::NotRunning);
        }
        let shared = &self.shared;

        let (handler, sink) = ClientHandler::new(remote, Arc::clone(shared));
        let user_id = shared.lobby.new_connection(remote, protocol, sink).map_err(|e| {
            warn!("Connection from {} refused: {}", remote, e);
            AdmissionError::Server(e)
        })?;

        let attempts = shared.config.bind_attempts;
        let mut leased_any = false;
        let mut bound = None;
        for attempt in 1..=attempts {
            match shared.pool.acquire() {
                None => error!("No ports available for {} (attempt {}/{})", remote, attempt, attempts),
                Some(port) => {
                    leased_any = true;
                    info!("Port {} allocated to {} (attempt {}/{})", port, remote, attempt, attempts);
                    match handler.bind(port).await {
                        Ok(()) => {
                            bound = Some(port);
                            break;
                        }
                        Err(e) => {
                            error!("Attempt {}/{} for {}: {}", attempt, attempts, remote, e);
                            shared.metrics.bind_failures.fetch_add(1, Ordering::Relaxed);
                            shared.pool.release(port);
                            debug!("Returned port {} to the pool", port);
                        }
                    }
                }
            }
            if attempt < attempts {
                tokio::time::sleep(shared.config.bind_retry_delay).await;
            }
        }

        let Some(port) = bound else {
            handler.stop();
            shared.lobby.disconnect(user_id);
            return Err(if leased_any {
                AdmissionError::BindFailed { attempts }
            } else {
                AdmissionError::NoPortsAvailable
            });
        };

        if let Err(e) = handler.run() {
            handler.stop();
            shared.pool.release(port);
            shared.lobby.disconnect(user_id);
            return Err(e.into());
        }
        shared.handlers.insert(port, handler.clone());

        // Lost a race with stop(); the session task cleans up after itself
        if !self.is_running() {
            handler.stop();
            shared.handlers.remove(port);
            shared.lobby.disconnect(user_id);
            return Err(AdmissionError::NotRunning);
        }

        handler.start(user_id)?;
        info!("User {} from {} admitted on port {}", user_id, remote, port);
        Ok(port)
    }
}
