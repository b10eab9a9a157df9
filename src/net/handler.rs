//! Client handlers and their registry
//!
//! A handler is created per admission, binds one session port, and runs the
//! session task once the lobby has assigned a user id.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::controller::ControllerShared;
use super::session::{run_session, SessionParts};
use crate::lobby::{EventSink, LobbyEvent, UserId};

/// Lifecycle of a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Created,
    Bound,
    Running,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("failed to bind port {port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error("handler is {found:?}, expected {expected:?}")]
    InvalidState {
        expected: HandlerState,
        found: HandlerState,
    },
    #[error("session task already exited")]
    SessionGone,
}

/// Cheap to clone; all clones drive the same session
#[derive(Clone)]
pub struct ClientHandler {
    inner: Arc<HandlerInner>,
}

struct HandlerInner {
    remote: SocketAddr,
    shared: Arc<ControllerShared>,
    shutdown: watch::Sender<bool>,
    core: Mutex<HandlerCore>,
}

struct HandlerCore {
    state: HandlerState,
    port: Option<u16>,
    socket: Option<UdpSocket>,
    events: Option<mpsc::UnboundedReceiver<LobbyEvent>>,
    start: Option<oneshot::Sender<UserId>>,
    task: Option<JoinHandle<()>>,
}

impl ClientHandler {
    /// New handler plus the sink the lobby uses to reach it
    pub(crate) fn new(remote: SocketAddr, shared: Arc<ControllerShared>) -> (Self, EventSink) {
        let (sink, events) = EventSink::channel();
        let (shutdown, _) = watch::channel(false);
        let handler = Self {
            inner: Arc::new(HandlerInner {
                remote,
                shared,
                shutdown,
                core: Mutex::new(HandlerCore {
                    state: HandlerState::Created,
                    port: None,
                    socket: None,
                    events: Some(events),
                    start: None,
                    task: None,
                }),
            }),
        };
        (handler, sink)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote
    }

    pub fn port(&self) -> Option<u16> {
        self.inner.core.lock().port
    }

    pub fn state(&self) -> HandlerState {
        self.inner.core.lock().state
    }

    fn expect_state(core: &HandlerCore, expected: HandlerState) -> Result<(), HandlerError> {
        if core.state == expected {
            Ok(())
        } else {
            Err(HandlerError::InvalidState {
                expected,
                found: core.state,
            })
        }
    }

    /// Bind the session socket on `port`
    pub async fn bind(&self, port: u16) -> Result<(), HandlerError> {
        Self::expect_state(&self.inner.core.lock(), HandlerState::Created)?;

        let addr = SocketAddr::new(self.inner.shared.config.bind_address, port);
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| HandlerError::Bind { port, source })?;

        let mut core = self.inner.core.lock();
        // Stopped while the bind was in flight
        Self::expect_state(&core, HandlerState::Created)?;
        core.socket = Some(socket);
        core.port = Some(port);
        core.state = HandlerState::Bound;
        tracing::debug!("Handler for {} bound to port {}", self.inner.remote, port);
        Ok(())
    }

    /// Spawn the session task; it idles until [`ClientHandler::start`]
    pub fn run(&self) -> Result<(), HandlerError> {
        let mut core = self.inner.core.lock();
        Self::expect_state(&core, HandlerState::Bound)?;

        let (Some(socket), Some(port), Some(events)) = (core.socket.take(), core.port, core.events.take())
        else {
            return Err(HandlerError::InvalidState {
                expected: HandlerState::Bound,
                found: core.state,
            });
        };
        let (start_tx, start_rx) = oneshot::channel();
        let parts = SessionParts {
            socket,
            port,
            connect_addr: self.inner.remote,
            events,
            start: start_rx,
            shutdown: self.inner.shutdown.subscribe(),
        };

        core.task = Some(tokio::spawn(run_session(parts, Arc::clone(&self.inner.shared))));
        core.start = Some(start_tx);
        core.state = HandlerState::Running;
        Ok(())
    }

    /// Hand the session its user id
    pub fn start(&self, user_id: UserId) -> Result<(), HandlerError> {
        let mut core = self.inner.core.lock();
        Self::expect_state(&core, HandlerState::Running)?;
        let start = core.start.take().ok_or(HandlerError::InvalidState {
            expected: HandlerState::Running,
            found: core.state,
        })?;
        start.send(user_id).map_err(|_| HandlerError::SessionGone)
    }

    /// Ask the session to end; safe to call more than once
    pub fn stop(&self) {
        let mut core = self.inner.core.lock();
        if core.state == HandlerState::Stopped {
            return;
        }
        core.state = HandlerState::Stopped;
        core.socket = None;
        core.start = None;
        self.inner.shutdown.send_replace(true);
        tracing::debug!("Handler for {} stopped", self.inner.remote);
    }

    /// Wait for the session task to finish
    pub async fn join(&self) {
        let task = self.inner.core.lock().task.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("Session task for {} panicked: {}", self.inner.remote, e);
            }
        }
    }
}

impl std::fmt::Debug for ClientHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandler")
            .field("remote", &self.inner.remote)
            .field("port", &self.port())
            .field("state", &self.state())
            .finish()
    }
}

/// Running handlers keyed by session port
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: Mutex<FxHashMap<u16, ClientHandler>>,
}

impl HandlerRegistry {
    pub fn insert(&self, port: u16, handler: ClientHandler) {
        if self.handlers.lock().insert(port, handler).is_some() {
            tracing::warn!("Replaced existing handler on port {}", port);
        }
    }

    pub fn remove(&self, port: u16) -> Option<ClientHandler> {
        self.handlers.lock().remove(&port)
    }

    pub fn get(&self, port: u16) -> Option<ClientHandler> {
        self.handlers.lock().get(&port).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }

    /// Empty the registry, returning what it held
    pub fn drain(&self) -> Vec<ClientHandler> {
        self.handlers.lock().drain().map(|(_, handler)| handler).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::lobby::Lobby;
    use crate::metrics::Metrics;
    use crate::net::port_pool::PortPool;
    use std::net::{IpAddr, Ipv4Addr};

    fn shared() -> Arc<ControllerShared> {
        let config = ServerConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..ServerConfig::default()
        };
        let lobby = Arc::new(Lobby::new(config.clone()));
        Arc::new(ControllerShared::new(
            config,
            lobby,
            Arc::new(Metrics::new()),
            PortPool::from_ports(Vec::new()),
        ))
    }

    fn remote() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_bind_then_run() {
        let (handler, _sink) = ClientHandler::new(remote(), shared());
        assert_eq!(handler.state(), HandlerState::Created);

        handler.bind(0).await.unwrap();
        assert_eq!(handler.state(), HandlerState::Bound);
        assert_eq!(handler.port(), Some(0));

        handler.run().unwrap();
        assert_eq!(handler.state(), HandlerState::Running);

        handler.stop();
        handler.join().await;
        assert_eq!(handler.state(), HandlerState::Stopped);
    }

    #[tokio::test]
    async fn test_bind_conflict_keeps_handler_unbound() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let (handler, _sink) = ClientHandler::new(remote(), shared());
        let err = handler.bind(port).await.unwrap_err();

        assert!(matches!(err, HandlerError::Bind { port: p, .. } if p == port));
        assert_eq!(handler.state(), HandlerState::Created);
        assert_eq!(handler.port(), None);
    }

    #[tokio::test]
    async fn test_out_of_order_calls_rejected() {
        let (handler, _sink) = ClientHandler::new(remote(), shared());

        assert!(matches!(
            handler.run(),
            Err(HandlerError::InvalidState {
                expected: HandlerState::Bound,
                found: HandlerState::Created
            })
        ));
        assert!(handler.start(1).is_err());

        handler.bind(0).await.unwrap();
        assert!(handler.bind(0).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (handler, _sink) = ClientHandler::new(remote(), shared());
        handler.stop();
        handler.stop();
        handler.join().await;

        assert_eq!(handler.state(), HandlerState::Stopped);
        assert!(handler.bind(0).await.is_err());
    }

    #[tokio::test]
    async fn test_registry() {
        let registry = HandlerRegistry::default();
        let (a, _sink_a) = ClientHandler::new(remote(), shared());
        let (b, _sink_b) = ClientHandler::new(remote(), shared());

        registry.insert(100, a);
        registry.insert(101, b);
        assert_eq!(registry.len(), 2);
        assert!(registry.get(100).is_some());

        assert!(registry.remove(100).is_some());
        assert!(registry.remove(100).is_none());

        let drained = registry.drain();
        assert_eq!(drained.len(), 1);
        assert!(registry.is_empty());
    }
}
