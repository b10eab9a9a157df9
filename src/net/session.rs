//! Per-client session loop
//!
//! One task per admitted client owns the session socket. It waits for the
//! user id, then multiplexes shutdown, lobby events and inbound datagrams.
//! Replies produced while handling either side are numbered in emission
//! order and flushed as bundles that repeat the last few messages.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::bundle::{Bundle, BundleError};
use super::cache::GameDataCache;
use super::controller::ControllerShared;
use super::protocol::{Payload, V086Message, MAX_BUNDLE_SIZE};
use crate::action::login::SpeedTest;
use crate::action::ActionError;
use crate::lobby::{Lobby, LobbyEvent, LoginInfo, UserId};

/// Largest datagram a session reads
pub const MAX_DATAGRAM: usize = 65_507;

/// State the actions read and write while handling one message or event
pub struct SessionContext {
    user_id: UserId,
    lobby: Arc<Lobby>,
    next_number: u16,
    outbox: Vec<V086Message>,
    closing: bool,
    resend: bool,
    pub(crate) login: Option<LoginInfo>,
    pub(crate) logged_in: bool,
    pub(crate) speed_test: SpeedTest,
    pub(crate) in_cache: GameDataCache,
    pub(crate) out_cache: GameDataCache,
}

impl SessionContext {
    pub fn new(user_id: UserId, lobby: Arc<Lobby>) -> Self {
        Self {
            user_id,
            lobby,
            next_number: 0,
            outbox: Vec::new(),
            closing: false,
            resend: false,
            login: None,
            logged_in: false,
            speed_test: SpeedTest::default(),
            in_cache: GameDataCache::new(),
            out_cache: GameDataCache::new(),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn lobby(&self) -> &Lobby {
        &self.lobby
    }

    /// Name given at login, empty before UserInformation arrives
    pub fn username(&self) -> &str {
        self.login.as_ref().map_or("", |info| info.name.as_str())
    }

    /// Queue a reply; numbers increase by one per message and wrap at 0xFFFF
    pub fn send(&mut self, payload: Payload) {
        let number = self.next_number;
        self.next_number = number.wrapping_add(1);
        self.outbox.push(V086Message::new(number, payload));
    }

    pub fn take_outbox(&mut self) -> Vec<V086Message> {
        std::mem::take(&mut self.outbox)
    }

    /// End the session after the current outbox is flushed
    pub fn close(&mut self) {
        self.closing = true;
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Repeat the last datagram on the next flush
    pub fn request_resend(&mut self) {
        self.resend = true;
    }

    pub fn take_resend(&mut self) -> bool {
        std::mem::replace(&mut self.resend, false)
    }

    /// Both sides start a game with empty frame caches
    pub fn reset_game_caches(&mut self) {
        self.in_cache.clear();
        self.out_cache.clear();
    }
}

/// Most recent outbound messages, newest first
#[derive(Debug)]
pub struct OutboundWindow {
    capacity: usize,
    max_bytes: usize,
    recent: VecDeque<V086Message>,
}

impl OutboundWindow {
    pub fn new(capacity: usize) -> Self {
        Self::with_max_bytes(capacity, MAX_DATAGRAM)
    }

    /// Window whose bundles stay within `max_bytes` once encoded
    pub fn with_max_bytes(capacity: usize, max_bytes: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_BUNDLE_SIZE);
        Self {
            capacity,
            max_bytes,
            recent: VecDeque::with_capacity(capacity),
        }
    }

    /// Add a message and build the bundle carrying it plus earlier ones
    pub fn push(&mut self, message: V086Message) -> Result<Bundle, BundleError> {
        self.recent.push_front(message);
        self.recent.truncate(self.capacity);
        self.latest().ok_or(BundleError::Empty)
    }

    /// Bundle of the current window, if anything was sent yet.
    ///
    /// The newest message always goes out; older ones are repeated only
    /// while the encoded bundle stays within the byte limit.
    pub fn latest(&self) -> Option<Bundle> {
        let mut size = 1;
        let mut messages = Vec::with_capacity(self.recent.len());
        for message in &self.recent {
            size += message.encoded_len();
            if !messages.is_empty() && size > self.max_bytes {
                break;
            }
            messages.push(message.clone());
        }
        Bundle::new(messages).ok()
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }
}

/// Channels and socket handed to a session task
pub(crate) struct SessionParts {
    pub socket: UdpSocket,
    pub port: u16,
    pub connect_addr: SocketAddr,
    pub events: mpsc::UnboundedReceiver<LobbyEvent>,
    pub start: oneshot::Receiver<UserId>,
    pub shutdown: watch::Receiver<bool>,
}

struct Session {
    socket: UdpSocket,
    port: u16,
    connect_addr: SocketAddr,
    remote: SocketAddr,
    last_inbound: Option<u16>,
    window: OutboundWindow,
    shared: Arc<ControllerShared>,
}

/// Body of a session task; cleans up the port and the lobby user on exit
pub(crate) async fn run_session(parts: SessionParts, shared: Arc<ControllerShared>) {
    let SessionParts {
        socket,
        port,
        connect_addr,
        mut events,
        start,
        mut shutdown,
    } = parts;

    shared.metrics.session_started();
    let mut session = Session {
        socket,
        port,
        connect_addr,
        remote: connect_addr,
        last_inbound: None,
        window: OutboundWindow::new(shared.config.buffer_size),
        shared: Arc::clone(&shared),
    };

    let user_id = if *shutdown.borrow() {
        None
    } else {
        tokio::select! {
            biased;
            _ = shutdown.changed() => None,
            user = start => user.ok(),
        }
    };

    if let Some(user_id) = user_id {
        debug!("Session on port {} started for user {}", port, user_id);
        let mut ctx = SessionContext::new(user_id, Arc::clone(&shared.lobby));
        if let Err(e) = session.serve(&mut ctx, &mut events, &mut shutdown).await {
            error!("Session on port {} failed: {}", port, e);
        }
    }

    // Port goes back only after the socket is closed
    let Session { socket, .. } = session;
    drop(socket);
    shared.handlers.remove(port);
    shared.pool.release(port);
    if let Some(user_id) = user_id {
        shared.lobby.disconnect(user_id);
    }
    shared.metrics.session_ended();
    info!("Session on port {} closed", port);
}

impl Session {
    async fn serve(
        &mut self,
        ctx: &mut SessionContext,
        events: &mut mpsc::UnboundedReceiver<LobbyEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> io::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Session on port {} stopping", self.port);
                        return Ok(());
                    }
                }
                Some(event) = events.recv() => {
                    if let Err(e) = self.shared.actions.handle_event(&event, ctx) {
                        self.log_action_error(ctx, &e);
                    }
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.handle_datagram(&buf[..len], from, ctx),
                    // ICMP unreachable from an earlier send
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                        debug!("Port {}: {}", self.port, e);
                    }
                    Err(e) => return Err(e),
                },
            }

            self.flush(ctx).await;
            if ctx.is_closing() {
                return Ok(());
            }
        }
    }

    fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr, ctx: &mut SessionContext) {
        let metrics = &self.shared.metrics;
        metrics.record_received(bytes.len());

        if from.ip() != self.connect_addr.ip() {
            warn!(
                "Port {}: dropping datagram from {} (client is {})",
                self.port,
                from,
                self.connect_addr.ip()
            );
            return;
        }
        self.remote = from;

        let decoded = Bundle::decode_newer_than(bytes, self.last_inbound);
        if let Some(e) = &decoded.error {
            metrics.parse_failures.fetch_add(1, Ordering::Relaxed);
            warn!("Port {}: malformed bundle from {}: {}", self.port, from, e);
        }

        // Bundles carry the newest message first
        for message in decoded.messages.into_iter().rev() {
            self.last_inbound = Some(message.number);
            metrics.messages_dispatched.fetch_add(1, Ordering::Relaxed);

            if let Err(e) = self.shared.actions.dispatch(&message, ctx) {
                self.log_action_error(ctx, &e);
            }
            if ctx.is_closing() {
                break;
            }
        }
    }

    fn log_action_error(&self, ctx: &mut SessionContext, error: &ActionError) {
        if error.is_fatal() {
            error!("User {} on port {}: {}", ctx.user_id(), self.port, error);
            ctx.close();
            return;
        }
        self.shared
            .metrics
            .action_rejections
            .fetch_add(1, Ordering::Relaxed);
        match error {
            ActionError::Unsupported(_) => debug!("User {}: {}", ctx.user_id(), error),
            _ => warn!("User {}: {}", ctx.user_id(), error),
        }
    }

    async fn flush(&mut self, ctx: &mut SessionContext) {
        if ctx.take_resend() {
            if let Some(bundle) = self.window.latest() {
                self.send_bundle(&bundle).await;
            }
        }
        for message in ctx.take_outbox() {
            debug!("Port {} -> {}: {}", self.port, self.remote, message);
            match self.window.push(message) {
                Ok(bundle) => self.send_bundle(&bundle).await,
                Err(e) => error!("Port {}: cannot build bundle: {}", self.port, e),
            }
        }
    }

    async fn send_bundle(&self, bundle: &Bundle) {
        let bytes = match bundle.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Port {}: failed to encode bundle: {}", self.port, e);
                return;
            }
        };
        match self.socket.send_to(&bytes, self.remote).await {
            Ok(sent) => self.shared.metrics.record_sent(sent),
            Err(e) => warn!("Port {}: send to {} failed: {}", self.port, self.remote, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::net::protocol::{GameData, InformationMessage};

    fn context() -> SessionContext {
        SessionContext::new(1, Arc::new(Lobby::new(ServerConfig::default())))
    }

    #[test]
    fn test_message_numbers_follow_emission_order() {
        let mut ctx = context();
        ctx.send(Payload::ServerAck);
        ctx.send(Payload::AllReady);

        let sent = ctx.take_outbox();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].number, 0);
        assert_eq!(sent[1].number, 1);
        assert!(ctx.take_outbox().is_empty());

        ctx.send(Payload::ServerAck);
        assert_eq!(ctx.take_outbox()[0].number, 2);
    }

    #[test]
    fn test_message_numbers_wrap() {
        let mut ctx = context();
        ctx.next_number = u16::MAX;
        ctx.send(Payload::ServerAck);
        ctx.send(Payload::ServerAck);

        let sent = ctx.take_outbox();
        assert_eq!(sent[0].number, u16::MAX);
        assert_eq!(sent[1].number, 0);
    }

    #[test]
    fn test_resend_flag_resets() {
        let mut ctx = context();
        assert!(!ctx.take_resend());
        ctx.request_resend();
        assert!(ctx.take_resend());
        assert!(!ctx.take_resend());
    }

    #[test]
    fn test_window_keeps_newest_first() {
        let mut window = OutboundWindow::new(3);
        assert!(window.latest().is_none());

        for number in 0..5u16 {
            window.push(V086Message::new(number, Payload::ServerAck)).unwrap();
        }

        let bundle = window.latest().unwrap();
        let numbers: Vec<u16> = bundle.messages().iter().map(|m| m.number).collect();
        assert_eq!(numbers, vec![4, 3, 2]);
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn test_window_capacity_clamped() {
        let mut window = OutboundWindow::new(50);
        for number in 0..20u16 {
            let payload = Payload::InformationMessage(InformationMessage::new("server", "hi"));
            window.push(V086Message::new(number, payload)).unwrap();
        }
        assert_eq!(window.len(), MAX_BUNDLE_SIZE);

        let mut window = OutboundWindow::new(0);
        window.push(V086Message::new(0, Payload::ServerAck)).unwrap();
        window.push(V086Message::new(1, Payload::ServerAck)).unwrap();
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_window_bundle_fits_byte_limit() {
        let frame = |number: u16| {
            let data = GameData::new(vec![number as u8; 600]).unwrap();
            V086Message::new(number, Payload::GameData(data))
        };
        let mut window = OutboundWindow::with_max_bytes(MAX_BUNDLE_SIZE, 1400);

        for number in 0..4u16 {
            let bundle = window.push(frame(number)).unwrap();
            assert!(bundle.encoded_len() <= 1400);
            assert_eq!(bundle.messages()[0].number, number);
        }

        // Older messages stay in the window even when left out of the bundle
        assert_eq!(window.len(), 4);
        let numbers: Vec<u16> = window.latest().unwrap().messages().iter().map(|m| m.number).collect();
        assert_eq!(numbers, vec![3, 2]);

        // Newest message goes out alone even when it is over the limit
        let mut small = OutboundWindow::with_max_bytes(3, 100);
        small.push(V086Message::new(0, Payload::ServerAck)).unwrap();
        let bundle = small.push(frame(1)).unwrap();
        assert_eq!(bundle.len(), 1);
        assert_eq!(bundle.messages()[0].number, 1);
    }
}
