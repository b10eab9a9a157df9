use std::net::SocketAddr;
use std::time::Instant;

use crate::lobby::event::{EventSink, LobbyEvent, UserSummary};
use crate::lobby::{GameId, UserId};
use crate::net::protocol::{ConnectionType, UserStatus};

/// Login details collected during the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginInfo {
    pub name: String,
    pub client_type: String,
    pub connection_type: ConnectionType,
    pub ping: u32,
}

/// A connected user, logged in or not
#[derive(Debug)]
pub struct LobbyUser {
    pub id: UserId,
    pub name: String,
    pub client_type: String,
    pub protocol: String,
    pub connect_addr: SocketAddr,
    pub connection_type: ConnectionType,
    pub ping: u32,
    pub status: UserStatus,
    pub logged_in: bool,
    pub game: Option<GameId>,
    pub connected_at: Instant,
    pub last_keep_alive: Instant,
    pub last_chat: Option<Instant>,
    pub last_create_game: Option<Instant>,
    sink: EventSink,
}

impl LobbyUser {
    pub fn new(id: UserId, protocol: String, connect_addr: SocketAddr, sink: EventSink) -> Self {
        let now = Instant::now();
        Self {
            id,
            name: String::new(),
            client_type: String::new(),
            protocol,
            connect_addr,
            connection_type: ConnectionType::Lan,
            ping: 0,
            status: UserStatus::Connecting,
            logged_in: false,
            game: None,
            connected_at: now,
            last_keep_alive: now,
            last_chat: None,
            last_create_game: None,
            sink,
        }
    }

    /// Apply accepted login details
    pub fn login(&mut self, info: LoginInfo) {
        self.name = info.name;
        self.client_type = info.client_type;
        self.connection_type = info.connection_type;
        self.ping = info.ping;
        self.status = UserStatus::Idle;
        self.logged_in = true;
        self.last_keep_alive = Instant::now();
    }

    pub fn notify(&self, event: impl Into<LobbyEvent>) {
        if !self.sink.send(event) {
            tracing::debug!("Dropped event for user {} (session gone)", self.id);
        }
    }

    pub fn is_in_game(&self) -> bool {
        self.game.is_some()
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            name: self.name.clone(),
            ping: self.ping,
            connection_type: self.connection_type,
            status: self.status,
        }
    }

    /// Whether `last` is recent enough to count as flooding
    pub fn is_flooding(last: Option<Instant>, min_interval: std::time::Duration, now: Instant) -> bool {
        match last {
            Some(last) => !min_interval.is_zero() && now.duration_since(last) < min_interval,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn create_user() -> (LobbyUser, tokio::sync::mpsc::UnboundedReceiver<LobbyEvent>) {
        let (sink, rx) = EventSink::channel();
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        (LobbyUser::new(7, "0.83".to_string(), addr, sink), rx)
    }

    #[test]
    fn test_new_user_is_connecting() {
        let (user, _rx) = create_user();
        assert_eq!(user.status, UserStatus::Connecting);
        assert!(!user.logged_in);
        assert!(!user.is_in_game());
    }

    #[test]
    fn test_login_sets_details() {
        let (mut user, _rx) = create_user();
        user.login(LoginInfo {
            name: "alice".to_string(),
            client_type: "emu".to_string(),
            connection_type: ConnectionType::Good,
            ping: 40,
        });

        assert!(user.logged_in);
        assert_eq!(user.status, UserStatus::Idle);
        assert_eq!(user.summary().name, "alice");
        assert_eq!(user.summary().ping, 40);
    }

    #[test]
    fn test_notify_after_session_closed() {
        let (user, rx) = create_user();
        drop(rx);
        // Must not panic
        user.notify(crate::lobby::event::UserEvent::InfoMessage {
            message: "hi".to_string(),
        });
    }

    #[test]
    fn test_flood_window() {
        let now = Instant::now();
        let window = Duration::from_secs(2);
        assert!(!LobbyUser::is_flooding(None, window, now));
        assert!(LobbyUser::is_flooding(Some(now), window, now));
        assert!(!LobbyUser::is_flooding(Some(now), Duration::ZERO, now));
    }
}
