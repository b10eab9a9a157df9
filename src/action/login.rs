//! Login handshake and lobby-level notifications
//!
//! After UserInformation the server runs four ServerAck/ClientAck rounds to
//! measure the client's ping, then hands the login to the lobby.

use std::time::{Duration, Instant};

use super::{impl_action, ActionError, ActionStats, ServerEventHandler, UserEventHandler, V086Action};
use crate::lobby::{LoginInfo, ServerError, ServerEvent, UserEvent};
use crate::net::protocol::{
    ConnectionRejected, InformationMessage, Payload, ServerStatus, StatusGame, StatusUser,
    UserJoined, V086Message,
};
use crate::net::session::SessionContext;

/// Ack round trips measured before login
pub const SPEED_TEST_ROUNDS: usize = 4;

/// Round-trip timing over the ack exchange
#[derive(Debug, Default)]
pub struct SpeedTest {
    sent_at: Option<Instant>,
    samples: Vec<Duration>,
}

impl SpeedTest {
    /// A ServerAck went out at `now`
    pub fn start(&mut self, now: Instant) {
        self.sent_at = Some(now);
    }

    /// A ClientAck arrived at `now`; acks nobody asked for are ignored
    pub fn record(&mut self, now: Instant) -> bool {
        match self.sent_at.take() {
            Some(sent) => {
                self.samples.push(now.saturating_duration_since(sent));
                true
            }
            None => false,
        }
    }

    pub fn rounds(&self) -> usize {
        self.samples.len()
    }

    pub fn is_complete(&self) -> bool {
        self.samples.len() >= SPEED_TEST_ROUNDS
    }

    /// Mean round trip in whole milliseconds, at least 1
    pub fn average_ms(&self) -> u32 {
        if self.samples.is_empty() {
            return 1;
        }
        let total: Duration = self.samples.iter().sum();
        let mean = total / self.samples.len() as u32;
        u32::try_from(mean.as_millis()).unwrap_or(u32::MAX).max(1)
    }
}

/// 0x03: starts the login handshake
#[derive(Debug, Default)]
pub struct LoginAction {
    stats: ActionStats,
}

impl_action!(LoginAction, "Login");

impl V086Action for LoginAction {
    fn perform(&self, message: &V086Message, ctx: &mut SessionContext) -> Result<(), ActionError> {
        let Payload::UserInformation(info) = &message.payload else {
            return Err(ActionError::unexpected("Login", message));
        };
        if ctx.login.is_some() {
            tracing::debug!("User {} sent UserInformation twice", ctx.user_id());
            return Ok(());
        }

        ctx.login = Some(LoginInfo {
            name: info.username.clone(),
            client_type: info.client_type.clone(),
            connection_type: info.connection_type,
            ping: 0,
        });
        ctx.speed_test.start(Instant::now());
        ctx.send(Payload::ServerAck);
        Ok(())
    }
}

/// 0x06: one round of the speed test; the last round logs the user in.
/// Also renders the lobby snapshot sent on login.
#[derive(Debug, Default)]
pub struct AckAction {
    stats: ActionStats,
}

impl_action!(AckAction, "Ack");

impl V086Action for AckAction {
    fn perform(&self, message: &V086Message, ctx: &mut SessionContext) -> Result<(), ActionError> {
        if !matches!(message.payload, Payload::ClientAck) {
            return Err(ActionError::unexpected("Ack", message));
        }
        if ctx.logged_in || !ctx.speed_test.record(Instant::now()) {
            return Ok(());
        }

        if !ctx.speed_test.is_complete() {
            ctx.speed_test.start(Instant::now());
            ctx.send(Payload::ServerAck);
            return Ok(());
        }

        let Some(mut info) = ctx.login.clone() else {
            return Ok(());
        };
        info.ping = ctx.speed_test.average_ms();
        let user_id = ctx.user_id();

        match ctx.lobby().login(user_id, info.clone()) {
            Ok(()) => {
                ctx.logged_in = true;
                Ok(())
            }
            Err(ServerError::LoginDenied(reason)) => {
                ctx.send(Payload::ConnectionRejected(ConnectionRejected {
                    username: info.name,
                    user_id,
                    message: reason,
                }));
                ctx.close();
                Ok(())
            }
            Err(e) => Err(ActionError::rejected("Ack", e)),
        }
    }
}

impl UserEventHandler for AckAction {
    fn handle_user_event(&self, event: &UserEvent, ctx: &mut SessionContext) -> Result<(), ActionError> {
        let UserEvent::Connected { users, games } = event else {
            return Ok(());
        };

        let users = users
            .iter()
            .map(|user| StatusUser {
                username: user.name.clone(),
                ping: user.ping,
                status: user.status,
                user_id: user.id,
                connection_type: user.connection_type,
            })
            .collect();
        let games = games
            .iter()
            .map(|game| StatusGame {
                rom_name: game.rom_name.clone(),
                game_id: u32::from(game.id),
                client_type: game.client_type.clone(),
                username: game.owner_name.clone(),
                players: game.players_line(),
                status: game.status,
            })
            .collect();

        ctx.send(Payload::ServerStatus(ServerStatus { users, games }));
        Ok(())
    }
}

/// 0x09
#[derive(Debug, Default)]
pub struct KeepAliveAction {
    stats: ActionStats,
}

impl_action!(KeepAliveAction, "KeepAlive");

impl V086Action for KeepAliveAction {
    fn perform(&self, message: &V086Message, ctx: &mut SessionContext) -> Result<(), ActionError> {
        if !matches!(message.payload, Payload::KeepAlive { .. }) {
            return Err(ActionError::unexpected("KeepAlive", message));
        }
        let user_id = ctx.user_id();
        ctx.lobby()
            .keep_alive(user_id)
            .map_err(|e| ActionError::rejected("KeepAlive", e))
    }
}

/// Announces users that finished logging in
#[derive(Debug, Default)]
pub struct UserJoinedAction {
    stats: ActionStats,
}

impl_action!(UserJoinedAction, "UserJoined");

impl ServerEventHandler for UserJoinedAction {
    fn handle_server_event(&self, event: &ServerEvent, ctx: &mut SessionContext) -> Result<(), ActionError> {
        let ServerEvent::UserJoined { user } = event else {
            return Ok(());
        };
        ctx.send(Payload::UserJoined(UserJoined {
            username: user.name.clone(),
            user_id: user.id,
            ping: user.ping,
            connection_type: user.connection_type,
        }));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InfoMessageAction {
    stats: ActionStats,
}

impl_action!(InfoMessageAction, "InfoMessage");

impl UserEventHandler for InfoMessageAction {
    fn handle_user_event(&self, event: &UserEvent, ctx: &mut SessionContext) -> Result<(), ActionError> {
        if let UserEvent::InfoMessage { message } = event {
            ctx.send(Payload::InformationMessage(InformationMessage::new("server", message.clone())));
        }
        Ok(())
    }
}
