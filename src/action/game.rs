//! Game room actions

use super::{
    impl_action, ActionError, ActionStats, GameEventHandler, ServerEventHandler, V086Action,
};
use crate::lobby::{GameEvent, ServerError, ServerEvent};
use crate::net::protocol::{
    checked_u8, Chat, CreateGame, GameStatusUpdate, InformationMessage, JoinGame, Payload,
    PlayerDrop, PlayerEntry, PlayerInformation, QuitGame, StartGame, V086Message,
};
use crate::net::session::SessionContext;

/// Tell the client a create or join failed, and that it is not in a game
fn refuse_game(action: &'static str, error: ServerError, ctx: &mut SessionContext) -> ActionError {
    ctx.send(Payload::InformationMessage(InformationMessage::new(
        "server",
        format!("{} failed: {}", action, error),
    )));
    let username = ctx.username().to_string();
    match QuitGame::notification(username, ctx.user_id()) {
        Ok(quit) => ctx.send(Payload::QuitGame(quit)),
        Err(e) => tracing::debug!("No QuitGame for user {}: {}", ctx.user_id(), e),
    }
    ActionError::rejected(action, error)
}

/// 0x0A
#[derive(Debug, Default)]
pub struct CreateGameAction {
    stats: ActionStats,
}

impl_action!(CreateGameAction, "CreateGame");

impl V086Action for CreateGameAction {
    fn perform(&self, message: &V086Message, ctx: &mut SessionContext) -> Result<(), ActionError> {
        let Payload::CreateGame(CreateGame::Request { rom_name }) = &message.payload else {
            return Err(ActionError::unexpected("CreateGame", message));
        };
        let user_id = ctx.user_id();
        match ctx.lobby().create_game(user_id, rom_name) {
            Ok(game_id) => {
                tracing::debug!("User {} created game {}", user_id, game_id);
                Ok(())
            }
            Err(e) => Err(refuse_game("CreateGame", e, ctx)),
        }
    }
}

impl ServerEventHandler for CreateGameAction {
    fn handle_server_event(&self, event: &ServerEvent, ctx: &mut SessionContext) -> Result<(), ActionError> {
        if let ServerEvent::GameCreated { game } = event {
            ctx.send(Payload::CreateGame(CreateGame::notification(
                game.owner_name.clone(),
                game.rom_name.clone(),
                game.client_type.clone(),
                game.id,
                0u16,
            )?));
        }
        Ok(())
    }
}

/// 0x0C
#[derive(Debug, Default)]
pub struct JoinGameAction {
    stats: ActionStats,
}

impl_action!(JoinGameAction, "JoinGame");

impl V086Action for JoinGameAction {
    fn perform(&self, message: &V086Message, ctx: &mut SessionContext) -> Result<(), ActionError> {
        let Payload::JoinGame(JoinGame::Request { game_id, .. }) = &message.payload else {
            return Err(ActionError::unexpected("JoinGame", message));
        };
        let user_id = ctx.user_id();
        match ctx.lobby().join_game(user_id, *game_id) {
            Ok(()) => Ok(()),
            Err(e) => Err(refuse_game("JoinGame", e, ctx)),
        }
    }
}

impl GameEventHandler for JoinGameAction {
    fn handle_game_event(&self, event: &GameEvent, ctx: &mut SessionContext) -> Result<(), ActionError> {
        let GameEvent::UserJoinedGame {
            game_id,
            user,
            players,
        } = event
        else {
            return Ok(());
        };

        // The joining player learns who was already seated
        if user.id == ctx.user_id() {
            let players = players
                .iter()
                .map(|player| PlayerEntry {
                    username: player.name.clone(),
                    ping: player.ping,
                    user_id: player.id,
                    connection_type: player.connection_type,
                })
                .collect();
            ctx.send(Payload::PlayerInformation(PlayerInformation { players }));
        }

        ctx.send(Payload::JoinGame(JoinGame::notification(
            u32::from(*game_id),
            user.name.clone(),
            user.ping,
            user.id,
            user.connection_type,
        )?));
        Ok(())
    }
}

/// 0x0B
#[derive(Debug, Default)]
pub struct QuitGameAction {
    stats: ActionStats,
}

impl_action!(QuitGameAction, "QuitGame");

impl V086Action for QuitGameAction {
    fn perform(&self, message: &V086Message, ctx: &mut SessionContext) -> Result<(), ActionError> {
        if !matches!(message.payload, Payload::QuitGame(QuitGame::Request)) {
            return Err(ActionError::unexpected("QuitGame", message));
        }
        let user_id = ctx.user_id();
        ctx.lobby()
            .quit_game(user_id)
            .map_err(|e| ActionError::rejected("QuitGame", e))
    }
}

impl GameEventHandler for QuitGameAction {
    fn handle_game_event(&self, event: &GameEvent, ctx: &mut SessionContext) -> Result<(), ActionError> {
        if let GameEvent::UserQuitGame {
            user_id, username, ..
        } = event
        {
            ctx.send(Payload::QuitGame(QuitGame::notification(username.clone(), *user_id)?));
        }
        Ok(())
    }
}

/// 0x11
#[derive(Debug, Default)]
pub struct StartGameAction {
    stats: ActionStats,
}

impl_action!(StartGameAction, "StartGame");

impl V086Action for StartGameAction {
    fn perform(&self, message: &V086Message, ctx: &mut SessionContext) -> Result<(), ActionError> {
        if !matches!(message.payload, Payload::StartGame(StartGame::Request)) {
            return Err(ActionError::unexpected("StartGame", message));
        }
        let user_id = ctx.user_id();
        ctx.lobby()
            .start_game(user_id)
            .map_err(|e| ActionError::rejected("StartGame", e))
    }
}

impl GameEventHandler for StartGameAction {
    fn handle_game_event(&self, event: &GameEvent, ctx: &mut SessionContext) -> Result<(), ActionError> {
        let GameEvent::GameStarted {
            player_number,
            num_players,
            ..
        } = event
        else {
            return Ok(());
        };

        ctx.reset_game_caches();
        let frame_delay = ctx
            .login
            .as_ref()
            .map_or(1, |info| info.connection_type.frame_delay());
        ctx.send(Payload::StartGame(StartGame::notification(
            u16::from(frame_delay),
            *player_number as u64,
            *num_players as u64,
        )?));
        Ok(())
    }
}

/// 0x15
#[derive(Debug, Default)]
pub struct UserReadyAction {
    stats: ActionStats,
}

impl_action!(UserReadyAction, "UserReady");

impl V086Action for UserReadyAction {
    fn perform(&self, message: &V086Message, ctx: &mut SessionContext) -> Result<(), ActionError> {
        if !matches!(message.payload, Payload::AllReady) {
            return Err(ActionError::unexpected("UserReady", message));
        }
        let user_id = ctx.user_id();
        ctx.lobby()
            .ready(user_id)
            .map_err(|e| ActionError::rejected("UserReady", e))
    }
}

impl GameEventHandler for UserReadyAction {
    fn handle_game_event(&self, event: &GameEvent, ctx: &mut SessionContext) -> Result<(), ActionError> {
        if let GameEvent::AllReady { .. } = event {
            ctx.send(Payload::AllReady);
        }
        Ok(())
    }
}

/// 0x14
#[derive(Debug, Default)]
pub struct DropGameAction {
    stats: ActionStats,
}

impl_action!(DropGameAction, "DropGame");

impl V086Action for DropGameAction {
    fn perform(&self, message: &V086Message, ctx: &mut SessionContext) -> Result<(), ActionError> {
        if !matches!(message.payload, Payload::PlayerDrop(PlayerDrop::Request)) {
            return Err(ActionError::unexpected("DropGame", message));
        }
        let user_id = ctx.user_id();
        ctx.lobby()
            .drop_game(user_id)
            .map_err(|e| ActionError::rejected("DropGame", e))
    }
}

impl GameEventHandler for DropGameAction {
    fn handle_game_event(&self, event: &GameEvent, ctx: &mut SessionContext) -> Result<(), ActionError> {
        if let GameEvent::UserDropped {
            username,
            player_number,
            ..
        } = event
        {
            ctx.send(Payload::PlayerDrop(PlayerDrop::notification(
                username.clone(),
                *player_number as u64,
            )?));
        }
        Ok(())
    }
}

/// 0x0F
#[derive(Debug, Default)]
pub struct GameKickAction {
    stats: ActionStats,
}

impl_action!(GameKickAction, "GameKick");

impl V086Action for GameKickAction {
    fn perform(&self, message: &V086Message, ctx: &mut SessionContext) -> Result<(), ActionError> {
        let Payload::GameKick { user_id: target } = message.payload else {
            return Err(ActionError::unexpected("GameKick", message));
        };
        let user_id = ctx.user_id();
        ctx.lobby()
            .kick(user_id, target)
            .map_err(|e| ActionError::rejected("GameKick", e))
    }
}

#[derive(Debug, Default)]
pub struct CloseGameAction {
    stats: ActionStats,
}

impl_action!(CloseGameAction, "CloseGame");

impl ServerEventHandler for CloseGameAction {
    fn handle_server_event(&self, event: &ServerEvent, ctx: &mut SessionContext) -> Result<(), ActionError> {
        if let ServerEvent::GameClosed { game_id } = event {
            ctx.send(Payload::CloseGame {
                game_id: u32::from(*game_id),
                val1: 0,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct GameStatusAction {
    stats: ActionStats,
}

impl_action!(GameStatusAction, "GameStatus");

impl ServerEventHandler for GameStatusAction {
    fn handle_server_event(&self, event: &ServerEvent, ctx: &mut SessionContext) -> Result<(), ActionError> {
        if let ServerEvent::GameStatusChanged { game } = event {
            ctx.send(Payload::GameStatus(GameStatusUpdate {
                game_id: u32::from(game.id),
                val1: 0,
                status: game.status,
                num_players: checked_u8("GameStatus", "player count", game.num_players as u64)?,
                max_players: checked_u8("GameStatus", "max players", game.max_players as u64)?,
            }));
        }
        Ok(())
    }
}

/// Server notices shown in the game's chat window
fn game_notice(ctx: &mut SessionContext, message: &str) -> Result<(), ActionError> {
    ctx.send(Payload::GameChat(Chat::notification("Server", message)?));
    Ok(())
}

#[derive(Debug, Default)]
pub struct GameDesynchAction {
    stats: ActionStats,
}

impl_action!(GameDesynchAction, "GameDesynch");

impl GameEventHandler for GameDesynchAction {
    fn handle_game_event(&self, event: &GameEvent, ctx: &mut SessionContext) -> Result<(), ActionError> {
        match event {
            GameEvent::GameDesynch { message, .. } => game_notice(ctx, message),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct PlayerDesynchAction {
    stats: ActionStats,
}

impl_action!(PlayerDesynchAction, "PlayerDesynch");

impl GameEventHandler for PlayerDesynchAction {
    fn handle_game_event(&self, event: &GameEvent, ctx: &mut SessionContext) -> Result<(), ActionError> {
        match event {
            GameEvent::PlayerDesynch { message, .. } => game_notice(ctx, message),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct GameInfoAction {
    stats: ActionStats,
}

impl_action!(GameInfoAction, "GameInfo");

impl GameEventHandler for GameInfoAction {
    fn handle_game_event(&self, event: &GameEvent, ctx: &mut SessionContext) -> Result<(), ActionError> {
        match event {
            GameEvent::GameInfo { message, .. } => game_notice(ctx, message),
            _ => Ok(()),
        }
    }
}

/// A running game stalled on this player; repeat the last datagram in case
/// it was lost
#[derive(Debug, Default)]
pub struct GameTimeoutAction {
    stats: ActionStats,
}

impl_action!(GameTimeoutAction, "GameTimeout");

impl GameEventHandler for GameTimeoutAction {
    fn handle_game_event(&self, event: &GameEvent, ctx: &mut SessionContext) -> Result<(), ActionError> {
        if let GameEvent::GameTimeout {
            game_id,
            user_id,
            timeout_number,
        } = event
        {
            if *user_id == ctx.user_id() {
                tracing::debug!(
                    "Game {} timeout #{} for user {}, resending",
                    game_id,
                    timeout_number,
                    user_id
                );
                ctx.request_resend();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::test_support::{drain, lobby, logged_in};
    use crate::lobby::LobbyEvent;
    use crate::net::protocol::ConnectionType;

    fn assert_refused(ctx: &mut SessionContext, action: &str) {
        let sent = ctx.take_outbox();
        assert_eq!(sent.len(), 2, "{:?}", sent);
        assert!(matches!(
            sent[0].payload,
            Payload::InformationMessage(ref info) if info.message.starts_with(&format!("{} failed", action))
        ));
        assert_eq!(
            sent[1].payload,
            Payload::QuitGame(QuitGame::notification(ctx.username(), ctx.user_id()).unwrap())
        );
    }

    #[test]
    fn test_join_missing_game_refused() {
        let (mut ctx, _events) = logged_in(&lobby(), "alice");
        let message = V086Message::new(0, Payload::JoinGame(JoinGame::request(42, ConnectionType::Good)));

        let err = JoinGameAction::default().perform(&message, &mut ctx).unwrap_err();

        assert!(matches!(
            err,
            ActionError::Rejected {
                action: "JoinGame",
                source: ServerError::GameNotFound(42)
            }
        ));
        assert_refused(&mut ctx, "JoinGame");
    }

    #[test]
    fn test_second_create_refused() {
        let lobby = lobby();
        let (mut ctx, _events) = logged_in(&lobby, "alice");
        let message = V086Message::new(0, Payload::CreateGame(CreateGame::request("Test Game")));
        let action = CreateGameAction::default();

        action.perform(&message, &mut ctx).unwrap();
        assert!(ctx.take_outbox().is_empty());
        assert_eq!(lobby.game_count(), 1);

        let err = action.perform(&message, &mut ctx).unwrap_err();
        assert!(matches!(
            err,
            ActionError::Rejected {
                source: ServerError::AlreadyInGame,
                ..
            }
        ));
        assert_refused(&mut ctx, "CreateGame");
        assert_eq!(lobby.game_count(), 1);
    }

    #[test]
    fn test_joining_player_learns_who_is_seated() {
        let lobby = lobby();
        let (mut owner, _owner_events) = logged_in(&lobby, "alice");
        let (mut guest, mut guest_events) = logged_in(&lobby, "bob");

        let create = V086Message::new(0, Payload::CreateGame(CreateGame::request("Test Game")));
        CreateGameAction::default().perform(&create, &mut owner).unwrap();
        let game_id = lobby.user_game(owner.user_id()).unwrap();
        drain(&mut guest_events);

        let join = V086Message::new(
            0,
            Payload::JoinGame(JoinGame::request(u32::from(game_id), ConnectionType::Good)),
        );
        JoinGameAction::default().perform(&join, &mut guest).unwrap();

        let joined = drain(&mut guest_events)
            .into_iter()
            .find_map(|event| match event {
                LobbyEvent::Game(event @ GameEvent::UserJoinedGame { .. }) => Some(event),
                _ => None,
            })
            .unwrap();
        JoinGameAction::default().handle_game_event(&joined, &mut guest).unwrap();

        let sent = guest.take_outbox();
        assert_eq!(sent.len(), 2);
        let Payload::PlayerInformation(ref info) = sent[0].payload else {
            panic!("expected PlayerInformation, got {:?}", sent[0].payload);
        };
        assert_eq!(info.players.len(), 1);
        assert_eq!(info.players[0].username, "alice");
        assert!(matches!(sent[1].payload, Payload::JoinGame(JoinGame::Notification { .. })));
    }

    #[test]
    fn test_game_start_clears_caches() {
        let (mut ctx, _events) = logged_in(&lobby(), "alice");
        ctx.in_cache.add(vec![1]);
        ctx.out_cache.add(vec![2]);

        let started = GameEvent::GameStarted {
            game_id: 1,
            player_number: 2,
            num_players: 3,
        };
        StartGameAction::default().handle_game_event(&started, &mut ctx).unwrap();

        assert!(ctx.in_cache.is_empty());
        assert!(ctx.out_cache.is_empty());
        assert_eq!(
            ctx.take_outbox()[0].payload,
            Payload::StartGame(
                StartGame::notification(u16::from(ConnectionType::Good.frame_delay()), 2u64, 3u64).unwrap()
            )
        );
    }

    #[test]
    fn test_timeout_resends_only_for_stalled_player() {
        let (mut ctx, _events) = logged_in(&lobby(), "alice");
        let action = GameTimeoutAction::default();

        let other = GameEvent::GameTimeout {
            game_id: 1,
            user_id: ctx.user_id().wrapping_add(1),
            timeout_number: 1,
        };
        action.handle_game_event(&other, &mut ctx).unwrap();
        assert!(!ctx.take_resend());

        let own = GameEvent::GameTimeout {
            game_id: 1,
            user_id: ctx.user_id(),
            timeout_number: 2,
        };
        action.handle_game_event(&own, &mut ctx).unwrap();
        assert!(ctx.take_resend());
    }
}
