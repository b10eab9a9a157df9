//! Message and event actions
//!
//! Inbound messages are routed by type id through a dense table; domain
//! events are routed by kind. Both sides append their replies to the
//! session's outbox through [`SessionContext`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::lobby::event::{GameEventKind, ServerEventKind, UserEventKind};
use crate::lobby::{GameEvent, LobbyEvent, ServerError, ServerEvent, UserEvent};
use crate::net::protocol::{MessageError, MessageType, V086Message};
use crate::net::session::SessionContext;

pub mod chat;
pub mod data;
pub mod game;
pub mod login;
pub mod quit;

/// Slots in the inbound dispatch table, indexed by type id
pub const ACTION_SLOTS: usize = 25;

/// Per-action counters
#[derive(Debug, Default)]
pub struct ActionStats {
    performed: AtomicU64,
    handled: AtomicU64,
}

impl ActionStats {
    /// Inbound messages performed
    pub fn performed(&self) -> u64 {
        self.performed.load(Ordering::Relaxed)
    }

    /// Domain events handled
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    fn record_performed(&self) {
        self.performed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_handled(&self) {
        self.handled.fetch_add(1, Ordering::Relaxed);
    }
}

/// Common identity of every action
pub trait Action: Send + Sync {
    fn name(&self) -> &'static str;
    fn stats(&self) -> &ActionStats;
}

/// Handles one inbound message type
pub trait V086Action: Action {
    fn perform(&self, message: &V086Message, ctx: &mut SessionContext) -> Result<(), ActionError>;
}

pub trait ServerEventHandler: Action {
    fn handle_server_event(&self, event: &ServerEvent, ctx: &mut SessionContext) -> Result<(), ActionError>;
}

pub trait GameEventHandler: Action {
    fn handle_game_event(&self, event: &GameEvent, ctx: &mut SessionContext) -> Result<(), ActionError>;
}

pub trait UserEventHandler: Action {
    fn handle_user_event(&self, event: &UserEvent, ctx: &mut SessionContext) -> Result<(), ActionError>;
}

macro_rules! impl_action {
    ($ty:ty, $name:expr) => {
        impl $crate::action::Action for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn stats(&self) -> &$crate::action::ActionStats {
                &self.stats
            }
        }
    };
}
pub(crate) use impl_action;

/// Action failures; only [`ActionError::Fatal`] ends the session
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("no action for message type {0:#04x}")]
    Unsupported(u8),
    #[error("{action}: unexpected {message}")]
    UnexpectedMessage {
        action: &'static str,
        message: &'static str,
    },
    #[error("{action}: {source}")]
    Rejected {
        action: &'static str,
        source: ServerError,
    },
    #[error("{action}: no cached game data for key {key}")]
    CacheMiss { action: &'static str, key: u8 },
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("{action}: {reason}")]
    Fatal { action: &'static str, reason: String },
}

impl ActionError {
    /// Wrap a lobby refusal; a user the lobby no longer knows means the
    /// session cannot continue
    pub fn rejected(action: &'static str, source: ServerError) -> Self {
        match source {
            ServerError::UserNotFound(_) => ActionError::Fatal {
                action,
                reason: source.to_string(),
            },
            source => ActionError::Rejected { action, source },
        }
    }

    pub fn unexpected(action: &'static str, message: &V086Message) -> Self {
        ActionError::UnexpectedMessage {
            action,
            message: message.message_type().name(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ActionError::Fatal { .. })
    }
}

/// Counters of one action, for logging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSummary {
    pub name: &'static str,
    pub performed: u64,
    pub handled: u64,
}

/// Routing tables from type ids and event kinds to actions
pub struct ActionTable {
    actions: [Option<Arc<dyn V086Action>>; ACTION_SLOTS],
    server_events: FxHashMap<ServerEventKind, Arc<dyn ServerEventHandler>>,
    game_events: FxHashMap<GameEventKind, Arc<dyn GameEventHandler>>,
    user_events: FxHashMap<UserEventKind, Arc<dyn UserEventHandler>>,
    all: Vec<Arc<dyn Action>>,
}

impl ActionTable {
    /// Table wired with every v086 action
    pub fn new() -> Self {
        let mut table = Self::empty();

        let login = Arc::new(login::LoginAction::default());
        let ack = Arc::new(login::AckAction::default());
        let keep_alive = Arc::new(login::KeepAliveAction::default());
        let user_joined = Arc::new(login::UserJoinedAction::default());
        let info = Arc::new(login::InfoMessageAction::default());
        let quit = Arc::new(quit::QuitAction::default());
        let chat = Arc::new(chat::ChatAction::default());
        let game_chat = Arc::new(chat::GameChatAction::default());
        let create_game = Arc::new(game::CreateGameAction::default());
        let join_game = Arc::new(game::JoinGameAction::default());
        let quit_game = Arc::new(game::QuitGameAction::default());
        let start_game = Arc::new(game::StartGameAction::default());
        let ready = Arc::new(game::UserReadyAction::default());
        let drop_game = Arc::new(game::DropGameAction::default());
        let kick = Arc::new(game::GameKickAction::default());
        let close_game = Arc::new(game::CloseGameAction::default());
        let game_status = Arc::new(game::GameStatusAction::default());
        let game_desynch = Arc::new(game::GameDesynchAction::default());
        let player_desynch = Arc::new(game::PlayerDesynchAction::default());
        let game_info = Arc::new(game::GameInfoAction::default());
        let game_timeout = Arc::new(game::GameTimeoutAction::default());
        let game_data = Arc::new(data::GameDataAction::default());
        let cached_data = Arc::new(data::CachedGameDataAction::default());

        table.register(MessageType::Quit, quit.clone());
        table.register(MessageType::UserInformation, login.clone());
        table.register(MessageType::ClientAck, ack.clone());
        table.register(MessageType::Chat, chat.clone());
        table.register(MessageType::GameChat, game_chat.clone());
        table.register(MessageType::KeepAlive, keep_alive.clone());
        table.register(MessageType::CreateGame, create_game.clone());
        table.register(MessageType::QuitGame, quit_game.clone());
        table.register(MessageType::JoinGame, join_game.clone());
        table.register(MessageType::GameKick, kick.clone());
        table.register(MessageType::StartGame, start_game.clone());
        table.register(MessageType::GameData, game_data.clone());
        table.register(MessageType::CachedGameData, cached_data.clone());
        table.register(MessageType::PlayerDrop, drop_game.clone());
        table.register(MessageType::AllReady, ready.clone());

        table.server_events.insert(ServerEventKind::Chat, chat.clone());
        table.server_events.insert(ServerEventKind::GameCreated, create_game.clone());
        table.server_events.insert(ServerEventKind::UserJoined, user_joined.clone());
        table.server_events.insert(ServerEventKind::GameClosed, close_game.clone());
        table.server_events.insert(ServerEventKind::UserQuit, quit.clone());
        table.server_events.insert(ServerEventKind::GameStatusChanged, game_status.clone());

        table.game_events.insert(GameEventKind::UserJoinedGame, join_game.clone());
        table.game_events.insert(GameEventKind::UserQuitGame, quit_game.clone());
        table.game_events.insert(GameEventKind::GameStarted, start_game.clone());
        table.game_events.insert(GameEventKind::GameChat, game_chat.clone());
        table.game_events.insert(GameEventKind::AllReady, ready.clone());
        table.game_events.insert(GameEventKind::GameData, game_data.clone());
        table.game_events.insert(GameEventKind::UserDropped, drop_game.clone());
        table.game_events.insert(GameEventKind::GameDesynch, game_desynch.clone());
        table.game_events.insert(GameEventKind::PlayerDesynch, player_desynch.clone());
        table.game_events.insert(GameEventKind::GameInfo, game_info.clone());
        table.game_events.insert(GameEventKind::GameTimeout, game_timeout.clone());

        table.user_events.insert(UserEventKind::Connected, ack.clone());
        table.user_events.insert(UserEventKind::InfoMessage, info.clone());
        table.user_events.insert(UserEventKind::Disconnected, quit.clone());

        table.all = vec![
            login, ack, keep_alive, user_joined, info, quit, chat, game_chat, create_game,
            join_game, quit_game, start_game, ready, drop_game, kick, close_game, game_status,
            game_desynch, player_desynch, game_info, game_timeout, game_data, cached_data,
        ];
        table
    }

    fn empty() -> Self {
        Self {
            actions: std::array::from_fn(|_| None),
            server_events: FxHashMap::default(),
            game_events: FxHashMap::default(),
            user_events: FxHashMap::default(),
            all: Vec::new(),
        }
    }

    fn register(&mut self, message_type: MessageType, action: Arc<dyn V086Action>) {
        self.actions[usize::from(message_type.id())] = Some(action);
    }

    /// Action registered for a type id
    pub fn action(&self, type_id: u8) -> Option<&Arc<dyn V086Action>> {
        self.actions.get(usize::from(type_id))?.as_ref()
    }

    /// Route an inbound message to its action
    pub fn dispatch(&self, message: &V086Message, ctx: &mut SessionContext) -> Result<(), ActionError> {
        let action = self
            .action(message.type_id())
            .ok_or(ActionError::Unsupported(message.type_id()))?;
        action.stats().record_performed();
        action.perform(message, ctx)
    }

    /// Route a domain event to its handler; unmapped kinds are ignored
    pub fn handle_event(&self, event: &LobbyEvent, ctx: &mut SessionContext) -> Result<(), ActionError> {
        match event {
            LobbyEvent::Server(event) => {
                if let Some(handler) = self.server_events.get(&event.kind()) {
                    handler.stats().record_handled();
                    return handler.handle_server_event(event, ctx);
                }
            }
            LobbyEvent::Game(event) => {
                if let Some(handler) = self.game_events.get(&event.kind()) {
                    handler.stats().record_handled();
                    return handler.handle_game_event(event, ctx);
                }
            }
            LobbyEvent::User(event) => {
                if let Some(handler) = self.user_events.get(&event.kind()) {
                    handler.stats().record_handled();
                    return handler.handle_user_event(event, ctx);
                }
            }
        }
        tracing::debug!("No handler for event {:?}", event);
        Ok(())
    }

    pub fn summaries(&self) -> Vec<ActionSummary> {
        self.all
            .iter()
            .map(|action| ActionSummary {
                name: action.name(),
                performed: action.stats().performed(),
                handled: action.stats().handled(),
            })
            .collect()
    }
}

impl Default for ActionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Sessions wired to a real lobby, for action tests
#[cfg(test)]
pub(crate) mod test_support {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::config::ServerConfig;
    use crate::lobby::{EventSink, Lobby, LobbyEvent, LoginInfo};
    use crate::net::protocol::ConnectionType;
    use crate::net::session::SessionContext;

    pub(crate) fn lobby() -> Arc<Lobby> {
        Arc::new(Lobby::new(ServerConfig {
            chat_flood_time: Duration::ZERO,
            create_game_flood_time: Duration::ZERO,
            ..ServerConfig::default()
        }))
    }

    /// Connected but not logged in
    pub(crate) fn connected(lobby: &Arc<Lobby>) -> (SessionContext, UnboundedReceiver<LobbyEvent>) {
        let (sink, events) = EventSink::channel();
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let user_id = lobby.new_connection(addr, "0.83", sink).unwrap();
        (SessionContext::new(user_id, Arc::clone(lobby)), events)
    }

    pub(crate) fn logged_in(lobby: &Arc<Lobby>, name: &str) -> (SessionContext, UnboundedReceiver<LobbyEvent>) {
        let (mut ctx, events) = connected(lobby);
        let info = LoginInfo {
            name: name.to_string(),
            client_type: "emu".to_string(),
            connection_type: ConnectionType::Good,
            ping: 30,
        };
        lobby.login(ctx.user_id(), info.clone()).unwrap();
        ctx.login = Some(info);
        ctx.logged_in = true;
        (ctx, events)
    }

    pub(crate) fn drain(events: &mut UnboundedReceiver<LobbyEvent>) -> Vec<LobbyEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }
}
