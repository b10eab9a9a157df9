//! Domain events delivered to connected users
//!
//! Every user owns one unbounded FIFO channel; the lobby pushes events into
//! it while holding its lock, so each user observes events in the order the
//! lobby produced them.

use tokio::sync::mpsc;

use crate::lobby::{GameId, UserId};
use crate::net::protocol::{ConnectionType, GameStatus, UserStatus};

/// Public view of a user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSummary {
    pub id: UserId,
    pub name: String,
    pub ping: u32,
    pub connection_type: ConnectionType,
    pub status: UserStatus,
}

/// Public view of a game
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameSummary {
    pub id: GameId,
    pub rom_name: String,
    pub owner_name: String,
    pub client_type: String,
    pub status: GameStatus,
    pub num_players: usize,
    pub max_players: usize,
}

impl GameSummary {
    /// Player count as shown in lobby listings, e.g. `2/8`
    pub fn players_line(&self) -> String {
        format!("{}/{}", self.num_players, self.max_players)
    }
}

/// Events broadcast to every logged-in user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Chat { username: String, message: String },
    GameCreated { game: GameSummary },
    UserJoined { user: UserSummary },
    GameClosed { game_id: GameId },
    UserQuit {
        user_id: UserId,
        username: String,
        message: String,
    },
    GameStatusChanged { game: GameSummary },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    Chat,
    GameCreated,
    UserJoined,
    GameClosed,
    UserQuit,
    GameStatusChanged,
}

impl ServerEvent {
    pub fn kind(&self) -> ServerEventKind {
        match self {
            ServerEvent::Chat { .. } => ServerEventKind::Chat,
            ServerEvent::GameCreated { .. } => ServerEventKind::GameCreated,
            ServerEvent::UserJoined { .. } => ServerEventKind::UserJoined,
            ServerEvent::GameClosed { .. } => ServerEventKind::GameClosed,
            ServerEvent::UserQuit { .. } => ServerEventKind::UserQuit,
            ServerEvent::GameStatusChanged { .. } => ServerEventKind::GameStatusChanged,
        }
    }
}

/// Events sent to the players of one game
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameEvent {
    /// `players` lists everyone in the game before `user` joined
    UserJoinedGame {
        game_id: GameId,
        user: UserSummary,
        players: Vec<UserSummary>,
    },
    UserQuitGame {
        game_id: GameId,
        user_id: UserId,
        username: String,
    },
    /// Built per recipient: `player_number` is the recipient's own slot
    GameStarted {
        game_id: GameId,
        player_number: usize,
        num_players: usize,
    },
    GameChat {
        game_id: GameId,
        username: String,
        message: String,
    },
    AllReady { game_id: GameId },
    GameData { game_id: GameId, data: Vec<u8> },
    UserDropped {
        game_id: GameId,
        username: String,
        player_number: usize,
    },
    GameDesynch { game_id: GameId, message: String },
    PlayerDesynch { game_id: GameId, message: String },
    GameInfo { game_id: GameId, message: String },
    GameTimeout {
        game_id: GameId,
        user_id: UserId,
        timeout_number: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameEventKind {
    UserJoinedGame,
    UserQuitGame,
    GameStarted,
    GameChat,
    AllReady,
    GameData,
    UserDropped,
    GameDesynch,
    PlayerDesynch,
    GameInfo,
    GameTimeout,
}

impl GameEvent {
    pub fn kind(&self) -> GameEventKind {
        match self {
            GameEvent::UserJoinedGame { .. } => GameEventKind::UserJoinedGame,
            GameEvent::UserQuitGame { .. } => GameEventKind::UserQuitGame,
            GameEvent::GameStarted { .. } => GameEventKind::GameStarted,
            GameEvent::GameChat { .. } => GameEventKind::GameChat,
            GameEvent::AllReady { .. } => GameEventKind::AllReady,
            GameEvent::GameData { .. } => GameEventKind::GameData,
            GameEvent::UserDropped { .. } => GameEventKind::UserDropped,
            GameEvent::GameDesynch { .. } => GameEventKind::GameDesynch,
            GameEvent::PlayerDesynch { .. } => GameEventKind::PlayerDesynch,
            GameEvent::GameInfo { .. } => GameEventKind::GameInfo,
            GameEvent::GameTimeout { .. } => GameEventKind::GameTimeout,
        }
    }
}

/// Events addressed to a single user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserEvent {
    /// Login accepted; carries the lobby as it looked at that moment
    Connected {
        users: Vec<UserSummary>,
        games: Vec<GameSummary>,
    },
    InfoMessage { message: String },
    /// The lobby dropped this user without a quit broadcast
    Disconnected { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserEventKind {
    Connected,
    InfoMessage,
    Disconnected,
}

impl UserEvent {
    pub fn kind(&self) -> UserEventKind {
        match self {
            UserEvent::Connected { .. } => UserEventKind::Connected,
            UserEvent::InfoMessage { .. } => UserEventKind::InfoMessage,
            UserEvent::Disconnected { .. } => UserEventKind::Disconnected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LobbyEvent {
    Server(ServerEvent),
    Game(GameEvent),
    User(UserEvent),
}

impl From<ServerEvent> for LobbyEvent {
    fn from(event: ServerEvent) -> Self {
        LobbyEvent::Server(event)
    }
}

impl From<GameEvent> for LobbyEvent {
    fn from(event: GameEvent) -> Self {
        LobbyEvent::Game(event)
    }
}

impl From<UserEvent> for LobbyEvent {
    fn from(event: UserEvent) -> Self {
        LobbyEvent::User(event)
    }
}

/// Sending half of a user's event channel
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<LobbyEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LobbyEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an event; returns false once the session has gone away
    pub fn send(&self, event: impl Into<LobbyEvent>) -> bool {
        self.tx.send(event.into()).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
