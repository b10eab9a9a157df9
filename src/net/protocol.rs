//! v086 in-session messages
//!
//! Every message travels as `u16 number, u16 length, u8 type id, body`
//! where `length` counts the type id plus the body. Several message types
//! are used in both directions with one layout; the request form is told
//! apart from the notification form by sentinel field values.

use std::fmt;

use crate::net::framing::{string_len, FrameBuilder, FrameReader};

/// Maximum number of messages carried by one datagram
pub const MAX_BUNDLE_SIZE: usize = 9;

/// Bytes preceding the body: number, length and type id
pub const HEADER_LEN: usize = 5;

/// Sentinel id carried by request variants
pub const NO_ID: u16 = 0xFFFF;

const NO_PLAYER: u8 = 0xFF;
const MARKER: u8 = 0x00;
const ACK_BODY_LEN: usize = 17;

/// Decode failure for a single message or bundle
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("{message}: need {needed} more bytes, {remaining} remaining")]
    Truncated {
        message: &'static str,
        needed: usize,
        remaining: usize,
    },
    #[error("{message}: string is missing its stop byte")]
    UnterminatedString { message: &'static str },
    #[error("{message}: expected marker byte 0x00, found {found:#04x}")]
    InvalidMarker { message: &'static str, found: u8 },
    #[error("{message}: invalid {field} value {value}")]
    InvalidField {
        message: &'static str,
        field: &'static str,
        value: u32,
    },
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),
    #[error("invalid message length {length} with {remaining} bytes remaining")]
    InvalidLength { length: usize, remaining: usize },
    #[error("bundle declares no messages")]
    EmptyBundle,
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Protocol violation detected while constructing a message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("{message}: {field} must not be blank")]
    Blank {
        message: &'static str,
        field: &'static str,
    },
    #[error("{message}: {field} out of range: {value}")]
    OutOfRange {
        message: &'static str,
        field: &'static str,
        value: u64,
    },
    #[error("{message}: notification fields match the request sentinels")]
    LooksLikeRequest { message: &'static str },
}

/// Narrow a domain value into an unsigned short field
pub fn checked_u16(
    message: &'static str,
    field: &'static str,
    value: impl Into<u64>,
) -> Result<u16, MessageError> {
    let value = value.into();
    u16::try_from(value).map_err(|_| MessageError::OutOfRange {
        message,
        field,
        value,
    })
}

/// Narrow a domain value into a byte field
pub fn checked_u8(
    message: &'static str,
    field: &'static str,
    value: impl Into<u64>,
) -> Result<u8, MessageError> {
    let value = value.into();
    u8::try_from(value).map_err(|_| MessageError::OutOfRange {
        message,
        field,
        value,
    })
}

fn require_text(message: &'static str, field: &'static str, value: &str) -> Result<(), MessageError> {
    if value.trim().is_empty() {
        Err(MessageError::Blank { message, field })
    } else {
        Ok(())
    }
}

/// Message type ids, `0x01..=0x17`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Quit = 0x01,
    UserJoined = 0x02,
    UserInformation = 0x03,
    ServerStatus = 0x04,
    ServerAck = 0x05,
    ClientAck = 0x06,
    Chat = 0x07,
    GameChat = 0x08,
    KeepAlive = 0x09,
    CreateGame = 0x0A,
    QuitGame = 0x0B,
    JoinGame = 0x0C,
    PlayerInformation = 0x0D,
    GameStatus = 0x0E,
    GameKick = 0x0F,
    CloseGame = 0x10,
    StartGame = 0x11,
    GameData = 0x12,
    CachedGameData = 0x13,
    PlayerDrop = 0x14,
    AllReady = 0x15,
    ConnectionRejected = 0x16,
    InformationMessage = 0x17,
}

impl MessageType {
    pub const ALL: [MessageType; 23] = [
        MessageType::Quit,
        MessageType::UserJoined,
        MessageType::UserInformation,
        MessageType::ServerStatus,
        MessageType::ServerAck,
        MessageType::ClientAck,
        MessageType::Chat,
        MessageType::GameChat,
        MessageType::KeepAlive,
        MessageType::CreateGame,
        MessageType::QuitGame,
        MessageType::JoinGame,
        MessageType::PlayerInformation,
        MessageType::GameStatus,
        MessageType::GameKick,
        MessageType::CloseGame,
        MessageType::StartGame,
        MessageType::GameData,
        MessageType::CachedGameData,
        MessageType::PlayerDrop,
        MessageType::AllReady,
        MessageType::ConnectionRejected,
        MessageType::InformationMessage,
    ];

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x01..=0x17 => Some(Self::ALL[usize::from(id) - 1]),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::Quit => "Quit",
            MessageType::UserJoined => "UserJoined",
            MessageType::UserInformation => "UserInformation",
            MessageType::ServerStatus => "ServerStatus",
            MessageType::ServerAck => "ServerAck",
            MessageType::ClientAck => "ClientAck",
            MessageType::Chat => "Chat",
            MessageType::GameChat => "GameChat",
            MessageType::KeepAlive => "KeepAlive",
            MessageType::CreateGame => "CreateGame",
            MessageType::QuitGame => "QuitGame",
            MessageType::JoinGame => "JoinGame",
            MessageType::PlayerInformation => "PlayerInformation",
            MessageType::GameStatus => "GameStatus",
            MessageType::GameKick => "GameKick",
            MessageType::CloseGame => "CloseGame",
            MessageType::StartGame => "StartGame",
            MessageType::GameData => "GameData",
            MessageType::CachedGameData => "CachedGameData",
            MessageType::PlayerDrop => "PlayerDrop",
            MessageType::AllReady => "AllReady",
            MessageType::ConnectionRejected => "ConnectionRejected",
            MessageType::InformationMessage => "InformationMessage",
        }
    }
}

/// Connection quality reported by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionType {
    Lan = 1,
    Excellent = 2,
    Good = 3,
    Average = 4,
    Low = 5,
    Bad = 6,
}

impl ConnectionType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ConnectionType::Lan),
            2 => Some(ConnectionType::Excellent),
            3 => Some(ConnectionType::Good),
            4 => Some(ConnectionType::Average),
            5 => Some(ConnectionType::Low),
            6 => Some(ConnectionType::Bad),
            _ => None,
        }
    }

    /// Frames the client batches into each GameData message
    pub fn frame_delay(self) -> u8 {
        self as u8
    }
}

/// Game state as shown in lobby listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GameStatus {
    Waiting = 0,
    Playing = 1,
    Synchronizing = 2,
}

impl GameStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(GameStatus::Waiting),
            1 => Some(GameStatus::Playing),
            2 => Some(GameStatus::Synchronizing),
            _ => None,
        }
    }
}

/// User state as shown in lobby listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UserStatus {
    Playing = 0,
    Idle = 1,
    Connecting = 2,
}

impl UserStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(UserStatus::Playing),
            1 => Some(UserStatus::Idle),
            2 => Some(UserStatus::Connecting),
            _ => None,
        }
    }
}

/// Bounds-checked reader over one message body
struct BodyReader<'a> {
    reader: FrameReader<'a>,
    message: &'static str,
}

impl<'a> BodyReader<'a> {
    fn new(body: &'a [u8], message: &'static str) -> Self {
        Self {
            reader: FrameReader::new(body),
            message,
        }
    }

    /// Fail unless at least `needed` bytes are left for the rest of the message
    fn require(&self, needed: usize) -> Result<(), ParseError> {
        let remaining = self.reader.remaining();
        if remaining < needed {
            return Err(ParseError::Truncated {
                message: self.message,
                needed,
                remaining,
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, ParseError> {
        self.require(1)?;
        self.reader.read_u8().ok_or(ParseError::Truncated {
            message: self.message,
            needed: 1,
            remaining: 0,
        })
    }

    fn u16(&mut self) -> Result<u16, ParseError> {
        self.require(2)?;
        self.reader.read_u16().ok_or(ParseError::Truncated {
            message: self.message,
            needed: 2,
            remaining: 0,
        })
    }

    fn u32(&mut self) -> Result<u32, ParseError> {
        self.require(4)?;
        self.reader.read_u32().ok_or(ParseError::Truncated {
            message: self.message,
            needed: 4,
            remaining: 0,
        })
    }

    fn bytes(&mut self, n: usize) -> Result<Vec<u8>, ParseError> {
        self.require(n)?;
        self.reader
            .read(n)
            .map(<[u8]>::to_vec)
            .ok_or(ParseError::Truncated {
                message: self.message,
                needed: n,
                remaining: 0,
            })
    }

    fn string(&mut self) -> Result<String, ParseError> {
        self.reader
            .read_string()
            .ok_or(ParseError::UnterminatedString {
                message: self.message,
            })
    }

    fn marker(&mut self) -> Result<(), ParseError> {
        let found = self.u8()?;
        if found != MARKER {
            return Err(ParseError::InvalidMarker {
                message: self.message,
                found,
            });
        }
        Ok(())
    }

    fn connection_type(&mut self) -> Result<ConnectionType, ParseError> {
        let value = self.u8()?;
        ConnectionType::from_u8(value).ok_or(ParseError::InvalidField {
            message: self.message,
            field: "connection type",
            value: u32::from(value),
        })
    }

    fn game_status(&mut self) -> Result<GameStatus, ParseError> {
        let value = self.u8()?;
        GameStatus::from_u8(value).ok_or(ParseError::InvalidField {
            message: self.message,
            field: "game status",
            value: u32::from(value),
        })
    }

    fn user_status(&mut self) -> Result<UserStatus, ParseError> {
        let value = self.u8()?;
        UserStatus::from_u8(value).ok_or(ParseError::InvalidField {
            message: self.message,
            field: "user status",
            value: u32::from(value),
        })
    }

    /// Upper bound for preallocating `count` entries of at least `min_len` bytes
    fn capacity_for(&self, count: u32, min_len: usize) -> usize {
        (count as usize).min(self.reader.remaining() / min_len)
    }
}

/// 0x01: a user left the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Quit {
    Request {
        message: String,
    },
    Notification {
        username: String,
        user_id: u16,
        message: String,
    },
}

impl Quit {
    pub fn request(message: impl Into<String>) -> Self {
        Quit::Request {
            message: message.into(),
        }
    }

    pub fn notification(
        username: impl Into<String>,
        user_id: u16,
        message: impl Into<String>,
    ) -> Result<Self, MessageError> {
        let username = username.into();
        require_text("Quit", "username", &username)?;
        Ok(Quit::Notification {
            username,
            user_id,
            message: message.into(),
        })
    }

    fn parts(&self) -> (&str, u16, &str) {
        match self {
            Quit::Request { message } => ("", NO_ID, message),
            Quit::Notification {
                username,
                user_id,
                message,
            } => (username, *user_id, message),
        }
    }

    fn body_len(&self) -> usize {
        let (username, _, message) = self.parts();
        string_len(username) + 2 + string_len(message)
    }

    fn write_body(&self, out: &mut FrameBuilder) {
        let (username, user_id, message) = self.parts();
        out.write_string(username).write_u16(user_id).write_string(message);
    }

    fn read_body(r: &mut BodyReader<'_>) -> Result<Self, ParseError> {
        r.require(4)?;
        let username = r.string()?;
        r.require(3)?;
        let user_id = r.u16()?;
        let message = r.string()?;

        if username.trim().is_empty() && user_id == NO_ID {
            return Ok(Quit::Request { message });
        }
        Ok(Quit::notification(username, user_id, message)?)
    }
}

/// 0x02: a user finished logging in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserJoined {
    pub username: String,
    pub user_id: u16,
    pub ping: u32,
    pub connection_type: ConnectionType,
}

impl UserJoined {
    fn body_len(&self) -> usize {
        string_len(&self.username) + 2 + 4 + 1
    }

    fn write_body(&self, out: &mut FrameBuilder) {
        out.write_string(&self.username)
            .write_u16(self.user_id)
            .write_u32(self.ping)
            .write_u8(self.connection_type as u8);
    }

    fn read_body(r: &mut BodyReader<'_>) -> Result<Self, ParseError> {
        r.require(8)?;
        let username = r.string()?;
        r.require(7)?;
        Ok(UserJoined {
            username,
            user_id: r.u16()?,
            ping: r.u32()?,
            connection_type: r.connection_type()?,
        })
    }
}

/// 0x03: login details sent by a client right after connecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInformation {
    pub username: String,
    pub client_type: String,
    pub connection_type: ConnectionType,
}

impl UserInformation {
    fn body_len(&self) -> usize {
        string_len(&self.username) + string_len(&self.client_type) + 1
    }

    fn write_body(&self, out: &mut FrameBuilder) {
        out.write_string(&self.username)
            .write_string(&self.client_type)
            .write_u8(self.connection_type as u8);
    }

    fn read_body(r: &mut BodyReader<'_>) -> Result<Self, ParseError> {
        r.require(3)?;
        let username = r.string()?;
        r.require(2)?;
        let client_type = r.string()?;
        Ok(UserInformation {
            username,
            client_type,
            connection_type: r.connection_type()?,
        })
    }
}

/// One user row of a [`ServerStatus`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUser {
    pub username: String,
    pub ping: u32,
    pub status: UserStatus,
    pub user_id: u16,
    pub connection_type: ConnectionType,
}

/// One game row of a [`ServerStatus`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusGame {
    pub rom_name: String,
    pub game_id: u32,
    pub client_type: String,
    pub username: String,
    pub players: String,
    pub status: GameStatus,
}

/// 0x04: lobby snapshot sent to a user that just logged in
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStatus {
    pub users: Vec<StatusUser>,
    pub games: Vec<StatusGame>,
}

impl ServerStatus {
    fn body_len(&self) -> usize {
        let users: usize = self
            .users
            .iter()
            .map(|u| string_len(&u.username) + 4 + 1 + 2 + 1)
            .sum();
        let games: usize = self
            .games
            .iter()
            .map(|g| {
                string_len(&g.rom_name)
                    + 4
                    + string_len(&g.client_type)
                    + string_len(&g.username)
                    + string_len(&g.players)
                    + 1
            })
            .sum();
        1 + 4 + 4 + users + games
    }

    fn write_body(&self, out: &mut FrameBuilder) {
        out.write_u8(MARKER)
            .write_u32(self.users.len() as u32)
            .write_u32(self.games.len() as u32);
        for user in &self.users {
            out.write_string(&user.username)
                .write_u32(user.ping)
                .write_u8(user.status as u8)
                .write_u16(user.user_id)
                .write_u8(user.connection_type as u8);
        }
        for game in &self.games {
            out.write_string(&game.rom_name)
                .write_u32(game.game_id)
                .write_string(&game.client_type)
                .write_string(&game.username)
                .write_string(&game.players)
                .write_u8(game.status as u8);
        }
    }

    fn read_body(r: &mut BodyReader<'_>) -> Result<Self, ParseError> {
        r.require(9)?;
        r.marker()?;
        let num_users = r.u32()?;
        let num_games = r.u32()?;

        let mut users = Vec::with_capacity(r.capacity_for(num_users, 9));
        for _ in 0..num_users {
            r.require(9)?;
            let username = r.string()?;
            r.require(8)?;
            users.push(StatusUser {
                username,
                ping: r.u32()?,
                status: r.user_status()?,
                user_id: r.u16()?,
                connection_type: r.connection_type()?,
            });
        }

        let mut games = Vec::with_capacity(r.capacity_for(num_games, 9));
        for _ in 0..num_games {
            r.require(9)?;
            let rom_name = r.string()?;
            r.require(8)?;
            let game_id = r.u32()?;
            let client_type = r.string()?;
            r.require(3)?;
            let username = r.string()?;
            r.require(2)?;
            let players = r.string()?;
            games.push(StatusGame {
                rom_name,
                game_id,
                client_type,
                username,
                players,
                status: r.game_status()?,
            });
        }

        Ok(ServerStatus { users, games })
    }
}

/// 0x07 and 0x08: lobby chat and in-game chat share one layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chat {
    Request { message: String },
    Notification { username: String, message: String },
}

impl Chat {
    pub fn request(message: impl Into<String>) -> Self {
        Chat::Request {
            message: message.into(),
        }
    }

    pub fn notification(
        username: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<Self, MessageError> {
        let username = username.into();
        if username.is_empty() {
            return Err(MessageError::Blank {
                message: "Chat",
                field: "username",
            });
        }
        Ok(Chat::Notification {
            username,
            message: message.into(),
        })
    }

    pub fn message(&self) -> &str {
        match self {
            Chat::Request { message } | Chat::Notification { message, .. } => message,
        }
    }

    fn username(&self) -> &str {
        match self {
            Chat::Request { .. } => "",
            Chat::Notification { username, .. } => username,
        }
    }

    fn body_len(&self) -> usize {
        string_len(self.username()) + string_len(self.message())
    }

    fn write_body(&self, out: &mut FrameBuilder) {
        out.write_string(self.username()).write_string(self.message());
    }

    fn read_body(r: &mut BodyReader<'_>) -> Result<Self, ParseError> {
        r.require(2)?;
        let username = r.string()?;
        r.require(1)?;
        let message = r.string()?;
        if username.is_empty() {
            Ok(Chat::Request { message })
        } else {
            Ok(Chat::Notification { username, message })
        }
    }
}

/// 0x0A: create a game, or announce a created game
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateGame {
    Request {
        rom_name: String,
    },
    Notification {
        username: String,
        rom_name: String,
        client_type: String,
        game_id: u16,
        val1: u16,
    },
}

impl CreateGame {
    pub fn request(rom_name: impl Into<String>) -> Self {
        CreateGame::Request {
            rom_name: rom_name.into(),
        }
    }

    pub fn notification(
        username: impl Into<String>,
        rom_name: impl Into<String>,
        client_type: impl Into<String>,
        game_id: impl Into<u64>,
        val1: impl Into<u64>,
    ) -> Result<Self, MessageError> {
        let username: String = username.into();
        let rom_name: String = rom_name.into();
        let client_type: String = client_type.into();
        require_text("CreateGame", "rom name", &rom_name)?;
        let game_id = checked_u16("CreateGame", "game id", game_id)?;
        let val1 = checked_u16("CreateGame", "val1", val1)?;
        // Would decode back as a request
        if username.is_empty() && client_type.is_empty() && game_id == NO_ID && val1 == NO_ID {
            return Err(MessageError::LooksLikeRequest {
                message: "CreateGame",
            });
        }
        Ok(CreateGame::Notification {
            username,
            rom_name,
            client_type,
            game_id,
            val1,
        })
    }

    fn parts(&self) -> (&str, &str, &str, u16, u16) {
        match self {
            CreateGame::Request { rom_name } => ("", rom_name, "", NO_ID, NO_ID),
            CreateGame::Notification {
                username,
                rom_name,
                client_type,
                game_id,
                val1,
            } => (username, rom_name, client_type, *game_id, *val1),
        }
    }

    fn body_len(&self) -> usize {
        let (username, rom_name, client_type, _, _) = self.parts();
        string_len(username) + string_len(rom_name) + string_len(client_type) + 4
    }

    fn write_body(&self, out: &mut FrameBuilder) {
        let (username, rom_name, client_type, game_id, val1) = self.parts();
        out.write_string(username)
            .write_string(rom_name)
            .write_string(client_type)
            .write_u16(game_id)
            .write_u16(val1);
    }

    fn read_body(r: &mut BodyReader<'_>) -> Result<Self, ParseError> {
        r.require(8)?;
        let username = r.string()?;
        r.require(6)?;
        let rom_name = r.string()?;
        r.require(5)?;
        let client_type = r.string()?;
        r.require(4)?;
        let game_id = r.u16()?;
        let val1 = r.u16()?;

        if username.is_empty() && client_type.is_empty() && game_id == NO_ID && val1 == NO_ID {
            return Ok(CreateGame::Request { rom_name });
        }
        Ok(CreateGame::notification(
            username,
            rom_name,
            client_type,
            game_id,
            val1,
        )?)
    }
}

/// 0x0B: leave the current game, or announce that a player left
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuitGame {
    Request,
    Notification { username: String, user_id: u16 },
}

impl QuitGame {
    pub fn notification(username: impl Into<String>, user_id: u16) -> Result<Self, MessageError> {
        let username = username.into();
        require_text("QuitGame", "username", &username)?;
        Ok(QuitGame::Notification { username, user_id })
    }

    fn parts(&self) -> (&str, u16) {
        match self {
            QuitGame::Request => ("", NO_ID),
            QuitGame::Notification { username, user_id } => (username, *user_id),
        }
    }

    fn body_len(&self) -> usize {
        string_len(self.parts().0) + 2
    }

    fn write_body(&self, out: &mut FrameBuilder) {
        let (username, user_id) = self.parts();
        out.write_string(username).write_u16(user_id);
    }

    fn read_body(r: &mut BodyReader<'_>) -> Result<Self, ParseError> {
        r.require(3)?;
        let username = r.string()?;
        r.require(2)?;
        let user_id = r.u16()?;
        if username.trim().is_empty() && user_id == NO_ID {
            return Ok(QuitGame::Request);
        }
        Ok(QuitGame::notification(username, user_id)?)
    }
}

/// 0x0C: join a game, or announce a player that joined
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinGame {
    Request {
        game_id: u32,
        connection_type: ConnectionType,
    },
    Notification {
        game_id: u32,
        val1: u16,
        username: String,
        ping: u32,
        user_id: u16,
        connection_type: ConnectionType,
    },
}

impl JoinGame {
    pub fn request(game_id: u32, connection_type: ConnectionType) -> Self {
        JoinGame::Request {
            game_id,
            connection_type,
        }
    }

    pub fn notification(
        game_id: u32,
        username: impl Into<String>,
        ping: u32,
        user_id: u16,
        connection_type: ConnectionType,
    ) -> Result<Self, MessageError> {
        let username = username.into();
        require_text("JoinGame", "username", &username)?;
        Ok(JoinGame::Notification {
            game_id,
            val1: 0,
            username,
            ping,
            user_id,
            connection_type,
        })
    }

    fn parts(&self) -> (u32, u16, &str, u32, u16, ConnectionType) {
        match self {
            JoinGame::Request {
                game_id,
                connection_type,
            } => (*game_id, 0, "", 0, NO_ID, *connection_type),
            JoinGame::Notification {
                game_id,
                val1,
                username,
                ping,
                user_id,
                connection_type,
            } => (*game_id, *val1, username, *ping, *user_id, *connection_type),
        }
    }

    fn body_len(&self) -> usize {
        1 + 4 + 2 + string_len(self.parts().2) + 4 + 2 + 1
    }

    fn write_body(&self, out: &mut FrameBuilder) {
        let (game_id, val1, username, ping, user_id, connection_type) = self.parts();
        out.write_u8(MARKER)
            .write_u32(game_id)
            .write_u16(val1)
            .write_string(username)
            .write_u32(ping)
            .write_u16(user_id)
            .write_u8(connection_type as u8);
    }

    fn read_body(r: &mut BodyReader<'_>) -> Result<Self, ParseError> {
        r.require(15)?;
        r.marker()?;
        let game_id = r.u32()?;
        let val1 = r.u16()?;
        let username = r.string()?;
        r.require(7)?;
        let ping = r.u32()?;
        let user_id = r.u16()?;
        let connection_type = r.connection_type()?;

        if username.is_empty() && ping == 0 && user_id == NO_ID {
            return Ok(JoinGame::Request {
                game_id,
                connection_type,
            });
        }
        require_text("JoinGame", "username", &username)?;
        Ok(JoinGame::Notification {
            game_id,
            val1,
            username,
            ping,
            user_id,
            connection_type,
        })
    }
}

/// One row of a [`PlayerInformation`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerEntry {
    pub username: String,
    pub ping: u32,
    pub user_id: u16,
    pub connection_type: ConnectionType,
}

/// 0x0D: players already in a game, sent to the player that just joined
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerInformation {
    pub players: Vec<PlayerEntry>,
}

impl PlayerInformation {
    fn body_len(&self) -> usize {
        let players: usize = self
            .players
            .iter()
            .map(|p| string_len(&p.username) + 4 + 2 + 1)
            .sum();
        1 + 4 + players
    }

    fn write_body(&self, out: &mut FrameBuilder) {
        out.write_u8(MARKER).write_u32(self.players.len() as u32);
        for player in &self.players {
            out.write_string(&player.username)
                .write_u32(player.ping)
                .write_u16(player.user_id)
                .write_u8(player.connection_type as u8);
        }
    }

    fn read_body(r: &mut BodyReader<'_>) -> Result<Self, ParseError> {
        r.require(5)?;
        r.marker()?;
        let count = r.u32()?;
        let mut players = Vec::with_capacity(r.capacity_for(count, 8));
        for _ in 0..count {
            r.require(8)?;
            let username = r.string()?;
            r.require(7)?;
            players.push(PlayerEntry {
                username,
                ping: r.u32()?,
                user_id: r.u16()?,
                connection_type: r.connection_type()?,
            });
        }
        Ok(PlayerInformation { players })
    }
}

/// 0x0E: a game's state or player count changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameStatusUpdate {
    pub game_id: u32,
    pub val1: u16,
    pub status: GameStatus,
    pub num_players: u8,
    pub max_players: u8,
}

impl GameStatusUpdate {
    const BODY_LEN: usize = 1 + 4 + 2 + 1 + 1 + 1;

    fn write_body(&self, out: &mut FrameBuilder) {
        out.write_u8(MARKER)
            .write_u32(self.game_id)
            .write_u16(self.val1)
            .write_u8(self.status as u8)
            .write_u8(self.num_players)
            .write_u8(self.max_players);
    }

    fn read_body(r: &mut BodyReader<'_>) -> Result<Self, ParseError> {
        r.require(Self::BODY_LEN)?;
        r.marker()?;
        Ok(GameStatusUpdate {
            game_id: r.u32()?,
            val1: r.u16()?,
            status: r.game_status()?,
            num_players: r.u8()?,
            max_players: r.u8()?,
        })
    }
}

/// 0x11: start the game, or tell a player its slot once the game starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartGame {
    Request,
    Notification {
        val1: u16,
        player_number: u8,
        num_players: u8,
    },
}

impl StartGame {
    const BODY_LEN: usize = 1 + 2 + 1 + 1;

    pub fn notification(
        val1: u16,
        player_number: impl Into<u64>,
        num_players: impl Into<u64>,
    ) -> Result<Self, MessageError> {
        let player_number = checked_u8("StartGame", "player number", player_number)?;
        let num_players = checked_u8("StartGame", "player count", num_players)?;
        if player_number == NO_PLAYER {
            return Err(MessageError::OutOfRange {
                message: "StartGame",
                field: "player number",
                value: u64::from(player_number),
            });
        }
        Ok(StartGame::Notification {
            val1,
            player_number,
            num_players,
        })
    }

    fn write_body(&self, out: &mut FrameBuilder) {
        let (val1, player_number, num_players) = match self {
            StartGame::Request => (NO_ID, NO_PLAYER, NO_PLAYER),
            StartGame::Notification {
                val1,
                player_number,
                num_players,
            } => (*val1, *player_number, *num_players),
        };
        out.write_u8(MARKER)
            .write_u16(val1)
            .write_u8(player_number)
            .write_u8(num_players);
    }

    fn read_body(r: &mut BodyReader<'_>) -> Result<Self, ParseError> {
        r.require(Self::BODY_LEN)?;
        r.marker()?;
        let val1 = r.u16()?;
        let player_number = r.u8()?;
        let num_players = r.u8()?;
        if val1 == NO_ID && player_number == NO_PLAYER && num_players == NO_PLAYER {
            return Ok(StartGame::Request);
        }
        Ok(StartGame::Notification {
            val1,
            player_number,
            num_players,
        })
    }
}

/// 0x12: one frame of controller input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameData {
    data: Vec<u8>,
}

impl GameData {
    /// Largest payload whose message length still fits the length field
    pub const MAX_LEN: usize = 0xFFFF - 4;

    pub fn new(data: Vec<u8>) -> Result<Self, MessageError> {
        if data.is_empty() {
            return Err(MessageError::Blank {
                message: "GameData",
                field: "data",
            });
        }
        if data.len() > Self::MAX_LEN {
            return Err(MessageError::OutOfRange {
                message: "GameData",
                field: "data length",
                value: data.len() as u64,
            });
        }
        Ok(GameData { data })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    fn body_len(&self) -> usize {
        1 + 2 + self.data.len()
    }

    fn write_body(&self, out: &mut FrameBuilder) {
        out.write_u8(MARKER)
            .write_u16(self.data.len() as u16)
            .write(&self.data);
    }

    fn read_body(r: &mut BodyReader<'_>) -> Result<Self, ParseError> {
        r.require(4)?;
        r.marker()?;
        let len = usize::from(r.u16()?);
        let data = r.bytes(len)?;
        Ok(GameData::new(data)?)
    }
}

/// 0x14: drop out of a running game, or announce a dropped player
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerDrop {
    Request,
    Notification { username: String, player_number: u8 },
}

impl PlayerDrop {
    pub fn notification(
        username: impl Into<String>,
        player_number: impl Into<u64>,
    ) -> Result<Self, MessageError> {
        let username = username.into();
        require_text("PlayerDrop", "username", &username)?;
        Ok(PlayerDrop::Notification {
            username,
            player_number: checked_u8("PlayerDrop", "player number", player_number)?,
        })
    }

    fn parts(&self) -> (&str, u8) {
        match self {
            PlayerDrop::Request => ("", 0),
            PlayerDrop::Notification {
                username,
                player_number,
            } => (username, *player_number),
        }
    }

    fn body_len(&self) -> usize {
        string_len(self.parts().0) + 1
    }

    fn write_body(&self, out: &mut FrameBuilder) {
        let (username, player_number) = self.parts();
        out.write_string(username).write_u8(player_number);
    }

    fn read_body(r: &mut BodyReader<'_>) -> Result<Self, ParseError> {
        r.require(2)?;
        let username = r.string()?;
        r.require(1)?;
        let player_number = r.u8()?;
        if username.is_empty() && player_number == 0 {
            return Ok(PlayerDrop::Request);
        }
        Ok(PlayerDrop::notification(username, player_number)?)
    }
}

/// 0x16: login refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRejected {
    pub username: String,
    pub user_id: u16,
    pub message: String,
}

impl ConnectionRejected {
    fn body_len(&self) -> usize {
        string_len(&self.username) + 2 + string_len(&self.message)
    }

    fn write_body(&self, out: &mut FrameBuilder) {
        out.write_string(&self.username)
            .write_u16(self.user_id)
            .write_string(&self.message);
    }

    fn read_body(r: &mut BodyReader<'_>) -> Result<Self, ParseError> {
        r.require(4)?;
        let username = r.string()?;
        r.require(3)?;
        Ok(ConnectionRejected {
            username,
            user_id: r.u16()?,
            message: r.string()?,
        })
    }
}

/// 0x17: server text shown to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InformationMessage {
    pub source: String,
    pub message: String,
}

impl InformationMessage {
    pub fn new(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            message: message.into(),
        }
    }

    fn body_len(&self) -> usize {
        string_len(&self.source) + string_len(&self.message)
    }

    fn write_body(&self, out: &mut FrameBuilder) {
        out.write_string(&self.source).write_string(&self.message);
    }

    fn read_body(r: &mut BodyReader<'_>) -> Result<Self, ParseError> {
        r.require(2)?;
        let source = r.string()?;
        r.require(1)?;
        Ok(InformationMessage {
            source,
            message: r.string()?,
        })
    }
}

/// Body of a v086 message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Quit(Quit),
    UserJoined(UserJoined),
    UserInformation(UserInformation),
    ServerStatus(ServerStatus),
    ServerAck,
    ClientAck,
    Chat(Chat),
    GameChat(Chat),
    KeepAlive { value: u8 },
    CreateGame(CreateGame),
    QuitGame(QuitGame),
    JoinGame(JoinGame),
    PlayerInformation(PlayerInformation),
    GameStatus(GameStatusUpdate),
    GameKick { user_id: u16 },
    CloseGame { game_id: u32, val1: u16 },
    StartGame(StartGame),
    GameData(GameData),
    CachedGameData { key: u8 },
    PlayerDrop(PlayerDrop),
    AllReady,
    ConnectionRejected(ConnectionRejected),
    InformationMessage(InformationMessage),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Quit(_) => MessageType::Quit,
            Payload::UserJoined(_) => MessageType::UserJoined,
            Payload::UserInformation(_) => MessageType::UserInformation,
            Payload::ServerStatus(_) => MessageType::ServerStatus,
            Payload::ServerAck => MessageType::ServerAck,
            Payload::ClientAck => MessageType::ClientAck,
            Payload::Chat(_) => MessageType::Chat,
            Payload::GameChat(_) => MessageType::GameChat,
            Payload::KeepAlive { .. } => MessageType::KeepAlive,
            Payload::CreateGame(_) => MessageType::CreateGame,
            Payload::QuitGame(_) => MessageType::QuitGame,
            Payload::JoinGame(_) => MessageType::JoinGame,
            Payload::PlayerInformation(_) => MessageType::PlayerInformation,
            Payload::GameStatus(_) => MessageType::GameStatus,
            Payload::GameKick { .. } => MessageType::GameKick,
            Payload::CloseGame { .. } => MessageType::CloseGame,
            Payload::StartGame(_) => MessageType::StartGame,
            Payload::GameData(_) => MessageType::GameData,
            Payload::CachedGameData { .. } => MessageType::CachedGameData,
            Payload::PlayerDrop(_) => MessageType::PlayerDrop,
            Payload::AllReady => MessageType::AllReady,
            Payload::ConnectionRejected(_) => MessageType::ConnectionRejected,
            Payload::InformationMessage(_) => MessageType::InformationMessage,
        }
    }

    /// Encoded body size, excluding the header
    pub fn body_len(&self) -> usize {
        match self {
            Payload::Quit(m) => m.body_len(),
            Payload::UserJoined(m) => m.body_len(),
            Payload::UserInformation(m) => m.body_len(),
            Payload::ServerStatus(m) => m.body_len(),
            Payload::ServerAck | Payload::ClientAck => ACK_BODY_LEN,
            Payload::Chat(m) | Payload::GameChat(m) => m.body_len(),
            Payload::KeepAlive { .. } => 1,
            Payload::CreateGame(m) => m.body_len(),
            Payload::QuitGame(m) => m.body_len(),
            Payload::JoinGame(m) => m.body_len(),
            Payload::PlayerInformation(m) => m.body_len(),
            Payload::GameStatus(_) => GameStatusUpdate::BODY_LEN,
            Payload::GameKick { .. } => 3,
            Payload::CloseGame { .. } => 7,
            Payload::StartGame(_) => StartGame::BODY_LEN,
            Payload::GameData(m) => m.body_len(),
            Payload::CachedGameData { .. } => 2,
            Payload::PlayerDrop(m) => m.body_len(),
            Payload::AllReady => 1,
            Payload::ConnectionRejected(m) => m.body_len(),
            Payload::InformationMessage(m) => m.body_len(),
        }
    }

    fn write_body(&self, out: &mut FrameBuilder) {
        match self {
            Payload::Quit(m) => m.write_body(out),
            Payload::UserJoined(m) => m.write_body(out),
            Payload::UserInformation(m) => m.write_body(out),
            Payload::ServerStatus(m) => m.write_body(out),
            Payload::ServerAck | Payload::ClientAck => {
                out.write_u8(MARKER)
                    .write_u32(0)
                    .write_u32(1)
                    .write_u32(2)
                    .write_u32(3);
            }
            Payload::Chat(m) | Payload::GameChat(m) => m.write_body(out),
            Payload::KeepAlive { value } => {
                out.write_u8(*value);
            }
            Payload::CreateGame(m) => m.write_body(out),
            Payload::QuitGame(m) => m.write_body(out),
            Payload::JoinGame(m) => m.write_body(out),
            Payload::PlayerInformation(m) => m.write_body(out),
            Payload::GameStatus(m) => m.write_body(out),
            Payload::GameKick { user_id } => {
                out.write_u8(MARKER).write_u16(*user_id);
            }
            Payload::CloseGame { game_id, val1 } => {
                out.write_u8(MARKER).write_u32(*game_id).write_u16(*val1);
            }
            Payload::StartGame(m) => m.write_body(out),
            Payload::GameData(m) => m.write_body(out),
            Payload::CachedGameData { key } => {
                out.write_u8(MARKER).write_u8(*key);
            }
            Payload::PlayerDrop(m) => m.write_body(out),
            Payload::AllReady => {
                out.write_u8(MARKER);
            }
            Payload::ConnectionRejected(m) => m.write_body(out),
            Payload::InformationMessage(m) => m.write_body(out),
        }
    }

    /// Decode a body for the given type id
    pub fn decode(type_id: u8, body: &[u8]) -> Result<Self, ParseError> {
        let message_type = MessageType::from_id(type_id).ok_or(ParseError::UnknownType(type_id))?;
        let mut r = BodyReader::new(body, message_type.name());

        let payload = match message_type {
            MessageType::Quit => Payload::Quit(Quit::read_body(&mut r)?),
            MessageType::UserJoined => Payload::UserJoined(UserJoined::read_body(&mut r)?),
            MessageType::UserInformation => {
                Payload::UserInformation(UserInformation::read_body(&mut r)?)
            }
            MessageType::ServerStatus => Payload::ServerStatus(ServerStatus::read_body(&mut r)?),
            MessageType::ServerAck | MessageType::ClientAck => {
                r.require(ACK_BODY_LEN)?;
                r.marker()?;
                for _ in 0..4 {
                    r.u32()?;
                }
                if message_type == MessageType::ServerAck {
                    Payload::ServerAck
                } else {
                    Payload::ClientAck
                }
            }
            MessageType::Chat => Payload::Chat(Chat::read_body(&mut r)?),
            MessageType::GameChat => Payload::GameChat(Chat::read_body(&mut r)?),
            MessageType::KeepAlive => Payload::KeepAlive { value: r.u8()? },
            MessageType::CreateGame => Payload::CreateGame(CreateGame::read_body(&mut r)?),
            MessageType::QuitGame => Payload::QuitGame(QuitGame::read_body(&mut r)?),
            MessageType::JoinGame => Payload::JoinGame(JoinGame::read_body(&mut r)?),
            MessageType::PlayerInformation => {
                Payload::PlayerInformation(PlayerInformation::read_body(&mut r)?)
            }
            MessageType::GameStatus => Payload::GameStatus(GameStatusUpdate::read_body(&mut r)?),
            MessageType::GameKick => {
                r.require(3)?;
                r.marker()?;
                Payload::GameKick { user_id: r.u16()? }
            }
            MessageType::CloseGame => {
                r.require(7)?;
                r.marker()?;
                Payload::CloseGame {
                    game_id: r.u32()?,
                    val1: r.u16()?,
                }
            }
            MessageType::StartGame => Payload::StartGame(StartGame::read_body(&mut r)?),
            MessageType::GameData => Payload::GameData(GameData::read_body(&mut r)?),
            MessageType::CachedGameData => {
                r.require(2)?;
                r.marker()?;
                Payload::CachedGameData { key: r.u8()? }
            }
            MessageType::PlayerDrop => Payload::PlayerDrop(PlayerDrop::read_body(&mut r)?),
            MessageType::AllReady => {
                r.marker()?;
                Payload::AllReady
            }
            MessageType::ConnectionRejected => {
                Payload::ConnectionRejected(ConnectionRejected::read_body(&mut r)?)
            }
            MessageType::InformationMessage => {
                Payload::InformationMessage(InformationMessage::read_body(&mut r)?)
            }
        };

        Ok(payload)
    }
}

/// A numbered v086 message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V086Message {
    pub number: u16,
    pub payload: Payload,
}

impl V086Message {
    pub fn new(number: u16, payload: Payload) -> Self {
        Self { number, payload }
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    pub fn type_id(&self) -> u8 {
        self.message_type().id()
    }

    /// Value of the length field: type id plus body
    pub fn length(&self) -> usize {
        1 + self.payload.body_len()
    }

    /// Full encoded size including number and length fields
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.body_len()
    }

    /// Append `number, length, type id, body` to `out`
    pub fn write_to(&self, out: &mut FrameBuilder) -> Result<(), MessageError> {
        let length = checked_u16(self.message_type().name(), "message length", self.length() as u64)?;
        out.write_u16(self.number)
            .write_u16(length)
            .write_u8(self.type_id());
        self.payload.write_body(out);
        Ok(())
    }

    /// Encode this message on its own
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let mut out = FrameBuilder::with_capacity(self.encoded_len());
        self.write_to(&mut out)?;
        Ok(out.build())
    }

    /// Decode a message from its type id and body (`bytes[0]` is the type id)
    pub fn decode(number: u16, bytes: &[u8]) -> Result<Self, ParseError> {
        let (&type_id, body) = bytes.split_first().ok_or(ParseError::InvalidLength {
            length: 0,
            remaining: 0,
        })?;
        Ok(Self::new(number, Payload::decode(type_id, body)?))
    }

    /// Read one framed message, consuming exactly its declared length
    pub fn read_from(reader: &mut FrameReader<'_>) -> Result<Self, ParseError> {
        let remaining = reader.remaining();
        if remaining < 4 {
            return Err(ParseError::Truncated {
                message: "message header",
                needed: 4,
                remaining,
            });
        }
        let number = reader.read_u16().unwrap_or_default();
        let length = usize::from(reader.read_u16().unwrap_or_default());

        let remaining = reader.remaining();
        if length == 0 || length > remaining {
            return Err(ParseError::InvalidLength { length, remaining });
        }
        let bytes = reader.read(length).ok_or(ParseError::InvalidLength { length, remaining })?;
        Self::decode(number, bytes)
    }
}

impl fmt::Display for V086Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.number, self.message_type().name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(payload: Payload) -> Payload {
        let message = V086Message::new(7, payload);
        let bytes = message.encode().unwrap();
        assert_eq!(bytes.len(), message.encoded_len());

        let mut reader = FrameReader::new(&bytes);
        let decoded = V086Message::read_from(&mut reader).unwrap();
        assert!(!reader.has_remaining());
        assert_eq!(decoded.number, 7);
        decoded.payload
    }

    fn sample_payloads() -> Vec<Payload> {
        vec![
            Payload::Quit(Quit::request("bye")),
            Payload::Quit(Quit::notification("alice", 3, "bye").unwrap()),
            Payload::UserJoined(UserJoined {
                username: "alice".into(),
                user_id: 3,
                ping: 42,
                connection_type: ConnectionType::Good,
            }),
            Payload::UserInformation(UserInformation {
                username: "alice".into(),
                client_type: "Kaillera 0.83".into(),
                connection_type: ConnectionType::Lan,
            }),
            Payload::ServerStatus(ServerStatus {
                users: vec![StatusUser {
                    username: "bob".into(),
                    ping: 20,
                    status: UserStatus::Idle,
                    user_id: 4,
                    connection_type: ConnectionType::Excellent,
                }],
                games: vec![StatusGame {
                    rom_name: "Street Fighter".into(),
                    game_id: 1,
                    client_type: "Kaillera 0.83".into(),
                    username: "bob".into(),
                    players: "1/8".into(),
                    status: GameStatus::Waiting,
                }],
            }),
            Payload::ServerAck,
            Payload::ClientAck,
            Payload::Chat(Chat::request("hello")),
            Payload::GameChat(Chat::notification("bob", "gg").unwrap()),
            Payload::KeepAlive { value: 0 },
            Payload::CreateGame(CreateGame::request("Test Game")),
            Payload::CreateGame(
                CreateGame::notification("bob", "Test Game", "emu", 12u16, 0u16).unwrap(),
            ),
            Payload::QuitGame(QuitGame::Request),
            Payload::QuitGame(QuitGame::notification("bob", 4).unwrap()),
            Payload::JoinGame(JoinGame::request(12, ConnectionType::Average)),
            Payload::JoinGame(
                JoinGame::notification(12, "bob", 30, 4, ConnectionType::Bad).unwrap(),
            ),
            Payload::PlayerInformation(PlayerInformation {
                players: vec![PlayerEntry {
                    username: "bob".into(),
                    ping: 30,
                    user_id: 4,
                    connection_type: ConnectionType::Low,
                }],
            }),
            Payload::GameStatus(GameStatusUpdate {
                game_id: 12,
                val1: 0,
                status: GameStatus::Playing,
                num_players: 2,
                max_players: 8,
            }),
            Payload::GameKick { user_id: 9 },
            Payload::CloseGame { game_id: 12, val1: 0 },
            Payload::StartGame(StartGame::Request),
            Payload::StartGame(StartGame::notification(0, 1u8, 2u8).unwrap()),
            Payload::GameData(GameData::new(vec![1, 2, 3, 4]).unwrap()),
            Payload::CachedGameData { key: 200 },
            Payload::PlayerDrop(PlayerDrop::Request),
            Payload::PlayerDrop(PlayerDrop::notification("bob", 2u8).unwrap()),
            Payload::AllReady,
            Payload::ConnectionRejected(ConnectionRejected {
                username: "bob".into(),
                user_id: 4,
                message: "name taken".into(),
            }),
            Payload::InformationMessage(InformationMessage::new("server", "Welcome")),
        ]
    }

    #[test]
    fn test_every_variant_survives_encoding() {
        for payload in sample_payloads() {
            assert_eq!(roundtrip(payload.clone()), payload);
        }
    }

    #[test]
    fn test_every_message_type_is_covered() {
        let covered: Vec<MessageType> = sample_payloads()
            .iter()
            .map(Payload::message_type)
            .collect();
        for message_type in MessageType::ALL {
            assert!(covered.contains(&message_type), "{:?}", message_type);
        }
    }

    #[test]
    fn test_truncated_bodies_fail_without_panicking() {
        for payload in sample_payloads() {
            let message = V086Message::new(1, payload);
            let bytes = message.encode().unwrap();
            let type_id = bytes[4];
            let body = &bytes[HEADER_LEN..];
            for cut in 0..body.len() {
                assert!(
                    Payload::decode(type_id, &body[..cut]).is_err(),
                    "{} decoded from {} of {} bytes",
                    message,
                    cut,
                    body.len()
                );
            }
        }
    }

    #[test]
    fn test_create_game_sentinels() {
        let mut out = FrameBuilder::new();
        out.write_string("")
            .write_string("Test Game")
            .write_string("")
            .write_u16(0xFFFF)
            .write_u16(0xFFFF);
        let decoded = Payload::decode(0x0A, &out.build()).unwrap();
        assert_eq!(decoded, Payload::CreateGame(CreateGame::request("Test Game")));

        let mut out = FrameBuilder::new();
        out.write_string("bob")
            .write_string("Test Game")
            .write_string("emu")
            .write_u16(5)
            .write_u16(0);
        let decoded = Payload::decode(0x0A, &out.build()).unwrap();
        assert!(matches!(
            decoded,
            Payload::CreateGame(CreateGame::Notification { game_id: 5, .. })
        ));
    }

    #[test]
    fn test_create_game_notification_requires_rom() {
        let result = CreateGame::notification("bob", "  ", "emu", 1u16, 0u16);
        assert!(matches!(result, Err(MessageError::Blank { .. })));

        let result = CreateGame::notification("bob", "rom", "emu", 70_000u32, 0u16);
        assert!(matches!(result, Err(MessageError::OutOfRange { value: 70_000, .. })));
    }

    #[test]
    fn test_create_game_notification_cannot_mimic_request() {
        let result = CreateGame::notification("", "rom", "", 0xFFFFu16, 0xFFFFu16);
        assert_eq!(
            result,
            Err(MessageError::LooksLikeRequest {
                message: "CreateGame"
            })
        );

        // Any one field off the sentinel keeps it a notification
        let created = CreateGame::notification("", "rom", "", 0xFFFFu16, 0u16).unwrap();
        let bytes = V086Message::new(3, Payload::CreateGame(created.clone()))
            .encode()
            .unwrap();
        let decoded = V086Message::decode(3, &bytes[4..]).unwrap();
        assert_eq!(decoded.payload, Payload::CreateGame(created));
    }

    #[test]
    fn test_quit_sentinels() {
        let mut out = FrameBuilder::new();
        out.write_string("").write_u16(0xFFFF).write_string("later");
        let decoded = Payload::decode(0x01, &out.build()).unwrap();
        assert_eq!(decoded, Payload::Quit(Quit::request("later")));

        // Blank name without the sentinel id is neither form
        let mut out = FrameBuilder::new();
        out.write_string("").write_u16(3).write_string("later");
        let result = Payload::decode(0x01, &out.build());
        assert!(matches!(result, Err(ParseError::Message(MessageError::Blank { .. }))));
    }

    #[test]
    fn test_quit_minimum_length() {
        assert!(matches!(
            Payload::decode(0x01, &[0x00, 0xFF, 0xFF]),
            Err(ParseError::Truncated { needed: 4, .. })
        ));
        assert_eq!(
            Payload::decode(0x01, &[0x00, 0xFF, 0xFF, 0x00]).unwrap(),
            Payload::Quit(Quit::request(""))
        );
    }

    #[test]
    fn test_join_game_sentinels() {
        let request = JoinGame::request(3, ConnectionType::Good);
        let bytes = V086Message::new(0, Payload::JoinGame(request.clone()))
            .encode()
            .unwrap();
        assert_eq!(&bytes[HEADER_LEN + 7..HEADER_LEN + 8], &[0x00]);
        assert_eq!(roundtrip(Payload::JoinGame(request.clone())), Payload::JoinGame(request));

        assert!(JoinGame::notification(3, "", 10, 2, ConnectionType::Good).is_err());
    }

    #[test]
    fn test_start_game_sentinels() {
        assert_eq!(
            Payload::decode(0x11, &[0x00, 0xFF, 0xFF, 0xFF, 0xFF]).unwrap(),
            Payload::StartGame(StartGame::Request)
        );
        assert!(matches!(
            Payload::decode(0x11, &[0x00, 0x00, 0x00, 0x02, 0x04]).unwrap(),
            Payload::StartGame(StartGame::Notification {
                player_number: 2,
                num_players: 4,
                ..
            })
        ));
        assert!(StartGame::notification(0, 0xFFu8, 2u8).is_err());
        assert!(StartGame::notification(0, 300u32, 2u8).is_err());
    }

    #[test]
    fn test_player_drop_and_chat_sentinels() {
        assert_eq!(
            Payload::decode(0x14, &[0x00, 0x00]).unwrap(),
            Payload::PlayerDrop(PlayerDrop::Request)
        );
        assert_eq!(
            Payload::decode(0x07, b"\0hi\0").unwrap(),
            Payload::Chat(Chat::request("hi"))
        );
        assert_eq!(
            Payload::decode(0x08, b"bob\0hi\0").unwrap(),
            Payload::GameChat(Chat::notification("bob", "hi").unwrap())
        );
    }

    #[test]
    fn test_invalid_marker_and_enum_values() {
        assert!(matches!(
            Payload::decode(0x15, &[0x01]),
            Err(ParseError::InvalidMarker { found: 0x01, .. })
        ));
        assert!(matches!(
            Payload::decode(0x03, b"bob\0emu\0\x09"),
            Err(ParseError::InvalidField { value: 9, .. })
        ));
    }

    #[test]
    fn test_unknown_type() {
        assert_eq!(Payload::decode(0x00, &[]), Err(ParseError::UnknownType(0x00)));
        assert_eq!(Payload::decode(0x18, &[0x00]), Err(ParseError::UnknownType(0x18)));
    }

    #[test]
    fn test_game_data_limits() {
        assert!(GameData::new(Vec::new()).is_err());
        assert!(GameData::new(vec![0; GameData::MAX_LEN]).is_ok());
        assert!(GameData::new(vec![0; GameData::MAX_LEN + 1]).is_err());
    }

    #[test]
    fn test_length_field_counts_type_id() {
        let message = V086Message::new(0x0102, Payload::KeepAlive { value: 9 });
        assert_eq!(message.encode().unwrap(), vec![0x02, 0x01, 0x02, 0x00, 0x09, 0x09]);
    }

    #[test]
    fn test_read_from_rejects_bad_lengths() {
        let zero = [0x00, 0x00, 0x00, 0x00, 0x09];
        assert!(matches!(
            V086Message::read_from(&mut FrameReader::new(&zero)),
            Err(ParseError::InvalidLength { length: 0, .. })
        ));

        let overlong = [0x00, 0x00, 0x09, 0x00, 0x09, 0x00];
        assert!(matches!(
            V086Message::read_from(&mut FrameReader::new(&overlong)),
            Err(ParseError::InvalidLength { length: 9, remaining: 2 })
        ));
    }

    #[test]
    fn test_trailing_bytes_inside_length_are_ignored() {
        let frame = [0x05, 0x00, 0x03, 0x00, 0x09, 0x01, 0xEE];
        let mut reader = FrameReader::new(&frame);
        let message = V086Message::read_from(&mut reader).unwrap();
        assert_eq!(message.payload, Payload::KeepAlive { value: 1 });
        assert!(!reader.has_remaining());
    }
}
