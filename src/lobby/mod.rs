//! In-memory lobby: users, games and the events between them
//!
//! Sessions call into [`manager::Lobby`]; the lobby answers through each
//! user's [`event::EventSink`].

pub mod event;
pub mod manager;
pub mod player;
pub mod room;

/// User id as carried on the wire
pub type UserId = u16;

/// Game id; the lobby hands out ids that fit the 16-bit CreateGame field
pub type GameId = u16;

pub use event::{EventSink, GameEvent, LobbyEvent, ServerEvent, UserEvent};
pub use manager::{Lobby, ServerError};
pub use player::LoginInfo;
