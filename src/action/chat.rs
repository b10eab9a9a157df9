//! Lobby and in-game chat

use super::{impl_action, ActionError, ActionStats, GameEventHandler, ServerEventHandler, V086Action};
use crate::lobby::{GameEvent, ServerEvent};
use crate::net::protocol::{Chat, InformationMessage, Payload, V086Message};
use crate::net::session::SessionContext;

/// 0x07
#[derive(Debug, Default)]
pub struct ChatAction {
    stats: ActionStats,
}

impl_action!(ChatAction, "Chat");

impl V086Action for ChatAction {
    fn perform(&self, message: &V086Message, ctx: &mut SessionContext) -> Result<(), ActionError> {
        let Payload::Chat(Chat::Request { message: text }) = &message.payload else {
            return Err(ActionError::unexpected("Chat", message));
        };
        let user_id = ctx.user_id();
        if let Err(e) = ctx.lobby().chat(user_id, text) {
            ctx.send(Payload::InformationMessage(InformationMessage::new(
                "server",
                format!("Chat denied: {}", e),
            )));
            return Err(ActionError::rejected("Chat", e));
        }
        Ok(())
    }
}

impl ServerEventHandler for ChatAction {
    fn handle_server_event(&self, event: &ServerEvent, ctx: &mut SessionContext) -> Result<(), ActionError> {
        if let ServerEvent::Chat { username, message } = event {
            ctx.send(Payload::Chat(Chat::notification(username.clone(), message.clone())?));
        }
        Ok(())
    }
}

/// 0x08
#[derive(Debug, Default)]
pub struct GameChatAction {
    stats: ActionStats,
}

impl_action!(GameChatAction, "GameChat");

impl V086Action for GameChatAction {
    fn perform(&self, message: &V086Message, ctx: &mut SessionContext) -> Result<(), ActionError> {
        let Payload::GameChat(Chat::Request { message: text }) = &message.payload else {
            return Err(ActionError::unexpected("GameChat", message));
        };
        let user_id = ctx.user_id();
        ctx.lobby()
            .game_chat(user_id, text)
            .map_err(|e| ActionError::rejected("GameChat", e))
    }
}

impl GameEventHandler for GameChatAction {
    fn handle_game_event(&self, event: &GameEvent, ctx: &mut SessionContext) -> Result<(), ActionError> {
        if let GameEvent::GameChat {
            username, message, ..
        } = event
        {
            ctx.send(Payload::GameChat(Chat::notification(username.clone(), message.clone())?));
        }
        Ok(())
    }
}
