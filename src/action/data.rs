//! Game input relay with the shared frame caches

use super::{impl_action, ActionError, ActionStats, GameEventHandler, V086Action};
use crate::lobby::GameEvent;
use crate::net::protocol::{Chat, GameData, Payload, V086Message};
use crate::net::session::SessionContext;

/// 0x12: full input frame
#[derive(Debug, Default)]
pub struct GameDataAction {
    stats: ActionStats,
}

impl_action!(GameDataAction, "GameData");

impl V086Action for GameDataAction {
    fn perform(&self, message: &V086Message, ctx: &mut SessionContext) -> Result<(), ActionError> {
        let Payload::GameData(data) = &message.payload else {
            return Err(ActionError::unexpected("GameData", message));
        };
        let data = data.data().to_vec();
        ctx.in_cache.add(data.clone());

        let user_id = ctx.user_id();
        ctx.lobby()
            .game_data(user_id, data)
            .map_err(|e| ActionError::rejected("GameData", e))
    }
}

impl GameEventHandler for GameDataAction {
    fn handle_game_event(&self, event: &GameEvent, ctx: &mut SessionContext) -> Result<(), ActionError> {
        let GameEvent::GameData { data, .. } = event else {
            return Ok(());
        };

        match ctx.out_cache.index_of(data) {
            Some(key) => ctx.send(Payload::CachedGameData { key }),
            None => {
                let message = GameData::new(data.clone())?;
                ctx.out_cache.add(data.clone());
                ctx.send(Payload::GameData(message));
            }
        }
        Ok(())
    }
}

/// 0x13: input frame by cache key
#[derive(Debug, Default)]
pub struct CachedGameDataAction {
    stats: ActionStats,
}

impl_action!(CachedGameDataAction, "CachedGameData");

impl V086Action for CachedGameDataAction {
    fn perform(&self, message: &V086Message, ctx: &mut SessionContext) -> Result<(), ActionError> {
        let Payload::CachedGameData { key } = message.payload else {
            return Err(ActionError::unexpected("CachedGameData", message));
        };

        let Some(data) = ctx.in_cache.get(key).map(<[u8]>::to_vec) else {
            ctx.send(Payload::GameChat(Chat::notification(
                "Error",
                "Game Data Error! Game state will be inconsistent!",
            )?));
            return Err(ActionError::CacheMiss {
                action: "CachedGameData",
                key,
            });
        };

        let user_id = ctx.user_id();
        ctx.lobby()
            .game_data(user_id, data)
            .map_err(|e| ActionError::rejected("CachedGameData", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::test_support::{lobby, logged_in};
    use crate::lobby::ServerError;

    fn frame(data: &[u8]) -> GameEvent {
        GameEvent::GameData {
            game_id: 1,
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_repeated_frame_sent_by_key() {
        let (mut ctx, _events) = logged_in(&lobby(), "alice");
        let action = GameDataAction::default();

        action.handle_game_event(&frame(&[7, 7]), &mut ctx).unwrap();
        action.handle_game_event(&frame(&[7, 7]), &mut ctx).unwrap();
        action.handle_game_event(&frame(&[8]), &mut ctx).unwrap();

        let sent: Vec<Payload> = ctx.take_outbox().into_iter().map(|m| m.payload).collect();
        assert_eq!(
            sent,
            vec![
                Payload::GameData(GameData::new(vec![7, 7]).unwrap()),
                Payload::CachedGameData { key: 0 },
                Payload::GameData(GameData::new(vec![8]).unwrap()),
            ]
        );
        assert_eq!(ctx.out_cache.len(), 2);
        assert!(ctx.in_cache.is_empty());
    }

    #[test]
    fn test_cache_miss_warns_player() {
        let (mut ctx, _events) = logged_in(&lobby(), "alice");
        let message = V086Message::new(0, Payload::CachedGameData { key: 3 });

        let err = CachedGameDataAction::default()
            .perform(&message, &mut ctx)
            .unwrap_err();

        assert!(matches!(err, ActionError::CacheMiss { key: 3, .. }));
        assert!(!err.is_fatal());
        let sent = ctx.take_outbox();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].payload,
            Payload::GameChat(
                Chat::notification("Error", "Game Data Error! Game state will be inconsistent!").unwrap()
            )
        );
    }

    #[test]
    fn test_inbound_frame_cached_before_relay() {
        let (mut ctx, _events) = logged_in(&lobby(), "alice");
        let inbound = V086Message::new(0, Payload::GameData(GameData::new(vec![1, 2]).unwrap()));

        // Not in a game, so the lobby refuses it after the cache took it
        let err = GameDataAction::default().perform(&inbound, &mut ctx).unwrap_err();
        assert!(matches!(
            err,
            ActionError::Rejected {
                source: ServerError::NotInGame,
                ..
            }
        ));
        assert_eq!(ctx.in_cache.index_of(&[1, 2]), Some(0));

        let cached = V086Message::new(1, Payload::CachedGameData { key: 0 });
        let err = CachedGameDataAction::default()
            .perform(&cached, &mut ctx)
            .unwrap_err();
        assert!(matches!(
            err,
            ActionError::Rejected {
                action: "CachedGameData",
                source: ServerError::NotInGame
            }
        ));
        assert!(ctx.take_outbox().is_empty());
    }
}
