use super::{impl_action, ActionError, ActionStats, ServerEventHandler, UserEventHandler, V086Action};
use crate::lobby::{ServerError, ServerEvent, UserEvent};
use crate::net::protocol::{InformationMessage, Payload, Quit, V086Message};
use crate::net::session::SessionContext;

/// 0x01: leaving the server, and the session teardown that follows
#[derive(Debug, Default)]
pub struct QuitAction {
    stats: ActionStats,
}

impl_action!(QuitAction, "Quit");

impl V086Action for QuitAction {
    fn perform(&self, message: &V086Message, ctx: &mut SessionContext) -> Result<(), ActionError> {
        let Payload::Quit(Quit::Request { message: text }) = &message.payload else {
            return Err(ActionError::unexpected("Quit", message));
        };
        let user_id = ctx.user_id();
        match ctx.lobby().quit(user_id, text) {
            Ok(()) => Ok(()),
            // Never logged in, so nobody else needs to hear about it
            Err(ServerError::NotLoggedIn) | Err(ServerError::UserNotFound(_)) => {
                ctx.close();
                Ok(())
            }
            Err(e) => Err(ActionError::rejected("Quit", e)),
        }
    }
}

impl ServerEventHandler for QuitAction {
    fn handle_server_event(&self, event: &ServerEvent, ctx: &mut SessionContext) -> Result<(), ActionError> {
        let ServerEvent::UserQuit {
            user_id,
            username,
            message,
        } = event
        else {
            return Ok(());
        };

        ctx.send(Payload::Quit(Quit::notification(username.clone(), *user_id, message.clone())?));
        if *user_id == ctx.user_id() {
            ctx.close();
        }
        Ok(())
    }
}

impl UserEventHandler for QuitAction {
    fn handle_user_event(&self, event: &UserEvent, ctx: &mut SessionContext) -> Result<(), ActionError> {
        if let UserEvent::Disconnected { reason } = event {
            tracing::info!("User {} disconnected by the server: {}", ctx.user_id(), reason);
            ctx.send(Payload::InformationMessage(InformationMessage::new("server", reason.clone())));
            ctx.close();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::test_support::{connected, lobby, logged_in};

    fn quit(text: &str) -> V086Message {
        V086Message::new(0, Payload::Quit(Quit::request(text)))
    }

    #[test]
    fn test_quit_before_login_closes_quietly() {
        let lobby = lobby();
        let (mut ctx, _events) = connected(&lobby);

        QuitAction::default().perform(&quit("bye"), &mut ctx).unwrap();

        assert!(ctx.is_closing());
        assert!(ctx.take_outbox().is_empty());
    }

    #[test]
    fn test_own_quit_notice_closes_session() {
        let lobby = lobby();
        let (mut ctx, _events) = logged_in(&lobby, "alice");
        let action = QuitAction::default();

        action.perform(&quit("bye"), &mut ctx).unwrap();
        assert!(!ctx.is_closing());
        assert_eq!(lobby.user_count(), 0);

        let other = ServerEvent::UserQuit {
            user_id: ctx.user_id().wrapping_add(1),
            username: "bob".to_string(),
            message: "later".to_string(),
        };
        action.handle_server_event(&other, &mut ctx).unwrap();
        assert!(!ctx.is_closing());

        let own = ServerEvent::UserQuit {
            user_id: ctx.user_id(),
            username: "alice".to_string(),
            message: "bye".to_string(),
        };
        action.handle_server_event(&own, &mut ctx).unwrap();
        assert!(ctx.is_closing());
        let sent = ctx.take_outbox();
        assert_eq!(
            sent[1].payload,
            Payload::Quit(Quit::notification("alice", ctx.user_id(), "bye").unwrap())
        );
    }

    #[test]
    fn test_server_disconnect_closes_session() {
        let (mut ctx, _events) = logged_in(&lobby(), "alice");
        let event = UserEvent::Disconnected {
            reason: "Idle too long".to_string(),
        };

        QuitAction::default().handle_user_event(&event, &mut ctx).unwrap();

        assert!(ctx.is_closing());
        assert_eq!(
            ctx.take_outbox()[0].payload,
            Payload::InformationMessage(InformationMessage::new("server", "Idle too long"))
        );
    }

    #[test]
    fn test_quit_notification_from_client_rejected() {
        let (mut ctx, _events) = logged_in(&lobby(), "alice");
        let message = V086Message::new(
            0,
            Payload::Quit(Quit::notification("alice", ctx.user_id(), "bye").unwrap()),
        );

        let err = QuitAction::default().perform(&message, &mut ctx).unwrap_err();
        assert!(matches!(err, ActionError::UnexpectedMessage { action: "Quit", .. }));
        assert!(!ctx.is_closing());
    }
}
