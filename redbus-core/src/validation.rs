//! Structural validation and sanitization of messages.
//!
//! Every message passes the base envelope checks plus type-specific
//! field checks before it is published or handed to a handler.
//! Sanitization strips HTML from free-text fields and is idempotent.

use std::sync::LazyLock;

use ammonia::clean;
use regex::Regex;

use crate::error::{Error, Result};
use crate::message::{Envelope, MessageBody};

static EVENT_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[A-Za-z0-9_-]+(\.[A-Za-z0-9_-]+)+$").unwrap()
});

/// Validates message envelopes against per-type structural rules.
#[derive(Debug, Clone)]
pub struct MessageValidator {
    pub max_chat_length: usize,
    pub max_message_size: usize,
}

impl Default for MessageValidator {
    fn default() -> Self {
        Self {
            max_chat_length: 1_000,
            max_message_size: 64 * 1024,
        }
    }
}

impl MessageValidator {
    #[must_use]
    pub fn new(max_chat_length: usize, max_message_size: usize) -> Self {
        Self {
            max_chat_length,
            max_message_size,
        }
    }

    /// Check base and type-specific structure.
    pub fn validate(&self, envelope: &Envelope) -> Result<()> {
        if envelope.id.trim().is_empty() {
            return Err(Error::Validation("Message id is empty".to_string()));
        }

        match &envelope.body {
            MessageBody::Admin(admin) => {
                require_non_empty("action", &admin.action)?;
                require_non_empty("fromAdmin", &admin.from_admin)?;
            }
            MessageBody::Chat(chat) => {
                require_non_empty("roomId", &chat.room_id)?;
                require_non_empty("userId", &chat.user_id)?;
                require_non_empty("content", &chat.content)?;
                if chat.content.chars().count() > self.max_chat_length {
                    return Err(Error::TooLarge {
                        size: chat.content.chars().count(),
                        max: self.max_chat_length,
                    });
                }
                let serialized_len = serde_json::to_string(envelope)?.len();
                if serialized_len > self.max_message_size {
                    return Err(Error::TooLarge {
                        size: serialized_len,
                        max: self.max_message_size,
                    });
                }
            }
            MessageBody::Heartbeat(hb) => {
                require_non_empty("processId", &hb.process_id)?;
                require_non_empty("status", &hb.status)?;
            }
            MessageBody::Event(event) => {
                require_non_empty("eventType", &event.event_type)?;
                if !EVENT_TYPE.is_match(&event.event_type) {
                    return Err(Error::Validation(format!(
                        "eventType must be a dotted namespace, got {:?}",
                        event.event_type
                    )));
                }
                if let Some(data) = &event.data {
                    if !data.is_object() {
                        return Err(Error::Validation(
                            "Event data must be an object when present".to_string(),
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// Strip HTML from free-text fields in place. Idempotent.
    pub fn sanitize(&self, envelope: &mut Envelope) {
        match &mut envelope.body {
            MessageBody::Chat(chat) => {
                chat.content = strip_html(&chat.content);
            }
            MessageBody::Admin(admin) => {
                admin.action = strip_html(&admin.action);
            }
            MessageBody::Heartbeat(hb) => {
                hb.status = strip_html(&hb.status);
            }
            MessageBody::Event(_) => {}
        }
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{field} is required")));
    }
    Ok(())
}

/// Remove all HTML from text: decode via ammonia, then drop any remaining
/// tag content with a small state machine.
#[must_use]
pub fn strip_html(text: &str) -> String {
    let cleaned = clean(text);

    let mut result = String::with_capacity(cleaned.len());
    let mut in_tag = false;

    for ch in cleaned.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }

    result.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AdminMessage, ChatMessage, EventMessage, HeartbeatMessage};

    fn chat(content: &str) -> Envelope {
        Envelope::new(MessageBody::Chat(ChatMessage {
            room_id: "r1".to_string(),
            user_id: "u1".to_string(),
            content: content.to_string(),
            metadata: None,
        }))
    }

    #[test]
    fn test_valid_messages_pass() {
        let validator = MessageValidator::default();

        validator.validate(&chat("hello")).unwrap();
        validator
            .validate(&Envelope::new(MessageBody::Admin(AdminMessage {
                action: "restart".to_string(),
                from_admin: "ops".to_string(),
                data: None,
            })))
            .unwrap();
        validator
            .validate(&Envelope::new(MessageBody::Heartbeat(HeartbeatMessage {
                process_id: "p1".to_string(),
                status: "healthy".to_string(),
                metadata: None,
            })))
            .unwrap();
        validator
            .validate(&Envelope::new(MessageBody::Event(EventMessage {
                event_type: "user.created".to_string(),
                data: Some(serde_json::json!({"userId": "u1"})),
            })))
            .unwrap();
    }

    #[test]
    fn test_missing_required_fields() {
        let validator = MessageValidator::default();

        assert!(validator.validate(&chat("")).is_err());
        assert!(validator
            .validate(&Envelope::new(MessageBody::Chat(ChatMessage {
                room_id: String::new(),
                user_id: "u1".to_string(),
                content: "hi".to_string(),
                metadata: None,
            })))
            .is_err());
        assert!(validator
            .validate(&Envelope::new(MessageBody::Admin(AdminMessage {
                action: "  ".to_string(),
                from_admin: "ops".to_string(),
                data: None,
            })))
            .is_err());
        assert!(validator
            .validate(&Envelope::new(MessageBody::Heartbeat(HeartbeatMessage {
                process_id: "p1".to_string(),
                status: String::new(),
                metadata: None,
            })))
            .is_err());
    }

    #[test]
    fn test_chat_length_bound() {
        let validator = MessageValidator::new(10, 64 * 1024);
        assert!(validator.validate(&chat("0123456789")).is_ok());
        assert!(matches!(
            validator.validate(&chat("01234567890")),
            Err(Error::TooLarge { .. })
        ));
    }

    #[test]
    fn test_event_type_grammar() {
        let validator = MessageValidator::default();

        for bad in ["created", "user..created", ".created", "user.created.", "user created"] {
            let envelope = Envelope::new(MessageBody::Event(EventMessage {
                event_type: bad.to_string(),
                data: None,
            }));
            assert!(validator.validate(&envelope).is_err(), "{bad} should fail");
        }

        for good in ["user.created", "system.error", "room.member.joined"] {
            let envelope = Envelope::new(MessageBody::Event(EventMessage {
                event_type: good.to_string(),
                data: None,
            }));
            assert!(validator.validate(&envelope).is_ok(), "{good} should pass");
        }
    }

    #[test]
    fn test_event_data_must_be_object() {
        let validator = MessageValidator::default();
        let envelope = Envelope::new(MessageBody::Event(EventMessage {
            event_type: "user.created".to_string(),
            data: Some(serde_json::json!([1, 2, 3])),
        }));
        assert!(validator.validate(&envelope).is_err());
    }

    #[test]
    fn test_sanitize_strips_html() {
        let validator = MessageValidator::default();
        let mut envelope = chat("<script>alert('x')</script>hello <b>world</b>");
        validator.sanitize(&mut envelope);
        match &envelope.body {
            MessageBody::Chat(c) => assert_eq!(c.content, "hello world"),
            other => panic!("Expected chat, got {other:?}"),
        }
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let validator = MessageValidator::default();
        for input in [
            "plain text",
            "<b>bold</b> and <i>italic</i>",
            "a < b > c",
            "<script>evil()</script>ok",
        ] {
            let mut once = chat(input);
            validator.sanitize(&mut once);
            let mut twice = once.clone();
            validator.sanitize(&mut twice);
            assert_eq!(once, twice, "sanitize not idempotent for {input:?}");
        }
    }
}
