//! Channel identifier construction, validation, and parsing.
//!
//! Channel strings match `[A-Za-z0-9._:-]+` and stay under 200 chars.
//! Room-scoped names use a single `:` between the prefix and the encoded
//! room URL; global names are fixed constants.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

/// Administrative fan-out to every listener
pub const ADMIN_BROADCAST: &str = "admin:messages";
/// Global chat firehose, used for monitoring
pub const CHAT_GLOBAL: &str = "chat:global";
/// Process heartbeat channel
pub const HEARTBEAT_STATUS: &str = "heartbeat:status";
/// System-wide events
pub const SYSTEM_EVENTS: &str = "events:system";
/// Health probe channel
pub const HEALTH_CHECK: &str = "health:check";
/// Metrics snapshots
pub const METRICS: &str = "metrics:stats";
/// Error reports
pub const ERROR_REPORTS: &str = "errors:reports";

const ADMIN_ROOM_PREFIX: &str = "admin_messages";
const CHAT_ROOM_PREFIX: &str = "chat_room";
const EVENTS_ROOM_PREFIX: &str = "events_room";

/// Maximum channel name length
pub const MAX_CHANNEL_LENGTH: usize = 200;

static CHANNEL_NAME: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[A-Za-z0-9._:-]+$").unwrap()
});

/// Category of a parsed channel name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Admin,
    Chat,
    Events,
    Heartbeat,
    Monitoring,
    Unknown,
}

/// Result of [`parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedChannel {
    pub kind: ChannelKind,
    /// The encoded room identifier for room-scoped channels.
    pub room_url: Option<String>,
    pub is_global: bool,
}

/// The three per-room fan-out channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomChannels {
    pub admin: String,
    pub chat: String,
    pub events: String,
}

/// Encode a room URL into channel-safe form.
///
/// Strips the scheme, lowercases, and replaces everything outside
/// `[A-Za-z0-9.-]` with `_`. The mapping is lossy; callers that need the
/// exact URL back must persist it themselves.
#[must_use]
pub fn encode_room_url(room_url: &str) -> String {
    let without_scheme = room_url
        .split_once("://")
        .map_or(room_url, |(_, rest)| rest);

    without_scheme
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Admin channel for a specific room
#[must_use]
pub fn admin_room(room_url: &str) -> String {
    format!("{ADMIN_ROOM_PREFIX}:{}", encode_room_url(room_url))
}

/// Chat channel for a specific room
#[must_use]
pub fn chat_room(room_url: &str) -> String {
    format!("{CHAT_ROOM_PREFIX}:{}", encode_room_url(room_url))
}

/// Events channel for a specific room
#[must_use]
pub fn events_room(room_url: &str) -> String {
    format!("{EVENTS_ROOM_PREFIX}:{}", encode_room_url(room_url))
}

/// All three per-room channels for a room URL
#[must_use]
pub fn room_channels(room_url: &str) -> RoomChannels {
    RoomChannels {
        admin: admin_room(room_url),
        chat: chat_room(room_url),
        events: events_room(room_url),
    }
}

/// Validate a channel name against the grammar and length limit.
pub fn validate(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("Channel name is empty".to_string()));
    }
    if name.len() > MAX_CHANNEL_LENGTH {
        return Err(Error::Validation(format!(
            "Channel name exceeds {MAX_CHANNEL_LENGTH} characters"
        )));
    }
    if !CHANNEL_NAME.is_match(name) {
        return Err(Error::Validation(format!(
            "Channel name contains invalid characters: {name}"
        )));
    }
    Ok(())
}

/// Parse a channel name into its category and room scope.
#[must_use]
pub fn parse(name: &str) -> ParsedChannel {
    // Fixed globals first; they contain a ':' but are not room-scoped.
    let global_kind = match name {
        ADMIN_BROADCAST => Some(ChannelKind::Admin),
        CHAT_GLOBAL => Some(ChannelKind::Chat),
        SYSTEM_EVENTS => Some(ChannelKind::Events),
        HEARTBEAT_STATUS => Some(ChannelKind::Heartbeat),
        HEALTH_CHECK | METRICS | ERROR_REPORTS => Some(ChannelKind::Monitoring),
        _ => None,
    };
    if let Some(kind) = global_kind {
        return ParsedChannel {
            kind,
            room_url: None,
            is_global: true,
        };
    }

    if let Some((prefix, room)) = name.split_once(':') {
        let kind = match prefix {
            ADMIN_ROOM_PREFIX => ChannelKind::Admin,
            CHAT_ROOM_PREFIX => ChannelKind::Chat,
            EVENTS_ROOM_PREFIX => ChannelKind::Events,
            _ => ChannelKind::Unknown,
        };
        let room_url = (kind != ChannelKind::Unknown && !room.is_empty())
            .then(|| room.to_string());
        return ParsedChannel {
            kind,
            room_url,
            is_global: false,
        };
    }

    ParsedChannel {
        kind: ChannelKind::Unknown,
        room_url: None,
        is_global: false,
    }
}

impl ChannelKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Chat => "chat",
            Self::Events => "events",
            Self::Heartbeat => "heartbeat",
            Self::Monitoring => "monitoring",
            Self::Unknown => "unknown",
        }
    }
}
