//! Envelope serialization with optional payload compression.
//!
//! Payloads are UTF-8 JSON. Compressed payloads carry a textual marker
//! prefix followed by base64-encoded gzip; the deserializer mirrors the
//! marker, so the transform is deterministic in both directions.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{Error, Result};
use crate::message::Envelope;

/// Envelope schema version stamped at serialization time
pub const ENVELOPE_VERSION: u32 = 1;

/// Prefix marking a compressed payload
pub const COMPRESSION_MARKER: &str = "redbus:gz:";

/// Outcome of [`Serializer::deserialize_safe`].
#[derive(Debug)]
pub enum DecodeOutcome {
    Parsed(Envelope),
    /// The payload did not parse; the raw string is handed back for
    /// debugging paths.
    Raw(String),
}

/// Encodes and decodes message envelopes.
#[derive(Debug, Clone)]
pub struct Serializer {
    compression: bool,
    compression_threshold: usize,
}

impl Serializer {
    #[must_use]
    pub fn new(compression: bool, compression_threshold: usize) -> Self {
        Self {
            compression,
            compression_threshold,
        }
    }

    /// Serialize an envelope, stamping `serializedAt` and `version`.
    ///
    /// When compression is enabled and the JSON exceeds the threshold,
    /// the output is `redbus:gz:` + base64(gzip(json)).
    pub fn serialize(&self, envelope: &Envelope) -> Result<String> {
        let mut stamped = envelope.clone();
        stamped.serialized_at = Some(Utc::now());
        stamped.version = Some(ENVELOPE_VERSION);

        let json = serde_json::to_string(&stamped)?;

        if self.compression && json.len() > self.compression_threshold {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(json.as_bytes())
                .map_err(|e| Error::Serialization(format!("Compression failed: {e}")))?;
            let compressed = encoder
                .finish()
                .map_err(|e| Error::Serialization(format!("Compression failed: {e}")))?;
            return Ok(format!("{COMPRESSION_MARKER}{}", BASE64.encode(compressed)));
        }

        Ok(json)
    }

    /// Deserialize a payload, mirroring the compression marker.
    ///
    /// Fails with a serialization error when the payload is not a valid
    /// envelope or the required `type`/`timestamp` fields are missing.
    pub fn deserialize(&self, payload: &str) -> Result<Envelope> {
        let json = Self::decompress_if_marked(payload)?;

        // Envelope-level shape check before the typed parse so the error
        // names the missing field rather than a serde enum mismatch.
        let value: serde_json::Value = serde_json::from_str(&json)?;
        let object = value
            .as_object()
            .ok_or_else(|| Error::Serialization("Payload is not a JSON object".to_string()))?;
        for field in ["type", "timestamp"] {
            if !object.contains_key(field) {
                return Err(Error::Serialization(format!(
                    "Envelope is missing required field: {field}"
                )));
            }
        }

        serde_json::from_value(value)
            .map_err(|e| Error::Serialization(format!("Invalid envelope: {e}")))
    }

    /// Like [`deserialize`](Self::deserialize), but hands back the raw
    /// string instead of failing.
    #[must_use]
    pub fn deserialize_safe(&self, payload: &str) -> DecodeOutcome {
        match self.deserialize(payload) {
            Ok(envelope) => DecodeOutcome::Parsed(envelope),
            Err(e) => {
                tracing::debug!(error = %e, "Payload failed to parse, returning raw");
                DecodeOutcome::Raw(payload.to_string())
            }
        }
    }

    fn decompress_if_marked(payload: &str) -> Result<String> {
        let Some(encoded) = payload.strip_prefix(COMPRESSION_MARKER) else {
            return Ok(payload.to_string());
        };

        let compressed = BASE64
            .decode(encoded)
            .map_err(|e| Error::Serialization(format!("Invalid base64 payload: {e}")))?;
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut json = String::new();
        decoder
            .read_to_string(&mut json)
            .map_err(|e| Error::Serialization(format!("Decompression failed: {e}")))?;
        Ok(json)
    }
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new(false, 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ChatMessage, EventMessage, MessageBody};

    fn chat_envelope(content: &str) -> Envelope {
        Envelope::new(MessageBody::Chat(ChatMessage {
            room_id: "r1".to_string(),
            user_id: "u1".to_string(),
            content: content.to_string(),
            metadata: None,
        }))
    }

    #[test]
    fn test_round_trip_preserves_message() {
        let serializer = Serializer::default();
        let envelope = chat_envelope("hello");

        let payload = serializer.serialize(&envelope).unwrap();
        let decoded = serializer.deserialize(&payload).unwrap();

        // Identical modulo the fields the serializer stamps
        assert_eq!(decoded.id, envelope.id);
        assert_eq!(decoded.body, envelope.body);
        assert_eq!(decoded.timestamp, envelope.timestamp);
        assert_eq!(decoded.version, Some(ENVELOPE_VERSION));
        assert!(decoded.serialized_at.is_some());
    }

    #[test]
    fn test_compression_round_trip() {
        let serializer = Serializer::new(true, 64);
        let envelope = chat_envelope(&"long ".repeat(100));

        let payload = serializer.serialize(&envelope).unwrap();
        assert!(payload.starts_with(COMPRESSION_MARKER));

        let decoded = serializer.deserialize(&payload).unwrap();
        assert_eq!(decoded.body, envelope.body);
    }

    #[test]
    fn test_small_payloads_skip_compression() {
        let serializer = Serializer::new(true, 10_000);
        let payload = serializer.serialize(&chat_envelope("hi")).unwrap();
        assert!(!payload.starts_with(COMPRESSION_MARKER));
    }

    #[test]
    fn test_rejects_non_envelope_payloads() {
        let serializer = Serializer::default();

        assert!(matches!(
            serializer.deserialize("{not json"),
            Err(Error::Json(_))
        ));
        assert!(matches!(
            serializer.deserialize("[1,2,3]"),
            Err(Error::Serialization(_))
        ));
        // Missing timestamp
        assert!(matches!(
            serializer.deserialize(r#"{"id":"x","type":"event","eventType":"a.b"}"#),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_safe_variant_returns_raw_on_failure() {
        let serializer = Serializer::default();
        match serializer.deserialize_safe("garbage") {
            DecodeOutcome::Raw(raw) => assert_eq!(raw, "garbage"),
            DecodeOutcome::Parsed(_) => panic!("Expected raw outcome"),
        }

        let payload = serializer
            .serialize(&Envelope::new(MessageBody::Event(EventMessage {
                event_type: "user.created".to_string(),
                data: None,
            })))
            .unwrap();
        assert!(matches!(
            serializer.deserialize_safe(&payload),
            DecodeOutcome::Parsed(_)
        ));
    }
}
