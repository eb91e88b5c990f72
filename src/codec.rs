//! # Event Identity and Row Encoding
//!
//! An event id is the SHA-256 of a canonical JSON array:
//!
//! ```text
//! [0, <pubkey>, <created_at>, <kind>, <tags>, <content>]
//! ```
//!
//! serialized without whitespace, hex encoded in lowercase. Because the id is a
//! pure function of the other fields, two events with the same id are the same
//! fact and the store can deduplicate on id alone.
//!
//! The SQLite backend persists events as their JSON object form; the helpers
//! at the bottom of this module are the single place that encoding lives.

use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::types::{Event, EventId, Timestamp};

// =============================================================================
// Identity
// =============================================================================

/// Returns the canonical serialization the id is computed over.
pub fn canonical_json(event: &Event) -> String {
    serde_json::json!([
        0,
        event.pubkey,
        event.created_at,
        event.kind,
        event.tags,
        event.content
    ])
    .to_string()
}

/// Computes the id an event should carry.
pub fn compute_id(event: &Event) -> EventId {
    let hash = Sha256::digest(canonical_json(event).as_bytes());
    EventId::new(hex::encode(hash))
}

/// Checks that the event's id matches its contents.
///
/// # Errors
///
/// `Error::InvalidEvent` with reason `"id mismatch"` when it doesn't.
pub fn verify_id(event: &Event) -> Result<()> {
    let expected = compute_id(event);
    if expected != event.id {
        return Err(Error::InvalidEvent {
            id: event.id.to_string(),
            reason: format!("id mismatch (computed {expected})"),
        });
    }
    Ok(())
}

// =============================================================================
// Row Encoding
// =============================================================================

/// Encodes an event for storage in the `events.raw` column.
pub fn encode_event(event: &Event) -> Result<String> {
    Ok(serde_json::to_string(event)?)
}

/// Decodes an event previously written by [`encode_event`].
pub fn decode_event(raw: &str) -> Result<Event> {
    Ok(serde_json::from_str(raw)?)
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Returns the current time in seconds since the Unix epoch.
pub fn current_time_secs() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventBuilder;

    #[test]
    fn test_canonical_json_shape() {
        let event = EventBuilder::new(1, "ab")
            .created_at(7)
            .tag(["t", "x"])
            .content("hi \"there\"")
            .build();

        assert_eq!(
            canonical_json(&event),
            r#"[0,"ab",7,1,[["t","x"]],"hi \"there\""]"#
        );
    }

    #[test]
    fn test_compute_id_matches_reference() {
        let event = EventBuilder::new(1, "00".repeat(32)).created_at(1).build();

        let expected = {
            let mut hasher = Sha256::new();
            hasher.update(canonical_json(&event).as_bytes());
            hex::encode(hasher.finalize())
        };
        assert_eq!(event.id.as_str(), expected);
        assert!(verify_id(&event).is_ok());
    }

    #[test]
    fn test_verify_id_rejects_tampering() {
        let mut event = EventBuilder::new(1, "pk").content("original").build();
        event.content = "edited".to_string();

        let err = verify_id(&event).unwrap_err();
        assert!(matches!(err, Error::InvalidEvent { .. }));
    }

    #[test]
    fn test_row_codec() {
        let event = EventBuilder::new(30_023, "pk").identifier("slug").build();
        let raw = encode_event(&event).unwrap();
        assert_eq!(decode_event(&raw).unwrap(), event);

        assert!(matches!(decode_event("not json"), Err(Error::Json(_))));
    }
}
