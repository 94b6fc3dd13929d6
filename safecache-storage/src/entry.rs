//! On-disk entry layout shared by store implementations.
//!
//! Format: `[expires_at: 8 bytes, i64 LE unix millis][payload]`.
//! An `expires_at` of zero means the entry never expires.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Size of the expiry header in bytes.
pub const HEADER_LEN: usize = 8;

/// A decoded view over a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredEntry<'a> {
    expires_at_millis: i64,
    payload: &'a [u8],
}

impl<'a> StoredEntry<'a> {
    /// Decode an entry, or `None` if the header is truncated.
    pub fn decode(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let header: [u8; HEADER_LEN] = bytes[..HEADER_LEN].try_into().ok()?;
        Some(Self {
            expires_at_millis: i64::from_le_bytes(header),
            payload: &bytes[HEADER_LEN..],
        })
    }

    /// The caller's value bytes.
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// When the entry stops being visible, if ever.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.expires_at_millis == 0 {
            None
        } else {
            DateTime::from_timestamp_millis(self.expires_at_millis)
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at_millis != 0 && now.timestamp_millis() >= self.expires_at_millis
    }
}

/// Encode `payload` with an optional time-to-live measured from `now`.
pub fn encode_entry(payload: &[u8], ttl: Option<Duration>, now: DateTime<Utc>) -> Vec<u8> {
    let expires_at_millis = match ttl {
        None => 0,
        Some(ttl) => {
            let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            // Never collide with the "no expiry" marker.
            now.timestamp_millis().saturating_add(ttl_millis).max(1)
        }
    };

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&expires_at_millis.to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}
