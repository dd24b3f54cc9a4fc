//! Location types and WebSocket frame formats.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque user identifier, taken from the authenticated token subject.
pub type UserId = String;

// ============================================================================
// Locations
// ============================================================================

/// A single user's position at an instant.
///
/// Locations are never mutated; a newer one replaces the stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub user_id: UserId,
    pub latitude: f64,
    pub longitude: f64,
    /// Unix milliseconds on the wire.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl Location {
    pub fn new(
        user_id: impl Into<UserId>,
        latitude: f64,
        longitude: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            latitude,
            longitude,
            timestamp,
        }
    }
}

/// Most recent location per user.
///
/// Serialized as a JSON object keyed by user id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationSet(BTreeMap<UserId, Location>);

impl LocationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str) -> Option<&Location> {
        self.0.get(user_id)
    }

    /// Replace the entry for the location's user, returning the previous one.
    pub fn replace(&mut self, location: Location) -> Option<Location> {
        self.0.insert(location.user_id.clone(), location)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// Presence
// ============================================================================

/// Whether a user is reachable right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// Connected with a focused client.
    Online,
    /// Connected, but the client reported it is in the background.
    Away,
    /// No open connection.
    Offline,
}

/// A user's presence and when the hub last heard from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub status: PresenceStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_seen: DateTime<Utc>,
}

/// Presence per user who has connected since the process started.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PresenceSet(BTreeMap<UserId, Presence>);

impl PresenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str) -> Option<&Presence> {
        self.0.get(user_id)
    }

    /// Record `status` for a user seen at `at`.
    pub fn set(&mut self, user_id: &str, status: PresenceStatus, at: DateTime<Utc>) {
        self.0.insert(
            user_id.to_string(),
            Presence {
                status,
                last_seen: at,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// Inbound frames (Client -> Server)
// ============================================================================

/// Errors decoding an inbound frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown frame type '{0}'")]
    UnknownType(String),

    #[error("coordinates must be finite numbers")]
    NonFinite,

    #[error("coordinates out of range: latitude {latitude}, longitude {longitude}")]
    OutOfRange { latitude: f64, longitude: f64 },
}

/// Position reported by a client. The user comes from the connection, never
/// from the frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LocationUpdate {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl LocationUpdate {
    fn validate(&self) -> Result<(), DecodeError> {
        if !self.latitude.is_finite() || !self.longitude.is_finite() {
            return Err(DecodeError::NonFinite);
        }
        if !(-90.0..=90.0).contains(&self.latitude) || !(-180.0..=180.0).contains(&self.longitude)
        {
            return Err(DecodeError::OutOfRange {
                latitude: self.latitude,
                longitude: self.longitude,
            });
        }
        Ok(())
    }

    /// Bind this update to the user that sent it.
    pub fn into_location(self, user_id: impl Into<UserId>) -> Location {
        Location::new(user_id, self.latitude, self.longitude, self.timestamp)
    }
}

/// Periodic focus report. `active` is false while the client is in the
/// background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ActivityReport {
    pub active: bool,
}

/// Any frame a client may send.
///
/// Location frames carry no `type` field (or `"type": "location"`); activity
/// reports are tagged `"type": "background"`.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Location(LocationUpdate),
    Activity(ActivityReport),
}

impl InboundFrame {
    /// Decode and validate one frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let value: serde_json::Value = serde_json::from_slice(payload)?;
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned);

        match kind.as_deref() {
            None | Some("location") => {
                let update: LocationUpdate = serde_json::from_value(value)?;
                update.validate()?;
                Ok(Self::Location(update))
            }
            Some("background") => Ok(Self::Activity(serde_json::from_value(value)?)),
            Some(other) => Err(DecodeError::UnknownType(other.to_string())),
        }
    }
}

// ============================================================================
// Outbound frames (Server -> Client)
// ============================================================================

/// Frames sent to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent<'a> {
    /// Full current state. Never a delta.
    Locations {
        version: u64,
        body: &'a LocationSet,
        presence: &'a PresenceSet,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn decode_location(payload: &[u8]) -> Result<LocationUpdate, DecodeError> {
        match InboundFrame::decode(payload)? {
            InboundFrame::Location(update) => Ok(update),
            other => panic!("expected a location frame, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_valid_frame() {
        let update =
            decode_location(br#"{"latitude":52.52,"longitude":13.40,"timestamp":100}"#).unwrap();
        assert_eq!(update.latitude, 52.52);
        assert_eq!(update.longitude, 13.40);
        assert_eq!(update.timestamp, at(100));

        let location = update.into_location("alice");
        assert_eq!(location.user_id, "alice");
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let cases: [&[u8]; 4] = [
            b"",
            b"not json",
            br#"{"latitude":1.0,"longitude":1.0}"#,
            br#"{"latitude":"north","longitude":1.0,"timestamp":1}"#,
        ];

        for case in cases {
            assert!(
                matches!(InboundFrame::decode(case), Err(DecodeError::Malformed(_))),
                "{:?} should fail",
                String::from_utf8_lossy(case)
            );
        }
    }

    #[test]
    fn test_decode_rejects_out_of_range() {
        let err =
            decode_location(br#"{"latitude":91.0,"longitude":0.0,"timestamp":1}"#).unwrap_err();
        assert!(matches!(err, DecodeError::OutOfRange { .. }));

        let err =
            decode_location(br#"{"latitude":0.0,"longitude":-180.5,"timestamp":1}"#).unwrap_err();
        assert!(matches!(err, DecodeError::OutOfRange { .. }));
    }

    #[test]
    fn test_decode_tagged_location_frame() {
        let update = decode_location(
            br#"{"type":"location","latitude":1.0,"longitude":2.0,"timestamp":5}"#,
        )
        .unwrap();
        assert_eq!(update.longitude, 2.0);
    }

    #[test]
    fn test_decode_activity_report() {
        let frame = InboundFrame::decode(br#"{"type":"background","active":false}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Activity(ActivityReport { active: false })
        );

        assert!(matches!(
            InboundFrame::decode(br#"{"type":"background"}"#),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let err = InboundFrame::decode(br#"{"type":"chat","body":"hi"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownType(ref kind) if kind == "chat"));
    }

    #[test]
    fn test_location_set_replace_keeps_one_entry_per_user() {
        let mut set = LocationSet::new();
        assert!(set.is_empty());
        assert!(set.replace(Location::new("u1", 1.0, 1.0, at(1))).is_none());
        let previous = set.replace(Location::new("u1", 2.0, 2.0, at(2))).unwrap();

        assert_eq!(previous.latitude, 1.0);
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("u1").unwrap().latitude, 2.0);
    }

    #[test]
    fn test_locations_event_shape() {
        let mut set = LocationSet::new();
        set.replace(Location::new("A", 1.0, 1.0, at(100)));

        let mut presence = PresenceSet::new();
        presence.set("A", PresenceStatus::Away, at(90));

        let json = serde_json::to_value(WsEvent::Locations {
            version: 3,
            body: &set,
            presence: &presence,
        })
        .unwrap();

        assert_eq!(json["type"], "locations");
        assert_eq!(json["version"], 3);
        assert_eq!(json["body"]["A"]["user_id"], "A");
        assert_eq!(json["body"]["A"]["latitude"], 1.0);
        assert_eq!(json["body"]["A"]["timestamp"], 100);
        assert_eq!(json["presence"]["A"]["status"], "away");
        assert_eq!(json["presence"]["A"]["last_seen"], 90);
    }

    #[test]
    fn test_presence_set_overwrites_status() {
        let mut presence = PresenceSet::new();
        assert!(presence.is_empty());

        presence.set("u1", PresenceStatus::Online, at(1));
        presence.set("u1", PresenceStatus::Offline, at(2));

        assert_eq!(presence.len(), 1);
        let entry = presence.get("u1").unwrap();
        assert_eq!(entry.status, PresenceStatus::Offline);
        assert_eq!(entry.last_seen, at(2));
    }
}
