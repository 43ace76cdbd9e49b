use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typesafe_builder::*;

use crate::source::Notification;
use crate::utils::CommaSeparatedVec;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::convert::Infallible;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok($name(s.to_string()))
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a tracking session, generated when the session starts.
    SessionId
);
string_id!(
    /// Reference to a mission owned by the surrounding business application.
    MissionId
);
string_id!(DriverId);
string_id!(InspectionId);
string_id!(PointId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl SessionStatus {
    /// Completed and cancelled sessions accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "paused" => Ok(SessionStatus::Paused),
            "completed" => Ok(SessionStatus::Completed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            other => Err(anyhow::anyhow!("Unknown session status '{other}'")),
        }
    }
}

/// A named position, e.g. where the vehicle was picked up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Route statistics derived from the full point set of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStats {
    pub total_distance_km: f64,
    pub total_duration_minutes: i64,
    pub average_speed_kmh: f64,
    pub max_speed_kmh: f64,
    pub points_count: usize,
}

/// The long lived aggregate root of a tracked mission leg.
///
/// `stats` is `None` until the session has at least two points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct TrackingSession {
    #[builder(required)]
    pub id: SessionId,
    #[builder(required)]
    pub mission_id: MissionId,
    #[builder(required)]
    pub driver_id: DriverId,
    #[builder(required)]
    pub status: SessionStatus,
    #[builder(optional)]
    pub departure_inspection_id: Option<InspectionId>,
    #[builder(optional)]
    pub arrival_inspection_id: Option<InspectionId>,
    #[builder(optional)]
    pub start_location: Option<Place>,
    #[builder(optional)]
    pub end_location: Option<Place>,
    #[builder(required)]
    pub started_at: DateTime<Utc>,
    #[builder(optional)]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(optional)]
    pub public_token: Option<String>,
    #[builder(optional)]
    pub stats: Option<RouteStats>,
}

/// A persisted, immutable GPS sample owned by one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationPoint {
    pub id: PointId,
    pub session_id: SessionId,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_kmh: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// A sample as the platform location service reports it.
///
/// Platforms disagree on field names, hence the aliases. Speed is in m/s and
/// the timestamp in milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lon", alias = "lng")]
    pub longitude: f64,
    #[serde(default, alias = "alt")]
    pub altitude: Option<f64>,
    #[serde(default, alias = "acc")]
    pub accuracy: Option<f64>,
    #[serde(default, alias = "spd")]
    pub speed: Option<f64>,
    #[serde(default, alias = "bearing")]
    pub heading: Option<f64>,
    #[serde(alias = "time")]
    pub timestamp: f64,
}

/// Partial update of a session record. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub completed_at: Option<DateTime<Utc>>,
    pub end_location: Option<Place>,
    pub arrival_inspection_id: Option<InspectionId>,
    pub stats: Option<RouteStats>,
}

impl SessionPatch {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn stats(stats: RouteStats) -> Self {
        Self {
            stats: Some(stats),
            ..Default::default()
        }
    }

    pub fn apply(&self, session: &mut TrackingSession) {
        if let Some(status) = self.status {
            session.status = status;
        }
        if let Some(completed_at) = self.completed_at {
            session.completed_at = Some(completed_at);
        }
        if let Some(end_location) = &self.end_location {
            session.end_location = Some(end_location.clone());
        }
        if let Some(inspection_id) = &self.arrival_inspection_id {
            session.arrival_inspection_id = Some(inspection_id.clone());
        }
        if let Some(stats) = &self.stats {
            session.stats = Some(stats.clone());
        }
    }
}

// ========================
// API Request and Response Models
// ========================

/// Request body for `POST /api/sessions`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub mission_id: MissionId,
    pub driver_id: DriverId,
    #[serde(default)]
    pub departure_inspection_id: Option<InspectionId>,
    #[serde(default)]
    pub start_location: Option<Place>,
}

/// Request body for `POST /api/sessions/{id}/complete`.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    #[serde(default)]
    pub arrival_inspection_id: Option<InspectionId>,
    #[serde(default)]
    pub end_location: Option<Place>,
}

/// Permission grants as reported by the device.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PermissionsRequest {
    pub foreground: bool,
    #[serde(default)]
    pub background: bool,
}

/// Request body for `POST /api/device/background`: a batch handed to the
/// background task. No session id travels with it.
#[derive(Debug, Serialize, Deserialize)]
pub struct BackgroundBatch {
    pub locations: Vec<RawSample>,
}

/// Response body of `POST /api/device/sample` and `POST /api/device/background`.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeliveryResponse {
    pub delivered: bool,
}

/// Query of `GET /api/stream`. An empty list follows every mission.
#[derive(Debug, Deserialize)]
pub struct StreamRequest {
    #[serde(default = "CommaSeparatedVec::new")]
    pub missions: CommaSeparatedVec<MissionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Foreground,
    Background,
}

/// Response body of `GET /api/device/status`: where the device should send
/// its samples right now.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub current_session: Option<SessionId>,
    pub delivery: Option<DeliveryMode>,
    pub notification: Option<Notification>,
}

/// Response body of `POST /api/events`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub subscribers: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub stats: Option<RouteStats>,
}

/// What a customer following a public tracking link gets to see.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicView {
    pub mission_id: MissionId,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stats: Option<RouteStats>,
    pub last_point: Option<LocationPoint>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
