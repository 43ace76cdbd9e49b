// src/db_models.rs

use crate::models::{
    self, DriverId, InspectionId, MissionId, Place, RouteStats, SessionId, SessionStatus,
    TrackingSession,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session fields that are only ever read back whole, stored as one JSON column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub departure_inspection_id: Option<InspectionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrival_inspection_id: Option<InspectionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_location: Option<Place>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_location: Option<Place>,
}

/// Represents a session row of the `tracking_sessions` table.
#[derive(Debug, Clone, PartialEq)]
pub struct DbSession {
    pub id: SessionId,
    pub mission_id: MissionId,
    pub driver_id: DriverId,
    pub status: SessionStatus,
    pub details: SessionDetails,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub public_token: Option<String>,
    pub stats: Option<RouteStats>,
}

impl From<&TrackingSession> for DbSession {
    fn from(session: &TrackingSession) -> Self {
        Self {
            id: session.id.clone(),
            mission_id: session.mission_id.clone(),
            driver_id: session.driver_id.clone(),
            status: session.status,
            details: SessionDetails {
                departure_inspection_id: session.departure_inspection_id.clone(),
                arrival_inspection_id: session.arrival_inspection_id.clone(),
                start_location: session.start_location.clone(),
                end_location: session.end_location.clone(),
            },
            started_at: session.started_at,
            completed_at: session.completed_at,
            public_token: session.public_token.clone(),
            stats: session.stats.clone(),
        }
    }
}

impl From<DbSession> for TrackingSession {
    fn from(db_session: DbSession) -> Self {
        let mut session = models::TrackingSessionBuilder::new()
            .with_id(db_session.id)
            .with_mission_id(db_session.mission_id)
            .with_driver_id(db_session.driver_id)
            .with_status(db_session.status)
            .with_started_at(db_session.started_at)
            .build();
        session.departure_inspection_id = db_session.details.departure_inspection_id;
        session.arrival_inspection_id = db_session.details.arrival_inspection_id;
        session.start_location = db_session.details.start_location;
        session.end_location = db_session.details.end_location;
        session.completed_at = db_session.completed_at;
        session.public_token = db_session.public_token;
        session.stats = db_session.stats;
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::tests::base_time;

    #[test]
    fn test_session_survives_row_conversion() {
        let mut session = models::TrackingSessionBuilder::new()
            .with_id(SessionId::from("s1"))
            .with_mission_id(MissionId::from("m1"))
            .with_driver_id(DriverId::from("d1"))
            .with_status(SessionStatus::Paused)
            .with_started_at(base_time())
            .build();
        session.departure_inspection_id = Some(InspectionId::from("i1"));
        session.start_location = Some(Place {
            latitude: 48.8566,
            longitude: 2.3522,
            address: None,
        });
        session.public_token = Some("token".to_string());

        let row = DbSession::from(&session);
        assert_eq!(row.details.departure_inspection_id, Some(InspectionId::from("i1")));
        assert_eq!(TrackingSession::from(row), session);
    }

    #[test]
    fn test_empty_details_serialize_to_empty_object() {
        assert_eq!(serde_json::to_string(&SessionDetails::default()).unwrap(), "{}");
    }
}
