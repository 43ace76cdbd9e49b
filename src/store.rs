//! Persistence contract for sessions and points.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

use crate::models::{LocationPoint, MissionId, SessionId, SessionPatch, TrackingSession};

/// Typed insert/select/update access to the `tracking_sessions` and
/// `gps_location_points` collections.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    async fn insert_session(&self, session: &TrackingSession) -> Result<()>;

    async fn get_session(&self, id: &SessionId) -> Result<Option<TrackingSession>>;

    /// All sessions of a mission, most recently started first.
    async fn sessions_for_mission(&self, mission_id: &MissionId) -> Result<Vec<TrackingSession>>;

    async fn find_by_public_token(&self, token: &str) -> Result<Option<TrackingSession>>;

    /// Fails when the session does not exist.
    async fn update_session(&self, id: &SessionId, patch: &SessionPatch) -> Result<()>;

    async fn insert_point(&self, point: &LocationPoint) -> Result<()>;

    /// Points of a session in ascending `recorded_at` order.
    async fn points_for_session(&self, id: &SessionId) -> Result<Vec<LocationPoint>>;
}

/// Store keeping everything in process memory. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    sessions: DashMap<SessionId, TrackingSession>,
    points: DashMap<SessionId, Vec<LocationPoint>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrackingStore for MemoryStore {
    async fn insert_session(&self, session: &TrackingSession) -> Result<()> {
        if self.sessions.contains_key(&session.id) {
            anyhow::bail!("Session {} already exists", session.id);
        }
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<TrackingSession>> {
        Ok(self.sessions.get(id).map(|s| s.value().clone()))
    }

    async fn sessions_for_mission(&self, mission_id: &MissionId) -> Result<Vec<TrackingSession>> {
        let mut sessions: Vec<TrackingSession> = self
            .sessions
            .iter()
            .filter(|s| &s.value().mission_id == mission_id)
            .map(|s| s.value().clone())
            .collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(sessions)
    }

    async fn find_by_public_token(&self, token: &str) -> Result<Option<TrackingSession>> {
        Ok(self
            .sessions
            .iter()
            .find(|s| s.value().public_token.as_deref() == Some(token))
            .map(|s| s.value().clone()))
    }

    async fn update_session(&self, id: &SessionId, patch: &SessionPatch) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("Cannot update missing session {id}"))?;
        patch.apply(session.value_mut());
        Ok(())
    }

    async fn insert_point(&self, point: &LocationPoint) -> Result<()> {
        self.points
            .entry(point.session_id.clone())
            .or_default()
            .push(point.clone());
        Ok(())
    }

    async fn points_for_session(&self, id: &SessionId) -> Result<Vec<LocationPoint>> {
        let mut points = self
            .points
            .get(id)
            .map(|p| p.value().clone())
            .unwrap_or_default();
        points.sort_by_key(|p| p.recorded_at);
        Ok(points)
    }
}
