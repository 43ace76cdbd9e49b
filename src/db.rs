use crate::db_models::{DbSession, SessionDetails};
use crate::models::{
    DriverId, LocationPoint, MissionId, PointId, RouteStats, SessionId, SessionPatch,
    TrackingSession,
};
use crate::store::TrackingStore;
use anyhow::{Context as AnyhowContext, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use turso::{Builder, Connection, Row};

const SESSION_COLUMNS: &str = "id, mission_id, driver_id, status, details, started_at, completed_at, public_token, total_distance_km, total_duration_minutes, average_speed_kmh, max_speed_kmh, points_count";
const POINT_COLUMNS: &str = "id, session_id, latitude, longitude, altitude, accuracy, speed_kmh, heading, recorded_at";

/// Client for the Turso (SQLite) database holding sessions and points.
pub struct DbClient {
    conn: Arc<Mutex<Connection>>,
    db_file: PathBuf,
}

fn format_time(time: &DateTime<Utc>) -> String {
    // fixed width, so text order is time order
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)?.with_timezone(&Utc))
}

/// Stats columns, all NULL until the session has stats.
type StatsColumns = (Option<f64>, Option<i64>, Option<f64>, Option<f64>, Option<i64>);

fn stats_columns(stats: Option<&RouteStats>) -> Result<StatsColumns> {
    let Some(stats) = stats else {
        return Ok((None, None, None, None, None));
    };
    Ok((
        Some(stats.total_distance_km),
        Some(stats.total_duration_minutes),
        Some(stats.average_speed_kmh),
        Some(stats.max_speed_kmh),
        Some(i64::try_from(stats.points_count)?),
    ))
}

impl DbClient {
    /// Opens (or creates) the database file and initializes the schema.
    pub async fn new(db_file: &Path) -> Result<Self> {
        let turso_db_client = Arc::new(
            Builder::new_local(db_file.to_str().ok_or_else(|| {
                anyhow::anyhow!("Cannot convert path name to unicode: {:?}", db_file)
            })?)
            .build()
            .await
            .with_context(|| {
                format!("Failed to open db (and/or its wal file). File name: {db_file:?}")
            })?,
        );

        let conn = Arc::new(Mutex::new(turso_db_client.connect()?));

        let client = DbClient {
            conn,
            db_file: PathBuf::from(db_file),
        };
        client
            .init_db()
            .await
            .with_context(|| format!("Failed to init db file {db_file:?} (and/or its wal file)"))?;
        Ok(client)
    }

    async fn init_db(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tracking_sessions (
                id TEXT PRIMARY KEY,
                mission_id TEXT NOT NULL,
                driver_id TEXT NOT NULL,
                status TEXT NOT NULL,
                details TEXT NOT NULL, -- JSON
                started_at TEXT NOT NULL,
                completed_at TEXT,
                public_token TEXT,
                total_distance_km REAL,
                total_duration_minutes INTEGER,
                average_speed_kmh REAL,
                max_speed_kmh REAL,
                points_count INTEGER
            )",
            (),
        )
        .await?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS gps_location_points (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                altitude REAL,
                accuracy REAL,
                speed_kmh REAL,
                heading REAL,
                recorded_at INTEGER NOT NULL -- ms since the epoch
            )",
            (),
        )
        .await?;
        Ok(())
    }

    async fn query_sessions(&self, clause: &str, value: String) -> Result<Vec<TrackingSession>> {
        let mut results = self
            .conn
            .lock()
            .await
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM tracking_sessions {clause}"),
                (value,),
            )
            .await
            .with_context(|| format!("Failed to load sessions. File name: {:?}", self.db_file))?;
        let mut sessions = Vec::new();
        while let Some(row) = results.next().await? {
            sessions.push(Self::map_row_to_dbsession(row)?.into());
        }
        Ok(sessions)
    }

    fn map_row_to_dbsession(row: Row) -> Result<DbSession> {
        let id_val = row.get::<String>(0)?;
        let mission_id_val = row.get::<String>(1)?;
        let driver_id_val = row.get::<String>(2)?;
        let status_val = row.get::<String>(3)?;
        let details_val = row.get::<String>(4)?;
        let started_at_val = row.get::<String>(5)?;
        let completed_at_val = row.get::<Option<String>>(6)?;
        let public_token_val = row.get::<Option<String>>(7)?;
        let points_count_val = row.get::<Option<i64>>(12)?;
        let stats = match points_count_val {
            Some(points_count) => Some(RouteStats {
                total_distance_km: row.get::<Option<f64>>(8)?.unwrap_or_default(),
                total_duration_minutes: row.get::<Option<i64>>(9)?.unwrap_or_default(),
                average_speed_kmh: row.get::<Option<f64>>(10)?.unwrap_or_default(),
                max_speed_kmh: row.get::<Option<f64>>(11)?.unwrap_or_default(),
                points_count: usize::try_from(points_count)?,
            }),
            None => None,
        };

        let details: SessionDetails = serde_json::from_str(&details_val)
            .with_context(|| format!("Corrupt details of session {id_val}"))?;
        Ok(DbSession {
            id: SessionId(id_val),
            mission_id: MissionId(mission_id_val),
            driver_id: DriverId(driver_id_val),
            status: status_val.parse()?,
            details,
            started_at: parse_time(&started_at_val)?,
            completed_at: completed_at_val.as_deref().map(parse_time).transpose()?,
            public_token: public_token_val,
            stats,
        })
    }

    fn map_row_to_point(row: Row) -> Result<LocationPoint> {
        let recorded_at_val = row.get::<i64>(8)?;
        Ok(LocationPoint {
            id: PointId(row.get::<String>(0)?),
            session_id: SessionId(row.get::<String>(1)?),
            latitude: row.get::<f64>(2)?,
            longitude: row.get::<f64>(3)?,
            altitude: row.get::<Option<f64>>(4)?,
            accuracy: row.get::<Option<f64>>(5)?,
            speed_kmh: row.get::<Option<f64>>(6)?,
            heading: row.get::<Option<f64>>(7)?,
            recorded_at: DateTime::from_timestamp_millis(recorded_at_val).ok_or_else(|| {
                anyhow::anyhow!("Point timestamp {recorded_at_val} out of range")
            })?,
        })
    }
}

#[async_trait]
impl TrackingStore for DbClient {
    async fn insert_session(&self, session: &TrackingSession) -> Result<()> {
        let row = DbSession::from(session);
        let (distance, duration, average, max, points) = stats_columns(row.stats.as_ref())?;
        self.conn
            .lock()
            .await
            .execute(
                &format!(
                    "INSERT INTO tracking_sessions ({SESSION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
                ),
                (
                    row.id.0,
                    row.mission_id.0,
                    row.driver_id.0,
                    row.status.as_str().to_string(),
                    serde_json::to_string(&row.details)?,
                    format_time(&row.started_at),
                    row.completed_at.as_ref().map(format_time),
                    row.public_token,
                    distance,
                    duration,
                    average,
                    max,
                    points,
                ),
            )
            .await
            .with_context(|| {
                format!(
                    "Failed to insert into tracking_sessions. File name: {:?}",
                    self.db_file
                )
            })?;
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<TrackingSession>> {
        Ok(self
            .query_sessions("WHERE id = ?", id.0.clone())
            .await?
            .into_iter()
            .next())
    }

    async fn sessions_for_mission(&self, mission_id: &MissionId) -> Result<Vec<TrackingSession>> {
        self.query_sessions(
            "WHERE mission_id = ? ORDER BY started_at DESC",
            mission_id.0.clone(),
        )
        .await
    }

    async fn find_by_public_token(&self, token: &str) -> Result<Option<TrackingSession>> {
        Ok(self
            .query_sessions("WHERE public_token = ?", token.to_string())
            .await?
            .into_iter()
            .next())
    }

    async fn update_session(&self, id: &SessionId, patch: &SessionPatch) -> Result<()> {
        let mut session = self
            .get_session(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Cannot update missing session {id}"))?;
        patch.apply(&mut session);
        let row = DbSession::from(&session);
        let (distance, duration, average, max, points) = stats_columns(row.stats.as_ref())?;

        self.conn
            .lock()
            .await
            .execute(
                "UPDATE tracking_sessions SET status = ?, details = ?, completed_at = ?, \
                 total_distance_km = ?, total_duration_minutes = ?, average_speed_kmh = ?, \
                 max_speed_kmh = ?, points_count = ? WHERE id = ?",
                (
                    row.status.as_str().to_string(),
                    serde_json::to_string(&row.details)?,
                    row.completed_at.as_ref().map(format_time),
                    distance,
                    duration,
                    average,
                    max,
                    points,
                    row.id.0,
                ),
            )
            .await
            .with_context(|| format!("Failed to update session. File name: {:?}", self.db_file))?;
        Ok(())
    }

    async fn insert_point(&self, point: &LocationPoint) -> Result<()> {
        self.conn
            .lock()
            .await
            .execute(
                &format!(
                    "INSERT INTO gps_location_points ({POINT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
                ),
                (
                    point.id.0.clone(),
                    point.session_id.0.clone(),
                    point.latitude,
                    point.longitude,
                    point.altitude,
                    point.accuracy,
                    point.speed_kmh,
                    point.heading,
                    point.recorded_at.timestamp_millis(),
                ),
            )
            .await
            .with_context(|| {
                format!(
                    "Failed to insert into gps_location_points. File name: {:?}",
                    self.db_file
                )
            })?;
        Ok(())
    }

    async fn points_for_session(&self, id: &SessionId) -> Result<Vec<LocationPoint>> {
        let mut results = self
            .conn
            .lock()
            .await
            .query(
                &format!(
                    "SELECT {POINT_COLUMNS} FROM gps_location_points WHERE session_id = ? ORDER BY recorded_at ASC, id ASC"
                ),
                (id.0.clone(),),
            )
            .await
            .with_context(|| format!("Failed to load points. File name: {:?}", self.db_file))?;
        let mut points = Vec::new();
        while let Some(row) = results.next().await? {
            points.push(Self::map_row_to_point(row)?);
        }
        Ok(points)
    }
}
