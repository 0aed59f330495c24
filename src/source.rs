use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::aggregate;
use crate::db;
use crate::models::AttendanceRecord;

/// Where live attendance comes from while a session is being watched.
#[async_trait]
pub trait AttendanceSource: Send + Sync {
    /// Today's rolled-up attendance for every participant of `program`.
    async fn todays_attendance(&self, program: &str) -> anyhow::Result<Vec<AttendanceRecord>>;

    async fn session_open(&self, session_id: Uuid) -> anyhow::Result<bool>;
}

pub struct PgAttendanceSource {
    pool: PgPool,
}

impl PgAttendanceSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AttendanceSource for PgAttendanceSource {
    async fn todays_attendance(&self, program: &str) -> anyhow::Result<Vec<AttendanceRecord>> {
        let today = Utc::now().date_naive();
        let roster = db::fetch_roster(&self.pool, Some(program)).await?;
        let dates = db::fetch_session_dates(&self.pool, program, today, today).await?;
        let entries = db::fetch_entries(&self.pool, program, today, today).await?;
        Ok(aggregate::roll_up(&roster, &dates, &entries))
    }

    async fn session_open(&self, session_id: Uuid) -> anyhow::Result<bool> {
        let session = db::fetch_session(&self.pool, session_id)
            .await?
            .with_context(|| format!("session {session_id} not found"))?;
        Ok(session.is_open(Utc::now()))
    }
}
