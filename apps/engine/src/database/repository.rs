use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use libsql::params;
use scorecheck::{ResultSink, ServiceCheck};
use tracing::debug;

use crate::pool::{LibsqlManager, LibsqlPool};

/// One row of `service_checks`
#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCheck {
    pub id: i64,
    pub team_id: String,
    pub target_id: i64,
    pub service: String,
    pub result_code: String,
    pub feedback: String,
    pub staff_feedback: String,
    pub points: i64,
}

/// libsql-backed sink for scored checks
pub struct ResultStore {
    pool: LibsqlPool,
}

impl ResultStore {
    /// Open (or create) the database at `path` and bring its schema up to date
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_string_lossy().to_string();
        let db = libsql::Builder::new_local(&path).build().await?;
        let pool: LibsqlPool = deadpool::managed::Pool::builder(LibsqlManager::new(db))
            .config(deadpool::managed::PoolConfig::default())
            .build()?;

        let conn = pool.get().await?;
        super::initialize_database(&conn).await?;

        Ok(Self::new_from_pool(pool))
    }

    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    async fn get_conn(&self) -> Result<deadpool::managed::Object<LibsqlManager>> {
        Ok(self.pool.get().await?)
    }

    /// Store a scored check with its details and add its points to the team total
    pub async fn save_check(&self, check: &ServiceCheck) -> Result<i64> {
        let code = check.outcome.code()?;
        let now = chrono::Utc::now().timestamp();
        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;

        tx.execute(
            "INSERT INTO service_checks (team_id, team_name, target_id, target_host, service, result_code, feedback, staff_feedback, points, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                check.team_id.clone(),
                check.team_name.clone(),
                check.target_id,
                check.target_host.clone(),
                check.service.as_str(),
                code.as_code(),
                check.outcome.participant().summary(),
                check.outcome.staff().summary(),
                check.points as i64,
                now
            ],
        )
        .await?;
        let check_id = tx.last_insert_rowid();

        let details = [
            ("participant", check.outcome.participant().details()),
            ("staff", check.outcome.staff().details()),
        ];
        for (audience, entries) in details {
            for detail in entries {
                tx.execute(
                    "INSERT INTO check_details (check_id, audience, detail) VALUES (?, ?, ?)",
                    params![check_id, audience, detail.to_string()],
                )
                .await?;
            }
        }

        tx.execute(
            "INSERT INTO team_points (team_id, team_name, points, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(team_id) DO UPDATE SET points = points + excluded.points, team_name = excluded.team_name, updated_at = excluded.updated_at",
            params![check.team_id.clone(), check.team_name.clone(), check.points as i64, now],
        )
        .await?;

        tx.commit().await?;
        Ok(check_id)
    }

    /// Team totals, highest first
    pub async fn standings(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query("SELECT team_name, points FROM team_points ORDER BY points DESC, team_name", ())
            .await?;

        let mut standings = Vec::new();
        while let Some(row) = rows.next().await? {
            standings.push((row.get(0)?, row.get(1)?));
        }
        Ok(standings)
    }
}

#[cfg(test)]
impl ResultStore {
    pub async fn recent_checks(&self, limit: usize) -> Result<Vec<StoredCheck>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, team_id, target_id, service, result_code, feedback, staff_feedback, points FROM service_checks ORDER BY id DESC LIMIT ?",
                params![limit as i64],
            )
            .await?;

        let mut checks = Vec::new();
        while let Some(row) = rows.next().await? {
            checks.push(StoredCheck {
                id: row.get(0)?,
                team_id: row.get(1)?,
                target_id: row.get(2)?,
                service: row.get(3)?,
                result_code: row.get(4)?,
                feedback: row.get(5)?,
                staff_feedback: row.get(6)?,
                points: row.get(7)?,
            });
        }
        Ok(checks)
    }

    /// Stored details of one check for one audience, in insertion order
    pub async fn details(&self, check_id: i64, audience: &str) -> Result<Vec<serde_json::Value>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT detail FROM check_details WHERE check_id = ? AND audience = ? ORDER BY id",
                params![check_id, audience],
            )
            .await?;

        let mut details = Vec::new();
        while let Some(row) = rows.next().await? {
            let raw: String = row.get(0)?;
            details.push(serde_json::from_str(&raw)?);
        }
        Ok(details)
    }
}

#[async_trait]
impl ResultSink for ResultStore {
    async fn record(&self, check: &ServiceCheck) -> Result<()> {
        let id = self.save_check(check).await?;
        debug!("Stored {} check on {} as row {}", check.service, check.target_host, id);
        Ok(())
    }
}
