use anyhow::Result;
use libsql::Connection;

/// Schema version - increment when making schema changes
const SCHEMA_VERSION: i32 = 2;

/// Run database migrations
pub async fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT
        )",
        (),
    )
    .await?;

    let current_version = get_current_version(conn).await?;

    if current_version >= SCHEMA_VERSION {
        tracing::info!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    tracing::info!("Running migrations from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        run_migration_v1(conn).await?;
        record_migration(conn, 1, "Service checks and feedback details").await?;
    }

    if current_version < 2 {
        run_migration_v2(conn).await?;
        record_migration(conn, 2, "Running team point totals").await?;
    }

    tracing::info!("Database migrations completed successfully (now at version {})", SCHEMA_VERSION);
    Ok(())
}

/// Get current schema version from database
pub async fn get_current_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn.query("SELECT MAX(version) FROM schema_migrations", ()).await?;

    if let Some(row) = rows.next().await? {
        let version: Option<i32> = row.get(0)?;
        Ok(version.unwrap_or(0))
    } else {
        Ok(0)
    }
}

async fn record_migration(conn: &Connection, version: i32, description: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    conn.execute(
        "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?, ?, ?)",
        libsql::params![version, now, description],
    )
    .await?;

    tracing::info!("Applied migration v{}: {}", version, description);
    Ok(())
}

/// Migration v1: one row per scored check, one row per feedback detail
async fn run_migration_v1(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS service_checks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            team_id TEXT NOT NULL,
            team_name TEXT NOT NULL,
            target_id INTEGER NOT NULL,
            target_host TEXT NOT NULL,
            service TEXT NOT NULL,
            result_code TEXT NOT NULL,
            feedback TEXT NOT NULL DEFAULT '',
            staff_feedback TEXT NOT NULL DEFAULT '',
            points INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    // audience is 'participant' or 'staff'
    conn.execute(
        "CREATE TABLE IF NOT EXISTS check_details (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            check_id INTEGER NOT NULL,
            audience TEXT NOT NULL,
            detail TEXT NOT NULL,
            FOREIGN KEY (check_id) REFERENCES service_checks(id) ON DELETE CASCADE
        )",
        (),
    )
    .await?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_service_checks_team ON service_checks(team_id)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_service_checks_created_at ON service_checks(created_at DESC)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_check_details_check_id ON check_details(check_id)", ()).await?;

    Ok(())
}

/// Migration v2: team totals, backfilled from existing checks
async fn run_migration_v2(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS team_points (
            team_id TEXT PRIMARY KEY,
            team_name TEXT NOT NULL,
            points INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    let now = chrono::Utc::now().timestamp();
    conn.execute(
        "INSERT OR IGNORE INTO team_points (team_id, team_name, points, updated_at)
         SELECT team_id, MAX(team_name), SUM(points), ? FROM service_checks GROUP BY team_id",
        libsql::params![now],
    )
    .await?;

    tracing::info!("Added team_points table");
    Ok(())
}
