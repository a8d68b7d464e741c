//! MySQL prober.
//!
//! Connects with the team's credentials, reads every row of the configured
//! table, then inserts one row of test data inside a committed transaction.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Params, Row, TxOpts, Value};
use serde_json::json;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::Prober;
use crate::check::{ServiceCheck, SqlInfo};
use crate::outcome::{Outcome, Report};

pub const SQL_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SqlFailure {
    #[error("connection failed: {0}")]
    Connect(String),
    /// Syntax errors, missing tables, denied access
    #[error("{0}")]
    Programming(String),
    #[error("{0}")]
    Other(String),
}

impl SqlFailure {
    /// Classify a driver error. SQLSTATE classes 42 and 28 are programming errors.
    fn classify(error: mysql_async::Error, connecting: bool) -> Self {
        match error {
            mysql_async::Error::Server(server)
                if server.state.starts_with("42") || server.state.starts_with("28") =>
            {
                SqlFailure::Programming(server.message)
            }
            mysql_async::Error::Io(e) if connecting => SqlFailure::Connect(e.to_string()),
            mysql_async::Error::Driver(e) if connecting => SqlFailure::Connect(e.to_string()),
            other => SqlFailure::Other(other.to_string()),
        }
    }
}

/// Connection parameters for one check
#[derive(Clone)]
pub struct SqlTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub db_name: String,
    pub timeout: Duration,
}

#[async_trait::async_trait]
pub trait SqlConnector: Send + Sync {
    async fn connect(&self, target: &SqlTarget) -> Result<Box<dyn SqlSession>, SqlFailure>;
}

#[async_trait::async_trait]
pub trait SqlSession: Send {
    /// Fetch every row of `table`, returning the row count
    async fn read_table(&mut self, table: &str) -> Result<usize, SqlFailure>;

    /// Insert one row and commit
    async fn insert_row(&mut self, table: &str, data: &[(String, String)]) -> Result<(), SqlFailure>;

    async fn close(self: Box<Self>);
}

/// Backtick-quote an identifier
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Parameterised INSERT for the ordered test data
pub fn build_insert(table: &str, data: &[(String, String)]) -> String {
    let columns: Vec<String> = data.iter().map(|(column, _)| quote_identifier(column)).collect();
    let placeholders: Vec<&str> = data.iter().map(|_| "?").collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_identifier(table),
        columns.join(", "),
        placeholders.join(", ")
    )
}

/// `mysql_async`-backed connector
#[derive(Debug, Default)]
pub struct MysqlConnector;

#[async_trait::async_trait]
impl SqlConnector for MysqlConnector {
    async fn connect(&self, target: &SqlTarget) -> Result<Box<dyn SqlSession>, SqlFailure> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(target.host.clone())
            .tcp_port(target.port)
            .user(Some(target.username.clone()))
            .pass(Some(target.password.clone()))
            .db_name(Some(target.db_name.clone()));

        let conn = timeout(target.timeout, Conn::new(opts))
            .await
            .map_err(|_| SqlFailure::Connect(format!("timed out after {:?}", target.timeout)))?
            .map_err(|e| SqlFailure::classify(e, true))?;

        Ok(Box::new(MysqlSession { conn }))
    }
}

struct MysqlSession {
    conn: Conn,
}

#[async_trait::async_trait]
impl SqlSession for MysqlSession {
    async fn read_table(&mut self, table: &str) -> Result<usize, SqlFailure> {
        let rows: Vec<Row> = self
            .conn
            .query(format!("SELECT * FROM {}", quote_identifier(table)))
            .await
            .map_err(|e| SqlFailure::classify(e, false))?;
        Ok(rows.len())
    }

    async fn insert_row(&mut self, table: &str, data: &[(String, String)]) -> Result<(), SqlFailure> {
        let query = build_insert(table, data);
        let values: Vec<Value> =
            data.iter().map(|(_, value)| Value::Bytes(value.as_bytes().to_vec())).collect();

        let mut tx = self
            .conn
            .start_transaction(TxOpts::default())
            .await
            .map_err(|e| SqlFailure::classify(e, false))?;
        tx.exec_drop(query, Params::Positional(values))
            .await
            .map_err(|e| SqlFailure::classify(e, false))?;
        tx.commit().await.map_err(|e| SqlFailure::classify(e, false))
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.conn.disconnect().await {
            debug!("MySQL disconnect failed: {}", e);
        }
    }
}

/// Where the check ended up, before it is turned into an outcome
#[derive(Debug)]
pub enum SqlRun {
    ConnectFailed(SqlFailure),
    ProbeFailed(SqlFailure),
    Completed { rows_read: usize },
}

/// Await one session stage, giving up after `limit`
async fn bounded<T>(
    limit: Duration,
    stage: &str,
    work: impl Future<Output = Result<T, SqlFailure>>,
) -> Result<T, SqlFailure> {
    timeout(limit, work)
        .await
        .map_err(|_| SqlFailure::Other(format!("{stage} timed out after {limit:?}")))?
}

/// Run both probes, closing the connection on every path. Every stage is
/// bounded by `target.timeout`.
pub async fn run_session(connector: &dyn SqlConnector, target: &SqlTarget, info: &SqlInfo) -> SqlRun {
    let connected = timeout(target.timeout, connector.connect(target))
        .await
        .unwrap_or_else(|_| Err(SqlFailure::Connect(format!("timed out after {:?}", target.timeout))));
    let mut session = match connected {
        Ok(session) => session,
        Err(e) => return SqlRun::ConnectFailed(e),
    };

    let result = async {
        let rows_read =
            bounded(target.timeout, "read", session.read_table(&info.table_name)).await?;
        bounded(target.timeout, "write", session.insert_row(&info.table_name, &info.test_data))
            .await?;
        Ok::<_, SqlFailure>(rows_read)
    }
    .await;
    if timeout(target.timeout, session.close()).await.is_err() {
        debug!("MySQL disconnect from {} timed out", target.host);
    }

    match result {
        Ok(rows_read) => SqlRun::Completed { rows_read },
        Err(e) => SqlRun::ProbeFailed(e),
    }
}

/// Turn a finished run into exactly one terminal outcome
pub fn judge(outcome: &mut Outcome, host: &str, info: &SqlInfo, run: SqlRun) {
    let details = |raw: Option<String>| {
        json!({
            "target": host,
            "username": info.sql_username,
            "db_name": info.db_name,
            "table_name": info.table_name,
            "raw": raw,
        })
    };

    match run {
        SqlRun::Completed { rows_read } => {
            let mut staff = details(None);
            staff["rows_read"] = json!(rows_read);
            outcome.success(
                Report::feedback(format!(
                    "Successful read and write on SQL host {host} as user {}",
                    info.sql_username
                ))
                .with_staff_detail(staff),
            );
        }
        SqlRun::ConnectFailed(SqlFailure::Programming(message))
        | SqlRun::ProbeFailed(SqlFailure::Programming(message)) => outcome.warn(
            Report::feedback(format!("SQL error occurred: {message}"))
                .with_staff_detail(details(Some(message.clone()))),
        ),
        SqlRun::ConnectFailed(e) => outcome.fail(
            Report::feedback(format!("Failed to connect to SQL host {host}"))
                .with_staff_detail(details(Some(e.to_string()))),
        ),
        SqlRun::ProbeFailed(e) => outcome.fail(
            Report::feedback("An unexpected error occurred during the SQL check")
                .with_staff_detail(details(Some(e.to_string()))),
        ),
    }
}

/// SQL prober
pub struct SqlProber {
    connector: Arc<dyn SqlConnector>,
    timeout: Duration,
}

impl SqlProber {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(MysqlConnector))
    }

    pub fn with_connector(connector: Arc<dyn SqlConnector>) -> Self {
        Self { connector, timeout: SQL_CONNECT_TIMEOUT }
    }
}

impl Default for SqlProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Prober for SqlProber {
    async fn probe(&self, check: &mut ServiceCheck) {
        let Some(info) = check.sql_info().cloned() else {
            warn!("SQL check for {} has no SQL info", check.target_host);
            check.outcome.error(
                Report::feedback(format!("No SQL info given for target: {}", check.target_host))
                    .with_staff_feedback("missing SQL configuration"),
            );
            return;
        };

        let target = SqlTarget {
            host: check.target_host.clone(),
            port: check.port().unwrap_or(3306),
            username: info.sql_username.clone(),
            password: info.sql_password.clone(),
            db_name: info.db_name.clone(),
            timeout: self.timeout,
        };
        debug!("SQL check starting for {}:{}", target.host, target.port);

        let run = run_session(self.connector.as_ref(), &target, &info).await;
        judge(&mut check.outcome, &check.target_host, &info, run);
        debug!("SQL check for {} finished: {:?}", check.target_host, check.outcome.code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{CheckTarget, ProtocolInfo, ServiceKind};
    use crate::outcome::ResultCode;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeDatabase {
        tables: Vec<String>,
        refuse: bool,
        stall_read: bool,
        stall_close: bool,
        connects: AtomicUsize,
        closes: Arc<AtomicUsize>,
        inserts: Arc<Mutex<Vec<String>>>,
    }

    struct FakeSession {
        tables: Vec<String>,
        stall_read: bool,
        stall_close: bool,
        closes: Arc<AtomicUsize>,
        inserts: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl SqlConnector for FakeDatabase {
        async fn connect(&self, _target: &SqlTarget) -> Result<Box<dyn SqlSession>, SqlFailure> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Err(SqlFailure::Connect("Connection refused".to_string()));
            }
            Ok(Box::new(FakeSession {
                tables: self.tables.clone(),
                stall_read: self.stall_read,
                stall_close: self.stall_close,
                closes: self.closes.clone(),
                inserts: self.inserts.clone(),
            }))
        }
    }

    #[async_trait::async_trait]
    impl SqlSession for FakeSession {
        async fn read_table(&mut self, table: &str) -> Result<usize, SqlFailure> {
            if self.stall_read {
                std::future::pending::<()>().await;
            }
            if self.tables.iter().any(|t| t == table) {
                Ok(3)
            } else {
                Err(SqlFailure::Programming(format!("Table 'shop.{table}' doesn't exist")))
            }
        }

        async fn insert_row(
            &mut self,
            table: &str,
            data: &[(String, String)],
        ) -> Result<(), SqlFailure> {
            self.inserts.lock().unwrap().push(build_insert(table, data));
            Ok(())
        }

        async fn close(self: Box<Self>) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.stall_close {
                std::future::pending::<()>().await;
            }
        }
    }

    fn sql_check(table: &str) -> ServiceCheck {
        ServiceCheck::new(
            CheckTarget {
                target_id: 6,
                target_host: "10.0.6.6".to_string(),
                target_port: None,
                team_id: "6".to_string(),
                team_name: "Team Six".to_string(),
            },
            ServiceKind::Sql,
            Some(ProtocolInfo::Sql(SqlInfo {
                sql_username: "scorer".to_string(),
                sql_password: "secret".to_string(),
                db_name: "shop".to_string(),
                table_name: table.to_string(),
                test_data: vec![
                    ("name".to_string(), "widget".to_string()),
                    ("qty".to_string(), "3".to_string()),
                ],
            })),
        )
    }

    #[test]
    fn test_build_insert_preserves_column_order() {
        let data = vec![("b".to_string(), "1".to_string()), ("a".to_string(), "2".to_string())];
        assert_eq!(build_insert("orders", &data), "INSERT INTO `orders` (`b`, `a`) VALUES (?, ?)");
        assert_eq!(quote_identifier("we`ird"), "`we``ird`");
    }

    #[tokio::test]
    async fn test_read_and_write_pass() {
        let db = Arc::new(FakeDatabase { tables: vec!["orders".into()], ..Default::default() });
        let mut check = sql_check("orders");
        SqlProber::with_connector(db.clone()).probe(&mut check).await;

        assert_eq!(check.outcome.code(), Ok(ResultCode::Pass));
        assert_eq!(db.inserts.lock().unwrap().len(), 1);
        assert_eq!(db.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_table_is_warn_and_closes() {
        let db = Arc::new(FakeDatabase { tables: vec!["orders".into()], ..Default::default() });
        let mut check = sql_check("invoices");
        SqlProber::with_connector(db.clone()).probe(&mut check).await;

        assert_eq!(check.outcome.code(), Ok(ResultCode::Warn));
        assert!(check.outcome.participant().summary().contains("doesn't exist"));
        assert!(db.inserts.lock().unwrap().is_empty());
        assert_eq!(db.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_fail() {
        let db = Arc::new(FakeDatabase { refuse: true, ..Default::default() });
        let mut check = sql_check("orders");
        SqlProber::with_connector(db.clone()).probe(&mut check).await;

        assert_eq!(check.outcome.code(), Ok(ResultCode::Fail));
        assert_eq!(db.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_info_never_connects() {
        let db = Arc::new(FakeDatabase::default());
        let mut check = sql_check("orders");
        check.protocol = None;
        SqlProber::with_connector(db.clone()).probe(&mut check).await;

        assert_eq!(check.outcome.code(), Ok(ResultCode::Error));
        assert_eq!(db.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_query_times_out_as_fail() {
        let db = Arc::new(FakeDatabase {
            tables: vec!["orders".into()],
            stall_read: true,
            ..Default::default()
        });
        let mut check = sql_check("orders");
        let started = tokio::time::Instant::now();

        let finished = tokio::time::timeout(
            Duration::from_secs(3600),
            SqlProber::with_connector(db.clone()).probe(&mut check),
        )
        .await;

        assert!(finished.is_ok());
        assert!(started.elapsed() <= SQL_CONNECT_TIMEOUT * 2);
        assert_eq!(check.outcome.code(), Ok(ResultCode::Fail));
        assert!(check.outcome.staff().details()[0]["raw"].as_str().unwrap().contains("timed out"));
        assert!(db.inserts.lock().unwrap().is_empty());
        assert_eq!(db.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_disconnect_does_not_hold_the_check() {
        let db = Arc::new(FakeDatabase {
            tables: vec!["orders".into()],
            stall_close: true,
            ..Default::default()
        });
        let mut check = sql_check("orders");

        let finished = tokio::time::timeout(
            Duration::from_secs(3600),
            SqlProber::with_connector(db.clone()).probe(&mut check),
        )
        .await;

        assert!(finished.is_ok());
        assert_eq!(check.outcome.code(), Ok(ResultCode::Pass));
        assert_eq!(db.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_other_probe_errors_fail() {
        let mut outcome = Outcome::new();
        let info = sql_check("orders").sql_info().cloned().unwrap();
        judge(&mut outcome, "10.0.6.6", &info, SqlRun::ProbeFailed(SqlFailure::Other("data".into())));
        assert_eq!(outcome.code(), Ok(ResultCode::Fail));
    }
}
