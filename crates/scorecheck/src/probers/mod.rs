//! Protocol probers.
//!
//! Each prober consumes one [`ServiceCheck`] and records exactly one
//! terminal outcome on it. Network failures never escape a prober; they are
//! mapped onto the outcome instead. Blocking client libraries run on the
//! blocking thread pool so a slow target never stalls the rest of the cycle.

pub mod ftp;
pub mod http;
pub mod icmp;
pub mod sql;
pub mod ssh;

pub use ftp::{FtpConnector, FtpProber, FtpSession, SuppaFtpConnector};
pub use http::HttpProber;
pub use icmp::{IcmpProber, Pinger, SurgePinger};
pub use sql::{MysqlConnector, SqlConnector, SqlProber, SqlSession};
pub use ssh::{HostKeyStore, Ssh2Connector, SshConnector, SshProber, SshSession};

use serde_json::json;
use tokio::task::JoinError;

use crate::check::ServiceCheck;
use crate::outcome::Report;

/// Prober trait for the protocol-specific checks
#[async_trait::async_trait]
pub trait Prober: Send + Sync {
    /// Run the check and record its outcome on `check`
    async fn probe(&self, check: &mut ServiceCheck);
}

/// Record an error outcome for a prober whose blocking task died
fn record_join_error(check: &mut ServiceCheck, error: JoinError) {
    tracing::error!("{} prober task for {} failed: {}", check.service, check.target_host, error);
    check.outcome.error(
        Report::feedback(format!("{} check could not complete: call staff", check.service))
            .with_staff_detail(json!({ "target": check.target_host, "raw": error.to_string() })),
    );
}
