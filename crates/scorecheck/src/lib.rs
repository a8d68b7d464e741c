//! scorecheck - service check engine for scored cyber-defense exercises
//!
//! Probes every team's services (ICMP, SSH, FTP, HTTP, SQL) once per cycle,
//! records a pass/fail/warn/error outcome with participant and staff
//! feedback, and turns outcomes into points.

pub mod check;
pub mod cycle;
pub mod dispatcher;
pub mod error;
pub mod outcome;
pub mod probers;
pub mod scoring;

// Re-export main types
pub use check::{
    CheckTarget, FtpAction, FtpInfo, HttpInfo, ProtocolInfo, ServiceCheck, ServiceKind, SqlInfo,
    SshInfo,
};
pub use cycle::{CYCLE_INTERVAL, Cycle, CycleEvent, CycleRunner, CycleSummary, LogSink, ResultSink};
pub use dispatcher::{Dispatcher, ProberSettings, Probers};
pub use error::CheckError;
pub use outcome::{Feedback, Outcome, OutcomeError, Report, ResultCode};
pub use probers::Prober;
pub use scoring::{ScoreTable, ServiceScore};
