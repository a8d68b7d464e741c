//! Teams, their targets, and the services checked on each target.
//!
//! ```toml
//! [[teams]]
//! id = "team01"
//! name = "Team 1"
//!
//! [[teams.targets]]
//! id = 101
//! host = "10.1.0.10"
//!
//! [[teams.targets.checks]]
//! service = "ssh"
//! port = 22
//! ssh = { username = "scorer", priv_key = "scorer_ed25519", script = "md5sum /etc/passwd", md5sum = "..." }
//! ```

use std::path::{Path, PathBuf};
use std::{fmt, fs};

use scorecheck::{
    CheckError, CheckTarget, FtpAction, FtpInfo, HttpInfo, ProtocolInfo, ServiceCheck, SqlInfo,
    SshInfo,
};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read roster {path}: {source}")]
    ReadFailed { path: PathBuf, source: std::io::Error },

    #[error("Failed to parse roster {path}: {source}")]
    ParseFailed { path: PathBuf, source: toml::de::Error },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Roster {
    #[serde(default)]
    pub teams: Vec<Team>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub targets: Vec<Target>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Target {
    pub id: i64,
    pub host: String,
    #[serde(default)]
    pub checks: Vec<CheckEntry>,
}

/// Port as written in the roster, either `22` or `"22"`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Port {
    Number(u16),
    Text(String),
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Port::Number(port) => write!(f, "{port}"),
            Port::Text(port) => f.write_str(port),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckEntry {
    pub service: String,
    pub port: Option<Port>,
    pub ssh: Option<SshEntry>,
    pub http: Option<HttpEntry>,
    pub ftp: Option<FtpEntry>,
    pub sql: Option<SqlEntry>,
}

#[derive(Clone, Deserialize)]
pub struct SshEntry {
    pub username: String,
    pub priv_key: String,
    pub script: String,
    pub md5sum: String,
}

impl fmt::Debug for SshEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshEntry")
            .field("username", &self.username)
            .field("priv_key", &"<redacted>")
            .field("script", &self.script)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpEntry {
    pub url: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Clone, Deserialize)]
pub struct FtpEntry {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub directory: String,
    pub action: FtpAction,
    pub files: Vec<String>,
    #[serde(default)]
    pub md5_sums: Vec<String>,
}

impl fmt::Debug for FtpEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpEntry")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("directory", &self.directory)
            .field("action", &self.action)
            .field("files", &self.files)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Deserialize)]
pub struct SqlEntry {
    pub username: String,
    pub password: String,
    pub db_name: String,
    pub table_name: String,
    /// Column to value, in insertion order
    #[serde(default)]
    pub test_data: toml::Table,
}

impl fmt::Debug for SqlEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlEntry")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("db_name", &self.db_name)
            .field("table_name", &self.table_name)
            .field("test_data", &self.test_data)
            .finish()
    }
}

impl From<&SshEntry> for SshInfo {
    fn from(entry: &SshEntry) -> Self {
        SshInfo {
            ssh_username: entry.username.clone(),
            ssh_priv_key: entry.priv_key.clone(),
            ssh_script: entry.script.clone(),
            md5sum: entry.md5sum.clone(),
        }
    }
}

impl From<&HttpEntry> for HttpInfo {
    fn from(entry: &HttpEntry) -> Self {
        HttpInfo { url: entry.url.clone(), path: entry.path.clone() }
    }
}

impl From<&FtpEntry> for FtpInfo {
    fn from(entry: &FtpEntry) -> Self {
        FtpInfo {
            ftp_username: entry.username.clone(),
            ftp_password: entry.password.clone(),
            directory: entry.directory.clone(),
            ftp_action: entry.action,
            files: entry.files.clone(),
            md5_sums: entry.md5_sums.clone(),
        }
    }
}

impl From<&SqlEntry> for SqlInfo {
    fn from(entry: &SqlEntry) -> Self {
        let test_data = entry
            .test_data
            .iter()
            .map(|(column, value)| {
                let value = match value {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (column.clone(), value)
            })
            .collect();

        SqlInfo {
            sql_username: entry.username.clone(),
            sql_password: entry.password.clone(),
            db_name: entry.db_name.clone(),
            table_name: entry.table_name.clone(),
            test_data,
        }
    }
}

impl CheckEntry {
    /// The protocol table matching `service`, or whichever table is present so
    /// the dispatcher can report the mismatch
    fn protocol(&self) -> Option<ProtocolInfo> {
        let ssh = || self.ssh.as_ref().map(|e| ProtocolInfo::Ssh(e.into()));
        let http = || self.http.as_ref().map(|e| ProtocolInfo::Http(e.into()));
        let ftp = || self.ftp.as_ref().map(|e| ProtocolInfo::Ftp(e.into()));
        let sql = || self.sql.as_ref().map(|e| ProtocolInfo::Sql(e.into()));

        let preferred = match self.service.trim().to_ascii_lowercase().as_str() {
            "ssh" => ssh(),
            "http" => http(),
            "ftp" => ftp(),
            "sql" => sql(),
            _ => None,
        };
        preferred.or_else(ssh).or_else(http).or_else(ftp).or_else(sql)
    }
}

impl Roster {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|source| Error::ReadFailed { path: path.to_path_buf(), source })?;
        Self::parse(&raw).map_err(|source| Error::ParseFailed { path: path.to_path_buf(), source })
    }

    pub fn parse(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Fresh checks for one cycle, plus the entries that name no known service
    pub fn checks(&self) -> (Vec<ServiceCheck>, Vec<CheckError>) {
        let mut checks = Vec::new();
        let mut errors = Vec::new();

        for team in &self.teams {
            for target in &team.targets {
                for entry in &target.checks {
                    let check_target = CheckTarget {
                        target_id: target.id,
                        target_host: target.host.clone(),
                        target_port: entry.port.as_ref().map(Port::to_string),
                        team_id: team.id.clone(),
                        team_name: team.name.clone(),
                    };
                    match ServiceCheck::from_service_name(
                        check_target,
                        &entry.service,
                        entry.protocol(),
                    ) {
                        Ok(check) => checks.push(check),
                        Err(e) => errors.push(e),
                    }
                }
            }
        }

        (checks, errors)
    }

    /// Number of configured check entries
    pub fn len(&self) -> usize {
        self.teams.iter().flat_map(|t| &t.targets).map(|t| t.checks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scorecheck::{ResultCode, ServiceKind};

    const ROSTER: &str = r#"
[[teams]]
id = "team01"
name = "Team 1"

[[teams.targets]]
id = 101
host = "10.1.0.10"

[[teams.targets.checks]]
service = "icmp"

[[teams.targets.checks]]
service = "SSH"
port = 2222
ssh = { username = "scorer", priv_key = "scorer_ed25519", script = "md5sum /etc/passwd", md5sum = "abc" }

[[teams.targets.checks]]
service = "telnet"

[[teams.targets]]
id = 102
host = "10.1.0.20"

[[teams.targets.checks]]
service = "sql"
port = "3307"

[teams.targets.checks.sql]
username = "scorer"
password = "hunter2"
db_name = "scoring"
table_name = "flags"

[teams.targets.checks.sql.test_data]
team = "team01"
round = 7
flag = "abc"

[[teams.targets.checks]]
service = "ftp"
ftp = { username = "anonymous", password = "", action = "GET", files = ["a.txt"], md5_sums = ["0cc1"] }
"#;

    #[test]
    fn test_checks_are_built_per_entry() {
        let roster = Roster::parse(ROSTER).unwrap();
        assert_eq!(roster.len(), 5);

        let (checks, errors) = roster.checks();

        assert_eq!(checks.len(), 4);
        assert_eq!(errors, vec![CheckError::UnknownService("telnet".into())]);

        let services: Vec<ServiceKind> = checks.iter().map(|c| c.service).collect();
        assert_eq!(
            services,
            vec![ServiceKind::Icmp, ServiceKind::Ssh, ServiceKind::Sql, ServiceKind::Ftp]
        );
        assert!(checks.iter().all(|c| c.validate().is_ok()));
        assert!(checks.iter().all(|c| c.outcome.code() == Err(scorecheck::OutcomeError::Unset)));
    }

    #[test]
    fn test_ports_accept_numbers_and_strings() {
        let (checks, _) = Roster::parse(ROSTER).unwrap().checks();

        assert_eq!(checks[0].port(), None);
        assert_eq!(checks[1].port(), Some(2222));
        assert_eq!(checks[2].port(), Some(3307));
        assert_eq!(checks[3].port(), Some(21));
    }

    #[test]
    fn test_sql_test_data_keeps_column_order() {
        let (checks, _) = Roster::parse(ROSTER).unwrap().checks();
        let info = checks[2].sql_info().unwrap();

        let columns: Vec<&str> = info.test_data.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(columns, vec!["team", "round", "flag"]);
        assert_eq!(info.test_data[1].1, "7");
    }

    #[test]
    fn test_each_call_yields_fresh_checks() {
        let roster = Roster::parse(ROSTER).unwrap();
        let (mut first, _) = roster.checks();
        first[0].outcome.success(scorecheck::Report::new());
        first[0].points = 5;

        let (second, _) = roster.checks();
        assert_eq!(first[0].outcome.code(), Ok(ResultCode::Pass));
        assert!(!second[0].outcome.is_set());
        assert_eq!(second[0].points, 0);
    }

    #[test]
    fn test_wrong_protocol_table_is_kept_for_validation() {
        let roster = Roster::parse(
            r#"
[[teams]]
id = "t"
name = "T"

[[teams.targets]]
id = 1
host = "h"

[[teams.targets.checks]]
service = "ssh"
http = { url = "h" }
"#,
        )
        .unwrap();
        let (checks, _) = roster.checks();

        assert_eq!(
            checks[0].validate(),
            Err(CheckError::MismatchedProtocolInfo {
                service: ServiceKind::Ssh,
                found: ServiceKind::Http
            })
        );
    }

    #[test]
    fn test_load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Roster::load(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(Error::ReadFailed { .. })));
    }
}
