//! Check requests and their protocol-specific configuration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CheckError;
use crate::outcome::Outcome;

/// Service kinds the engine knows how to probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceKind {
    Icmp,
    Ssh,
    Ftp,
    Http,
    Sql,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 5] =
        [ServiceKind::Icmp, ServiceKind::Ssh, ServiceKind::Ftp, ServiceKind::Http, ServiceKind::Sql];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Icmp => "ICMP",
            ServiceKind::Ssh => "SSH",
            ServiceKind::Ftp => "FTP",
            ServiceKind::Http => "HTTP",
            ServiceKind::Sql => "SQL",
        }
    }

    /// Port used when the roster gives none
    pub fn default_port(&self) -> Option<u16> {
        match self {
            ServiceKind::Ssh => Some(22),
            ServiceKind::Ftp => Some(21),
            ServiceKind::Sql => Some(3306),
            ServiceKind::Icmp | ServiceKind::Http => None,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = CheckError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ICMP" => Ok(ServiceKind::Icmp),
            "SSH" => Ok(ServiceKind::Ssh),
            "FTP" => Ok(ServiceKind::Ftp),
            "HTTP" => Ok(ServiceKind::Http),
            "SQL" => Ok(ServiceKind::Sql),
            _ => Err(CheckError::UnknownService(s.to_string())),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct SshInfo {
    pub ssh_username: String,
    /// Inline PEM key material or a key file name relative to the key directory
    pub ssh_priv_key: String,
    pub ssh_script: String,
    pub md5sum: String,
}

impl fmt::Debug for SshInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshInfo")
            .field("ssh_username", &self.ssh_username)
            .field("ssh_priv_key", &"<redacted>")
            .field("ssh_script", &self.ssh_script)
            .field("md5sum", &self.md5sum)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpInfo {
    pub url: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FtpAction {
    Get,
    Put,
}

impl fmt::Display for FtpAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FtpAction::Get => f.write_str("GET"),
            FtpAction::Put => f.write_str("PUT"),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct FtpInfo {
    pub ftp_username: String,
    pub ftp_password: String,
    pub directory: String,
    pub ftp_action: FtpAction,
    pub files: Vec<String>,
    /// Expected checksums for GET, aligned with `files` by position
    pub md5_sums: Vec<String>,
}

impl fmt::Debug for FtpInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpInfo")
            .field("ftp_username", &self.ftp_username)
            .field("ftp_password", &"<redacted>")
            .field("directory", &self.directory)
            .field("ftp_action", &self.ftp_action)
            .field("files", &self.files)
            .field("md5_sums", &self.md5_sums)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct SqlInfo {
    pub sql_username: String,
    pub sql_password: String,
    pub db_name: String,
    pub table_name: String,
    /// Column/value pairs in insertion order
    pub test_data: Vec<(String, String)>,
}

impl fmt::Debug for SqlInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlInfo")
            .field("sql_username", &self.sql_username)
            .field("sql_password", &"<redacted>")
            .field("db_name", &self.db_name)
            .field("table_name", &self.table_name)
            .field("test_data", &self.test_data)
            .finish()
    }
}

/// Protocol configuration carried by a check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolInfo {
    Ssh(SshInfo),
    Http(HttpInfo),
    Ftp(FtpInfo),
    Sql(SqlInfo),
}

impl ProtocolInfo {
    pub fn kind(&self) -> ServiceKind {
        match self {
            ProtocolInfo::Ssh(_) => ServiceKind::Ssh,
            ProtocolInfo::Http(_) => ServiceKind::Http,
            ProtocolInfo::Ftp(_) => ServiceKind::Ftp,
            ProtocolInfo::Sql(_) => ServiceKind::Sql,
        }
    }
}

/// Identity of the probed target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckTarget {
    pub target_id: i64,
    pub target_host: String,
    pub target_port: Option<String>,
    pub team_id: String,
    pub team_name: String,
}

/// One probe to run in one cycle.
///
/// Built fresh for every cycle; its [`Outcome`] is written by exactly one
/// prober and `points` by the scoring engine.
#[derive(Debug, Clone)]
pub struct ServiceCheck {
    pub target_id: i64,
    pub target_host: String,
    pub target_port: Option<String>,
    pub team_id: String,
    pub team_name: String,
    pub service: ServiceKind,
    pub protocol: Option<ProtocolInfo>,
    pub outcome: Outcome,
    pub points: u32,
}

impl ServiceCheck {
    pub fn new(target: CheckTarget, service: ServiceKind, protocol: Option<ProtocolInfo>) -> Self {
        Self {
            target_id: target.target_id,
            target_host: target.target_host,
            target_port: target.target_port,
            team_id: target.team_id,
            team_name: target.team_name,
            service,
            protocol,
            outcome: Outcome::new(),
            points: 0,
        }
    }

    /// Build a check from a roster service name
    pub fn from_service_name(
        target: CheckTarget,
        service_name: &str,
        protocol: Option<ProtocolInfo>,
    ) -> Result<Self, CheckError> {
        Ok(Self::new(target, service_name.parse()?, protocol))
    }

    /// Ensure the protocol configuration matches the service kind
    pub fn validate(&self) -> Result<(), CheckError> {
        match (&self.protocol, self.service) {
            (None, ServiceKind::Icmp) => Ok(()),
            (None, service) => Err(CheckError::MissingProtocolInfo {
                service,
                target: self.target_host.clone(),
            }),
            (Some(info), service) if info.kind() == service => Ok(()),
            (Some(info), service) => {
                Err(CheckError::MismatchedProtocolInfo { service, found: info.kind() })
            }
        }
    }

    /// Numeric port from the roster, falling back to the service default
    pub fn port(&self) -> Option<u16> {
        self.target_port
            .as_deref()
            .and_then(|p| p.trim().parse().ok())
            .or_else(|| self.service.default_port())
    }

    pub fn ssh_info(&self) -> Option<&SshInfo> {
        match &self.protocol {
            Some(ProtocolInfo::Ssh(info)) => Some(info),
            _ => None,
        }
    }

    pub fn http_info(&self) -> Option<&HttpInfo> {
        match &self.protocol {
            Some(ProtocolInfo::Http(info)) => Some(info),
            _ => None,
        }
    }

    pub fn ftp_info(&self) -> Option<&FtpInfo> {
        match &self.protocol {
            Some(ProtocolInfo::Ftp(info)) => Some(info),
            _ => None,
        }
    }

    pub fn sql_info(&self) -> Option<&SqlInfo> {
        match &self.protocol {
            Some(ProtocolInfo::Sql(info)) => Some(info),
            _ => None,
        }
    }
}
