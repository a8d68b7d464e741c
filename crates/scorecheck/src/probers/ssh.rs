//! SSH prober.
//!
//! Two stages: connect and authenticate with a private key, then run one
//! remote script and compare the first token of its stdout against the
//! expected checksum. The connect stage short-circuits on failure and the
//! session is closed on every path.

use std::collections::HashMap;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use ssh2::{ErrorCode, Session};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{Prober, record_join_error};
use crate::check::{ServiceCheck, SshInfo};
use crate::outcome::{Outcome, Report};

pub const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// libssh2 error codes
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;

#[derive(Debug, Error)]
pub enum SshFailure {
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("host key for {0} changed since first contact")]
    HostKeyChanged(String),
    #[error("{0}")]
    Other(String),
}

impl From<ssh2::Error> for SshFailure {
    fn from(error: ssh2::Error) -> Self {
        match error.code() {
            ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => SshFailure::Unreachable(error.to_string()),
            ErrorCode::Session(
                LIBSSH2_ERROR_AUTHENTICATION_FAILED | LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED,
            ) => SshFailure::Authentication(error.to_string()),
            _ => SshFailure::Other(error.to_string()),
        }
    }
}

/// Private key material for public key authentication
#[derive(Clone, PartialEq, Eq)]
pub enum PrivateKey {
    Inline(String),
    File(PathBuf),
}

impl PrivateKey {
    /// Inline PEM text is used as is, anything else names a file under `key_dir`
    pub fn resolve(value: &str, key_dir: &Path) -> Self {
        if value.trim_start().starts_with("-----BEGIN") {
            PrivateKey::Inline(value.to_string())
        } else {
            PrivateKey::File(key_dir.join(value))
        }
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrivateKey::Inline(_) => f.write_str("Inline(<redacted>)"),
            PrivateKey::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

/// Everything needed to open an SSH session
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub key: PrivateKey,
    pub timeout: Duration,
}

/// Captured output of the remote script
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Opens authenticated sessions. Blocking.
pub trait SshConnector: Send + Sync {
    fn connect(&self, target: &SshTarget) -> Result<Box<dyn SshSession>, SshFailure>;
}

/// An authenticated session. Blocking.
pub trait SshSession: Send {
    fn exec(&mut self, script: &str) -> Result<ExecOutput, SshFailure>;

    fn close(self: Box<Self>);
}

/// Trust-on-first-use host key memory shared by all SSH checks
#[derive(Debug, Default)]
pub struct HostKeyStore {
    keys: Mutex<HashMap<String, Vec<u8>>>,
}

impl HostKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the first key seen for `host:port`, reject a different one later
    pub fn verify(&self, host: &str, port: u16, key: &[u8]) -> Result<(), SshFailure> {
        let endpoint = format!("{host}:{port}");
        let mut keys = self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match keys.get(&endpoint) {
            Some(known) if known.as_slice() == key => Ok(()),
            Some(_) => Err(SshFailure::HostKeyChanged(endpoint)),
            None => {
                info!("Remembering host key for {}", endpoint);
                keys.insert(endpoint, key.to_vec());
                Ok(())
            }
        }
    }
}

/// libssh2-backed connector
pub struct Ssh2Connector {
    host_keys: Arc<HostKeyStore>,
}

impl Ssh2Connector {
    pub fn new(host_keys: Arc<HostKeyStore>) -> Self {
        Self { host_keys }
    }
}

impl SshConnector for Ssh2Connector {
    fn connect(&self, target: &SshTarget) -> Result<Box<dyn SshSession>, SshFailure> {
        let addr = (target.host.as_str(), target.port)
            .to_socket_addrs()
            .map_err(|e| SshFailure::Unreachable(format!("{}: {e}", target.host)))?
            .next()
            .ok_or_else(|| SshFailure::Unreachable(format!("no address for {}", target.host)))?;

        let tcp = TcpStream::connect_timeout(&addr, target.timeout)
            .map_err(|e| SshFailure::Unreachable(e.to_string()))?;

        let mut session = Session::new()?;
        session.set_timeout(target.timeout.as_millis() as u32);
        session.set_tcp_stream(tcp);
        session.handshake()?;

        let guard = Ssh2Session { session };
        let (host_key, _) = guard
            .session
            .host_key()
            .ok_or_else(|| SshFailure::Other("server presented no host key".to_string()))?;
        self.host_keys.verify(&target.host, target.port, host_key)?;

        match &target.key {
            PrivateKey::Inline(pem) => {
                guard.session.userauth_pubkey_memory(&target.username, None, pem, None)?
            }
            PrivateKey::File(path) => {
                guard.session.userauth_pubkey_file(&target.username, None, path, None)?
            }
        }
        if !guard.session.authenticated() {
            return Err(SshFailure::Authentication(format!(
                "server rejected key for {}",
                target.username
            )));
        }

        Ok(Box::new(guard))
    }
}

/// Session wrapper that disconnects when dropped
struct Ssh2Session {
    session: Session,
}

impl SshSession for Ssh2Session {
    fn exec(&mut self, script: &str) -> Result<ExecOutput, SshFailure> {
        let mut channel = self.session.channel_session()?;
        channel.exec(script)?;

        let mut output = ExecOutput::default();
        channel
            .read_to_string(&mut output.stdout)
            .map_err(|e| SshFailure::Other(e.to_string()))?;
        channel
            .stderr()
            .read_to_string(&mut output.stderr)
            .map_err(|e| SshFailure::Other(e.to_string()))?;
        channel.wait_close()?;

        Ok(output)
    }

    fn close(self: Box<Self>) {}
}

impl Drop for Ssh2Session {
    fn drop(&mut self) {
        if let Err(e) = self.session.disconnect(None, "check complete", None) {
            debug!("SSH disconnect failed: {}", e);
        }
    }
}

/// Where the check ended up, before it is turned into an outcome
#[derive(Debug)]
pub enum SshRun {
    ConnectFailed(SshFailure),
    ExecFailed(SshFailure),
    Completed(ExecOutput),
}

/// Run both stages against `connector`, closing the session on every path
pub fn run_session(connector: &dyn SshConnector, target: &SshTarget, script: &str) -> SshRun {
    let mut session = match connector.connect(target) {
        Ok(session) => session,
        Err(e) => return SshRun::ConnectFailed(e),
    };
    let result = session.exec(script);
    session.close();

    match result {
        Ok(output) => SshRun::Completed(output),
        Err(e) => SshRun::ExecFailed(e),
    }
}

/// Turn a finished run into exactly one terminal outcome
pub fn judge(outcome: &mut Outcome, host: &str, info: &SshInfo, run: SshRun) {
    let details = |raw: String| {
        json!({ "target": host, "ssh_username": info.ssh_username, "raw": raw })
    };

    match run {
        SshRun::ConnectFailed(e @ SshFailure::Unreachable(_)) => outcome.fail(
            Report::feedback(format!("Could not connect to host {host} over SSH"))
                .with_staff_detail(details(e.to_string())),
        ),
        SshRun::ConnectFailed(e @ SshFailure::Authentication(_)) => outcome.error(
            Report::feedback(format!("Could not authenticate to host {host} as the scoring user"))
                .with_staff_detail(details(e.to_string())),
        ),
        SshRun::ConnectFailed(e) => outcome.error(
            Report::feedback("SSH service check had an exception: call staff")
                .with_staff_detail(details(e.to_string())),
        ),
        SshRun::ExecFailed(e) => outcome.error(
            Report::feedback("SSH script execution failed: call staff")
                .with_staff_detail(details(e.to_string())),
        ),
        SshRun::Completed(output) => {
            let retrieved = output.stdout.split_whitespace().next().unwrap_or_default();
            let matched = retrieved.eq_ignore_ascii_case(info.md5sum.trim());
            let first_error = (!output.stderr.is_empty()).then(|| {
                let mut lines = output.stderr.lines();
                lines
                    .clone()
                    .find(|line| !line.trim().is_empty())
                    .or_else(|| lines.next())
                    .unwrap_or_default()
            });

            // A wrong checksum fails regardless of stderr
            match (matched, first_error) {
                (true, None) => outcome.success(Report::feedback(format!(
                    "SSH user {} can run the checksum script",
                    info.ssh_username
                ))),
                (true, Some(line)) => outcome.warn(
                    Report::feedback(format!(
                        "Able to connect to {host}, but the SSH script reported errors"
                    ))
                    .with_staff_detail(json!({ "target": host, "ssh_error": line })),
                ),
                (false, stderr) => outcome.fail(
                    Report::feedback(format!("SSH script on {host} returned an unexpected checksum"))
                        .with_staff_detail(json!({
                            "target": host,
                            "expected": info.md5sum,
                            "retrieved": retrieved,
                            "ssh_error": stderr,
                        })),
                ),
            }
        }
    }
}

/// SSH prober
pub struct SshProber {
    connector: Arc<dyn SshConnector>,
    key_dir: PathBuf,
    timeout: Duration,
}

impl SshProber {
    pub fn new(host_keys: Arc<HostKeyStore>, key_dir: impl Into<PathBuf>) -> Self {
        Self::with_connector(Arc::new(Ssh2Connector::new(host_keys)), key_dir)
    }

    pub fn with_connector(connector: Arc<dyn SshConnector>, key_dir: impl Into<PathBuf>) -> Self {
        Self { connector, key_dir: key_dir.into(), timeout: SSH_CONNECT_TIMEOUT }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait::async_trait]
impl Prober for SshProber {
    async fn probe(&self, check: &mut ServiceCheck) {
        let Some(info) = check.ssh_info().cloned() else {
            warn!("SSH check for {} has no SSH info", check.target_host);
            check.outcome.error(
                Report::feedback(format!("No SSH info given for target: {}", check.target_host))
                    .with_staff_feedback("missing SSH configuration"),
            );
            return;
        };

        let target = SshTarget {
            host: check.target_host.clone(),
            port: check.port().unwrap_or(22),
            username: info.ssh_username.clone(),
            key: PrivateKey::resolve(&info.ssh_priv_key, &self.key_dir),
            timeout: self.timeout,
        };
        debug!("SSH check starting for {}:{}", target.host, target.port);

        let connector = self.connector.clone();
        let script = info.ssh_script.clone();
        let joined =
            tokio::task::spawn_blocking(move || run_session(connector.as_ref(), &target, &script))
                .await;

        match joined {
            Ok(run) => judge(&mut check.outcome, &check.target_host, &info, run),
            Err(e) => record_join_error(check, e),
        }
        debug!("SSH check for {} finished: {:?}", check.target_host, check.outcome.code());
    }
}
