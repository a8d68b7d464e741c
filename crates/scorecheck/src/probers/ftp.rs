//! FTP prober.
//!
//! Connects, logs in, then either downloads each configured file while
//! hashing it (GET) or uploads a local fixture per file (PUT). Files are
//! handled independently so one bad file never hides the others.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use md5::{Digest, Md5};
use serde_json::{Map, Value, json};
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};
use thiserror::Error;
use tracing::{debug, warn};

use super::{Prober, record_join_error};
use crate::check::{FtpAction, FtpInfo, ServiceCheck};
use crate::outcome::{Outcome, Report};

pub const FTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum FtpFailure {
    #[error("{0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<FtpError> for FtpFailure {
    fn from(error: FtpError) -> Self {
        match error {
            FtpError::ConnectionError(e) => FtpFailure::Io(e),
            other => FtpFailure::Protocol(other.to_string()),
        }
    }
}

/// Opens control connections. Blocking.
pub trait FtpConnector: Send + Sync {
    fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn FtpSession>, FtpFailure>;
}

/// One FTP control connection. Blocking.
pub trait FtpSession: Send {
    fn login(&mut self, username: &str, password: &str) -> Result<(), FtpFailure>;

    fn change_dir(&mut self, directory: &str) -> Result<(), FtpFailure>;

    /// Download `file`, streaming its bytes into `sink`
    fn retrieve(&mut self, file: &str, sink: &mut dyn Write) -> Result<u64, FtpFailure>;

    /// Upload the bytes of `source` as `file`
    fn store(&mut self, file: &str, source: &mut dyn Read) -> Result<u64, FtpFailure>;

    fn quit(self: Box<Self>);
}

/// `suppaftp`-backed connector
#[derive(Debug, Default)]
pub struct SuppaFtpConnector;

impl FtpConnector for SuppaFtpConnector {
    fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn FtpSession>, FtpFailure> {
        let addr = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            FtpFailure::Io(io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}")))
        })?;
        let stream = FtpStream::connect_timeout(addr, timeout)?;
        stream.get_ref().set_read_timeout(Some(timeout))?;
        stream.get_ref().set_write_timeout(Some(timeout))?;
        Ok(Box::new(SuppaFtpSession { stream, timeout }))
    }
}

struct SuppaFtpSession {
    stream: FtpStream,
    /// Applied to every data connection as well as the control socket
    timeout: Duration,
}

impl FtpSession for SuppaFtpSession {
    fn login(&mut self, username: &str, password: &str) -> Result<(), FtpFailure> {
        self.stream.login(username, password)?;
        self.stream.transfer_type(FileType::Binary)?;
        Ok(())
    }

    fn change_dir(&mut self, directory: &str) -> Result<(), FtpFailure> {
        Ok(self.stream.cwd(directory)?)
    }

    fn retrieve(&mut self, file: &str, sink: &mut dyn Write) -> Result<u64, FtpFailure> {
        let mut data = self.stream.retr_as_stream(file)?;
        data.get_ref().set_read_timeout(Some(self.timeout))?;
        let copied = io::copy(&mut data, sink)?;
        self.stream.finalize_retr_stream(data)?;
        Ok(copied)
    }

    fn store(&mut self, file: &str, source: &mut dyn Read) -> Result<u64, FtpFailure> {
        let mut data = self.stream.put_with_stream(file)?;
        data.get_ref().set_write_timeout(Some(self.timeout))?;
        let copied = io::copy(source, &mut data)?;
        self.stream.finalize_put_stream(data)?;
        Ok(copied)
    }

    fn quit(mut self: Box<Self>) {
        if let Err(e) = self.stream.quit() {
            debug!("FTP quit failed: {}", e);
        }
    }
}

/// Result of handling one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileResult {
    pub file: String,
    pub error: Option<String>,
}

impl FileResult {
    fn ok(file: &str) -> Self {
        Self { file: file.to_string(), error: None }
    }

    fn failed(file: &str, error: impl Into<String>) -> Self {
        Self { file: file.to_string(), error: Some(error.into()) }
    }
}

/// Where the check ended up, before it is turned into an outcome
#[derive(Debug)]
pub enum FtpRun {
    ConnectFailed(FtpFailure),
    LoginFailed(FtpFailure),
    DirectoryFailed(FtpFailure),
    Transferred(Vec<FileResult>),
    /// The whole session overran its deadline
    TimedOut(Duration),
}

/// Lowercase hex MD5 of everything read from the server
fn download_checksum(session: &mut dyn FtpSession, file: &str) -> Result<String, FtpFailure> {
    let mut hasher = Md5::new();
    session.retrieve(file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn get_files(session: &mut dyn FtpSession, info: &FtpInfo) -> Vec<FileResult> {
    info.files
        .iter()
        .enumerate()
        .map(|(index, file)| {
            let Some(expected) = info.md5_sums.get(index) else {
                return FileResult::failed(file, "no checksum configured");
            };
            match download_checksum(session, file) {
                Ok(actual) if actual.eq_ignore_ascii_case(expected.trim()) => FileResult::ok(file),
                Ok(actual) => FileResult::failed(
                    file,
                    format!("checksum mismatch: expected {expected}, got {actual}"),
                ),
                Err(e) => FileResult::failed(file, e.to_string()),
            }
        })
        .collect()
}

fn put_files(session: &mut dyn FtpSession, info: &FtpInfo, staging_dir: &Path) -> Vec<FileResult> {
    info.files
        .iter()
        .map(|file| {
            let local = staging_dir.join(file);
            let mut source = match File::open(&local) {
                Ok(source) => source,
                Err(e) => {
                    return FileResult::failed(file, format!("{}: {e}", local.display()));
                }
            };
            match session.store(file, &mut source) {
                Ok(_) => FileResult::ok(file),
                Err(e) => FileResult::failed(file, e.to_string()),
            }
        })
        .collect()
}

fn transfer(session: &mut dyn FtpSession, info: &FtpInfo, staging_dir: &Path) -> FtpRun {
    if let Err(e) = session.login(&info.ftp_username, &info.ftp_password) {
        return FtpRun::LoginFailed(e);
    }
    if !info.directory.is_empty() {
        if let Err(e) = session.change_dir(&info.directory) {
            return FtpRun::DirectoryFailed(e);
        }
    }
    FtpRun::Transferred(match info.ftp_action {
        FtpAction::Get => get_files(session, info),
        FtpAction::Put => put_files(session, info, staging_dir),
    })
}

/// Run all stages against `connector`, quitting the session on every path
pub fn run_session(
    connector: &dyn FtpConnector,
    host: &str,
    port: u16,
    timeout: Duration,
    info: &FtpInfo,
    staging_dir: &Path,
) -> FtpRun {
    let mut session = match connector.connect(host, port, timeout) {
        Ok(session) => session,
        Err(e) => return FtpRun::ConnectFailed(e),
    };
    let run = transfer(session.as_mut(), info, staging_dir);
    session.quit();
    run
}

/// Turn a finished run into exactly one terminal outcome
pub fn judge(outcome: &mut Outcome, host: &str, info: &FtpInfo, run: FtpRun) {
    let base = || {
        json!({
            "target": host,
            "ftp_username": info.ftp_username,
            "ftp_action": info.ftp_action.to_string(),
            "directory": info.directory,
        })
    };
    let with_raw = |raw: String| {
        let mut details = base();
        details["raw"] = Value::String(raw);
        details
    };

    match run {
        FtpRun::TimedOut(deadline) => outcome.fail(
            Report::feedback(format!("FTP check on {host} timed out"))
                .with_staff_detail(with_raw(format!("no result within {deadline:?}"))),
        ),
        FtpRun::ConnectFailed(e) => outcome.fail(
            Report::feedback(format!("Failed to connect to FTP host {host}"))
                .with_staff_detail(with_raw(e.to_string())),
        ),
        FtpRun::LoginFailed(e) => outcome.warn(
            Report::feedback(format!("Could not log in to FTP host {host} as {}", info.ftp_username))
                .with_staff_detail(with_raw(e.to_string())),
        ),
        FtpRun::DirectoryFailed(e) => outcome.warn(
            Report::feedback(format!("Could not open directory {} on {host}", info.directory))
                .with_staff_detail(with_raw(e.to_string())),
        ),
        FtpRun::Transferred(results) => {
            let (ok, failed): (Vec<_>, Vec<_>) = results.iter().partition(|r| r.error.is_none());
            let succeeded: Vec<&str> = ok.iter().map(|r| r.file.as_str()).collect();
            let failed_files: Vec<&str> = failed.iter().map(|r| r.file.as_str()).collect();
            let errors: Map<String, Value> = failed
                .iter()
                .map(|r| (r.file.clone(), Value::String(r.error.clone().unwrap_or_default())))
                .collect();

            let mut details = base();
            details["succeeded_files"] = json!(succeeded);
            details["failed_files"] = json!(failed_files);

            if failed.is_empty() {
                outcome.success(
                    Report::feedback(format!(
                        "FTP {} succeeded for all files on {host}",
                        info.ftp_action
                    ))
                    .with_staff_detail(details),
                );
            } else {
                let feedback = match info.ftp_action {
                    FtpAction::Get => format!(
                        "FTP GET failed for: {}. Succeeded for: {}",
                        failed_files.join(", "),
                        if succeeded.is_empty() { "none".to_string() } else { succeeded.join(", ") }
                    ),
                    FtpAction::Put => format!("FTP PUT failed for: {}", failed_files.join(", ")),
                };
                outcome.warn(
                    Report::feedback(feedback)
                        .with_detail(json!({ "failed_files": failed_files }))
                        .with_staff_detail(Value::Array(vec![details, Value::Object(errors)])),
                );
            }
        }
    }
}

/// FTP prober
pub struct FtpProber {
    connector: Arc<dyn FtpConnector>,
    staging_dir: PathBuf,
    timeout: Duration,
}

impl FtpProber {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self::with_connector(Arc::new(SuppaFtpConnector), staging_dir)
    }

    pub fn with_connector(connector: Arc<dyn FtpConnector>, staging_dir: impl Into<PathBuf>) -> Self {
        Self { connector, staging_dir: staging_dir.into(), timeout: FTP_CONNECT_TIMEOUT }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Upper bound for a whole session: connect, login and directory, plus
    /// one transfer per file
    fn deadline(&self, info: &FtpInfo) -> Duration {
        let stages = u32::try_from(info.files.len()).unwrap_or(u32::MAX).saturating_add(3);
        self.timeout.saturating_mul(stages)
    }
}

#[async_trait::async_trait]
impl Prober for FtpProber {
    async fn probe(&self, check: &mut ServiceCheck) {
        let Some(info) = check.ftp_info().cloned() else {
            warn!("FTP check for {} has no FTP info", check.target_host);
            check.outcome.error(
                Report::feedback(format!("No FTP info given for target: {}", check.target_host))
                    .with_staff_feedback("missing FTP configuration"),
            );
            return;
        };

        let host = check.target_host.clone();
        let port = check.port().unwrap_or(21);
        debug!("FTP {} check starting for {}:{}", info.ftp_action, host, port);

        let connector = self.connector.clone();
        let staging_dir = self.staging_dir.clone();
        let timeout = self.timeout;
        let deadline = self.deadline(&info);
        let blocking_info = info.clone();
        let session = tokio::task::spawn_blocking(move || {
            run_session(connector.as_ref(), &host, port, timeout, &blocking_info, &staging_dir)
        });

        match tokio::time::timeout(deadline, session).await {
            Ok(Ok(run)) => judge(&mut check.outcome, &check.target_host, &info, run),
            Ok(Err(e)) => record_join_error(check, e),
            Err(_) => {
                warn!("FTP session with {} overran {:?}", check.target_host, deadline);
                judge(&mut check.outcome, &check.target_host, &info, FtpRun::TimedOut(deadline));
            }
        }
        debug!("FTP check for {} finished: {:?}", check.target_host, check.outcome.code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{CheckTarget, ProtocolInfo, ServiceKind};
    use crate::outcome::ResultCode;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeServer {
        files: HashMap<String, Vec<u8>>,
        refuse_connect: bool,
        reject_login: bool,
        slow_transfer: Option<Duration>,
        connects: AtomicUsize,
        quits: Arc<AtomicUsize>,
        uploads: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    }

    struct FakeSession {
        files: HashMap<String, Vec<u8>>,
        reject_login: bool,
        slow_transfer: Option<Duration>,
        quits: Arc<AtomicUsize>,
        uploads: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    }

    impl FtpConnector for FakeServer {
        fn connect(
            &self,
            _host: &str,
            _port: u16,
            _timeout: Duration,
        ) -> Result<Box<dyn FtpSession>, FtpFailure> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse_connect {
                return Err(FtpFailure::Io(io::Error::from(io::ErrorKind::ConnectionRefused)));
            }
            Ok(Box::new(FakeSession {
                files: self.files.clone(),
                reject_login: self.reject_login,
                slow_transfer: self.slow_transfer,
                quits: self.quits.clone(),
                uploads: self.uploads.clone(),
            }))
        }
    }

    impl FtpSession for FakeSession {
        fn login(&mut self, _username: &str, _password: &str) -> Result<(), FtpFailure> {
            if self.reject_login {
                return Err(FtpFailure::Protocol("530 Login incorrect".to_string()));
            }
            Ok(())
        }

        fn change_dir(&mut self, _directory: &str) -> Result<(), FtpFailure> {
            Ok(())
        }

        fn retrieve(&mut self, file: &str, sink: &mut dyn Write) -> Result<u64, FtpFailure> {
            if let Some(delay) = self.slow_transfer {
                std::thread::sleep(delay);
            }
            let bytes = self
                .files
                .get(file)
                .ok_or_else(|| FtpFailure::Protocol(format!("550 {file}: No such file")))?;
            sink.write_all(bytes)?;
            Ok(bytes.len() as u64)
        }

        fn store(&mut self, file: &str, source: &mut dyn Read) -> Result<u64, FtpFailure> {
            let mut bytes = Vec::new();
            source.read_to_end(&mut bytes)?;
            let len = bytes.len() as u64;
            self.uploads.lock().unwrap().insert(file.to_string(), bytes);
            Ok(len)
        }

        fn quit(self: Box<Self>) {
            self.quits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn md5_hex(bytes: &[u8]) -> String {
        hex::encode(Md5::digest(bytes))
    }

    fn ftp_check(info: Option<FtpInfo>) -> ServiceCheck {
        ServiceCheck::new(
            CheckTarget {
                target_id: 4,
                target_host: "10.0.4.4".to_string(),
                target_port: Some("21".to_string()),
                team_id: "4".to_string(),
                team_name: "Team Four".to_string(),
            },
            ServiceKind::Ftp,
            info.map(ProtocolInfo::Ftp),
        )
    }

    fn get_info(files: &[&str], sums: &[String]) -> FtpInfo {
        FtpInfo {
            ftp_username: "scorer".to_string(),
            ftp_password: "secret".to_string(),
            directory: "pub".to_string(),
            ftp_action: FtpAction::Get,
            files: files.iter().map(|f| f.to_string()).collect(),
            md5_sums: sums.to_vec(),
        }
    }

    fn server_with(files: &[(&str, &[u8])]) -> Arc<FakeServer> {
        Arc::new(FakeServer {
            files: files.iter().map(|(n, b)| (n.to_string(), b.to_vec())).collect(),
            ..FakeServer::default()
        })
    }

    async fn probe(server: Arc<FakeServer>, staging: &Path, info: Option<FtpInfo>) -> ServiceCheck {
        let prober = FtpProber::with_connector(server, staging);
        let mut check = ftp_check(info);
        prober.probe(&mut check).await;
        check
    }

    #[tokio::test]
    async fn test_get_all_files_match() {
        let server = server_with(&[("a.txt", b"alpha"), ("b.txt", b"bravo")]);
        let info = get_info(&["a.txt", "b.txt"], &[md5_hex(b"alpha"), md5_hex(b"bravo")]);

        let check = probe(server.clone(), Path::new("."), Some(info)).await;

        assert_eq!(check.outcome.code(), Ok(ResultCode::Pass));
        assert_eq!(server.quits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_checksum_mismatch_is_reported_per_file() {
        let server = server_with(&[("a.txt", b"alpha"), ("b.txt", b"tampered")]);
        let info = get_info(&["a.txt", "b.txt"], &[md5_hex(b"alpha"), md5_hex(b"bravo")]);

        let check = probe(server.clone(), Path::new("."), Some(info)).await;

        assert_eq!(check.outcome.code(), Ok(ResultCode::Warn));
        let staff = check.outcome.staff().details();
        assert_eq!(staff[0]["failed_files"], json!(["b.txt"]));
        assert_eq!(staff[0]["succeeded_files"], json!(["a.txt"]));
        assert!(staff[1]["b.txt"].as_str().unwrap().contains("checksum mismatch"));
        assert!(check.outcome.participant().summary().contains("b.txt"));
        assert_eq!(server.quits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_missing_file_does_not_abort_others() {
        let server = server_with(&[("b.txt", b"bravo")]);
        let info = get_info(&["gone.txt", "b.txt"], &[md5_hex(b"x"), md5_hex(b"bravo")]);

        let check = probe(server, Path::new("."), Some(info)).await;

        assert_eq!(check.outcome.code(), Ok(ResultCode::Warn));
        let staff = check.outcome.staff().details();
        assert_eq!(staff[0]["failed_files"], json!(["gone.txt"]));
        assert!(staff[1]["gone.txt"].as_str().unwrap().contains("No such file"));
    }

    #[tokio::test]
    async fn test_put_uploads_staged_fixtures() {
        let staging = tempfile::tempdir().unwrap();
        std::fs::write(staging.path().join("upload.txt"), b"fixture").unwrap();
        let server = server_with(&[]);
        let info = FtpInfo {
            ftp_action: FtpAction::Put,
            directory: String::new(),
            ..get_info(&["upload.txt", "absent.txt"], &[])
        };

        let check = probe(server.clone(), staging.path(), Some(info)).await;

        assert_eq!(check.outcome.code(), Ok(ResultCode::Warn));
        assert_eq!(check.outcome.staff().details()[0]["failed_files"], json!(["absent.txt"]));
        assert_eq!(server.uploads.lock().unwrap().get("upload.txt").unwrap(), b"fixture");
        assert_eq!(server.quits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_fail() {
        let server = Arc::new(FakeServer { refuse_connect: true, ..FakeServer::default() });
        let check = probe(server.clone(), Path::new("."), Some(get_info(&[], &[]))).await;

        assert_eq!(check.outcome.code(), Ok(ResultCode::Fail));
        assert_eq!(server.quits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_login_failure_is_warn_and_quits() {
        let server = Arc::new(FakeServer { reject_login: true, ..FakeServer::default() });
        let check = probe(server.clone(), Path::new("."), Some(get_info(&["a"], &[]))).await;

        assert_eq!(check.outcome.code(), Ok(ResultCode::Warn));
        assert_eq!(server.quits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stalled_transfer_is_cut_off_as_fail() {
        let server = Arc::new(FakeServer {
            files: [("a.txt".to_string(), b"alpha".to_vec())].into_iter().collect(),
            slow_transfer: Some(Duration::from_millis(1500)),
            ..FakeServer::default()
        });
        let prober =
            FtpProber::with_connector(server, Path::new(".")).timeout(Duration::from_millis(50));
        let mut check = ftp_check(Some(get_info(&["a.txt"], &[md5_hex(b"alpha")])));

        let started = std::time::Instant::now();
        prober.probe(&mut check).await;

        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(check.outcome.code(), Ok(ResultCode::Fail));
        assert!(check.outcome.participant().summary().contains("timed out"));
    }

    #[test]
    fn test_deadline_grows_with_file_count() {
        let prober = FtpProber::with_connector(server_with(&[]), ".").timeout(Duration::from_secs(5));
        assert_eq!(prober.deadline(&get_info(&[], &[])), Duration::from_secs(15));
        assert_eq!(prober.deadline(&get_info(&["a", "b"], &[])), Duration::from_secs(25));
    }

    #[tokio::test]
    async fn test_missing_info_never_connects() {
        let server = server_with(&[]);
        let check = probe(server.clone(), Path::new("."), None).await;

        assert_eq!(check.outcome.code(), Ok(ResultCode::Error));
        assert_eq!(server.connects.load(Ordering::SeqCst), 0);
    }
}
