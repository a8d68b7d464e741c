//! Routes a check to the prober for its service kind.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::check::{ServiceCheck, ServiceKind};
use crate::error::CheckError;
use crate::outcome::Report;
use crate::probers::ftp::FTP_CONNECT_TIMEOUT;
use crate::probers::ssh::SSH_CONNECT_TIMEOUT;
use crate::probers::{
    FtpProber, HostKeyStore, HttpProber, IcmpProber, Prober, SqlProber, SshProber,
};

/// Settings for the production probers
#[derive(Debug, Clone)]
pub struct ProberSettings {
    /// Directory that relative SSH key names resolve against
    pub key_dir: PathBuf,
    /// Local fixtures uploaded by FTP PUT checks
    pub staging_dir: PathBuf,
    pub ssh_timeout: Duration,
    pub ftp_timeout: Duration,
}

impl Default for ProberSettings {
    fn default() -> Self {
        Self {
            key_dir: PathBuf::from("."),
            staging_dir: PathBuf::from("ftp_staging"),
            ssh_timeout: SSH_CONNECT_TIMEOUT,
            ftp_timeout: FTP_CONNECT_TIMEOUT,
        }
    }
}

/// One prober per service kind
#[derive(Clone)]
pub struct Probers {
    pub icmp: Arc<dyn Prober>,
    pub ssh: Arc<dyn Prober>,
    pub ftp: Arc<dyn Prober>,
    pub http: Arc<dyn Prober>,
    pub sql: Arc<dyn Prober>,
}

impl Probers {
    /// The same prober for every service kind
    pub fn uniform(prober: Arc<dyn Prober>) -> Self {
        Self {
            icmp: prober.clone(),
            ssh: prober.clone(),
            ftp: prober.clone(),
            http: prober.clone(),
            sql: prober,
        }
    }
}

pub struct Dispatcher {
    probers: Probers,
}

impl Dispatcher {
    /// Dispatcher wired to the real network probers
    pub fn new(settings: ProberSettings) -> reqwest::Result<Self> {
        let host_keys = Arc::new(HostKeyStore::new());
        Ok(Self::with_probers(Probers {
            icmp: Arc::new(IcmpProber::new()),
            ssh: Arc::new(SshProber::new(host_keys, settings.key_dir).timeout(settings.ssh_timeout)),
            ftp: Arc::new(FtpProber::new(settings.staging_dir).timeout(settings.ftp_timeout)),
            http: Arc::new(HttpProber::new()?),
            sql: Arc::new(SqlProber::new()),
        }))
    }

    pub fn with_probers(probers: Probers) -> Self {
        Self { probers }
    }

    fn prober_for(&self, service: ServiceKind) -> &dyn Prober {
        match service {
            ServiceKind::Icmp => self.probers.icmp.as_ref(),
            ServiceKind::Ssh => self.probers.ssh.as_ref(),
            ServiceKind::Ftp => self.probers.ftp.as_ref(),
            ServiceKind::Http => self.probers.http.as_ref(),
            ServiceKind::Sql => self.probers.sql.as_ref(),
        }
    }

    /// Run the matching prober.
    ///
    /// Configuration defects are returned as errors without probing. A
    /// dispatched check always comes back with a result code.
    pub async fn dispatch(&self, mut check: ServiceCheck) -> Result<ServiceCheck, CheckError> {
        if let Err(e) = check.validate() {
            debug!("Refusing to probe {} (team {}): {}", check.target_host, check.team_name, e);
            return Err(e);
        }

        self.prober_for(check.service).probe(&mut check).await;

        if !check.outcome.is_set() {
            warn!("{} prober left {} without a result", check.service, check.target_host);
            check.outcome.unknown(
                Report::feedback("The check did not produce a result")
                    .with_staff_feedback("prober returned without a terminal outcome"),
            );
        }
        Ok(check)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{CheckTarget, HttpInfo, ProtocolInfo};
    use crate::outcome::ResultCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records which service kinds it was asked to probe
    #[derive(Default)]
    struct Recorder {
        calls: AtomicUsize,
        last: std::sync::Mutex<Option<ServiceKind>>,
    }

    #[async_trait::async_trait]
    impl Prober for Recorder {
        async fn probe(&self, check: &mut ServiceCheck) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(check.service);
            check.outcome.success(Report::new());
        }
    }

    struct Silent;

    #[async_trait::async_trait]
    impl Prober for Silent {
        async fn probe(&self, _check: &mut ServiceCheck) {}
    }

    fn check(service: ServiceKind, protocol: Option<ProtocolInfo>) -> ServiceCheck {
        ServiceCheck::new(
            CheckTarget {
                target_id: 2,
                target_host: "10.0.2.1".into(),
                target_port: None,
                team_id: "2".into(),
                team_name: "Two".into(),
            },
            service,
            protocol,
        )
    }

    #[tokio::test]
    async fn test_routes_by_service_kind() {
        let http = Arc::new(Recorder::default());
        let other = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::with_probers(Probers {
            http: http.clone(),
            ..Probers::uniform(other.clone())
        });

        let info = ProtocolInfo::Http(HttpInfo { url: "10.0.2.1".into(), path: String::new() });
        let done = dispatcher.dispatch(check(ServiceKind::Http, Some(info))).await.unwrap();

        assert_eq!(done.outcome.code(), Ok(ResultCode::Pass));
        assert_eq!(http.calls.load(Ordering::SeqCst), 1);
        assert_eq!(other.calls.load(Ordering::SeqCst), 0);
        assert_eq!(*http.last.lock().unwrap(), Some(ServiceKind::Http));
    }

    #[tokio::test]
    async fn test_missing_config_is_rejected_without_probing() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::with_probers(Probers::uniform(recorder.clone()));

        let result = dispatcher.dispatch(check(ServiceKind::Ftp, None)).await;

        assert!(matches!(result, Err(CheckError::MissingProtocolInfo { .. })));
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unset_outcome_becomes_unknown() {
        let dispatcher = Dispatcher::with_probers(Probers::uniform(Arc::new(Silent)));
        let done = dispatcher.dispatch(check(ServiceKind::Icmp, None)).await.unwrap();

        assert_eq!(done.outcome.code(), Ok(ResultCode::Unknown));
    }
}
