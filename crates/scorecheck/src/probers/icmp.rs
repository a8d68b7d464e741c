//! ICMP echo prober.

use std::net::IpAddr;
use std::time::Duration;

use serde_json::json;
use surge_ping::{Client, Config, ICMP, PingIdentifier, PingSequence, SurgeError};
use thiserror::Error;
use tracing::debug;

use super::Prober;
use crate::check::ServiceCheck;
use crate::outcome::Report;

pub const ICMP_TIMEOUT: Duration = Duration::from_secs(4);

const PAYLOAD: [u8; 56] = [0; 56];

#[derive(Debug, Error)]
pub enum PingError {
    #[error("no echo reply within {0:?}")]
    Timeout(Duration),
    #[error("could not resolve host: {0}")]
    HostUnknown(String),
    #[error("destination host unreachable: {0}")]
    DestinationHostUnreachable(String),
    #[error("destination unreachable: {0}")]
    DestinationUnreachable(String),
    #[error("ping error: {0}")]
    Other(String),
}

/// Sends a single echo request and waits for the reply
#[async_trait::async_trait]
pub trait Pinger: Send + Sync {
    /// Return the round trip time of one echo request
    async fn ping(&self, host: &str, timeout: Duration) -> Result<Duration, PingError>;
}

/// Raw socket pinger backed by `surge-ping`
#[derive(Debug, Default)]
pub struct SurgePinger;

impl SurgePinger {
    async fn resolve(host: &str) -> Result<IpAddr, PingError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| PingError::HostUnknown(format!("{host}: {e}")))?
            .map(|addr| addr.ip())
            .next()
            .ok_or_else(|| PingError::HostUnknown(host.to_string()))
    }
}

#[async_trait::async_trait]
impl Pinger for SurgePinger {
    async fn ping(&self, host: &str, timeout: Duration) -> Result<Duration, PingError> {
        let ip = Self::resolve(host).await?;
        let config = match ip {
            IpAddr::V4(_) => Config::default(),
            IpAddr::V6(_) => Config::builder().kind(ICMP::V6).build(),
        };
        let client = Client::new(&config).map_err(|e| PingError::Other(e.to_string()))?;
        let mut pinger = client.pinger(ip, PingIdentifier(rand::random())).await;
        pinger.timeout(timeout);

        match pinger.ping(PingSequence(0), &PAYLOAD).await {
            Ok((_packet, rtt)) => Ok(rtt),
            // surge-ping only matches echo replies, so an ICMP unreachable reply also ends here
            Err(SurgeError::Timeout { .. }) => Err(PingError::Timeout(timeout)),
            Err(SurgeError::IOError(e)) => Err(match e.kind() {
                std::io::ErrorKind::HostUnreachable => {
                    PingError::DestinationHostUnreachable(e.to_string())
                }
                std::io::ErrorKind::NetworkUnreachable => {
                    PingError::DestinationUnreachable(e.to_string())
                }
                _ => PingError::Other(e.to_string()),
            }),
            Err(e) => Err(PingError::Other(e.to_string())),
        }
    }
}

/// ICMP prober
pub struct IcmpProber {
    pinger: Box<dyn Pinger>,
    timeout: Duration,
}

impl IcmpProber {
    pub fn new() -> Self {
        Self::with_pinger(Box::new(SurgePinger))
    }

    pub fn with_pinger(pinger: Box<dyn Pinger>) -> Self {
        Self { pinger, timeout: ICMP_TIMEOUT }
    }
}

impl Default for IcmpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Prober for IcmpProber {
    async fn probe(&self, check: &mut ServiceCheck) {
        let host = check.target_host.clone();
        debug!("ICMP check starting for {}", host);

        let result = self.pinger.ping(&host, self.timeout).await;
        let raw = |e: &PingError| json!({ "target": host, "raw": e.to_string() });

        match result {
            Ok(rtt) => check.outcome.success(
                Report::feedback(format!("ping successful to host {host}"))
                    .with_staff_detail(json!({ "target": host, "rtt_ms": rtt.as_millis() as u64 })),
            ),
            Err(e @ PingError::Timeout(_)) => check.outcome.fail(
                Report::feedback(format!(
                    "Request timed out after {} seconds for host {host}",
                    self.timeout.as_secs()
                ))
                .with_staff_detail(raw(&e)),
            ),
            Err(e @ PingError::HostUnknown(_)) => check.outcome.error(
                Report::feedback(format!("Could not resolve host: {host}"))
                    .with_staff_detail(raw(&e)),
            ),
            Err(e @ PingError::DestinationHostUnreachable(_)) => check.outcome.fail(
                Report::feedback(format!("Destination host unreachable for target: {host}"))
                    .with_staff_detail(raw(&e)),
            ),
            Err(e @ PingError::DestinationUnreachable(_)) => check.outcome.error(
                Report::feedback("Destination unreachable").with_staff_detail(raw(&e)),
            ),
            Err(e @ PingError::Other(_)) => check.outcome.error(
                Report::feedback("An unknown ping error occurred").with_staff_detail(raw(&e)),
            ),
        }

        debug!("ICMP check for {} finished: {:?}", host, check.outcome.code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{CheckTarget, ServiceKind};
    use crate::outcome::ResultCode;

    struct FixedPinger(fn() -> Result<Duration, PingError>);

    #[async_trait::async_trait]
    impl Pinger for FixedPinger {
        async fn ping(&self, _host: &str, _timeout: Duration) -> Result<Duration, PingError> {
            (self.0)()
        }
    }

    fn icmp_check() -> ServiceCheck {
        ServiceCheck::new(
            CheckTarget {
                target_id: 1,
                target_host: "10.0.1.1".to_string(),
                target_port: None,
                team_id: "1".to_string(),
                team_name: "Team One".to_string(),
            },
            ServiceKind::Icmp,
            None,
        )
    }

    async fn run(reply: fn() -> Result<Duration, PingError>) -> ServiceCheck {
        let prober = IcmpProber::with_pinger(Box::new(FixedPinger(reply)));
        let mut check = icmp_check();
        prober.probe(&mut check).await;
        check
    }

    #[tokio::test]
    async fn test_reply_is_pass() {
        let check = run(|| Ok(Duration::from_millis(3))).await;
        assert_eq!(check.outcome.code(), Ok(ResultCode::Pass));
        assert!(check.outcome.participant().summary().contains("10.0.1.1"));
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let cases: [(fn() -> Result<Duration, PingError>, ResultCode); 5] = [
            (|| Err(PingError::Timeout(ICMP_TIMEOUT)), ResultCode::Fail),
            (|| Err(PingError::HostUnknown("nope".into())), ResultCode::Error),
            (|| Err(PingError::DestinationHostUnreachable("x".into())), ResultCode::Fail),
            (|| Err(PingError::DestinationUnreachable("x".into())), ResultCode::Error),
            (|| Err(PingError::Other("x".into())), ResultCode::Error),
        ];

        for (reply, expected) in cases {
            let check = run(reply).await;
            assert_eq!(check.outcome.code(), Ok(expected));
            assert!(!check.outcome.staff().details().is_empty());
        }
    }

    #[tokio::test]
    async fn test_timeout_feedback_mentions_timing_out() {
        let check = run(|| Err(PingError::Timeout(ICMP_TIMEOUT))).await;
        assert!(check.outcome.participant().summary().contains("timed out"));
    }
}
