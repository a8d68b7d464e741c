//! Plain HTTP prober.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use super::Prober;
use crate::check::{HttpInfo, ServiceCheck};
use crate::outcome::Report;

pub const HTTP_TIMEOUT: Duration = Duration::from_secs(4);

/// Request target for an HTTP check. The scheme is always `http`.
pub fn build_url(info: &HttpInfo) -> String {
    let path = info.path.trim_start_matches('/');
    if path.is_empty() {
        format!("http://{}", info.url)
    } else {
        format!("http://{}/{}", info.url, path)
    }
}

/// HTTP prober
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new() -> reqwest::Result<Self> {
        Self::with_timeout(HTTP_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("scorecheck/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl Prober for HttpProber {
    async fn probe(&self, check: &mut ServiceCheck) {
        let host = check.target_host.clone();
        let Some(info) = check.http_info().cloned() else {
            warn!("HTTP check for {} has no HTTP info", host);
            check.outcome.error(
                Report::feedback(format!("No HTTP info given for target: {host}"))
                    .with_staff_feedback("missing HTTP configuration"),
            );
            return;
        };

        let full_url = build_url(&info);
        debug!("HTTP check starting for {}", full_url);
        let mut details = json!({
            "target": host,
            "url": info.url,
            "path": info.path,
            "full_url": full_url,
            "timeout": HTTP_TIMEOUT.as_secs(),
        });

        match self.client.get(&full_url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                drop(response);
                details["status"] = json!(status);

                if status == 200 {
                    check.outcome.success(
                        Report::feedback(format!(
                            "HTTP accessible on host {host} for page {}",
                            info.path
                        ))
                        .with_staff_detail(details),
                    );
                } else {
                    check.outcome.fail(
                        Report::feedback(format!("Host {host} returned status {status}"))
                            .with_staff_detail(details),
                    );
                }
            }
            Err(e) if e.is_timeout() => {
                details["raw"] = json!(e.to_string());
                check.outcome.fail(Report::feedback("Request timed out").with_staff_detail(details));
            }
            Err(e) if e.is_connect() => {
                details["raw"] = json!(e.to_string());
                check.outcome.fail(
                    Report::feedback("Failed to connect to server, is the port open?")
                        .with_staff_detail(details),
                );
            }
            Err(e) => {
                details["raw"] = json!(e.to_string());
                check.outcome.error(
                    Report::feedback("An unknown error occurred during the HTTP check")
                        .with_staff_detail(details),
                );
            }
        }
        debug!("HTTP check for {} finished: {:?}", host, check.outcome.code());
    }
}
