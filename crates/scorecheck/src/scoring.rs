//! Points awarded per service and result code.

use serde::{Deserialize, Serialize};

use crate::check::{ServiceCheck, ServiceKind};
use crate::outcome::{OutcomeError, ResultCode};

/// Points for a passing and a partially working service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceScore {
    pub pass: u32,
    pub warn: u32,
}

impl ServiceScore {
    pub const fn new(pass: u32, warn: u32) -> Self {
        Self { pass, warn }
    }
}

/// Per-service scoring table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreTable {
    icmp: ServiceScore,
    ssh: ServiceScore,
    ftp: ServiceScore,
    http: ServiceScore,
    sql: ServiceScore,
}

impl Default for ScoreTable {
    fn default() -> Self {
        Self {
            icmp: ServiceScore::new(5, 0),
            ssh: ServiceScore::new(25, 10),
            ftp: ServiceScore::new(40, 10),
            http: ServiceScore::new(25, 10),
            sql: ServiceScore::new(0, 0),
        }
    }
}

impl ScoreTable {
    pub fn get(&self, service: ServiceKind) -> ServiceScore {
        match service {
            ServiceKind::Icmp => self.icmp,
            ServiceKind::Ssh => self.ssh,
            ServiceKind::Ftp => self.ftp,
            ServiceKind::Http => self.http,
            ServiceKind::Sql => self.sql,
        }
    }

    pub fn set(&mut self, service: ServiceKind, score: ServiceScore) {
        let slot = match service {
            ServiceKind::Icmp => &mut self.icmp,
            ServiceKind::Ssh => &mut self.ssh,
            ServiceKind::Ftp => &mut self.ftp,
            ServiceKind::Http => &mut self.http,
            ServiceKind::Sql => &mut self.sql,
        };
        *slot = score;
    }

    /// Points for `code` on `service`. Only pass and warn earn anything.
    pub fn points(&self, service: ServiceKind, code: ResultCode) -> u32 {
        let score = self.get(service);
        match code {
            ResultCode::Pass => score.pass,
            ResultCode::Warn => score.warn,
            ResultCode::Fail | ResultCode::Timeout | ResultCode::Unknown | ResultCode::Error => 0,
        }
    }

    /// Score a finished check in place
    pub fn score(&self, check: &mut ServiceCheck) -> Result<u32, OutcomeError> {
        let points = self.points(check.service, check.outcome.code()?);
        check.points = points;
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::CheckTarget;
    use crate::outcome::Report;

    #[test]
    fn test_default_table() {
        let table = ScoreTable::default();
        let expected = [
            (ServiceKind::Icmp, 5, 0),
            (ServiceKind::Ssh, 25, 10),
            (ServiceKind::Ftp, 40, 10),
            (ServiceKind::Http, 25, 10),
        ];
        for (service, pass, warn) in expected {
            assert_eq!(table.points(service, ResultCode::Pass), pass, "{service} pass");
            assert_eq!(table.points(service, ResultCode::Warn), warn, "{service} warn");
        }
    }

    #[test]
    fn test_non_passing_codes_score_zero() {
        let table = ScoreTable::default();
        for service in ServiceKind::ALL {
            for code in
                [ResultCode::Fail, ResultCode::Timeout, ResultCode::Unknown, ResultCode::Error]
            {
                assert_eq!(table.points(service, code), 0);
            }
        }
    }

    #[test]
    fn test_override() {
        let mut table = ScoreTable::default();
        table.set(ServiceKind::Sql, ServiceScore::new(30, 5));
        assert_eq!(table.points(ServiceKind::Sql, ResultCode::Pass), 30);
        assert_eq!(table.points(ServiceKind::Sql, ResultCode::Warn), 5);
    }

    #[test]
    fn test_score_requires_outcome() {
        let table = ScoreTable::default();
        let mut check = ServiceCheck::new(
            CheckTarget {
                target_id: 1,
                target_host: "10.0.0.1".into(),
                target_port: None,
                team_id: "1".into(),
                team_name: "One".into(),
            },
            ServiceKind::Ssh,
            None,
        );
        assert_eq!(table.score(&mut check), Err(OutcomeError::Unset));

        check.outcome.warn(Report::new());
        assert_eq!(table.score(&mut check), Ok(10));
        assert_eq!(check.points, 10);
    }
}
