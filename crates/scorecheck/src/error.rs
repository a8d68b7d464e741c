use thiserror::Error;

use crate::check::ServiceKind;

/// Configuration defects detected while building or dispatching a check.
///
/// These are never turned into a scored outcome: a roster mistake must not
/// look like a target that is down.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckError {
    #[error("unknown service kind `{0}`")]
    UnknownService(String),
    #[error("{service} check against {target} has no {service} configuration")]
    MissingProtocolInfo { service: ServiceKind, target: String },
    #[error("{service} check carries {found} configuration")]
    MismatchedProtocolInfo { service: ServiceKind, found: ServiceKind },
}
