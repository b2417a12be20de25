use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = CloudError> = std::result::Result<T, E>;

/// Uniform error returned by every orchestrator operation.
#[derive(Debug, Error)]
pub enum CloudError {
    /// Flavour, image, instance or firewall rule absent.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("no node can host {cpus} cpu(s) and {ram_bytes} bytes of memory")]
    NoCapacity { cpus: i32, ram_bytes: u64 },

    /// Permanent: only an operator reset of the counter clears it.
    #[error("start of vm {id} failed after {max} retries")]
    StartRetryExceeded { id: String, max: i32 },

    #[error("hypervisor unreachable: {0}")]
    Transport(String),

    #[error("hypervisor returned status {status}: {message}")]
    RemoteStatus { status: u16, message: String },

    #[error("task {task_id} did not complete within {waited:?}")]
    TaskTimeout { task_id: String, waited: Duration },

    #[error("operation cancelled")]
    Cancelled,

    #[error("record store error: {0}")]
    Store(String),

    #[error("invalid data: {0}")]
    Invalid(String),
}

impl CloudError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        CloudError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// HTTP-equivalent status for the upward contract.
    pub fn status_code(&self) -> u16 {
        match self {
            CloudError::NotFound { .. } => 404,
            CloudError::RemoteStatus { status, .. } => *status,
            CloudError::Invalid(_) => 400,
            _ => 500,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound { .. })
    }
}

impl From<sqlx::Error> for CloudError {
    fn from(e: sqlx::Error) -> Self {
        CloudError::Store(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(CloudError::not_found("instance", "101").status_code(), 404);
        assert_eq!(
            CloudError::RemoteStatus {
                status: 403,
                message: "forbidden".into()
            }
            .status_code(),
            403
        );
        assert_eq!(
            CloudError::NoCapacity {
                cpus: 2,
                ram_bytes: 1
            }
            .status_code(),
            500
        );
        assert_eq!(
            CloudError::StartRetryExceeded {
                id: "101".into(),
                max: 10
            }
            .status_code(),
            500
        );
    }

    #[test]
    fn not_found_message() {
        let e = CloudError::not_found("flavour", "xl");
        assert_eq!(e.to_string(), "flavour xl not found");
        assert!(e.is_not_found());
    }
}
