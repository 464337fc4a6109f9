//! Central error catalogue.
//!
//! Every failure that can cross the crate boundary is one of the types
//! below. `kind()` gives the machine-readable taxonomy used by the HTTP
//! surface, `explain()` the human hint shown to callers. Underlying
//! rusqlite/reqwest sources stay inside the crate.

use thiserror::Error;

/// Failure while reading or writing the backing store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database unavailable: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("database query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored record was not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("stored record was unreadable: {0}")]
    Invalid(String),
}

/// What went wrong while talking to one upstream backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendFault {
    /// Connection-level failure before any response arrived.
    Transport,
    /// Upstream answered with a non-2xx status.
    Status(u16),
    /// Upstream answered 2xx but the payload did not carry a reply.
    Payload,
    /// The per-call deadline expired.
    Timeout,
}

/// Distinguished error every backend adapter reports instead of letting raw
/// transport errors propagate. The dispatcher catches exactly this type per
/// attempt when walking the failover chain.
#[derive(Debug, Clone, Error)]
#[error("{provider}: {detail}")]
pub struct BackendError {
    pub provider: String,
    pub fault: BackendFault,
    pub detail: String,
}

impl BackendError {
    pub fn new(provider: &str, fault: BackendFault, detail: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            fault,
            detail: detail.into(),
        }
    }
}

/// Terminal outcome of a failed dispatch.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("API key not configured for {provider}")]
    MissingCredential { provider: String, setup_url: String },
    #[error("{} backend call failed: {}", .0.provider, .0.detail)]
    Backend(BackendError),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl DispatchError {
    /// Machine-readable taxonomy tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingCredential { .. } => "MISSING_CREDENTIAL",
            Self::Backend(err) if err.fault == BackendFault::Timeout => "TIMEOUT",
            Self::Backend(_) => "BACKEND_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Human hint with enough context to self-remediate.
    pub fn explain(&self) -> String {
        match self {
            Self::MissingCredential { provider, setup_url } => format!(
                "No API key is stored for {provider}. Create one at {setup_url} and save it via the settings endpoint."
            ),
            Self::Backend(err) if err.fault == BackendFault::Timeout => format!(
                "The {} backend did not answer within the configured deadline.",
                err.provider
            ),
            Self::Backend(err) => format!("The {} backend rejected the request.", err.provider),
            Self::Storage(_) => "The dispatch layer could not access its local store.".to_string(),
        }
    }

    /// Key-acquisition URL for the missing-credential case.
    pub fn setup_hint(&self) -> Option<&str> {
        match self {
            Self::MissingCredential { setup_url, .. } => Some(setup_url),
            _ => None,
        }
    }
}

impl From<StorageError> for DispatchError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_distinguishes_timeout_from_other_backend_faults() {
        let timeout = DispatchError::Backend(BackendError::new(
            "ollama",
            BackendFault::Timeout,
            "deadline expired",
        ));
        assert_eq!(timeout.kind(), "TIMEOUT");

        let status = DispatchError::Backend(BackendError::new(
            "openai",
            BackendFault::Status(429),
            "too many requests",
        ));
        assert_eq!(status.kind(), "BACKEND_ERROR");
    }

    #[test]
    fn missing_credential_carries_setup_hint() {
        let err = DispatchError::MissingCredential {
            provider: "openai".into(),
            setup_url: "https://platform.openai.com/".into(),
        };
        assert_eq!(err.kind(), "MISSING_CREDENTIAL");
        assert_eq!(err.setup_hint(), Some("https://platform.openai.com/"));
    }
}
