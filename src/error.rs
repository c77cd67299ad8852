use std::time::Duration;
use thiserror::Error;

/// Failure of a single browser capture, tagged by the phase it happened in.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GenerationError {
    #[error("Browser launch failed: {0}")]
    LaunchFailure(String),

    #[error("Navigation timed out after {0:?}")]
    NavigationTimeout(Duration),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Page load failed with HTTP status {status}")]
    PageLoad { status: u16 },

    #[error("Page closed before capture: {0}")]
    PageClosed(String),

    #[error("Screenshot capture failed: {0}")]
    CaptureFailure(String),
}

impl GenerationError {
    pub fn phase(&self) -> &'static str {
        match self {
            GenerationError::LaunchFailure(_) => "launch",
            GenerationError::NavigationTimeout(_) | GenerationError::NavigationFailed(_) => {
                "navigation"
            }
            GenerationError::PageLoad { .. } => "page-load",
            GenerationError::PageClosed(_) | GenerationError::CaptureFailure(_) => "capture",
        }
    }

    /// Stable name of the failure, reported to HTTP callers.
    pub fn kind(&self) -> &'static str {
        match self {
            GenerationError::LaunchFailure(_) => "LaunchFailure",
            GenerationError::NavigationTimeout(_) => "NavigationTimeout",
            GenerationError::NavigationFailed(_) => "NavigationFailed",
            GenerationError::PageLoad { .. } => "PageLoadError",
            GenerationError::PageClosed(_) => "PageClosedError",
            GenerationError::CaptureFailure(_) => "CaptureFailure",
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            GenerationError::PageLoad { status } => Some(*status),
            _ => None,
        }
    }
}

/// Errors reported by an [`ArtifactStore`](crate::ArtifactStore) backend.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("Store rejected credentials (HTTP {status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("Store misconfigured: {0}")]
    Misconfigured(String),

    #[error("Store request failed: {0}")]
    Transport(String),

    #[error("Store returned HTTP {status}: {message}")]
    Rejected { status: u16, message: String },
}

impl StoreError {
    /// Credential and setup failures abort a request instead of being treated as a miss.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            StoreError::Unauthorized { .. } | StoreError::Misconfigured(_)
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CacheError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Screenshot generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("Screenshot store write failed: {0}")]
    StoreWrite(StoreError),
}

impl CacheError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::Generation(_) | CacheError::StoreWrite(_))
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CacheError::InvalidInput(_) => ErrorSeverity::Low,
            CacheError::Generation(GenerationError::LaunchFailure(_)) => ErrorSeverity::High,
            CacheError::Generation(_) | CacheError::StoreWrite(_) => ErrorSeverity::Medium,
            CacheError::Configuration(_) => ErrorSeverity::Critical,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            CacheError::InvalidInput(_) => 400,
            _ => 500,
        }
    }

    /// Classify a failed write: credential problems are deployment errors, the rest are transient.
    pub fn from_store_write(err: StoreError) -> Self {
        if err.is_auth_failure() {
            CacheError::Configuration(err.to_string())
        } else {
            CacheError::StoreWrite(err)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<std::io::Error> for GenerationError {
    fn from(err: std::io::Error) -> Self {
        GenerationError::LaunchFailure(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Configuration(err.to_string())
    }
}
