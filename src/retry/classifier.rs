use crate::core::{DriverError, ErrorKind};
use std::collections::HashSet;

/// Decides whether a failed attempt may be run again.
///
/// Which connection-loss classes are safe to retry depends on the server,
/// so the runner takes its classifier as a parameter. Any
/// `Fn(&DriverError) -> bool` closure can stand in for one.
pub trait RetryClassifier: Send + Sync {
    fn is_retryable(&self, error: &DriverError) -> bool;
}

impl<F> RetryClassifier for F
where
    F: Fn(&DriverError) -> bool + Send + Sync,
{
    fn is_retryable(&self, error: &DriverError) -> bool {
        self(error)
    }
}

/// Retries transient server errors, connection failures and routing failures.
///
/// Status codes can be moved in either direction: `retry_code` makes an
/// otherwise fatal code retryable, `never_retry_code` does the opposite.
/// The explicit deny list wins.
#[derive(Debug, Clone, Default)]
pub struct DefaultRetryClassifier {
    extra_retryable_codes: HashSet<String>,
    non_retryable_codes: HashSet<String>,
}

impl DefaultRetryClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry_code(mut self, code: impl Into<String>) -> Self {
        self.extra_retryable_codes.insert(code.into());
        self
    }

    pub fn never_retry_code(mut self, code: impl Into<String>) -> Self {
        self.non_retryable_codes.insert(code.into());
        self
    }
}

impl RetryClassifier for DefaultRetryClassifier {
    fn is_retryable(&self, error: &DriverError) -> bool {
        if let Some(code) = error.code() {
            if self.non_retryable_codes.contains(code) {
                return false;
            }
            if self.extra_retryable_codes.contains(code) {
                return true;
            }
        }

        matches!(
            error.kind(),
            ErrorKind::Transient | ErrorKind::Connection | ErrorKind::Routing
        )
    }
}
