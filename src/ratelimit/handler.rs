//! Reporting of storage failures that must not fail the request.

use tracing::error;

use crate::error::RatewardenError;

/// Receives storage failures swallowed by the engine.
///
/// The engine fails open: a failed read starts a new window, a failed write
/// still returns the computed rate. Implementations decide how loudly to
/// report it.
pub trait ErrorHandler: Send + Sync {
    /// Persisting the rate for `key` failed.
    fn handle_save_error(&self, key: &str, error: &RatewardenError);

    /// Loading the rate for `key` failed.
    fn handle_fetch_error(&self, key: &str, error: &RatewardenError);

    /// Any other backend failure.
    fn handle_error(&self, message: &str, error: &RatewardenError);
}

/// Logs every failure at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn handle_save_error(&self, key: &str, error: &RatewardenError) {
        error!(key = %key, error = %error, "Failed saving rate");
    }

    fn handle_fetch_error(&self, key: &str, error: &RatewardenError) {
        error!(key = %key, error = %error, "Failed retrieving rate");
    }

    fn handle_error(&self, message: &str, error: &RatewardenError) {
        error!(error = %error, "{}", message);
    }
}
