use async_trait::async_trait;

use crate::Error;

/// Port to an external crash-reporting collector.
///
/// Handler-boundary failures are forwarded here *after* cleanup (admission
/// slot released, user notified); capture must never fail the caller.
#[async_trait]
pub trait CrashReportPort: Send + Sync {
    async fn capture(&self, context: &str, error: &Error);
}

/// Default sink: structured error log only.
pub struct LogReporter;

#[async_trait]
impl CrashReportPort for LogReporter {
    async fn capture(&self, context: &str, error: &Error) {
        tracing::error!(context, error = %error, "captured failure");
    }
}
