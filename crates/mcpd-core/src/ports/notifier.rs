//! Host notification port for interactive error surfacing.

/// Severity of a user-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Remediation action offered alongside a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Remediation {
    /// Open an external documentation/install page.
    OpenUrl { label: String, url: String },
    /// Reveal the server's log output.
    ShowOutput,
}

/// Host notification surface.
///
/// Errors during interactive (user-triggered) server starts are routed
/// here with remediation actions; background starts only log.
pub trait UserNotifier: Send + Sync {
    fn notify(&self, severity: Severity, message: &str, remediation: Option<Remediation>);
}

/// Notifier that drops everything; for tests and headless contexts.
#[derive(Debug, Default)]
pub struct NoopNotifier;

impl NoopNotifier {
    pub const fn new() -> Self {
        Self
    }
}

impl UserNotifier for NoopNotifier {
    fn notify(&self, _severity: Severity, _message: &str, _remediation: Option<Remediation>) {}
}
