//! User-visible notifications.

use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub const SESSION_EXPIRED_MESSAGE: &str = "Session expired. Please log in again.";
pub const INVALID_CREDENTIALS_MESSAGE: &str = "Invalid username or password";
pub const GENERIC_ERROR_MESSAGE: &str = "Something went wrong. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Message { level: NoticeLevel, text: String },
    /// Send the user back to the sign-in entry point
    RedirectToLogin,
}

/// Fire-and-forget sink for messages shown to the user.
pub trait Notifier: Send + Sync {
    fn notify(&self, level: NoticeLevel, message: &str);
    fn redirect_to_login(&self);
}

/// Writes notices to the log
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, level: NoticeLevel, message: &str) {
        match level {
            NoticeLevel::Success => info!(notice = message),
            NoticeLevel::Warning => warn!(notice = message),
            NoticeLevel::Error => error!(notice = message),
        }
    }

    fn redirect_to_login(&self) {
        info!("Redirecting to login");
    }
}

/// Forwards notices over a channel to whatever renders them
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notice>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, level: NoticeLevel, message: &str) {
        // A closed receiver just means nobody is watching
        let _ = self.tx.send(Notice::Message {
            level,
            text: message.to_string(),
        });
    }

    fn redirect_to_login(&self) {
        let _ = self.tx.send(Notice::RedirectToLogin);
    }
}
