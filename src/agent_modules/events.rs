use chrono::{DateTime, Local};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info};

/// A user-visible event from the monitor (checks, logins, cooldowns, pauses).
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub timestamp: DateTime<Local>,
    pub text: String,
}

/// One-way delivery of [`LogEvent`]s to a front end.
///
/// `emit` never blocks: when the receiver lags and the channel is full the
/// event is dropped from the feed (it is still recorded by `tracing`).
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    tx: Option<mpsc::Sender<LogEvent>>,
}

impl LogSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LogEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, text: impl Into<String>) {
        let text = text.into();
        info!(target: "portal_keeper::events", "{text}");

        let Some(tx) = &self.tx else { return };
        let event = LogEvent {
            timestamp: Local::now(),
            text,
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("Log sink is full; event dropped from the feed."),
            Err(TrySendError::Closed(_)) => debug!("Log sink receiver is gone."),
        }
    }
}
