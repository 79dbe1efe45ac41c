//! Error reporting with a throttle.
//!
//! Every reported error is logged. The first one raises an alert; further
//! alerts stay quiet until the backoff window has passed, and the reporting
//! loop sleeps for the backoff before it carries on.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use drover_config::log_node_error;

/// Where alerts go (mail, chat, pager).
pub trait AlertSink: Send + Sync {
    fn alert(&self, component: &str, message: &str);
}

/// Sink that only writes the alert to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn alert(&self, component: &str, message: &str) {
        tracing::error!(component = "ALERT", source = component, "{}", message);
    }
}

pub struct ErrorReporter {
    sink: Box<dyn AlertSink>,
    backoff: Duration,
    suppressed_until: Mutex<Option<Instant>>,
}

impl ErrorReporter {
    pub fn new(sink: Box<dyn AlertSink>, backoff: Duration) -> Self {
        Self {
            sink,
            backoff,
            suppressed_until: Mutex::new(None),
        }
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Log `error`, alert unless throttled, and return how long the caller
    /// should pause before its next iteration.
    pub fn report(&self, component: &str, error: &dyn std::fmt::Display) -> Duration {
        let message = error.to_string();
        log_node_error!(source = component, error = %message, "Loop iteration failed");

        let now = Instant::now();
        let send = {
            let mut until = self
                .suppressed_until
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            match *until {
                Some(deadline) if now < deadline => false,
                _ => {
                    *until = Some(now + self.backoff);
                    true
                }
            }
        };
        if send {
            self.sink.alert(component, &message);
        }
        self.backoff
    }
}
