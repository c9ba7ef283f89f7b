//! Run notifications.
//!
//! Delivery is fire-and-forget: [`deliver`] logs a failed notification and
//! carries on, so a broken channel never changes the outcome of a run.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

/// Something worth telling an operator about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    /// A plan is about to execute.
    ApplyStarted,
    /// Every planned revision committed and verified.
    ApplySucceeded,
    /// A blocking finding, drift or lock contention stopped the run before
    /// it executed anything.
    ApplyBlocked,
    /// A run failed and the database was left unchanged or rolled back.
    ApplyFailed,
    /// Recovery could not be verified.
    RecoveryFailed,
    /// The database does not match the expected head.
    VerificationFailed,
    /// A run left behind by an earlier process was resolved.
    InterruptedRunResolved,
    /// An operator restored a backup.
    BackupRestored,
}

impl Event {
    /// Returns the wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApplyStarted => "apply_started",
            Self::ApplySucceeded => "apply_succeeded",
            Self::ApplyBlocked => "apply_blocked",
            Self::ApplyFailed => "apply_failed",
            Self::RecoveryFailed => "recovery_failed",
            Self::VerificationFailed => "verification_failed",
            Self::InterruptedRunResolved => "interrupted_run_resolved",
            Self::BackupRestored => "backup_restored",
        }
    }

    fn is_alert(self) -> bool {
        matches!(
            self,
            Self::ApplyBlocked
                | Self::ApplyFailed
                | Self::RecoveryFailed
                | Self::VerificationFailed
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification channel failed.
#[derive(Debug, thiserror::Error)]
#[error("Notification '{event}' failed: {message}")]
pub struct NotifyError {
    /// Event being delivered.
    pub event: Event,
    /// Channel error.
    pub message: String,
}

/// Delivers events to a channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers one event.
    async fn notify(&self, event: Event, payload: &Value) -> Result<(), NotifyError>;
}

/// Delivers `event`, logging instead of failing.
pub async fn deliver(notifier: &dyn Notifier, event: Event, payload: Value) {
    if let Err(e) = notifier.notify(event, &payload).await {
        warn!(event = %event, error = %e, "Dropping notification");
    }
}

/// Writes events as log records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: Event, payload: &Value) -> Result<(), NotifyError> {
        if event.is_alert() {
            error!(event = %event, payload = %payload, "Safeguard event");
        } else {
            info!(event = %event, payload = %payload, "Safeguard event");
        }
        Ok(())
    }
}

/// Keeps events in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryNotifier {
    events: Arc<Mutex<Vec<(Event, Value)>>>,
}

impl MemoryNotifier {
    /// Creates an empty notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every event delivered so far.
    #[must_use]
    pub fn events(&self) -> Vec<(Event, Value)> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Returns only the event kinds, in delivery order.
    #[must_use]
    pub fn kinds(&self) -> Vec<Event> {
        self.events().into_iter().map(|(event, _)| event).collect()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, event: Event, payload: &Value) -> Result<(), NotifyError> {
        let mut events = self.events.lock().map_err(|e| NotifyError {
            event,
            message: e.to_string(),
        })?;
        events.push((event, payload.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Broken;

    #[async_trait]
    impl Notifier for Broken {
        async fn notify(&self, event: Event, _payload: &Value) -> Result<(), NotifyError> {
            Err(NotifyError {
                event,
                message: "webhook down".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_memory_notifier_records_in_order() {
        let notifier = MemoryNotifier::new();
        deliver(&notifier, Event::ApplyStarted, json!({"target": "0002"})).await;
        deliver(&notifier, Event::ApplySucceeded, json!({})).await;

        assert_eq!(
            notifier.kinds(),
            vec![Event::ApplyStarted, Event::ApplySucceeded]
        );
        assert_eq!(notifier.events()[0].1["target"], "0002");
    }

    #[tokio::test]
    async fn test_failed_delivery_is_swallowed() {
        deliver(&Broken, Event::ApplyFailed, json!({})).await;
        deliver(&TracingNotifier, Event::RecoveryFailed, json!({"run": "x"})).await;
    }

    #[test]
    fn test_event_serializes_as_wire_name() {
        let value = serde_json::to_value(Event::InterruptedRunResolved).unwrap();
        assert_eq!(value, Event::InterruptedRunResolved.as_str());
    }
}
