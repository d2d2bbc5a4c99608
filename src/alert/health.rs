//! Health status and the local alert sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::bus::{Bus, PublishEvent};

/// Number of alerts kept for `/api/alerts`.
const RECENT_ALERTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthCode {
    Good,
    Bad,
    Unknown,
}

/// A status code with free-text context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub status: HealthCode,
    pub context: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl Status {
    pub fn build(status: HealthCode, context: impl Into<String>) -> Self {
        Self {
            status,
            context: Some(context.into()),
            last_updated: Utc::now(),
        }
    }

    pub fn good() -> Self {
        Self {
            status: HealthCode::Good,
            context: None,
            last_updated: Utc::now(),
        }
    }
}

/// An alert raised here or forwarded by a peer.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub alert_key: String,
    pub status: Status,
    /// Identity of the forwarding peer; `None` for local alerts.
    pub origin: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Own health plus local alert delivery.
pub struct HealthMonitor {
    identity: String,
    bus: Arc<dyn Bus>,
    status: Mutex<Status>,
    recent: Mutex<VecDeque<AlertRecord>>,
}

impl HealthMonitor {
    pub fn new(identity: impl Into<String>, bus: Arc<dyn Bus>) -> Self {
        Self {
            identity: identity.into(),
            bus,
            status: Mutex::new(Status::good()),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_ALERTS)),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn status(&self) -> Status {
        self.status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| Status::build(HealthCode::Unknown, "health state poisoned"))
    }

    /// Update own status. Returns the previous code.
    pub fn set_status(&self, code: HealthCode, context: Option<String>) -> HealthCode {
        let next = Status {
            status: code,
            context,
            last_updated: Utc::now(),
        };
        match self.status.lock() {
            Ok(mut current) => std::mem::replace(&mut *current, next).status,
            Err(_) => HealthCode::Unknown,
        }
    }

    /// Deliver an alert locally: record it and publish it on the bus.
    pub fn send_alert(&self, alert_key: &str, status: &Status) {
        self.record(alert_key, status.clone(), None);

        let mut event = PublishEvent::new(
            format!("alerts/{}", self.identity),
            serde_json::to_value(status).unwrap_or_default(),
        );
        event
            .headers
            .insert("alert_key".to_string(), alert_key.to_string());
        self.bus.publish(&event);
    }

    /// Store an alert forwarded by a remote peer.
    pub fn receive_remote(&self, origin: &str, alert_key: &str, status: Status) {
        tracing::warn!(
            "Alert from {}: {} ({})",
            origin,
            alert_key,
            status.context.as_deref().unwrap_or("")
        );
        self.record(alert_key, status, Some(origin.to_string()));
    }

    /// Most recent alerts first.
    pub fn recent_alerts(&self) -> Vec<AlertRecord> {
        self.recent
            .lock()
            .map(|r| r.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    fn record(&self, alert_key: &str, status: Status, origin: Option<String>) {
        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == RECENT_ALERTS {
                recent.pop_front();
            }
            recent.push_back(AlertRecord {
                alert_key: alert_key.to_string(),
                status,
                origin,
                received_at: Utc::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryBus, Subscriber};

    #[derive(Default)]
    struct Capture {
        events: Mutex<Vec<PublishEvent>>,
    }

    impl Subscriber for Capture {
        fn on_publish(&self, event: &PublishEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_local_alert_is_published_and_recorded() {
        let bus = Arc::new(MemoryBus::new());
        let capture = Arc::new(Capture::default());
        bus.subscribe("test", "alerts/", capture.clone());

        let health = HealthMonitor::new("watcher", bus);
        let status = Status::build(HealthCode::Bad, "quiet".to_string());
        health.send_alert("Timeout for group g", &status);

        let events = capture.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].topic, "alerts/watcher");
        assert_eq!(events[0].headers["alert_key"], "Timeout for group g");
        assert_eq!(events[0].message["status"], "BAD");

        let recent = health.recent_alerts();
        assert_eq!(recent.len(), 1);
        assert!(recent[0].origin.is_none());
    }

    #[test]
    fn test_set_status_returns_previous() {
        let health = HealthMonitor::new("w", Arc::new(MemoryBus::new()));
        assert_eq!(health.status().status, HealthCode::Good);
        let prev = health.set_status(HealthCode::Bad, Some("down".to_string()));
        assert_eq!(prev, HealthCode::Good);
        assert_eq!(health.status().context.as_deref(), Some("down"));
    }

    #[test]
    fn test_recent_alerts_are_bounded() {
        let health = HealthMonitor::new("w", Arc::new(MemoryBus::new()));
        for i in 0..(RECENT_ALERTS + 5) {
            health.receive_remote("peer", &format!("k{}", i), Status::good());
        }
        let recent = health.recent_alerts();
        assert_eq!(recent.len(), RECENT_ALERTS);
        assert_eq!(recent[0].alert_key, format!("k{}", RECENT_ALERTS + 4));
    }
}
