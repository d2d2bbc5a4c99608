//! The supervisor owning every [`AlertGroup`].

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::Mutex;

use super::group::{AlertGroup, GroupSnapshot};
use super::health::{HealthCode, HealthMonitor, Status};
use super::remote::{ConnectError, RemoteConnection, RemotePeer};
use crate::bus::Bus;
use crate::config::{self, AgentConfig, ConfigError, PublishSettings};
use crate::db::{Store, StoreError};

#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("group table lock poisoned")]
    Poisoned,
}

pub struct AlertAgent {
    store: Arc<Store>,
    bus: Arc<dyn Bus>,
    health: Arc<HealthMonitor>,
    settings: PublishSettings,
    groups: RwLock<HashMap<String, Arc<AlertGroup>>>,
    remote: Mutex<Option<RemoteConnection>>,
    start_time: DateTime<Utc>,
}

impl AlertAgent {
    /// Record the run start and build one group per configured entry.
    pub fn start(
        config: AgentConfig,
        identity: &str,
        store: Arc<Store>,
        bus: Arc<dyn Bus>,
    ) -> Self {
        let start_time = Utc::now();
        if let Err(e) = store.start_run(start_time) {
            tracing::error!("Failed to record agent start: {}", e);
        }

        let groups = config
            .groups
            .into_iter()
            .map(|(name, specs)| {
                tracing::info!("Group {}: watching {} topic(s)", name, specs.len());
                let group = AlertGroup::new(name.clone(), specs, bus.clone(), store.clone());
                (name, group)
            })
            .collect();

        Self {
            health: Arc::new(HealthMonitor::new(identity, bus.clone())),
            store,
            bus,
            settings: config.publish,
            groups: RwLock::new(groups),
            remote: Mutex::new(None),
            start_time,
        }
    }

    /// Record the run stop time.
    pub fn shutdown(&self) -> Result<(), AgentError> {
        self.store.finish_run(Utc::now())?;
        tracing::info!("Agent run closed");
        Ok(())
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn group(&self, name: &str) -> Option<Arc<AlertGroup>> {
        self.groups.read().ok()?.get(name).cloned()
    }

    fn groups(&self) -> Vec<Arc<AlertGroup>> {
        self.groups
            .read()
            .map(|groups| groups.values().cloned().collect())
            .unwrap_or_default()
    }

    fn group_or_create(&self, name: &str) -> Result<Arc<AlertGroup>, AgentError> {
        let mut groups = self.groups.write().map_err(|_| AgentError::Poisoned)?;
        let group = groups.entry(name.to_string()).or_insert_with(|| {
            tracing::info!("Creating group {}", name);
            AlertGroup::new(name, Vec::new(), self.bus.clone(), self.store.clone())
        });
        Ok(group.clone())
    }

    pub fn snapshots(&self) -> Vec<GroupSnapshot> {
        let mut snapshots: Vec<GroupSnapshot> = self.groups().iter().map(|g| g.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    // --- RPC surface ---

    /// Watch `topic` in `group`, creating the group if needed. Only the
    /// timers of this topic restart; the rest of the group keeps counting.
    pub fn watch_topic(&self, group: &str, topic: &str, timeout: f64) -> Result<(), AgentError> {
        let timeout = config::timeout_from_secs(topic, timeout)?;
        self.group_or_create(group)?.watch_topic(topic, timeout);
        Ok(())
    }

    /// Like [`AlertAgent::watch_topic`], for a device topic and its points.
    pub fn watch_device(
        &self,
        group: &str,
        topic: &str,
        timeout: f64,
        points: Vec<String>,
    ) -> Result<(), AgentError> {
        let timeout = config::timeout_from_secs(topic, timeout)?;
        config::validate_device_topic(topic)?;
        self.group_or_create(group)?.watch_device(topic, timeout, points);
        Ok(())
    }

    /// Unknown groups and topics are ignored.
    pub fn ignore_topic(&self, group: &str, topic: &str) {
        if let Some(group) = self.group(group) {
            group.ignore_topic(topic);
        }
    }

    // --- Tick ---

    /// Advance every group by one second, then deliver the resulting alerts.
    ///
    /// Countdowns and timeout logging finish before any remote I/O, and the
    /// whole remote step is bounded by `remote-timeout`.
    pub async fn decrement_ttl(&self) {
        let mut alerts = Vec::new();
        for group in self.groups() {
            let outcome = group.tick(self.start_time);
            if outcome.alerting.is_empty() {
                continue;
            }
            let (alert_key, status) = group.compose_alert(&outcome.alerting);
            tracing::warn!(
                "{}: {}",
                alert_key,
                status.context.as_deref().unwrap_or_default()
            );
            alerts.push((alert_key, status));
        }

        if !alerts.is_empty() {
            self.deliver_alerts(&alerts).await;
        }
    }

    async fn deliver_alerts(&self, alerts: &[(String, Status)]) {
        let mut sent_remote = 0;

        if self.settings.publish_remote {
            let limit = self.settings.remote_timeout();
            let attempt =
                tokio::time::timeout(limit, self.send_remote(alerts, &mut sent_remote)).await;
            let result = attempt.unwrap_or(Err(ConnectError::Timeout(limit)));
            if let Err(e) = result {
                let peer = self
                    .settings
                    .remote
                    .as_ref()
                    .map(|r| r.identity.as_str())
                    .unwrap_or("remote peer");
                tracing::warn!(
                    "Failed to deliver {} alert(s) to {}: {}",
                    alerts.len() - sent_remote,
                    peer,
                    e
                );
                self.health.set_status(
                    HealthCode::Bad,
                    Some(format!("Failed to connect to remote peer {}: {}", peer, e)),
                );
            }
        }

        for (index, (alert_key, status)) in alerts.iter().enumerate() {
            let mut delivered = index < sent_remote;
            if self.settings.publish_local {
                self.health.send_alert(alert_key, status);
                delivered = true;
            }
            if !delivered {
                tracing::error!("Dropping alert {}: no delivery succeeded", alert_key);
            }
        }
    }

    /// Send alerts in order through the cached connection, connecting first
    /// if needed. Stops at the first failure. The connection is only put back
    /// after every send succeeds, so a failed or cancelled attempt makes the
    /// next alert reconnect.
    async fn send_remote(
        &self,
        alerts: &[(String, Status)],
        sent: &mut usize,
    ) -> Result<(), ConnectError> {
        let Some(settings) = self.settings.remote.as_ref() else {
            return Err(ConnectError::Unreachable("no remote configured".to_string()));
        };

        let mut remote = self.remote.lock().await;
        let conn = match remote.take() {
            Some(conn) => conn,
            None => {
                let conn = RemotePeer::connect(
                    settings,
                    self.health.identity(),
                    self.settings.remote_timeout(),
                )
                .await?;
                if self.health.set_status(HealthCode::Good, None) != HealthCode::Good {
                    tracing::info!("Remote peer {} reachable again", settings.identity);
                }
                conn
            }
        };

        for (alert_key, status) in alerts {
            conn.send_alert(alert_key, status).await?;
            *sent += 1;
        }
        *remote = Some(conn);
        Ok(())
    }
}
