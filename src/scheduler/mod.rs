//! Once-per-second driver for the watchdog countdowns.

use crate::alert::AlertAgent;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

const TICK: Duration = Duration::from_secs(1);

/// Runs [`AlertAgent::decrement_ttl`] on a fixed one-second interval.
pub struct TickScheduler {
    agent: Arc<AlertAgent>,
    stop: Mutex<Option<broadcast::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TickScheduler {
    pub fn new(agent: Arc<AlertAgent>) -> Self {
        Self {
            agent,
            stop: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Start the tick task. Calling it again while running is a no-op.
    pub async fn start(&self) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }

        let (tx, mut rx) = broadcast::channel(1);
        *self.stop.lock().await = Some(tx);

        let agent = self.agent.clone();
        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        agent.decrement_ttl().await;
                    }
                }
            }
            tracing::debug!("Tick scheduler stopped");
        }));

        tracing::info!("Tick scheduler started");
    }

    /// Stop the tick task, letting an in-progress tick finish.
    pub async fn stop(&self) {
        if let Some(tx) = self.stop.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!("Tick scheduler task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::config::AgentConfig;
    use crate::db::Store;
    use crate::watch::WatchTarget;
    use tempfile::NamedTempFile;

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_ticks_once_per_second() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let config = AgentConfig::from_value(serde_json::json!({"g": {"t": 100}})).unwrap();
        let agent = Arc::new(AlertAgent::start(
            config,
            "watcher",
            store,
            Arc::new(MemoryBus::new()),
        ));

        let scheduler = TickScheduler::new(agent.clone());
        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(3500)).await;
        scheduler.stop().await;

        let timer = agent
            .group("g")
            .unwrap()
            .timer(&WatchTarget::topic("t"))
            .unwrap();
        assert_eq!(timer.remaining, 97);
    }
}
