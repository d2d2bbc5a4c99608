//! A named group of watched topics and their countdown timers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use super::health::{HealthCode, Status};
use crate::bus::{Bus, PublishEvent, Subscriber};
use crate::db::Store;
use crate::watch::{TimerState, WatchSpec, WatchTarget};

/// Result of one tick.
#[derive(Debug, Default, PartialEq)]
pub struct TickOutcome {
    /// Every target due for an alert this tick, sorted.
    pub alerting: Vec<WatchTarget>,
    /// Targets that went down this tick, with their last-seen time.
    pub newly_unseen: Vec<(WatchTarget, Option<DateTime<Utc>>)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetSnapshot {
    pub target: WatchTarget,
    #[serde(flatten)]
    pub timer: TimerState,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub name: String,
    pub targets: Vec<TargetSnapshot>,
}

#[derive(Default)]
struct GroupState {
    specs: HashMap<String, WatchSpec>,
    timers: HashMap<WatchTarget, TimerState>,
}

impl GroupState {
    /// The spec responsible for a published topic: exact match, else the
    /// longest watched prefix.
    fn matching_spec(&self, topic: &str) -> Option<&WatchSpec> {
        if let Some(spec) = self.specs.get(topic) {
            return Some(spec);
        }
        self.specs
            .values()
            .filter(|spec| topic.starts_with(spec.topic.as_str()))
            .max_by_key(|spec| spec.topic.len())
    }
}

pub struct AlertGroup {
    name: String,
    bus: Arc<dyn Bus>,
    store: Arc<Store>,
    state: Mutex<GroupState>,
    subscriber: Arc<dyn Subscriber>,
}

/// Routes bus events to the group without the bus keeping it alive.
struct GroupSubscriber(Weak<AlertGroup>);

impl Subscriber for GroupSubscriber {
    fn on_publish(&self, event: &PublishEvent) {
        if let Some(group) = self.0.upgrade() {
            group.reset_time(event);
        }
    }
}

impl AlertGroup {
    /// Create a group and subscribe to every configured topic.
    pub fn new(
        name: impl Into<String>,
        specs: Vec<WatchSpec>,
        bus: Arc<dyn Bus>,
        store: Arc<Store>,
    ) -> Arc<Self> {
        let group = Arc::new_cyclic(|weak| Self {
            name: name.into(),
            bus,
            store,
            state: Mutex::new(GroupState::default()),
            subscriber: Arc::new(GroupSubscriber(weak.clone())),
        });
        for spec in specs {
            group.watch(spec);
        }
        group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> MutexGuard<'_, GroupState> {
        // The state is plain bookkeeping, so a panic elsewhere leaves it usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Watch a whole topic.
    pub fn watch_topic(&self, topic: &str, timeout: u64) {
        self.watch(WatchSpec::whole_topic(topic, timeout));
    }

    /// Watch a device topic and the given points inside its payload.
    pub fn watch_device<I, S>(&self, topic: &str, timeout: u64, points: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.watch(WatchSpec::device(topic, timeout, points));
    }

    /// Register or replace the watch for `spec.topic`.
    ///
    /// Timers of the new targets start at the full timeout. Last-seen times
    /// and the down flag carry over for targets that already existed, so a
    /// topic that is down still logs its recovery.
    pub fn watch(&self, spec: WatchSpec) {
        let topic = spec.topic.clone();
        {
            let mut state = self.state();
            let mut previous: HashMap<WatchTarget, TimerState> = HashMap::new();
            state.timers.retain(|target, timer| {
                if target.topic_name() == topic {
                    previous.insert(target.clone(), timer.clone());
                    false
                } else {
                    true
                }
            });

            for target in spec.targets() {
                let mut timer = TimerState::new(spec.timeout());
                if let Some(old) = previous.remove(&target) {
                    timer.last_seen = old.last_seen;
                    timer.is_unseen = old.is_unseen;
                }
                state.timers.insert(target, timer);
            }
            state.specs.insert(topic.clone(), spec);
        }

        self.bus.subscribe(&self.name, &topic, self.subscriber.clone());
        tracing::debug!("Group {}: watching {}", self.name, topic);
    }

    /// Stop watching a topic and all of its points. Returns false if the
    /// topic was not watched.
    pub fn ignore_topic(&self, topic: &str) -> bool {
        let removed = {
            let mut state = self.state();
            let removed = state.specs.remove(topic).is_some();
            state.timers.retain(|target, _| target.topic_name() != topic);
            removed
        };

        if removed {
            self.bus.unsubscribe(&self.name, topic);
            tracing::info!("Group {}: ignoring {}", self.name, topic);
        }
        removed
    }

    /// Subscription callback: re-arm timers for the published topic and
    /// any expected points present in its payload.
    pub fn reset_time(&self, event: &PublishEvent) {
        let now = Utc::now();
        let mut state = self.state();
        let Some(spec) = state.matching_spec(&event.topic) else {
            return;
        };
        let topic = spec.topic.clone();
        let points: BTreeSet<String> = spec
            .points()
            .map(|expected| {
                present_points(&event.message)
                    .into_iter()
                    .filter(|p| expected.contains(p.as_str()))
                    .collect()
            })
            .unwrap_or_default();

        let mut recovered = Vec::new();
        let mut targets = vec![WatchTarget::topic(topic.clone())];
        targets.extend(points.into_iter().map(|p| WatchTarget::point(topic.clone(), p)));

        for target in targets {
            if let Some(timer) = state.timers.get_mut(&target) {
                if timer.reset(now) {
                    recovered.push(target);
                }
            }
        }

        if recovered.is_empty() {
            return;
        }

        for target in &recovered {
            tracing::info!("Group {}: {} is publishing again", self.name, target);
        }
        // Logged while the group is still locked so tick() sees the row closed.
        if let Err(e) = self.store.log_recovery(&recovered, now) {
            tracing::error!("Group {}: failed to log recovery: {}", self.name, e);
        }
        drop(state);
    }

    /// Advance every timer by one second.
    ///
    /// Targets that go down are logged before the group is unlocked, with
    /// `fallback` as the last-seen time of targets never seen.
    pub fn tick(&self, fallback: DateTime<Utc>) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let mut state = self.state();
        for (target, timer) in state.timers.iter_mut() {
            timer.remaining = timer.remaining.saturating_sub(1);
            if timer.remaining > 0 {
                continue;
            }
            timer.remaining = timer.timeout;
            outcome.alerting.push(target.clone());
            if !timer.is_unseen {
                timer.is_unseen = true;
                outcome.newly_unseen.push((target.clone(), timer.last_seen));
            }
        }
        outcome.alerting.sort();
        outcome.newly_unseen.sort_by(|a, b| a.0.cmp(&b.0));

        if !outcome.newly_unseen.is_empty() {
            if let Err(e) = self.store.log_timeout(&outcome.newly_unseen, fallback) {
                tracing::error!("Group {}: failed to log timeout: {}", self.name, e);
            }
        }
        drop(state);
        outcome
    }

    /// Alert key and status describing `targets`.
    pub fn compose_alert(&self, targets: &[WatchTarget]) -> (String, Status) {
        let mut sorted = targets.to_vec();
        sorted.sort();
        let names: Vec<String> = sorted.iter().map(ToString::to_string).collect();

        let alert_key = format!("Timeout for group {}", self.name);
        let context = format!(
            "Topic(s) not published within time limit: {}",
            names.join(", ")
        );
        (alert_key, Status::build(HealthCode::Bad, context))
    }

    pub fn timer(&self, target: &WatchTarget) -> Option<TimerState> {
        self.state().timers.get(target).cloned()
    }

    pub fn is_watching(&self, topic: &str) -> bool {
        self.state().specs.contains_key(topic)
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        let state = self.state();
        let mut targets: Vec<TargetSnapshot> = state
            .timers
            .iter()
            .map(|(target, timer)| TargetSnapshot {
                target: target.clone(),
                timer: timer.clone(),
            })
            .collect();
        targets.sort_by(|a, b| a.target.cmp(&b.target));
        GroupSnapshot {
            name: self.name.clone(),
            targets,
        }
    }
}

/// Point names carried by a device payload.
///
/// Device payloads are `{point: value}` or `[{point: value}, {point: meta}]`.
/// Anything else carries no points.
fn present_points(message: &Value) -> Vec<String> {
    let values = match message {
        Value::Array(items) => items.first(),
        other => Some(other),
    };
    match values {
        Some(Value::Object(map)) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}
