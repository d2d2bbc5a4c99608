//! Watch configuration and timer bookkeeping types.
//!
//! A [`WatchSpec`] is what an operator configures for one topic. It expands
//! into one or more [`WatchTarget`]s, each with its own [`TimerState`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

/// Suffix carried by aggregate device topics.
pub const DEVICE_ALL_SUFFIX: &str = "all";

/// The unit being timed: a whole topic or one point inside a device topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum WatchTarget {
    Topic(String),
    Point { topic: String, point: String },
}

impl WatchTarget {
    pub fn topic(topic: impl Into<String>) -> Self {
        WatchTarget::Topic(topic.into())
    }

    pub fn point(topic: impl Into<String>, point: impl Into<String>) -> Self {
        WatchTarget::Point {
            topic: topic.into(),
            point: point.into(),
        }
    }

    /// The bus topic this target belongs to.
    pub fn topic_name(&self) -> &str {
        match self {
            WatchTarget::Topic(topic) => topic,
            WatchTarget::Point { topic, .. } => topic,
        }
    }

    pub fn point_name(&self) -> Option<&str> {
        match self {
            WatchTarget::Topic(_) => None,
            WatchTarget::Point { point, .. } => Some(point),
        }
    }

    /// Name under which this target is persisted.
    ///
    /// Point targets replace the trailing `all` of their device topic with the
    /// point name, so `devices/bldg/ahu1/all` + `fan` becomes
    /// `devices/bldg/ahu1/fan`. Returns `None` when a point target is attached
    /// to a topic that is not an aggregate device topic.
    pub fn log_topic(&self) -> Option<String> {
        match self {
            WatchTarget::Topic(topic) => Some(topic.clone()),
            WatchTarget::Point { topic, point } => topic
                .strip_suffix(DEVICE_ALL_SUFFIX)
                .map(|base| format!("{}{}", base, point)),
        }
    }

    fn sort_key(&self) -> (&str, Option<&str>) {
        (self.topic_name(), self.point_name())
    }
}

impl Ord for WatchTarget {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for WatchTarget {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchTarget::Topic(topic) => write!(f, "{}", topic),
            WatchTarget::Point { topic, point } => write!(f, "({}, {})", topic, point),
        }
    }
}

/// How a topic is watched, decided once when the configuration is parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchKind {
    WholeTopic { timeout: u64 },
    Device { timeout: u64, points: BTreeSet<String> },
}

/// One configured watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSpec {
    pub topic: String,
    pub kind: WatchKind,
}

impl WatchSpec {
    pub fn whole_topic(topic: impl Into<String>, timeout: u64) -> Self {
        Self {
            topic: topic.into(),
            kind: WatchKind::WholeTopic { timeout },
        }
    }

    pub fn device<I, S>(topic: impl Into<String>, timeout: u64, points: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topic: topic.into(),
            kind: WatchKind::Device {
                timeout,
                points: points.into_iter().map(Into::into).collect(),
            },
        }
    }

    pub fn timeout(&self) -> u64 {
        match &self.kind {
            WatchKind::WholeTopic { timeout } | WatchKind::Device { timeout, .. } => *timeout,
        }
    }

    pub fn points(&self) -> Option<&BTreeSet<String>> {
        match &self.kind {
            WatchKind::WholeTopic { .. } => None,
            WatchKind::Device { points, .. } => Some(points),
        }
    }

    /// Every target this spec expands into, topic-level target first.
    pub fn targets(&self) -> Vec<WatchTarget> {
        let mut targets = vec![WatchTarget::topic(self.topic.clone())];
        if let Some(points) = self.points() {
            targets.extend(
                points
                    .iter()
                    .map(|p| WatchTarget::point(self.topic.clone(), p.clone())),
            );
        }
        targets
    }
}

/// Countdown state for one [`WatchTarget`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimerState {
    /// Configured timeout in seconds.
    pub timeout: u64,
    /// Seconds left before the next alert.
    pub remaining: u64,
    pub last_seen: Option<DateTime<Utc>>,
    pub is_unseen: bool,
}

impl TimerState {
    pub fn new(timeout: u64) -> Self {
        Self {
            timeout,
            remaining: timeout,
            last_seen: None,
            is_unseen: false,
        }
    }

    /// Re-arm after a matching publish. Returns true if the target was down.
    pub fn reset(&mut self, seen_at: DateTime<Utc>) -> bool {
        self.remaining = self.timeout;
        self.last_seen = Some(seen_at);
        std::mem::replace(&mut self.is_unseen, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_topic_for_points() {
        let target = WatchTarget::point("devices/campus/ahu1/all", "fan_speed");
        assert_eq!(
            target.log_topic().as_deref(),
            Some("devices/campus/ahu1/fan_speed")
        );

        let whole = WatchTarget::topic("weather/current");
        assert_eq!(whole.log_topic().as_deref(), Some("weather/current"));

        let bad = WatchTarget::point("devices/campus/ahu1", "fan_speed");
        assert!(bad.log_topic().is_none());
    }

    #[test]
    fn test_targets_sort_by_topic_then_point() {
        let mut targets = vec![
            WatchTarget::point("b/all", "y"),
            WatchTarget::topic("b/all"),
            WatchTarget::point("b/all", "x"),
            WatchTarget::topic("a"),
        ];
        targets.sort();
        let rendered: Vec<String> = targets.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["a", "b/all", "(b/all, x)", "(b/all, y)"]);
    }

    #[test]
    fn test_device_spec_expands_to_point_targets() {
        let spec = WatchSpec::device("devices/all", 5, ["p", "q"]);
        let targets = spec.targets();
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0], WatchTarget::topic("devices/all"));
        assert!(targets.contains(&WatchTarget::point("devices/all", "q")));
    }

    #[test]
    fn test_timer_reset_reports_recovery() {
        let mut timer = TimerState::new(5);
        timer.remaining = 1;
        assert!(!timer.reset(Utc::now()));

        timer.is_unseen = true;
        timer.remaining = 3;
        assert!(timer.reset(Utc::now()));
        assert_eq!(timer.remaining, 5);
        assert!(!timer.is_unseen);
        assert!(timer.last_seen.is_some());
    }
}
