use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a scheduling step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingEventReason {
    FilteringSucceed,
    FilteringFailed,
    BindingSucceed,
    BindingFailed,
}

impl SchedulingEventReason {
    /// Kubernetes event reason for this outcome
    pub fn k8s_reason(&self) -> &'static str {
        match self {
            SchedulingEventReason::FilteringSucceed => "FilteringSucceed",
            SchedulingEventReason::FilteringFailed => "FailedScheduling",
            SchedulingEventReason::BindingSucceed => "BindingSucceed",
            SchedulingEventReason::BindingFailed => "FailedBinding",
        }
    }

    /// Kubernetes event type ("Normal" or "Warning")
    pub fn k8s_type(&self) -> &'static str {
        match self {
            SchedulingEventReason::FilteringSucceed | SchedulingEventReason::BindingSucceed => {
                "Normal"
            }
            SchedulingEventReason::FilteringFailed | SchedulingEventReason::BindingFailed => {
                "Warning"
            }
        }
    }
}

impl fmt::Display for SchedulingEventReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A scheduling decision about one pod
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingEvent {
    /// Unique event id
    pub id: String,
    pub reason: SchedulingEventReason,
    pub pod_namespace: String,
    pub pod_name: String,
    pub pod_uid: String,
    /// Nodes the decision concerns
    pub nodes: Vec<String>,
    /// Human readable detail, the aggregated reason string on failures
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl SchedulingEvent {
    pub fn new(
        reason: SchedulingEventReason,
        pod_namespace: impl Into<String>,
        pod_name: impl Into<String>,
        pod_uid: impl Into<String>,
        nodes: Vec<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            reason,
            pod_namespace: pod_namespace.into(),
            pod_name: pod_name.into(),
            pod_uid: pod_uid.into(),
            nodes,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.reason.k8s_type() == "Warning"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_reasons() {
        let event = SchedulingEvent::new(
            SchedulingEventReason::FilteringFailed,
            "default",
            "job-0",
            "uid-0",
            vec![],
            "2/2 CardInsufficientMemory",
        );
        assert!(event.is_failure());
        assert_eq!(event.reason.k8s_reason(), "FailedScheduling");

        let event = SchedulingEvent::new(
            SchedulingEventReason::BindingSucceed,
            "default",
            "job-0",
            "uid-0",
            vec!["node-a".to_string()],
            "",
        );
        assert!(!event.is_failure());
        assert_eq!(event.reason.k8s_type(), "Normal");
    }

    #[test]
    fn test_event_serde_roundtrip() {
        let event = SchedulingEvent::new(
            SchedulingEventReason::BindingFailed,
            "ml",
            "trainer",
            "uid-1",
            vec!["node-b".to_string()],
            "commit race",
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: SchedulingEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.reason, SchedulingEventReason::BindingFailed);
        assert_eq!(back.nodes, vec!["node-b".to_string()]);
    }
}
