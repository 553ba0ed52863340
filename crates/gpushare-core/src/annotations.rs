//! Annotation keys shared by the scheduler and the device plugins, and the
//! small value types stored under them.

use crate::{CoreError, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Domain prefix of every gpushare annotation
pub const DOMAIN: &str = "gpushare.io";

/// Node the scheduler assigned the pod to
pub const ASSIGNED_NODE: &str = "gpushare.io/vgpu-node";
/// Unix time of the assignment
pub const ASSIGNED_TIME: &str = "gpushare.io/vgpu-time";
/// Bind phase, see [`BindPhase`]
pub const BIND_PHASE: &str = "gpushare.io/bind-phase";
/// Unix time the bind started
pub const BIND_TIME: &str = "gpushare.io/bind-time";
/// Per-pod node policy override
pub const NODE_SCHEDULER_POLICY: &str = "gpushare.io/node-scheduler-policy";
/// Per-pod device policy override
pub const GPU_SCHEDULER_POLICY: &str = "gpushare.io/gpu-scheduler-policy";

/// Placement policy for nodes and devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerPolicy {
    /// Concentrate load
    #[default]
    Binpack,
    /// Distribute load
    Spread,
}

impl SchedulerPolicy {
    /// Read a policy override from `key`, falling back to `default` when absent
    pub fn from_annotations(
        annotations: &BTreeMap<String, String>,
        key: &str,
        default: SchedulerPolicy,
    ) -> Result<Self> {
        match annotations.get(key) {
            Some(value) => value.parse().map_err(|_| {
                CoreError::invalid_annotation_value(key, value.as_str(), "binpack, spread")
            }),
            None => Ok(default),
        }
    }
}

impl fmt::Display for SchedulerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerPolicy::Binpack => write!(f, "binpack"),
            SchedulerPolicy::Spread => write!(f, "spread"),
        }
    }
}

impl FromStr for SchedulerPolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binpack" => Ok(SchedulerPolicy::Binpack),
            "spread" => Ok(SchedulerPolicy::Spread),
            other => Err(CoreError::invalid_annotation_value(
                "scheduler-policy",
                other,
                "binpack, spread",
            )),
        }
    }
}

/// Progress of device binding, recorded on the pod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindPhase {
    Allocating,
    Success,
    Failed,
}

impl fmt::Display for BindPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindPhase::Allocating => write!(f, "allocating"),
            BindPhase::Success => write!(f, "success"),
            BindPhase::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for BindPhase {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "allocating" => Ok(BindPhase::Allocating),
            "success" => Ok(BindPhase::Success),
            "failed" => Ok(BindPhase::Failed),
            other => Err(CoreError::invalid_annotation_value(
                BIND_PHASE,
                other,
                "allocating, success, failed",
            )),
        }
    }
}

/// Liveness handshake between a vendor's device plugin and the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// Device plugin refreshed its inventory at the given time
    Reported(DateTime<Utc>),
    /// Scheduler asked the plugin to report, waiting since the given time
    Requesting(DateTime<Utc>),
    /// Scheduler dropped the vendor's devices at the given time
    Deleted(DateTime<Utc>),
}

impl Handshake {
    pub fn requesting_now() -> Self {
        Handshake::Requesting(Utc::now())
    }

    pub fn deleted_now() -> Self {
        Handshake::Deleted(Utc::now())
    }
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handshake::Reported(t) => write!(f, "Reported {}", t.to_rfc3339()),
            Handshake::Requesting(t) => write!(f, "Requesting_{}", t.to_rfc3339()),
            Handshake::Deleted(t) => write!(f, "Deleted_{}", t.to_rfc3339()),
        }
    }
}

impl FromStr for Handshake {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |raw: &str| {
            DateTime::parse_from_rfc3339(raw.trim())
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| CoreError::annotation_decode("handshake", e.to_string()))
        };

        if let Some(rest) = s.strip_prefix("Reported ") {
            Ok(Handshake::Reported(parse(rest)?))
        } else if let Some(rest) = s.strip_prefix("Requesting_") {
            Ok(Handshake::Requesting(parse(rest)?))
        } else if let Some(rest) = s.strip_prefix("Deleted_") {
            Ok(Handshake::Deleted(parse(rest)?))
        } else {
            Err(CoreError::annotation_decode(
                "handshake",
                format!("unknown handshake state '{}'", s),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_from_annotations() {
        let mut annos = BTreeMap::new();
        assert_eq!(
            SchedulerPolicy::from_annotations(&annos, GPU_SCHEDULER_POLICY, SchedulerPolicy::Spread)
                .unwrap(),
            SchedulerPolicy::Spread
        );

        annos.insert(GPU_SCHEDULER_POLICY.to_string(), "Binpack".to_string());
        assert_eq!(
            SchedulerPolicy::from_annotations(&annos, GPU_SCHEDULER_POLICY, SchedulerPolicy::Spread)
                .unwrap(),
            SchedulerPolicy::Binpack
        );

        annos.insert(GPU_SCHEDULER_POLICY.to_string(), "tight".to_string());
        assert!(SchedulerPolicy::from_annotations(
            &annos,
            GPU_SCHEDULER_POLICY,
            SchedulerPolicy::Spread
        )
        .is_err());
    }

    #[test]
    fn test_bind_phase_parse() {
        assert_eq!("success".parse::<BindPhase>().unwrap(), BindPhase::Success);
        assert_eq!(BindPhase::Failed.to_string(), "failed");
        assert!("done".parse::<BindPhase>().is_err());
    }

    #[test]
    fn test_handshake_parse() {
        let now = Utc::now();
        let reported = Handshake::Reported(now).to_string();
        match reported.parse::<Handshake>().unwrap() {
            Handshake::Reported(t) => assert_eq!(t.timestamp(), now.timestamp()),
            other => panic!("unexpected handshake {:?}", other),
        }

        let requesting = Handshake::Requesting(now).to_string();
        assert!(requesting.starts_with("Requesting_"));
        assert!(matches!(
            requesting.parse::<Handshake>().unwrap(),
            Handshake::Requesting(_)
        ));

        assert!("Whatever".parse::<Handshake>().is_err());
    }
}
