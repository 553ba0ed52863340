use gpushare_core::PodDevices;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;

/// A pod holding device grants on a node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub node: String,
    pub devices: PodDevices,
    /// Whether the grants were added to the namespace quota
    pub quota_reserved: bool,
}

/// Pods with device grants, keyed by UID
#[derive(Default)]
pub struct PodManager {
    pods: RwLock<BTreeMap<String, PodInfo>>,
}

impl PodManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a pod, returning the entry it replaced
    pub fn add_pod(&self, info: PodInfo) -> Option<PodInfo> {
        self.pods.write().insert(info.uid.clone(), info)
    }

    pub fn del_pod(&self, uid: &str) -> Option<PodInfo> {
        self.pods.write().remove(uid)
    }

    pub fn get_pod(&self, uid: &str) -> Option<PodInfo> {
        self.pods.read().get(uid).cloned()
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.pods.read().contains_key(uid)
    }

    /// Mark a pod's quota usage as added; false when the pod is unknown or already marked
    pub fn mark_quota_reserved(&self, uid: &str) -> bool {
        match self.pods.write().get_mut(uid) {
            Some(info) if !info.quota_reserved => {
                info.quota_reserved = true;
                true
            }
            _ => false,
        }
    }

    pub fn list_pods(&self) -> Vec<PodInfo> {
        self.pods.read().values().cloned().collect()
    }

    /// Pods placed on one node
    pub fn pods_on(&self, node: &str) -> Vec<PodInfo> {
        self.pods
            .read()
            .values()
            .filter(|p| p.node == node)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(uid: &str, node: &str) -> PodInfo {
        PodInfo {
            namespace: "default".to_string(),
            name: format!("pod-{}", uid),
            uid: uid.to_string(),
            node: node.to_string(),
            devices: PodDevices::new(),
            quota_reserved: false,
        }
    }

    #[test]
    fn test_add_get_del() {
        let manager = PodManager::new();
        assert!(manager.add_pod(info("u1", "node-a")).is_none());
        assert!(manager.add_pod(info("u2", "node-b")).is_none());
        assert!(manager.contains("u1"));
        assert_eq!(manager.get_pod("u2").unwrap().node, "node-b");
        assert_eq!(manager.pods_on("node-a").len(), 1);

        let replaced = manager.add_pod(info("u1", "node-c")).unwrap();
        assert_eq!(replaced.node, "node-a");

        assert!(manager.del_pod("u1").is_some());
        assert!(manager.del_pod("u1").is_none());
        assert_eq!(manager.list_pods().len(), 1);
    }

    #[test]
    fn test_quota_reserved_once() {
        let manager = PodManager::new();
        manager.add_pod(info("u1", "node-a"));
        assert!(manager.mark_quota_reserved("u1"));
        assert!(!manager.mark_quota_reserved("u1"));
        assert!(!manager.mark_quota_reserved("missing"));
        assert!(manager.get_pod("u1").unwrap().quota_reserved);
    }
}
