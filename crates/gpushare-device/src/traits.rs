use crate::allocate::ContainerAllocation;
use crate::checks;
use crate::error::Result;
use crate::fit::FitFailure;
use gpushare_core::codec;
use gpushare_core::{
    Container, ContainerDeviceRequest, ContainerDevices, DeviceInfo, DeviceUsage, Node,
    PodDevices,
};
use std::collections::BTreeMap;

/// Extended resource names a vendor reads from container specs
#[derive(Debug, Clone, Copy)]
pub struct ResourceNames {
    /// Device count
    pub count: &'static str,
    /// Absolute memory per device
    pub memory: Option<&'static str>,
    /// Memory as a percentage of the device
    pub memory_percentage: Option<&'static str>,
    /// Core percentage per device
    pub cores: Option<&'static str>,
}

impl ResourceNames {
    /// Names tracked by namespace quotas (memory and cores)
    pub fn quota_names(&self) -> impl Iterator<Item = &'static str> {
        self.memory.into_iter().chain(self.cores)
    }
}

/// Annotation keys a vendor owns on nodes and pods
#[derive(Debug, Clone, Copy)]
pub struct VendorKeys {
    /// Node annotation holding the registered inventory
    pub register: &'static str,
    /// Node annotation holding the plugin handshake
    pub handshake: &'static str,
    /// Pod annotation holding grants still to be handed out
    pub to_allocate: &'static str,
    /// Pod annotation holding the full grant
    pub allocated: &'static str,
    /// Pod annotation restricting placement to these device UUIDs
    pub use_uuid: &'static str,
    /// Pod annotation excluding these device UUIDs
    pub nouse_uuid: &'static str,
}

/// Everything a fit needs to know besides the devices and the request
#[derive(Debug, Clone, Copy)]
pub struct FitContext<'a> {
    /// Annotations of the pod being placed
    pub annotations: &'a BTreeMap<String, String>,
    /// Node being evaluated
    pub node: &'a str,
}

mod sealed {
    pub trait Sealed {}
}

pub(crate) use sealed::Sealed;

/// Capabilities of one accelerator vendor
///
/// The set of vendors is closed; the scheduler dispatches through
/// [`crate::DeviceRegistry`] by vendor name.
pub trait Device: Sealed + Send + Sync {
    /// Vendor name, also the key of the vendor's grants in [`PodDevices`]
    fn vendor(&self) -> &'static str;

    fn resource_names(&self) -> &ResourceNames;

    fn keys(&self) -> &VendorKeys;

    /// MiB per unit of the memory resource
    fn memory_unit(&self) -> u64 {
        1
    }

    /// Normalize a container's resource limits into a device request
    ///
    /// Returns `None` when the container does not ask for this vendor.
    fn generate_resource_request(
        &self,
        container: &Container,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Option<ContainerDeviceRequest>>;

    /// Whether `device` is of a type the pod accepts, and whether the
    /// request is NUMA-bound
    fn check_type(
        &self,
        annotations: &BTreeMap<String, String>,
        device: &DeviceUsage,
        request: &ContainerDeviceRequest,
    ) -> (bool, bool);

    /// Whether the pod's UUID selectors allow `device`
    fn check_uuid(&self, annotations: &BTreeMap<String, String>, device: &DeviceUsage) -> bool {
        let keys = self.keys();
        checks::uuid_allowed(annotations, keys.use_uuid, keys.nouse_uuid, &device.id)
    }

    /// Pick devices for one container from a policy-ordered candidate list
    fn fit(
        &self,
        devices: &[DeviceUsage],
        request: &ContainerDeviceRequest,
        ctx: &FitContext<'_>,
    ) -> std::result::Result<ContainerDevices, FitFailure>;

    /// Write this vendor's grants into the pod annotation patch
    fn patch_annotations(
        &self,
        annotations: &mut BTreeMap<String, String>,
        devices: &PodDevices,
    ) -> Result<()> {
        if let Some(single) = devices.get(self.vendor()) {
            let value = codec::encode_pod_single_device(single)?;
            annotations.insert(self.keys().to_allocate.to_string(), value.clone());
            annotations.insert(self.keys().allocated.to_string(), value);
        }
        Ok(())
    }

    /// Inventory the vendor's plugin registered on `node`, if any
    fn node_devices(&self, node: &Node) -> Result<Option<Vec<DeviceInfo>>> {
        let key = self.keys().register;
        let value = node
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key));
        match value {
            Some(value) => Ok(Some(codec::decode_node_devices(key, self.vendor(), value)?)),
            None => Ok(None),
        }
    }

    /// Device ids and environment handed to a container by the device plugin
    fn container_allocation(&self, devices: &ContainerDevices) -> ContainerAllocation;
}
