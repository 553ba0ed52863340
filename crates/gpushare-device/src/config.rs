/// Defaults applied when a container leaves parts of its device request unset
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Memory in MiB per device when neither memory nor percentage is set (0 = whole card)
    pub default_memory: u64,
    /// Core percentage per device when unset
    pub default_cores: u32,
    /// Device count when only memory or cores are requested
    pub default_count: u32,
    /// MiB per unit of Cambricon `vmemory`
    pub mlu_memory_unit: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            default_memory: 0,
            default_cores: 0,
            default_count: 1,
            mlu_memory_unit: 256,
        }
    }
}
