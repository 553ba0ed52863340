use crate::error::{DeviceError, Result};
use gpushare_core::k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use gpushare_core::{container_resources, Container, ResourceQuantities};
use std::collections::BTreeMap;

/// Integer device resources of one container
pub(crate) struct Limits<'a> {
    container: &'a str,
    resources: BTreeMap<String, Quantity>,
}

impl<'a> Limits<'a> {
    pub(crate) fn new(container: &'a Container) -> Self {
        Self {
            container: &container.name,
            resources: container_resources(container),
        }
    }

    pub(crate) fn get(&self, name: Option<&str>) -> Result<Option<u64>> {
        let Some(name) = name else {
            return Ok(None);
        };
        match ResourceQuantities::get(&self.resources, name)? {
            Some(v) if v < 0 => Err(DeviceError::invalid_request(
                self.container,
                format!("{} is negative ({})", name, v),
            )),
            Some(v) => Ok(Some(v as u64)),
            None => Ok(None),
        }
    }

    pub(crate) fn count(&self, name: &str) -> Result<Option<u32>> {
        match self.get(Some(name))? {
            Some(v) => u32::try_from(v)
                .map(Some)
                .map_err(|_| DeviceError::invalid_request(self.container, format!("{} is too large", name))),
            None => Ok(None),
        }
    }

    pub(crate) fn percentage(&self, name: Option<&str>) -> Result<Option<u32>> {
        match self.get(name)? {
            Some(v) if v > 100 => Err(DeviceError::invalid_request(
                self.container,
                format!("{} must be at most 100, got {}", name.unwrap_or_default(), v),
            )),
            Some(v) => Ok(Some(v as u32)),
            None => Ok(None),
        }
    }
}
