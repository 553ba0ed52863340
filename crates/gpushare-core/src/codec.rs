//! Delimited annotation encoding of device grants and node inventories.
//!
//! Pod grants: one `uuid,type,usedmem,usedcores,idx:` entry per device, each
//! container terminated by `;`. A container without devices is a bare `;`, so
//! container positions survive the round trip. Readers that only look at the
//! first four fields of an entry keep working; four-field entries decode with
//! index 0.
//!
//! Node inventory: one `id,count,devmem,devcore,type,numa,healthy:` entry per
//! device, the device index being its position in the list.

use crate::types::{ContainerDevice, ContainerDevices, DeviceInfo, PodDevices, PodSingleDevice};
use crate::{CoreError, Result};
use std::collections::BTreeMap;

const FIELD_SEP: char = ',';
const DEVICE_SEP: char = ':';
const CONTAINER_SEP: char = ';';

fn check_field(field: &str, what: &str) -> Result<()> {
    if field.contains([FIELD_SEP, DEVICE_SEP, CONTAINER_SEP]) {
        return Err(CoreError::annotation_encode(format!(
            "{} '{}' contains a delimiter",
            what, field
        )));
    }
    Ok(())
}

fn parse_field<T: std::str::FromStr>(key: &str, raw: &str, what: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| CoreError::annotation_decode(key, format!("invalid {} '{}': {}", what, raw, e)))
}

/// Encode the devices of one container
pub fn encode_container_devices(devices: &ContainerDevices) -> Result<String> {
    let mut out = String::new();
    for dev in devices {
        if dev.uuid.is_empty() {
            return Err(CoreError::annotation_encode("device uuid is empty"));
        }
        check_field(&dev.uuid, "device uuid")?;
        check_field(&dev.device_type, "device type")?;
        out.push_str(&format!(
            "{},{},{},{},{}{}",
            dev.uuid, dev.device_type, dev.usedmem, dev.usedcores, dev.idx, DEVICE_SEP
        ));
    }
    Ok(out)
}

/// Decode the devices of one container
pub fn decode_container_devices(key: &str, value: &str) -> Result<ContainerDevices> {
    let mut devices = ContainerDevices::new();
    for entry in value.split(DEVICE_SEP).filter(|e| !e.is_empty()) {
        let fields: Vec<&str> = entry.split(FIELD_SEP).collect();
        if fields.len() < 4 || fields.len() > 5 {
            return Err(CoreError::annotation_decode(
                key,
                format!("device entry '{}' has {} fields, expected 4 or 5", entry, fields.len()),
            ));
        }
        if fields[0].is_empty() {
            return Err(CoreError::annotation_decode(
                key,
                format!("device entry '{}' has an empty uuid", entry),
            ));
        }
        let idx = match fields.get(4) {
            Some(raw) => parse_field(key, raw, "device index")?,
            None => 0,
        };
        devices.push(ContainerDevice {
            idx,
            uuid: fields[0].to_string(),
            device_type: fields[1].to_string(),
            usedmem: parse_field(key, fields[2], "memory")?,
            usedcores: parse_field(key, fields[3], "cores")?,
        });
    }
    Ok(devices)
}

/// Encode the per-container grants of one vendor
pub fn encode_pod_single_device(devices: &PodSingleDevice) -> Result<String> {
    let mut out = String::new();
    for ctr in devices {
        out.push_str(&encode_container_devices(ctr)?);
        out.push(CONTAINER_SEP);
    }
    Ok(out)
}

/// Decode the per-container grants of one vendor
pub fn decode_pod_single_device(key: &str, value: &str) -> Result<PodSingleDevice> {
    let mut parts: Vec<&str> = value.split(CONTAINER_SEP).collect();
    if parts.last() == Some(&"") {
        parts.pop();
    }
    parts
        .into_iter()
        .map(|ctr| decode_container_devices(key, ctr))
        .collect()
}

/// Encode grants under each vendor's annotation key
///
/// `keys` maps vendor to annotation key; vendors absent from `devices` are
/// skipped.
pub fn encode_pod_devices(
    keys: &BTreeMap<String, String>,
    devices: &PodDevices,
) -> Result<BTreeMap<String, String>> {
    let mut annotations = BTreeMap::new();
    for (vendor, key) in keys {
        if let Some(single) = devices.get(vendor) {
            annotations.insert(key.clone(), encode_pod_single_device(single)?);
        }
    }
    Ok(annotations)
}

/// Decode grants from each vendor's annotation key
pub fn decode_pod_devices(
    keys: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> Result<PodDevices> {
    let mut devices = PodDevices::new();
    for (vendor, key) in keys {
        if let Some(value) = annotations.get(key) {
            devices.insert(vendor.clone(), decode_pod_single_device(key, value)?);
        }
    }
    Ok(devices)
}

/// Encode a node's device inventory
pub fn encode_node_devices(devices: &[DeviceInfo]) -> Result<String> {
    let mut out = String::new();
    for dev in devices {
        check_field(&dev.id, "device id")?;
        check_field(&dev.device_type, "device type")?;
        out.push_str(&format!(
            "{},{},{},{},{},{},{}{}",
            dev.id, dev.count, dev.devmem, dev.devcore, dev.device_type, dev.numa, dev.health, DEVICE_SEP
        ));
    }
    Ok(out)
}

/// Decode a node's device inventory registered by `vendor`
pub fn decode_node_devices(key: &str, vendor: &str, value: &str) -> Result<Vec<DeviceInfo>> {
    let mut devices = Vec::new();
    for (index, entry) in value.split(DEVICE_SEP).filter(|e| !e.is_empty()).enumerate() {
        let fields: Vec<&str> = entry.split(FIELD_SEP).collect();
        if fields.len() != 7 {
            return Err(CoreError::annotation_decode(
                key,
                format!("node device entry '{}' has {} fields, expected 7", entry, fields.len()),
            ));
        }
        devices.push(DeviceInfo {
            id: fields[0].to_string(),
            index: index as u32,
            vendor: vendor.to_string(),
            device_type: fields[4].to_string(),
            count: parse_field(key, fields[1], "slot count")?,
            devmem: parse_field(key, fields[2], "device memory")?,
            devcore: parse_field(key, fields[3], "device cores")?,
            numa: parse_field(key, fields[5], "numa node")?,
            health: parse_field(key, fields[6], "health flag")?,
        });
    }
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "gpushare.io/vgpu-devices-allocated";

    fn dev(idx: u32, uuid: &str, mem: u64, cores: u32) -> ContainerDevice {
        ContainerDevice {
            idx,
            uuid: uuid.to_string(),
            device_type: "NVIDIA".to_string(),
            usedmem: mem,
            usedcores: cores,
        }
    }

    #[test]
    fn test_pod_single_device_roundtrip_keeps_empty_containers() {
        let single: PodSingleDevice = vec![
            vec![dev(1, "GPU-a", 1000, 30), dev(0, "GPU-b", 2000, 0)],
            vec![],
            vec![dev(3, "GPU-c", 0, 100)],
            vec![],
        ];
        let encoded = encode_pod_single_device(&single).unwrap();
        assert_eq!(
            encoded,
            "GPU-a,NVIDIA,1000,30,1:GPU-b,NVIDIA,2000,0,0:;;GPU-c,NVIDIA,0,100,3:;;"
        );
        assert_eq!(decode_pod_single_device(KEY, &encoded).unwrap(), single);
    }

    #[test]
    fn test_pod_devices_roundtrip() {
        let mut keys = BTreeMap::new();
        keys.insert("NVIDIA".to_string(), KEY.to_string());
        keys.insert("MLU".to_string(), "gpushare.io/mlu-devices-allocated".to_string());

        let mut pod = PodDevices::new();
        pod.insert("NVIDIA".to_string(), vec![vec![dev(0, "GPU-a", 10, 10)], vec![]]);

        let annotations = encode_pod_devices(&keys, &pod).unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(decode_pod_devices(&keys, &annotations).unwrap(), pod);
    }

    #[test]
    fn test_pod_devices_roundtrip_table() {
        let mut keys = BTreeMap::new();
        for vendor in ["NVIDIA", "MLU", "XPU"] {
            keys.insert(vendor.to_string(), format!("gpushare.io/{}-allocated", vendor));
        }
        let grant = |idx: u32, uuid: &str, device_type: &str, mem: u64, cores: u32| ContainerDevice {
            idx,
            uuid: uuid.to_string(),
            device_type: device_type.to_string(),
            usedmem: mem,
            usedcores: cores,
        };

        let cases: Vec<(&str, Vec<(&str, PodSingleDevice)>)> = vec![
            ("no vendors", vec![]),
            ("vendor without containers", vec![("NVIDIA", vec![])]),
            ("only empty containers", vec![("NVIDIA", vec![vec![], vec![], vec![]])]),
            (
                "empty containers around grants",
                vec![("MLU", vec![vec![], vec![grant(2, "MLU-2", "MLU370", 256, 10)], vec![]])],
            ),
            (
                "several vendors",
                vec![
                    ("NVIDIA", vec![vec![grant(0, "GPU-0", "NVIDIA", 1000, 30)], vec![]]),
                    ("XPU", vec![vec![], vec![grant(4, "XPU-4", "XPU", 0, 100), grant(6, "XPU-6", "XPU", 0, 100)]]),
                ],
            ),
            (
                "integer limits",
                vec![("NVIDIA", vec![vec![grant(u32::MAX, "GPU-max", "NVIDIA", u64::MAX, u32::MAX)]])],
            ),
            ("zero values", vec![("NVIDIA", vec![vec![grant(0, "GPU-0", "", 0, 0)]])]),
        ];

        for (name, vendors) in cases {
            let pod: PodDevices = vendors
                .into_iter()
                .map(|(vendor, single)| (vendor.to_string(), single))
                .collect();
            let annotations = encode_pod_devices(&keys, &pod).unwrap();
            assert_eq!(annotations.len(), pod.len(), "{}", name);
            assert_eq!(decode_pod_devices(&keys, &annotations).unwrap(), pod, "{}", name);
        }
    }

    #[test]
    fn test_encode_rejects_what_decode_rejects() {
        let empty_uuid = vec![vec![dev(0, "", 1, 1)]];
        assert!(encode_pod_single_device(&empty_uuid).is_err());
        assert!(decode_pod_single_device(KEY, ",NVIDIA,1,1,0:;").is_err());
    }

    #[test]
    fn test_decode_legacy_four_field_entries() {
        let decoded = decode_pod_single_device(KEY, "GPU-a,NVIDIA,1000,30:;").unwrap();
        assert_eq!(decoded, vec![vec![dev(0, "GPU-a", 1000, 30)]]);
    }

    #[test]
    fn test_decode_empty_value() {
        assert!(decode_pod_single_device(KEY, "").unwrap().is_empty());
        assert_eq!(decode_pod_single_device(KEY, ";").unwrap(), vec![vec![]]);
    }

    #[test]
    fn test_decode_malformed_is_error() {
        assert!(decode_pod_single_device(KEY, "GPU-a,NVIDIA,1000:;").is_err());
        assert!(decode_pod_single_device(KEY, "GPU-a,NVIDIA,lots,30:;").is_err());
        assert!(decode_pod_single_device(KEY, ",NVIDIA,1,30:;").is_err());
    }

    #[test]
    fn test_encode_rejects_delimiters() {
        let bad = vec![vec![dev(0, "GPU:a", 1, 1)]];
        assert!(encode_pod_single_device(&bad).is_err());
    }

    #[test]
    fn test_node_devices_roundtrip() {
        let devices = vec![
            DeviceInfo {
                id: "GPU-0".to_string(),
                index: 0,
                vendor: "NVIDIA".to_string(),
                device_type: "NVIDIA-Tesla T4".to_string(),
                count: 10,
                devmem: 15360,
                devcore: 100,
                numa: 0,
                health: true,
            },
            DeviceInfo {
                id: "GPU-1".to_string(),
                index: 1,
                vendor: "NVIDIA".to_string(),
                device_type: "NVIDIA-Tesla T4".to_string(),
                count: 10,
                devmem: 15360,
                devcore: 100,
                numa: 1,
                health: false,
            },
        ];
        let encoded = encode_node_devices(&devices).unwrap();
        assert_eq!(
            encoded,
            "GPU-0,10,15360,100,NVIDIA-Tesla T4,0,true:GPU-1,10,15360,100,NVIDIA-Tesla T4,1,false:"
        );
        let decoded = decode_node_devices("register", "NVIDIA", &encoded).unwrap();
        assert_eq!(decoded, devices);
    }

    #[test]
    fn test_node_devices_bad_field_count() {
        assert!(decode_node_devices("register", "NVIDIA", "GPU-0,10,15360,100:").is_err());
    }
}
