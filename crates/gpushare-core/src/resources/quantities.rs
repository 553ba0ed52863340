use crate::{CoreError, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

/// Integer view of Kubernetes quantities used for device resources
///
/// Device resources are plain counts (`nvidia.com/gpu: 2`), MiB amounts
/// (`nvidia.com/gpumem: 3000`) or percentages, so only the integer value of a
/// quantity matters. Fractions round up, like `Quantity.Value()` does.
pub struct ResourceQuantities;

impl ResourceQuantities {
    /// Parse a quantity string (e.g., "2", "3000", "4Gi", "1k", "500m")
    pub fn parse(s: &str) -> Result<i64> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CoreError::invalid_quantity(s, "empty quantity"));
        }

        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);

        let value = number
            .parse::<f64>()
            .map_err(|e| CoreError::invalid_quantity(s, e.to_string()))?;
        if suffix == "m" {
            return Ok((value / 1000.0).ceil() as i64);
        }

        let multiplier: f64 = match suffix {
            "" => 1.0,
            "k" => 1e3,
            "M" => 1e6,
            "G" => 1e9,
            "T" => 1e12,
            "Ki" => 1024.0,
            "Mi" => 1024.0 * 1024.0,
            "Gi" => 1024.0 * 1024.0 * 1024.0,
            "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
            other => {
                return Err(CoreError::invalid_quantity(
                    s,
                    format!("unsupported suffix '{}'", other),
                ))
            }
        };

        if let Ok(int) = number.parse::<i64>() {
            return int
                .checked_mul(multiplier as i64)
                .ok_or_else(|| CoreError::invalid_quantity(s, "value overflows i64"));
        }

        Ok((value * multiplier).ceil() as i64)
    }

    /// Look up `name` in a resource map and parse it
    pub fn get(resources: &BTreeMap<String, Quantity>, name: &str) -> Result<Option<i64>> {
        resources.get(name).map(|q| Self::parse(&q.0)).transpose()
    }
}
