//! Annotation selectors shared by the vendors.

use std::collections::BTreeMap;

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// UUID selection: a use-list must contain `id`, otherwise the no-use list must not
pub fn uuid_allowed(
    annotations: &BTreeMap<String, String>,
    use_key: &str,
    nouse_key: &str,
    id: &str,
) -> bool {
    if let Some(list) = annotations.get(use_key) {
        return split_list(list).any(|u| u == id);
    }
    if let Some(list) = annotations.get(nouse_key) {
        return !split_list(list).any(|u| u == id);
    }
    true
}

/// Card model selection, case-insensitive substring match
///
/// With a use-list the card must match one entry; with a no-use list it must
/// match none.
pub fn type_allowed(
    annotations: &BTreeMap<String, String>,
    use_key: &str,
    nouse_key: &str,
    card_type: &str,
) -> bool {
    let card_type = card_type.to_uppercase();
    if let Some(list) = annotations.get(use_key) {
        if !split_list(list).any(|t| card_type.contains(&t.to_uppercase())) {
            return false;
        }
    }
    if let Some(list) = annotations.get(nouse_key) {
        if split_list(list).any(|t| card_type.contains(&t.to_uppercase())) {
            return false;
        }
    }
    true
}

/// Boolean annotation, "true" in any case
pub fn flag(annotations: &BTreeMap<String, String>, key: &str) -> bool {
    annotations
        .get(key)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annos(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_uuid_use_list() {
        let a = annos(&[("use", "GPU-a,GPU-b")]);
        assert!(uuid_allowed(&a, "use", "nouse", "GPU-a"));
        assert!(!uuid_allowed(&a, "use", "nouse", "GPU-c"));
    }

    #[test]
    fn test_uuid_nouse_list() {
        let a = annos(&[("nouse", "GPU-a")]);
        assert!(!uuid_allowed(&a, "use", "nouse", "GPU-a"));
        assert!(uuid_allowed(&a, "use", "nouse", "GPU-b"));
        assert!(uuid_allowed(&BTreeMap::new(), "use", "nouse", "GPU-a"));
    }

    #[test]
    fn test_type_selectors() {
        let a = annos(&[("use", "a100,h100")]);
        assert!(type_allowed(&a, "use", "nouse", "NVIDIA-A100-SXM4-40GB"));
        assert!(!type_allowed(&a, "use", "nouse", "NVIDIA-Tesla T4"));

        let a = annos(&[("nouse", "T4")]);
        assert!(!type_allowed(&a, "use", "nouse", "NVIDIA-Tesla T4"));
        assert!(type_allowed(&a, "use", "nouse", "NVIDIA-A10"));
    }

    #[test]
    fn test_flag() {
        assert!(flag(&annos(&[("numa", "True")]), "numa"));
        assert!(!flag(&annos(&[("numa", "no")]), "numa"));
        assert!(!flag(&BTreeMap::new(), "numa"));
    }
}
