//! Tag handling for cloud resources.
//!
//! Keys are compared case-insensitively, the way ARM treats them. The
//! service tag on a public IP is a comma separated list of `namespace/name`
//! owners; the legacy key spellings are still read so IPs created by older
//! controllers keep their owners.

use crate::consts::*;
use azure_client::Tags;
use tracing::warn;

/// Parse the configured `k=v,k2=v2` string and merge the map form on top of it
pub fn parse_tags(tags: &str, tags_map: &Tags) -> Tags {
    let mut parsed = Tags::new();
    for pair in tags.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            warn!("parse_tags: ignoring tag {:?} without a value", pair);
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            warn!("parse_tags: ignoring tag {:?} with an empty key", pair);
            continue;
        }
        parsed.insert(key.to_string(), value.trim().to_string());
    }

    for (key, value) in tags_map {
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        if let Some(existing) = find_key(&parsed, key).map(str::to_string) {
            warn!("parse_tags: tag {} from the tag map replaces {}", key, existing);
            parsed.remove(&existing);
        }
        parsed.insert(key.to_string(), value.trim().to_string());
    }
    parsed
}

/// The key of `tags` equal to `key` ignoring case
pub fn find_key<'a>(tags: &'a Tags, key: &str) -> Option<&'a str> {
    tags.keys().find(|k| k.eq_ignore_ascii_case(key)).map(String::as_str)
}

/// Merge `desired` into `current`.
///
/// Existing keys keep their spelling and get the desired value. When
/// `system_tags` is empty nothing is ever removed; otherwise keys that are
/// neither desired nor prefixed by a system tag are dropped.
pub fn reconcile_tags(current: &mut Tags, desired: &Tags, system_tags: &[String]) -> bool {
    let mut changed = false;
    for (key, value) in desired {
        match find_key(current, key).map(str::to_string) {
            Some(existing) => {
                if !current[&existing].eq_ignore_ascii_case(value) {
                    current.insert(existing, value.clone());
                    changed = true;
                }
            }
            None => {
                current.insert(key.clone(), value.clone());
                changed = true;
            }
        }
    }

    if !system_tags.is_empty() {
        let stale: Vec<String> = current
            .keys()
            .filter(|k| find_key(desired, k).is_none())
            .filter(|k| {
                let lower = k.to_lowercase();
                !system_tags.iter().any(|s| lower.starts_with(&s.to_lowercase()))
            })
            .cloned()
            .collect();
        for key in stale {
            current.remove(&key);
            changed = true;
        }
    }
    changed
}

fn first_of<'a>(tags: &'a Tags, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| tags.get(*k))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

/// Raw service tag value, from the current key or the legacy one
pub fn service_tag(tags: &Tags) -> Option<&str> {
    first_of(tags, &[SERVICE_TAG_KEY, LEGACY_SERVICE_TAG_KEY])
}

pub fn cluster_tag(tags: &Tags) -> Option<&str> {
    first_of(tags, &[CLUSTER_NAME_TAG_KEY, LEGACY_CLUSTER_NAME_TAG_KEY])
}

pub fn dns_label_service_tag(tags: &Tags) -> Option<&str> {
    first_of(tags, &[SERVICE_USING_DNS_TAG_KEY, LEGACY_SERVICE_USING_DNS_TAG_KEY])
}

/// Services listed in the service tag
pub fn service_names(tags: &Tags) -> Vec<String> {
    service_tag(tags)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub fn lists_service(tags: &Tags, service_name: &str) -> bool {
    service_names(tags).iter().any(|s| s.eq_ignore_ascii_case(service_name))
}

/// Add `service_name` to the service tag, returning whether it was new
pub fn bind_service(tags: &mut Tags, service_name: &str) -> bool {
    let mut names = service_names(tags);
    if names.iter().any(|s| s.eq_ignore_ascii_case(service_name)) {
        return false;
    }
    names.push(service_name.to_string());
    tags.insert(SERVICE_TAG_KEY.to_string(), names.join(","));
    true
}

/// Remove `service_name` from the service tag and drop its DNS label claim.
/// A user-assigned IP only loses the DNS claim.
pub fn unbind_service(tags: &mut Tags, service_name: &str, user_assigned: bool) {
    if dns_label_service_tag(tags).is_some_and(|s| s.eq_ignore_ascii_case(service_name)) {
        tags.remove(SERVICE_USING_DNS_TAG_KEY);
        tags.remove(LEGACY_SERVICE_USING_DNS_TAG_KEY);
    }
    if user_assigned {
        return;
    }
    let mut names = service_names(tags);
    match names.iter().position(|s| s.eq_ignore_ascii_case(service_name)) {
        Some(i) => {
            names.remove(i);
        }
        None => warn!("cannot find the service {} in the public IP service tag", service_name),
    }
    tags.remove(LEGACY_SERVICE_TAG_KEY);
    tags.insert(SERVICE_TAG_KEY.to_string(), names.join(","));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_parse_tags_map_overrides_string() {
        let parsed = parse_tags(" a=b, c = d ,broken,=x", &tags(&[("A", "z")]));
        assert_eq!(parsed, tags(&[("A", "z"), ("c", "d")]));
    }

    #[test]
    fn test_reconcile_keeps_unknown_keys_without_system_tags() {
        let mut current = tags(&[("Team", "a"), ("manual", "x")]);
        let changed = reconcile_tags(&mut current, &tags(&[("team", "b"), ("env", "prod")]), &[]);
        assert!(changed);
        assert_eq!(current, tags(&[("Team", "b"), ("env", "prod"), ("manual", "x")]));
    }

    #[test]
    fn test_reconcile_removes_non_system_keys() {
        let mut current = tags(&[("aks-managed-pool", "1"), ("manual", "x"), ("env", "prod")]);
        let changed = reconcile_tags(&mut current, &tags(&[("env", "prod")]), &["aks-managed".to_string()]);
        assert!(changed);
        assert_eq!(current, tags(&[("aks-managed-pool", "1"), ("env", "prod")]));
    }

    #[test]
    fn test_reconcile_value_compare_ignores_case() {
        let mut current = tags(&[("env", "Prod")]);
        assert!(!reconcile_tags(&mut current, &tags(&[("ENV", "prod")]), &[]));
    }

    #[test]
    fn test_bind_and_unbind_services() {
        let mut t = tags(&[(LEGACY_SERVICE_TAG_KEY, "default/a")]);
        assert!(bind_service(&mut t, "default/b"));
        assert!(!bind_service(&mut t, "Default/B"));
        assert_eq!(service_names(&t), vec!["default/a", "default/b"]);

        t.insert(SERVICE_USING_DNS_TAG_KEY.to_string(), "default/a".to_string());
        unbind_service(&mut t, "default/a", false);
        assert_eq!(service_names(&t), vec!["default/b"]);
        assert!(dns_label_service_tag(&t).is_none());
        assert!(!t.contains_key(LEGACY_SERVICE_TAG_KEY));
    }

    #[test]
    fn test_unbind_user_assigned_only_drops_dns_claim() {
        let mut t = tags(&[(SERVICE_USING_DNS_TAG_KEY, "default/a")]);
        unbind_service(&mut t, "default/a", true);
        assert!(t.is_empty());
    }

    #[test]
    fn test_unbind_last_service_leaves_empty_list() {
        let mut t = tags(&[(SERVICE_TAG_KEY, "default/a")]);
        unbind_service(&mut t, "default/a", false);
        assert!(service_names(&t).is_empty());
        assert!(service_tag(&t).is_none());
    }
}
