// Deterministic container naming and env map merging.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use act_common::constants::CONTAINER_NAME_BUDGET;

static NON_ALPHANUMERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new("[^a-zA-Z0-9]").expect("Invalid container name regex"));

/// Build a container name from `parts`.
///
/// Every character outside `[a-zA-Z0-9]` becomes `-`. All parts but the last
/// are cut to an equal share of the name budget; the last part is kept
/// whole, so long job names can exceed the budget. Truncation is lossy and
/// two distinct inputs may map to the same name.
pub fn create_container_name(parts: &[&str]) -> String {
    if parts.is_empty() {
        return String::new();
    }
    let part_len = (CONTAINER_NAME_BUDGET / parts.len()).saturating_sub(1);
    let last = parts.len() - 1;

    let name: Vec<String> = parts
        .iter()
        .enumerate()
        .map(|(i, part)| {
            let sanitized = NON_ALPHANUMERIC.replace_all(part, "-").into_owned();
            if i == last {
                sanitized
            } else {
                sanitized.chars().take(part_len).collect()
            }
        })
        .collect();

    name.join("-").trim_matches('-').to_string()
}

/// Union of `maps`; later maps win on key conflicts.
pub fn merge_maps(maps: &[&HashMap<String, String>]) -> HashMap<String, String> {
    let mut merged = HashMap::new();
    for map in maps {
        merged.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn later_maps_win() {
        let merged = merge_maps(&[&map(&[("A", "1")]), &map(&[("A", "2"), ("B", "3")])]);
        assert_eq!(merged, map(&[("A", "2"), ("B", "3")]));
        assert!(merge_maps(&[]).is_empty());
    }

    #[test]
    fn sidecar_name_is_sanitized_and_bounded() {
        let name = create_container_name(&["act", "dind", "wf/job"]);
        assert_eq!(name, "act-dind-wf-job");
        assert!(name.len() <= 30);
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }

    #[test]
    fn non_last_parts_are_truncated() {
        // 30 / 2 - 1 = 14 characters for the first part.
        let name = create_container_name(&["abcdefghijklmnopqrstuvwxyz", "CI Workflow/build"]);
        assert_eq!(name, "abcdefghijklmn-CI-Workflow-build");
    }

    #[test]
    fn leading_and_trailing_dashes_are_trimmed() {
        assert_eq!(create_container_name(&["act", "/job/"]), "act--job");
        assert_eq!(create_container_name(&["__", "x"]), "x");
    }

    #[test]
    fn many_parts_leave_no_budget() {
        let parts: Vec<&str> = std::iter::repeat("ab").take(31).collect();
        let name = create_container_name(&parts);
        assert_eq!(name, "ab");
    }
}
