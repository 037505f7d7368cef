//! Victim selection for the cleanup policies.
//!
//! Cleanup starts when usage passes 80% of the budget and stops once usage
//! is at or below 70%. `incoming` lets an insertion count the bytes it is
//! about to add.

use std::cmp::Reverse;

use stratum_config::CleanupPolicy;

use crate::entry::CacheEntry;

const TRIGGER_PERCENT: u128 = 80;
const TARGET_PERCENT: u128 = 70;

pub(crate) fn above_trigger(used: u64, limit: u64) -> bool {
    u128::from(used) * 100 > u128::from(limit) * TRIGGER_PERCENT
}

pub(crate) fn within_target(used: u64, limit: u64) -> bool {
    u128::from(used) * 100 <= u128::from(limit) * TARGET_PERCENT
}

/// Keys to remove, in removal order.
pub(crate) fn plan<'a>(
    policy: CleanupPolicy,
    entries: impl IntoIterator<Item = &'a CacheEntry>,
    limit: u64,
    incoming: u64,
    force: bool,
) -> Vec<String> {
    if policy == CleanupPolicy::Manual {
        return Vec::new();
    }
    let mut ranked: Vec<&CacheEntry> = entries.into_iter().collect();
    let used: u64 = ranked.iter().map(|entry| entry.size_bytes).sum();
    let projected = used.saturating_add(incoming);
    if !force && !above_trigger(projected, limit) {
        return Vec::new();
    }

    match policy {
        CleanupPolicy::Lru => {
            ranked.sort_by_key(|entry| (entry.last_accessed_at, entry.access_seq));
        }
        CleanupPolicy::SizeOnly => {
            ranked.sort_by_key(|entry| (Reverse(entry.size_bytes), entry.access_seq));
        }
        CleanupPolicy::Manual => {}
    }

    let mut remaining = projected;
    let mut victims = Vec::new();
    for entry in ranked {
        if !force && within_target(remaining, limit) {
            break;
        }
        remaining = remaining.saturating_sub(entry.size_bytes);
        victims.push(entry.key.clone());
    }
    victims
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use std::collections::BTreeSet;
    use stratum_core::CacheEntryKind;

    fn entry(key: &str, size: u64, age_secs: i64, seq: u64) -> CacheEntry {
        let at = Utc::now() - TimeDelta::seconds(age_secs);
        CacheEntry {
            key: key.to_string(),
            size_bytes: size,
            kind: CacheEntryKind::Archive,
            created_at: at,
            last_accessed_at: at,
            access_count: 1,
            checksum: None,
            tags: BTreeSet::new(),
            location: None,
            access_seq: seq,
        }
    }

    #[test]
    fn band_thresholds() {
        assert!(!above_trigger(80, 100));
        assert!(above_trigger(81, 100));
        assert!(within_target(70, 100));
        assert!(!within_target(71, 100));
        assert!(above_trigger(u64::MAX, u64::MAX - 1));
    }

    #[test]
    fn no_op_inside_band_unless_forced() {
        let entries = [entry("a", 40, 10, 1), entry("b", 35, 5, 2)];
        assert!(plan(CleanupPolicy::Lru, &entries, 100, 0, false).is_empty());
        assert_eq!(
            plan(CleanupPolicy::Lru, &entries, 100, 0, true),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn lru_removes_oldest_until_target() {
        let entries = [
            entry("new", 30, 1, 3),
            entry("old", 30, 30, 1),
            entry("mid", 30, 10, 2),
        ];
        assert_eq!(
            plan(CleanupPolicy::Lru, &entries, 100, 0, false),
            vec!["old".to_string()]
        );
    }

    #[test]
    fn size_only_removes_largest_first() {
        let entries = [entry("s10", 10, 0, 1), entry("s50", 50, 0, 2), entry("s20", 20, 0, 3)];
        assert_eq!(
            plan(CleanupPolicy::SizeOnly, &entries, 90, 0, false),
            vec!["s50".to_string()]
        );
    }

    #[test]
    fn incoming_bytes_count_toward_the_band() {
        let entries = [entry("first", 60, 5, 1)];
        assert_eq!(
            plan(CleanupPolicy::Lru, &entries, 100, 60, false),
            vec!["first".to_string()]
        );
    }

    #[test]
    fn manual_never_plans() {
        let entries = [entry("a", 99, 0, 1)];
        assert!(plan(CleanupPolicy::Manual, &entries, 100, 50, true).is_empty());
    }
}
