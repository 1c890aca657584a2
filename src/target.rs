use std::collections::{HashMap, HashSet};
use std::fmt;

use anyhow::{bail, Result};

/// Numeric event identifier as it appears in the event log.
pub type EventId = u32;

/// Identity of a monitored target: one event log on one host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetKey {
    pub host: String,
    pub log_name: String,
}

impl TargetKey {
    pub fn new(host: impl Into<String>, log_name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            log_name: log_name.into(),
        }
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.log_name, self.host)
    }
}

/// A (host, log) pair with its fixed set of monitored identifiers.
///
/// Immutable once built and shared (behind an `Arc`) by every worker in
/// the target's lineage.
#[derive(Debug, Clone)]
pub struct MonitorTarget {
    key: TargetKey,
    event_ids: Vec<EventId>,
    descriptions: HashMap<EventId, String>,
}

impl MonitorTarget {
    /// Creates a target, rejecting an empty or repeating identifier list.
    ///
    /// Descriptions for identifiers outside the monitored set are dropped.
    pub fn new(
        key: TargetKey,
        event_ids: Vec<EventId>,
        descriptions: HashMap<EventId, String>,
    ) -> Result<Self> {
        if event_ids.is_empty() {
            bail!("{}: no event IDs configured", key);
        }

        let mut seen = HashSet::with_capacity(event_ids.len());
        for id in &event_ids {
            if !seen.insert(*id) {
                bail!("{}: event ID {} listed more than once", key, id);
            }
        }

        let descriptions = descriptions
            .into_iter()
            .filter(|(id, _)| seen.contains(id))
            .collect();

        Ok(Self {
            key,
            event_ids,
            descriptions,
        })
    }

    pub fn key(&self) -> &TargetKey {
        &self.key
    }

    pub fn host(&self) -> &str {
        &self.key.host
    }

    pub fn log_name(&self) -> &str {
        &self.key.log_name
    }

    /// Monitored identifiers in configuration order.
    pub fn event_ids(&self) -> &[EventId] {
        &self.event_ids
    }

    /// Returns true if `id` belongs to the monitored set.
    pub fn monitors(&self, id: EventId) -> bool {
        self.event_ids.contains(&id)
    }

    /// Human-readable description, if one was configured.
    pub fn description(&self, id: EventId) -> Option<&str> {
        self.descriptions.get(&id).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_empty_ids() {
        let err = MonitorTarget::new(TargetKey::new("srv", "System"), vec![], HashMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("no event IDs"));
    }

    #[test]
    fn test_new_rejects_duplicate_ids() {
        let err = MonitorTarget::new(
            TargetKey::new("srv", "System"),
            vec![4624, 4625, 4624],
            HashMap::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("4624"));
    }

    #[test]
    fn test_descriptions_filtered_to_monitored_ids() {
        let descriptions = HashMap::from([
            (1111, "Logon".to_string()),
            (3333, "Unrelated".to_string()),
        ]);
        let target = MonitorTarget::new(
            TargetKey::new("srv", "Security"),
            vec![1111, 2222],
            descriptions,
        )
        .unwrap();

        assert_eq!(target.description(1111), Some("Logon"));
        assert_eq!(target.description(2222), None);
        assert_eq!(target.description(3333), None);
        assert!(target.monitors(2222));
        assert!(!target.monitors(3333));
    }

    #[test]
    fn test_key_display_matches_worker_name() {
        let key = TargetKey::new("dc01", "Security");
        assert_eq!(key.to_string(), "Security_dc01");
    }
}
