use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};

use crate::target::{EventId, MonitorTarget, TargetKey};

/// Top-level configuration file.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// host -> log name -> monitored event IDs.
    #[serde(rename = "Servers")]
    pub servers: UniqueMap<UniqueMap<Vec<EventId>>>,

    /// log name -> event ID (as a string) -> description.
    #[serde(rename = "Event Descriptions", default)]
    pub event_descriptions: UniqueMap<UniqueMap<String>>,

    /// Runtime settings. Every field has a default.
    #[serde(rename = "Settings", default)]
    pub settings: Settings,
}

/// Supervisor, source and export settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Delay between a worker's death and its respawn. Default: 5m.
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,

    /// How often a snapshot of all targets is exported. Default: 6h.
    #[serde(default = "default_export_interval", with = "humantime_serde")]
    pub export_interval: Duration,

    /// Control loop granularity. Default: 1s.
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,

    /// How long a file reader waits before re-checking an idle log. Default: 1s.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Directory snapshots are written to. Default: current directory.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Root of the `<host>/<log>.jsonl` event log tree. Default: "eventlogs".
    #[serde(default = "default_source_root")]
    pub source_root: PathBuf,

    /// Health metrics listen address. Empty disables the server.
    #[serde(default)]
    pub health_addr: String,
}

// --- Default value functions ---

fn default_retry_delay() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_export_interval() -> Duration {
    Duration::from_secs(6 * 60 * 60)
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_source_root() -> PathBuf {
    PathBuf::from("eventlogs")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retry_delay: default_retry_delay(),
            export_interval: default_export_interval(),
            tick_interval: default_tick_interval(),
            poll_interval: default_poll_interval(),
            output_dir: default_output_dir(),
            source_root: default_source_root(),
            health_addr: String::new(),
        }
    }
}

/// JSON object that keeps key order and rejects repeated keys.
///
/// A plain map would silently keep the last of two identical keys.
#[derive(Debug, Clone, PartialEq)]
pub struct UniqueMap<V>(pub Vec<(String, V)>);

impl<V> Default for UniqueMap<V> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<V> UniqueMap<V> {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for UniqueMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct UniqueMapVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for UniqueMapVisitor<V> {
            type Value = UniqueMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object with unique keys")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut seen = HashSet::new();
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));

                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    if !seen.insert(key.clone()) {
                        return Err(serde::de::Error::custom(format!("duplicate key \"{key}\"")));
                    }
                    entries.push((key, value));
                }

                Ok(UniqueMap(entries))
            }
        }

        deserializer.deserialize_map(UniqueMapVisitor(PhantomData))
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_json::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            bail!("Servers must list at least one host");
        }

        // Hostnames and log names are case-insensitive on the systems that
        // own them, so "DC01/Security" and "dc01/security" are one target.
        let mut seen = HashSet::new();
        for (host, logs) in self.servers.iter() {
            if host.is_empty() {
                bail!("Servers: empty host name");
            }
            if logs.is_empty() {
                bail!("Servers.{host}: no logs configured");
            }

            for (log, ids) in logs.iter() {
                if log.is_empty() {
                    bail!("Servers.{host}: empty log name");
                }
                if !seen.insert((host.to_lowercase(), log.to_lowercase())) {
                    bail!("Servers.{host}.{log}: target configured more than once");
                }
                if ids.is_empty() {
                    bail!("Servers.{host}.{log}: no event IDs configured");
                }

                let mut unique = HashSet::with_capacity(ids.len());
                for id in ids {
                    if !unique.insert(id) {
                        bail!("Servers.{host}.{log}: event ID {id} listed more than once");
                    }
                }
            }
        }

        for (log, descriptions) in self.event_descriptions.iter() {
            let mut parsed = HashSet::new();
            for (id, _) in descriptions.iter() {
                let Ok(value) = id.trim().parse::<EventId>() else {
                    bail!("Event Descriptions.{log}: \"{id}\" is not an event ID");
                };
                if !parsed.insert(value) {
                    bail!("Event Descriptions.{log}: \"{id}\" repeats event ID {value}");
                }
            }
        }

        let s = &self.settings;
        if s.retry_delay.is_zero() {
            bail!("Settings.retry_delay must be positive");
        }
        if s.export_interval.is_zero() {
            bail!("Settings.export_interval must be positive");
        }
        if s.tick_interval.is_zero() {
            bail!("Settings.tick_interval must be positive");
        }
        if s.poll_interval.is_zero() {
            bail!("Settings.poll_interval must be positive");
        }
        if s.tick_interval > s.retry_delay {
            bail!("Settings.tick_interval must not exceed Settings.retry_delay");
        }

        Ok(())
    }

    /// Descriptions configured for `log`, keyed by event ID.
    pub fn descriptions_for(&self, log: &str) -> HashMap<EventId, String> {
        self.event_descriptions
            .get(log)
            .map(|descriptions| {
                descriptions
                    .iter()
                    .filter_map(|(id, text)| Some((id.trim().parse().ok()?, text.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Builds one target per configured (host, log) pair, in file order.
    pub fn targets(&self) -> Result<Vec<MonitorTarget>> {
        let mut targets = Vec::new();

        for (host, logs) in self.servers.iter() {
            for (log, ids) in logs.iter() {
                let target = MonitorTarget::new(
                    TargetKey::new(host, log),
                    ids.clone(),
                    self.descriptions_for(log),
                )?;
                targets.push(target);
            }
        }

        Ok(targets)
    }
}
