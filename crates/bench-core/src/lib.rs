use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::Command;

pub mod error;

pub use error::BenchError;

/// Version tag of the campaign configuration snapshot format.
pub const CONFIG_VERSION: &str = "2";

/// Name of the configuration snapshot written at the end of a campaign.
pub const CONFIG_FILE: &str = "config.json";

/// Subdirectory of a campaign output tree holding per-model artifacts.
pub const DATA_DIR: &str = "data";

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn atomic_write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Host identity recorded in campaign snapshots. Honors `PNBENCH_HOST` so
/// campaigns replayed in containers can pin a stable name.
pub fn host_identity() -> String {
    std::env::var("PNBENCH_HOST")
        .or_else(|_| {
            Command::new("hostname")
                .output()
                .ok()
                .and_then(|o| String::from_utf8(o.stdout).ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .ok_or(std::env::VarError::NotPresent)
        })
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Campaign configuration snapshot, written once when a campaign ends and
/// required later as the sole handoff artifact for standalone ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignSnapshot {
    pub config_version: String,
    pub name: String,
    pub epoch_start: i64,
    pub epoch_end: i64,
    pub host: String,
    pub options: Vec<String>,
    pub tool_version: String,
    pub time_limit: u64,
}

impl CampaignSnapshot {
    pub fn start(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp(self.epoch_start, 0)
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp(self.epoch_end, 0)
    }
}

/// Counters of one unique table, stored without interpretation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UniqueTableStats {
    pub count: Option<u64>,
    pub peak: Option<u64>,
    pub accesses: Option<u64>,
    pub misses: Option<u64>,
    pub load_factor: Option<f64>,
}

impl UniqueTableStats {
    /// The tool guarantees hits + misses <= accesses. The hit counter is
    /// not persisted, so the caller passes it alongside. Violations are
    /// surfaced as warnings, never as hard failures.
    pub fn is_consistent_with(&self, hits: Option<u64>) -> bool {
        match (hits, self.misses, self.accesses) {
            (Some(h), Some(m), Some(a)) => h.saturating_add(m) <= a,
            _ => true,
        }
    }
}

/// Counters of one operation cache, stored without interpretation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: Option<u64>,
    pub misses: Option<u64>,
    pub filtered: Option<u64>,
    pub discarded: Option<u64>,
}

impl CacheStats {
    /// The tool guarantees filtered + discarded <= misses. Violations are
    /// surfaced as warnings, never as hard failures.
    pub fn is_consistent(&self) -> bool {
        match (self.filtered, self.discarded, self.misses) {
            (Some(f), Some(d), Some(m)) => f.saturating_add(d) <= m,
            _ => true,
        }
    }
}

/// Canonical outcome of one model under one campaign. Constructed by the
/// normalizer, persisted once, never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRunRecord {
    pub interrupted: bool,
    pub states: Option<f64>,
    pub relation_time: f64,
    pub rewrite_time: f64,
    pub state_space_time: f64,
    pub force_time: Option<f64>,
    pub dead_relation_time: Option<f64>,
    pub dead_rewrite_time: Option<f64>,
    pub dead_time: Option<f64>,

    pub final_bytes: Option<u64>,
    pub final_flat_nodes: Option<u64>,
    pub final_hier_nodes: Option<u64>,
    pub final_flat_arcs: Option<u64>,
    pub final_hier_arcs: Option<u64>,

    pub sdd_unique_table: Option<UniqueTableStats>,
    pub hom_unique_table: Option<UniqueTableStats>,
    pub sdd_diff_cache: Option<CacheStats>,
    pub sdd_inter_cache: Option<CacheStats>,
    pub sdd_sum_cache: Option<CacheStats>,
    pub hom_cache: Option<CacheStats>,
}

impl ModelRunRecord {
    pub fn has_statistics(&self) -> bool {
        self.sdd_unique_table.is_some()
            || self.hom_unique_table.is_some()
            || self.sdd_diff_cache.is_some()
            || self.sdd_inter_cache.is_some()
            || self.sdd_sum_cache.is_some()
            || self.hom_cache.is_some()
    }

    pub fn has_final_sizes(&self) -> bool {
        self.final_bytes.is_some()
            || self.final_flat_nodes.is_some()
            || self.final_hier_nodes.is_some()
            || self.final_flat_arcs.is_some()
            || self.final_hier_arcs.is_some()
    }

    /// Interrupted runs carry no full-completion data.
    pub fn invariants_hold(&self) -> bool {
        if self.interrupted {
            self.states.is_none() && !self.has_final_sizes() && !self.has_statistics()
        } else {
            true
        }
    }
}

/// A campaign fully normalized and ready to hand to the store.
#[derive(Debug, Clone)]
pub struct CampaignRecord {
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub host: String,
    pub tool_version: String,
    pub comments: Option<String>,
    pub time_limit: f64,
    pub options: Vec<String>,
    /// (model name, outcome) pairs, in output-tree order.
    pub model_runs: Vec<(String, ModelRunRecord)>,
}
