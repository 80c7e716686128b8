use anyhow::{Context, Result};
use bench_core::{
    BenchError, CacheStats, CampaignRecord, CampaignSnapshot, ModelRunRecord, UniqueTableStats,
    CONFIG_FILE, DATA_DIR,
};
use bench_store::{IngestSummary, Store};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Raw per-model statistics artifact, exactly as the tool emits it. Keys
/// carry spaces and `#` prefixes; everything beyond the core timings is
/// optional because older tool versions omit whole sections.
#[derive(Debug, Deserialize)]
struct StatsDoc {
    pnmc: StatsBody,
}

#[derive(Debug, Deserialize)]
struct StatsBody {
    interrupted: bool,
    #[serde(rename = "relation time")]
    relation_time: f64,
    #[serde(rename = "rewrite time")]
    rewrite_time: f64,
    #[serde(rename = "state space time")]
    state_space_time: f64,
    #[serde(rename = "FORCE time")]
    force_time: Option<f64>,
    #[serde(rename = "dead states relation time")]
    dead_relation_time: Option<f64>,
    #[serde(rename = "dead states rewrite time")]
    dead_rewrite_time: Option<f64>,
    #[serde(rename = "dead states time")]
    dead_time: Option<f64>,
    #[serde(rename = "state space")]
    state_space: Option<RawFinalSizes>,
    libsdd: Option<RawLibsdd>,
}

#[derive(Debug, Deserialize)]
struct RawFinalSizes {
    bytes: Option<u64>,
    #[serde(rename = "flat nodes")]
    flat_nodes: Option<u64>,
    #[serde(rename = "hierarchical nodes")]
    hier_nodes: Option<u64>,
    #[serde(rename = "flat arcs")]
    flat_arcs: Option<u64>,
    #[serde(rename = "hierarchical arcs")]
    hier_arcs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawLibsdd {
    #[serde(rename = "SDD unique table")]
    sdd_unique_table: Option<RawUniqueTable>,
    #[serde(rename = "hom unique table")]
    hom_unique_table: Option<RawUniqueTable>,
    #[serde(rename = "SDD differences cache")]
    sdd_diff_cache: Option<RawCache>,
    #[serde(rename = "SDD intersections cache")]
    sdd_inter_cache: Option<RawCache>,
    #[serde(rename = "SDD sums cache")]
    sdd_sum_cache: Option<RawCache>,
    #[serde(rename = "hom cache")]
    hom_cache: Option<RawCache>,
}

#[derive(Debug, Deserialize)]
struct RawUniqueTable {
    #[serde(rename = "#")]
    count: Option<u64>,
    #[serde(rename = "# peak")]
    peak: Option<u64>,
    #[serde(rename = "# accesses")]
    accesses: Option<u64>,
    // only read back for the consistency check, never persisted
    #[serde(rename = "# hits")]
    hits: Option<u64>,
    #[serde(rename = "# misses")]
    misses: Option<u64>,
    #[serde(rename = "load factor")]
    load_factor: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawCache {
    #[serde(rename = "# hits")]
    hits: Option<u64>,
    #[serde(rename = "# misses")]
    misses: Option<u64>,
    #[serde(rename = "# filtered")]
    filtered: Option<u64>,
    #[serde(rename = "# discarded")]
    discarded: Option<u64>,
}

/// The results artifact exists only when the tool ran to completion.
#[derive(Debug, Deserialize)]
struct ResultsDoc {
    pnmc: ResultsBody,
}

#[derive(Debug, Deserialize)]
struct ResultsBody {
    states: f64,
}

impl From<RawUniqueTable> for UniqueTableStats {
    fn from(raw: RawUniqueTable) -> Self {
        UniqueTableStats {
            count: raw.count,
            peak: raw.peak,
            accesses: raw.accesses,
            misses: raw.misses,
            load_factor: raw.load_factor,
        }
    }
}

impl From<RawCache> for CacheStats {
    fn from(raw: RawCache) -> Self {
        CacheStats {
            hits: raw.hits,
            misses: raw.misses,
            filtered: raw.filtered,
            discarded: raw.discarded,
        }
    }
}

/// Normalize a campaign output tree into a [`CampaignRecord`].
///
/// The configuration snapshot is mandatory. Per-model artifacts are best
/// effort: a model without `stats.json` produced nothing usable, a model
/// whose artifacts cannot be parsed is reported and skipped. Neither aborts
/// the campaign.
pub fn load_campaign(dir: &Path) -> Result<CampaignRecord> {
    let config_path = dir.join(CONFIG_FILE);
    let raw = fs::read(&config_path)
        .with_context(|| format!("reading {}", config_path.display()))?;
    let snapshot: CampaignSnapshot = serde_json::from_slice(&raw)
        .map_err(|_| BenchError::MalformedResult(config_path.clone()))?;
    let start = snapshot
        .start()
        .ok_or_else(|| BenchError::MalformedResult(config_path.clone()))?;
    let end = snapshot
        .end()
        .ok_or_else(|| BenchError::MalformedResult(config_path))?;

    let comments = fs::read_to_string(dir.join("comments")).ok();

    let mut record = CampaignRecord {
        name: snapshot.name,
        start,
        end,
        host: snapshot.host,
        tool_version: snapshot.tool_version,
        comments,
        time_limit: snapshot.time_limit as f64,
        options: snapshot.options,
        model_runs: Vec::new(),
    };

    let data_dir = dir.join(DATA_DIR);
    let mut entries: Vec<_> = fs::read_dir(&data_dir)
        .with_context(|| format!("reading {}", data_dir.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        match load_model_artifacts(&entry.path(), record.time_limit) {
            Ok(Some(mrun)) => {
                debug!(model = %name, interrupted = mrun.interrupted, "normalized");
                record.model_runs.push((name, mrun));
            }
            Ok(None) => {
                info!(model = %name, "no statistics artifact, skipping");
            }
            Err(e) => {
                warn!(model = %name, "{}", e);
            }
        }
    }
    Ok(record)
}

/// Read and normalize one model directory. `Ok(None)` means the model left
/// no statistics artifact at all.
fn load_model_artifacts(model_dir: &Path, time_limit: f64) -> Result<Option<ModelRunRecord>> {
    let stats_path = model_dir.join("stats.json");
    if !stats_path.is_file() {
        return Ok(None);
    }
    let stats: StatsDoc = serde_json::from_slice(&fs::read(&stats_path)?)
        .map_err(|_| BenchError::MalformedResult(stats_path.clone()))?;

    let results_path = model_dir.join("results.json");
    let results: Option<ResultsDoc> = if results_path.is_file() {
        Some(
            serde_json::from_slice(&fs::read(&results_path)?)
                .map_err(|_| BenchError::MalformedResult(results_path))?,
        )
    } else {
        None
    };

    Ok(Some(normalize(stats.pnmc, results, time_limit)))
}

fn normalize(stats: StatsBody, results: Option<ResultsDoc>, time_limit: f64) -> ModelRunRecord {
    let mut mrun = ModelRunRecord {
        interrupted: stats.interrupted,
        states: results.map(|r| r.pnmc.states),
        relation_time: stats.relation_time,
        rewrite_time: stats.rewrite_time,
        state_space_time: stats.state_space_time,
        force_time: stats.force_time,
        dead_relation_time: stats.dead_relation_time,
        dead_rewrite_time: stats.dead_rewrite_time,
        dead_time: stats.dead_time,
        ..Default::default()
    };

    // An interrupted run reports a zero construction time. Substitute the
    // campaign limit so rankings place it after every completed run.
    if mrun.state_space_time == 0.0 {
        mrun.state_space_time = time_limit;
    }

    // Final sizes and engine counters only mean something for a completed
    // state space; without a results artifact they are dropped.
    if mrun.states.is_some() {
        if let Some(sizes) = stats.state_space {
            mrun.final_bytes = sizes.bytes;
            mrun.final_flat_nodes = sizes.flat_nodes;
            mrun.final_hier_nodes = sizes.hier_nodes;
            mrun.final_flat_arcs = sizes.flat_arcs;
            mrun.final_hier_arcs = sizes.hier_arcs;
        }
        if let Some(libsdd) = stats.libsdd {
            mrun.sdd_unique_table = libsdd.sdd_unique_table.map(check_unique_table("SDD"));
            mrun.hom_unique_table = libsdd.hom_unique_table.map(check_unique_table("hom"));
            mrun.sdd_diff_cache = libsdd.sdd_diff_cache.map(check_cache("SDD differences"));
            mrun.sdd_inter_cache = libsdd.sdd_inter_cache.map(check_cache("SDD intersections"));
            mrun.sdd_sum_cache = libsdd.sdd_sum_cache.map(check_cache("SDD sums"));
            mrun.hom_cache = libsdd.hom_cache.map(check_cache("hom"));
        }
    }
    mrun
}

fn check_unique_table(which: &'static str) -> impl Fn(RawUniqueTable) -> UniqueTableStats {
    move |raw| {
        let hits = raw.hits;
        let table = UniqueTableStats::from(raw);
        if !table.is_consistent_with(hits) {
            warn!(table = which, "hits + misses exceeds accesses");
        }
        table
    }
}

fn check_cache(which: &'static str) -> impl Fn(RawCache) -> CacheStats {
    move |raw| {
        let cache = CacheStats::from(raw);
        if !cache.is_consistent() {
            warn!(cache = which, "filtered + discarded exceeds misses");
        }
        cache
    }
}

/// Normalize a campaign output tree and persist it in one transaction.
pub fn ingest_campaign(store: &mut Store, dir: &Path) -> Result<IngestSummary> {
    let record = load_campaign(dir)?;
    let summary = store.ingest_run(&record)?;
    info!(
        run_id = summary.run_id,
        ingested = summary.ingested,
        skipped = summary.skipped_unknown_model,
        "campaign ingested"
    );
    Ok(summary)
}
