use anyhow::Result;
use bench_core::{BenchError, CacheStats, CampaignRecord, ModelRunRecord, UniqueTableStats};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS models (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    format TEXT NOT NULL,
    comments TEXT,
    body BLOB,
    UNIQUE(name, format)
 );
 CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    start TEXT NOT NULL UNIQUE,
    end TEXT NOT NULL,
    host TEXT NOT NULL,
    tool_version TEXT NOT NULL,
    comments TEXT,
    time_limit REAL NOT NULL
 );
 CREATE TABLE IF NOT EXISTS options (
    id INTEGER PRIMARY KEY,
    option TEXT NOT NULL UNIQUE
 );
 CREATE TABLE IF NOT EXISTS run_options (
    run_id INTEGER NOT NULL REFERENCES runs(id),
    option_id INTEGER NOT NULL REFERENCES options(id)
 );
 CREATE TABLE IF NOT EXISTS modelruns (
    id INTEGER PRIMARY KEY,
    interrupted INTEGER NOT NULL,
    states REAL,
    relation_time REAL NOT NULL,
    rewrite_time REAL NOT NULL,
    state_space_time REAL NOT NULL,
    force_time REAL,
    dead_relation_time REAL,
    dead_rewrite_time REAL,
    dead_time REAL,
    final_bytes INTEGER,
    final_flat_nodes INTEGER,
    final_hier_nodes INTEGER,
    final_flat_arcs INTEGER,
    final_hier_arcs INTEGER,
    run_id INTEGER NOT NULL REFERENCES runs(id),
    model_id INTEGER NOT NULL REFERENCES models(id)
 );
 CREATE TABLE IF NOT EXISTS sdd_unique_tables (
    id INTEGER PRIMARY KEY,
    nb INTEGER, peak INTEGER, accesses INTEGER, misses INTEGER, load_factor REAL,
    model_run_id INTEGER NOT NULL REFERENCES modelruns(id)
 );
 CREATE TABLE IF NOT EXISTS hom_unique_tables (
    id INTEGER PRIMARY KEY,
    nb INTEGER, peak INTEGER, accesses INTEGER, misses INTEGER, load_factor REAL,
    model_run_id INTEGER NOT NULL REFERENCES modelruns(id)
 );
 CREATE TABLE IF NOT EXISTS sdd_diff_caches (
    id INTEGER PRIMARY KEY,
    hits INTEGER, misses INTEGER, filtered INTEGER, discarded INTEGER,
    model_run_id INTEGER NOT NULL REFERENCES modelruns(id)
 );
 CREATE TABLE IF NOT EXISTS sdd_inter_caches (
    id INTEGER PRIMARY KEY,
    hits INTEGER, misses INTEGER, filtered INTEGER, discarded INTEGER,
    model_run_id INTEGER NOT NULL REFERENCES modelruns(id)
 );
 CREATE TABLE IF NOT EXISTS sdd_sum_caches (
    id INTEGER PRIMARY KEY,
    hits INTEGER, misses INTEGER, filtered INTEGER, discarded INTEGER,
    model_run_id INTEGER NOT NULL REFERENCES modelruns(id)
 );
 CREATE TABLE IF NOT EXISTS hom_caches (
    id INTEGER PRIMARY KEY,
    hits INTEGER, misses INTEGER, filtered INTEGER, discarded INTEGER,
    model_run_id INTEGER NOT NULL REFERENCES modelruns(id)
 );";

/// Read-only snapshot of a stored model, body still compressed.
#[derive(Debug, Clone)]
pub struct Model {
    pub id: i64,
    pub name: String,
    pub format: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RunInfo {
    pub id: i64,
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub host: String,
    pub tool_version: String,
    pub time_limit: f64,
}

/// One persisted outcome joined with its model name, as the comparator
/// consumes it.
#[derive(Debug, Clone)]
pub struct StoredModelRun {
    pub model_name: String,
    pub interrupted: bool,
    pub states: Option<f64>,
    pub state_space_time: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddModelOutcome {
    Added(i64),
    Duplicate(i64),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImportSummary {
    pub added: usize,
    pub duplicates: usize,
    pub ignored: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct IngestSummary {
    pub run_id: i64,
    pub ingested: usize,
    pub skipped_unknown_model: usize,
}

pub fn compress_model_body(raw: &[u8]) -> Result<Vec<u8>> {
    Ok(zstd::encode_all(raw, zstd::DEFAULT_COMPRESSION_LEVEL)?)
}

pub fn decompress_model_body(compressed: &[u8]) -> Result<Vec<u8>> {
    Ok(zstd::decode_all(compressed)?)
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Find-or-create on (name, format). Re-adding an existing model is a
    /// no-op reported as a duplicate, not an error.
    pub fn add_model(&self, name: &str, format: &str, raw_body: &[u8]) -> Result<AddModelOutcome> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM models WHERE name = ?1 AND format = ?2",
                params![name, format],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(AddModelOutcome::Duplicate(id));
        }
        let body = compress_model_body(raw_body)?;
        self.conn.execute(
            "INSERT INTO models (name, format, body) VALUES (?1, ?2, ?3)",
            params![name, format, body],
        )?;
        Ok(AddModelOutcome::Added(self.conn.last_insert_rowid()))
    }

    /// Walk a directory tree and add every plain file as a model of the
    /// given format. Dotfiles are ignored.
    pub fn import_models(&self, dir: &Path, format: &str) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();
        for entry in walkdir::WalkDir::new(dir) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                info!(path = %entry.path().display(), "ignoring");
                summary.ignored += 1;
                continue;
            }
            let raw = fs::read(entry.path())?;
            match self.add_model(&name, format, &raw)? {
                AddModelOutcome::Added(_) => {
                    info!(model = %name, format, "added");
                    summary.added += 1;
                }
                AddModelOutcome::Duplicate(_) => {
                    warn!(model = %name, format, "already exists");
                    summary.duplicates += 1;
                }
            }
        }
        Ok(summary)
    }

    /// All models, bodies compressed, for the scheduler to iterate.
    pub fn models(&self) -> Result<Vec<Model>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, format, body FROM models ORDER BY name")?;
        let rows = stmt.query_map([], |r| {
            Ok(Model {
                id: r.get(0)?,
                name: r.get(1)?,
                format: r.get(2)?,
                body: r.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn run(&self, id: i64) -> Result<Option<RunInfo>> {
        let info = self
            .conn
            .query_row(
                "SELECT id, name, start, end, host, tool_version, time_limit
                 FROM runs WHERE id = ?1",
                params![id],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, String>(4)?,
                        r.get::<_, String>(5)?,
                        r.get::<_, f64>(6)?,
                    ))
                },
            )
            .optional()?;
        match info {
            None => Ok(None),
            Some((id, name, start, end, host, tool_version, time_limit)) => Ok(Some(RunInfo {
                id,
                name,
                start: parse_timestamp(&start)?,
                end: parse_timestamp(&end)?,
                host,
                tool_version,
                time_limit,
            })),
        }
    }

    /// Outcomes of one run, joined with model names.
    pub fn model_runs(&self, run_id: i64) -> Result<Vec<StoredModelRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT m.name, mr.interrupted, mr.states, mr.state_space_time
             FROM modelruns mr JOIN models m ON m.id = mr.model_id
             WHERE mr.run_id = ?1 ORDER BY mr.id",
        )?;
        let rows = stmt.query_map(params![run_id], |r| {
            Ok(StoredModelRun {
                model_name: r.get(0)?,
                interrupted: r.get(1)?,
                states: r.get(2)?,
                state_space_time: r.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Persist a normalized campaign in a single transaction.
    ///
    /// A start-timestamp collision with an existing run rejects the whole
    /// campaign and leaves the store unchanged. An outcome naming a model
    /// that is not in the store is skipped with a diagnostic; the rest of
    /// the campaign is still committed.
    pub fn ingest_run(&mut self, record: &CampaignRecord) -> Result<IngestSummary> {
        let tx = self.conn.transaction()?;

        let start = record.start.to_rfc3339();
        let collision: Option<i64> = tx
            .query_row("SELECT id FROM runs WHERE start = ?1", params![start], |r| {
                r.get(0)
            })
            .optional()?;
        if collision.is_some() {
            return Err(BenchError::DuplicateRun(record.start).into());
        }

        tx.execute(
            "INSERT INTO runs (name, start, end, host, tool_version, comments, time_limit)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.name,
                start,
                record.end.to_rfc3339(),
                record.host,
                record.tool_version,
                record.comments,
                record.time_limit,
            ],
        )?;
        let run_id = tx.last_insert_rowid();

        for option in &record.options {
            let option_id = find_or_create_option(&tx, option)?;
            tx.execute(
                "INSERT INTO run_options (run_id, option_id) VALUES (?1, ?2)",
                params![run_id, option_id],
            )?;
        }

        let mut ingested = 0usize;
        let mut skipped = 0usize;
        for (model_name, mrun) in &record.model_runs {
            let model_id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM models WHERE name = ?1 LIMIT 1",
                    params![model_name],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(model_id) = model_id else {
                warn!(model = %model_name, "model is not in the database, skipping");
                skipped += 1;
                continue;
            };
            insert_model_run(&tx, run_id, model_id, mrun)?;
            ingested += 1;
        }

        tx.commit()?;
        Ok(IngestSummary {
            run_id,
            ingested,
            skipped_unknown_model: skipped,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn find_or_create_option(tx: &Transaction<'_>, option: &str) -> Result<i64> {
    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM options WHERE option = ?1",
            params![option],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    tx.execute("INSERT INTO options (option) VALUES (?1)", params![option])?;
    Ok(tx.last_insert_rowid())
}

fn insert_model_run(
    tx: &Transaction<'_>,
    run_id: i64,
    model_id: i64,
    mrun: &ModelRunRecord,
) -> Result<()> {
    tx.execute(
        "INSERT INTO modelruns (
            interrupted, states, relation_time, rewrite_time, state_space_time,
            force_time, dead_relation_time, dead_rewrite_time, dead_time,
            final_bytes, final_flat_nodes, final_hier_nodes, final_flat_arcs, final_hier_arcs,
            run_id, model_id
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            mrun.interrupted,
            mrun.states,
            mrun.relation_time,
            mrun.rewrite_time,
            mrun.state_space_time,
            mrun.force_time,
            mrun.dead_relation_time,
            mrun.dead_rewrite_time,
            mrun.dead_time,
            mrun.final_bytes.map(|v| v as i64),
            mrun.final_flat_nodes.map(|v| v as i64),
            mrun.final_hier_nodes.map(|v| v as i64),
            mrun.final_flat_arcs.map(|v| v as i64),
            mrun.final_hier_arcs.map(|v| v as i64),
            run_id,
            model_id,
        ],
    )?;
    let model_run_id = tx.last_insert_rowid();

    if let Some(ut) = &mrun.sdd_unique_table {
        insert_unique_table(tx, "sdd_unique_tables", model_run_id, ut)?;
    }
    if let Some(ut) = &mrun.hom_unique_table {
        insert_unique_table(tx, "hom_unique_tables", model_run_id, ut)?;
    }
    if let Some(c) = &mrun.sdd_diff_cache {
        insert_cache(tx, "sdd_diff_caches", model_run_id, c)?;
    }
    if let Some(c) = &mrun.sdd_inter_cache {
        insert_cache(tx, "sdd_inter_caches", model_run_id, c)?;
    }
    if let Some(c) = &mrun.sdd_sum_cache {
        insert_cache(tx, "sdd_sum_caches", model_run_id, c)?;
    }
    if let Some(c) = &mrun.hom_cache {
        insert_cache(tx, "hom_caches", model_run_id, c)?;
    }
    Ok(())
}

fn insert_unique_table(
    tx: &Transaction<'_>,
    table: &str,
    model_run_id: i64,
    ut: &UniqueTableStats,
) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} (nb, peak, accesses, misses, load_factor, model_run_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        table
    );
    tx.execute(
        &sql,
        params![
            ut.count.map(|v| v as i64),
            ut.peak.map(|v| v as i64),
            ut.accesses.map(|v| v as i64),
            ut.misses.map(|v| v as i64),
            ut.load_factor,
            model_run_id,
        ],
    )?;
    Ok(())
}

fn insert_cache(
    tx: &Transaction<'_>,
    table: &str,
    model_run_id: i64,
    cache: &CacheStats,
) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} (hits, misses, filtered, discarded, model_run_id)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        table
    );
    tx.execute(
        &sql,
        params![
            cache.hits.map(|v| v as i64),
            cache.misses.map(|v| v as i64),
            cache.filtered.map(|v| v as i64),
            cache.discarded.map(|v| v as i64),
            model_run_id,
        ],
    )?;
    Ok(())
}
