use anyhow::Result;
use bench_core::{atomic_write_bytes, BenchError};
use bench_store::{Store, StoredModelRun};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

/// Decimal separator used when rendering durations. The point form is the
/// machine-friendly default; the comma form matches spreadsheet locales
/// that expect `12,50`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecimalSeparator {
    #[default]
    Point,
    Comma,
}

/// One comparison row: a model, one duration cell per compared run, and
/// the podium. A cell is `None` when the run has no usable outcome for the
/// model (absent or interrupted).
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonRow {
    pub model: String,
    pub cells: Vec<Option<f64>>,
    pub podium: Vec<String>,
}

/// A cross-campaign comparison, ready to render.
#[derive(Debug, Clone)]
pub struct Comparison {
    /// Names of the compared runs, in request order after deduplication.
    pub run_names: Vec<String>,
    /// One row per model, in model-name order.
    pub rows: Vec<ComparisonRow>,
    /// Non-fatal consistency findings; output is produced regardless.
    pub warnings: Vec<String>,
}

/// Compare the outcomes of the given runs across every model that appears
/// in at least one of them. Unknown run identifiers are fatal; consistency
/// findings (differing time limits, disagreeing state counts) are not.
pub fn compare(store: &Store, run_ids: &[i64]) -> Result<Comparison> {
    // Dedup while preserving request order so column order is predictable.
    let mut ids: Vec<i64> = Vec::new();
    for &id in run_ids {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    let mut runs = Vec::with_capacity(ids.len());
    for id in &ids {
        let info = store.run(*id)?.ok_or(BenchError::UnknownRun(*id))?;
        runs.push(info);
    }

    let mut warnings = Vec::new();
    if let Some(first) = runs.first() {
        if runs.iter().any(|r| r.time_limit != first.time_limit) {
            let detail: Vec<String> = runs
                .iter()
                .map(|r| format!("{} -> {}", r.name, r.time_limit))
                .collect();
            warnings.push(format!(
                "runs have different time limits: {}",
                detail.join(", ")
            ));
        }
    }

    // model name -> one slot per compared run
    let mut per_model: BTreeMap<String, Vec<Option<StoredModelRun>>> = BTreeMap::new();
    for (slot, run) in runs.iter().enumerate() {
        for mrun in store.model_runs(run.id)? {
            let model_name = mrun.model_name.clone();
            per_model
                .entry(model_name)
                .or_insert_with(|| vec![None; runs.len()])[slot] = Some(mrun);
        }
    }

    let mut rows = Vec::with_capacity(per_model.len());
    for (model, slots) in per_model {
        let reference_states = slots
            .iter()
            .flatten()
            .find(|m| !m.interrupted)
            .and_then(|m| m.states);
        if let Some(reference) = reference_states {
            let disagrees = slots
                .iter()
                .flatten()
                .filter(|m| !m.interrupted)
                .any(|m| m.states != Some(reference));
            if disagrees {
                warnings.push(format!(
                    "runs disagree on the number of states for model {}",
                    model
                ));
            }
        }

        let cells: Vec<Option<f64>> = slots
            .iter()
            .map(|slot| match slot {
                Some(m) if !m.interrupted => Some(m.state_space_time),
                _ => None,
            })
            .collect();

        // Stable sort: equal times keep the requested run order.
        let mut ranked: Vec<(f64, &str)> = slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Some(m) if !m.interrupted => Some((m.state_space_time, runs[i].name.as_str())),
                _ => None,
            })
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
        let podium = ranked.into_iter().map(|(_, name)| name.to_string()).collect();

        rows.push(ComparisonRow {
            model,
            cells,
            podium,
        });
    }

    for warning in &warnings {
        warn!("{}", warning);
    }

    Ok(Comparison {
        run_names: runs.into_iter().map(|r| r.name).collect(),
        rows,
        warnings,
    })
}

/// Render a duration with two decimals and the requested separator.
pub fn format_seconds(value: f64, separator: DecimalSeparator) -> String {
    let rendered = format!("{:.2}", value);
    match separator {
        DecimalSeparator::Point => rendered,
        DecimalSeparator::Comma => rendered.replace('.', ","),
    }
}

/// Write the comparison as a `;`-delimited table: header row with the run
/// names and rank positions, then one row per model with formatted-or-empty
/// cells followed by the podium.
pub fn write_csv(
    comparison: &Comparison,
    path: &Path,
    separator: DecimalSeparator,
) -> Result<()> {
    let mut out = String::new();

    let mut header: Vec<String> = Vec::with_capacity(1 + 2 * comparison.run_names.len());
    header.push("model".to_string());
    header.extend(comparison.run_names.iter().cloned());
    header.extend((1..=comparison.run_names.len()).map(|i| i.to_string()));
    out.push_str(&header.join(";"));
    out.push('\n');

    for row in &comparison.rows {
        let mut fields: Vec<String> = Vec::with_capacity(1 + row.cells.len() + row.podium.len());
        fields.push(row.model.clone());
        for cell in &row.cells {
            fields.push(match cell {
                Some(time) => format_seconds(*time, separator),
                None => String::new(),
            });
        }
        fields.extend(row.podium.iter().cloned());
        out.push_str(&fields.join(";"));
        out.push('\n');
    }

    atomic_write_bytes(path, out.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::{CampaignRecord, ModelRunRecord};
    use chrono::{TimeZone, Utc};

    fn record(name: &str, start_epoch: i64, time_limit: f64) -> CampaignRecord {
        CampaignRecord {
            name: name.to_string(),
            start: Utc.timestamp_opt(start_epoch, 0).unwrap(),
            end: Utc.timestamp_opt(start_epoch + 600, 0).unwrap(),
            host: "bench01".to_string(),
            tool_version: "pnmc 1.0".to_string(),
            comments: None,
            time_limit,
            options: vec!["--order=force".to_string()],
            model_runs: Vec::new(),
        }
    }

    fn completed(time: f64, states: f64) -> ModelRunRecord {
        ModelRunRecord {
            states: Some(states),
            state_space_time: time,
            ..Default::default()
        }
    }

    fn interrupted(time: f64) -> ModelRunRecord {
        ModelRunRecord {
            interrupted: true,
            state_space_time: time,
            ..Default::default()
        }
    }

    fn seeded_store(campaigns: Vec<CampaignRecord>) -> (Store, Vec<i64>) {
        let mut store = Store::open_in_memory().expect("store");
        let mut names: Vec<&str> = campaigns
            .iter()
            .flat_map(|c| c.model_runs.iter().map(|(n, _)| n.as_str()))
            .collect();
        names.sort_unstable();
        names.dedup();
        for name in names {
            store.add_model(name, "pnml", b"body").expect("add model");
        }
        let mut ids = Vec::new();
        for campaign in &campaigns {
            ids.push(store.ingest_run(campaign).expect("ingest").run_id);
        }
        (store, ids)
    }

    #[test]
    fn interrupted_run_yields_null_cell_and_no_podium_entry() {
        let mut r1 = record("R1", 1_700_000_000, 600.0);
        r1.model_runs.push(("m1".to_string(), completed(5.0, 42.0)));
        let mut r2 = record("R2", 1_700_100_000, 600.0);
        r2.model_runs.push(("m1".to_string(), interrupted(600.0)));

        let (store, ids) = seeded_store(vec![r1, r2]);
        let cmp = compare(&store, &ids).expect("compare");

        assert_eq!(cmp.run_names, vec!["R1", "R2"]);
        assert_eq!(cmp.rows.len(), 1);
        let row = &cmp.rows[0];
        assert_eq!(row.model, "m1");
        assert_eq!(row.cells, vec![Some(5.0), None]);
        assert_eq!(row.podium, vec!["R1"]);
        assert!(cmp.warnings.is_empty());
    }

    #[test]
    fn podium_sorts_ascending_and_ties_keep_request_order() {
        let mut r1 = record("R1", 1_700_000_000, 600.0);
        r1.model_runs.push(("m1".to_string(), completed(8.0, 42.0)));
        r1.model_runs.push(("m2".to_string(), completed(3.0, 10.0)));
        let mut r2 = record("R2", 1_700_100_000, 600.0);
        r2.model_runs.push(("m1".to_string(), completed(2.0, 42.0)));
        r2.model_runs.push(("m2".to_string(), completed(3.0, 10.0)));
        let mut r3 = record("R3", 1_700_200_000, 600.0);
        r3.model_runs.push(("m1".to_string(), completed(4.0, 42.0)));

        let (store, ids) = seeded_store(vec![r1, r2, r3]);
        let cmp = compare(&store, &ids).expect("compare");

        let m1 = &cmp.rows[0];
        assert_eq!(m1.model, "m1");
        assert_eq!(m1.podium, vec!["R2", "R3", "R1"]);

        let m2 = &cmp.rows[1];
        assert_eq!(m2.model, "m2");
        assert_eq!(m2.cells, vec![Some(3.0), Some(3.0), None]);
        assert_eq!(m2.podium, vec!["R1", "R2"]);
    }

    #[test]
    fn unknown_run_identifier_is_fatal() {
        let (store, _) = seeded_store(vec![record("R1", 1_700_000_000, 600.0)]);
        let err = compare(&store, &[9999]).expect_err("must fail");
        assert!(matches!(
            err.downcast_ref::<BenchError>(),
            Some(BenchError::UnknownRun(9999))
        ));
    }

    #[test]
    fn consistency_findings_are_warnings_not_failures() {
        let mut r1 = record("R1", 1_700_000_000, 600.0);
        r1.model_runs.push(("m1".to_string(), completed(5.0, 42.0)));
        let mut r2 = record("R2", 1_700_100_000, 300.0);
        r2.model_runs.push(("m1".to_string(), completed(6.0, 43.0)));

        let (store, ids) = seeded_store(vec![r1, r2]);
        let cmp = compare(&store, &ids).expect("compare");

        assert_eq!(cmp.warnings.len(), 2);
        assert!(cmp.warnings[0].contains("different time limits"));
        assert!(cmp.warnings[1].contains("number of states for model m1"));
        assert_eq!(cmp.rows[0].podium, vec!["R1", "R2"]);
    }

    #[test]
    fn duplicate_run_identifiers_collapse_to_one_column() {
        let mut r1 = record("R1", 1_700_000_000, 600.0);
        r1.model_runs.push(("m1".to_string(), completed(5.0, 42.0)));

        let (store, ids) = seeded_store(vec![r1]);
        let cmp = compare(&store, &[ids[0], ids[0], ids[0]]).expect("compare");
        assert_eq!(cmp.run_names, vec!["R1"]);
        assert_eq!(cmp.rows[0].cells.len(), 1);
    }

    #[test]
    fn durations_render_with_the_requested_separator() {
        assert_eq!(format_seconds(5.0, DecimalSeparator::Point), "5.00");
        assert_eq!(format_seconds(12.5, DecimalSeparator::Point), "12.50");
        assert_eq!(format_seconds(12.505, DecimalSeparator::Comma), "12,51");
        assert_eq!(format_seconds(600.0, DecimalSeparator::Comma), "600,00");
    }

    #[test]
    fn csv_layout_matches_the_comparison() {
        let mut r1 = record("R1", 1_700_000_000, 600.0);
        r1.model_runs.push(("m1".to_string(), completed(5.0, 42.0)));
        let mut r2 = record("R2", 1_700_100_000, 600.0);
        r2.model_runs.push(("m1".to_string(), interrupted(600.0)));
        r2.model_runs.push(("m2".to_string(), completed(1.25, 9.0)));

        let (store, ids) = seeded_store(vec![r1, r2]);
        let cmp = compare(&store, &ids).expect("compare");

        let dir = std::env::temp_dir().join(format!(
            "pnbench_compare_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let path = dir.join("out.csv");
        write_csv(&cmp, &path, DecimalSeparator::Point).expect("write");

        let content = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "model;R1;R2;1;2");
        assert_eq!(lines[1], "m1;5.00;;R1");
        assert_eq!(lines[2], "m2;;1.25;R2");
        let _ = std::fs::remove_dir_all(dir);
    }
}
