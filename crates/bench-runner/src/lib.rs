use anyhow::Result;
use bench_core::{
    atomic_write_json_pretty, ensure_dir, host_identity, BenchError, CampaignSnapshot,
    CONFIG_FILE, CONFIG_VERSION, DATA_DIR,
};
use bench_store::{decompress_model_body, Model, Store};
use chrono::Utc;
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use wait_timeout::ChildExt;

/// Configuration of one benchmark campaign.
#[derive(Debug, Clone)]
pub struct CampaignSpec {
    pub name: String,
    pub tool: PathBuf,
    pub output_dir: PathBuf,
    /// Pass-through options handed to the tool verbatim.
    pub options: Vec<String>,
    /// Soft time limit in seconds handed to the tool; 0 disables both the
    /// soft limit and the hard timeout.
    pub time_limit: u64,
    pub workers: usize,
    /// Directory of precomputed `<model>.json` ordering hints, if any.
    pub order_dir: Option<PathBuf>,
}

/// Terminal state of one task. Every submitted task reaches exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Completed,
    /// Non-zero exit; `None` means the process died on a signal.
    Failed(Option<i32>),
    TimedOut,
}

#[derive(Debug)]
pub struct TaskReport {
    pub model: String,
    pub result: Result<TaskStatus>,
}

#[derive(Debug, Clone)]
pub struct CampaignOutcome {
    pub output_dir: PathBuf,
    pub tool_version: String,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub errored: usize,
    pub elapsed_secs: i64,
}

/// The hard timeout sits strictly above the tool's own soft limit so the
/// tool gets a chance to wind down on its own first.
pub fn hard_timeout_secs(time_limit: u64) -> u64 {
    time_limit + 10 + time_limit / 10
}

/// Identity of the tool binary, captured before any task runs. Failure here
/// is fatal: a campaign without a recorded tool version cannot be ingested.
pub fn query_tool_version(tool: &Path) -> Result<String> {
    let output = Command::new(tool)
        .arg("--version")
        .output()
        .map_err(|e| BenchError::Configuration {
            tool: tool.to_path_buf(),
            reason: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(BenchError::Configuration {
            tool: tool.to_path_buf(),
            reason: format!("--version exited with {}", output.status),
        }
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

struct TaskContext {
    tool: PathBuf,
    options: Vec<String>,
    time_limit: u64,
    hard_timeout: Option<Duration>,
    data_dir: PathBuf,
    order_dir: Option<PathBuf>,
}

/// Run the full campaign: snapshot the tool, dispatch one task per model to
/// a bounded worker pool, collect outcomes as they complete, then write the
/// configuration snapshot that later ingestion depends on.
pub fn run_campaign(store: &Store, spec: &CampaignSpec) -> Result<CampaignOutcome> {
    let tool_version = query_tool_version(&spec.tool)?;

    let data_dir = spec.output_dir.join(DATA_DIR);
    ensure_dir(&data_dir)?;

    // All workers run an identical binary even if the original path changes
    // mid-campaign. The snapshot directory is removed on every exit path.
    let snapshot_dir = tempfile::tempdir()?;
    let tool_name = spec
        .tool
        .file_name()
        .ok_or_else(|| BenchError::Configuration {
            tool: spec.tool.clone(),
            reason: "tool path has no file name".to_string(),
        })?;
    let tool_snapshot = snapshot_dir.path().join(tool_name);
    fs::copy(&spec.tool, &tool_snapshot)?;

    let models = store.models()?;
    let total = models.len();
    info!(campaign = %spec.name, models = total, workers = spec.workers, "starting");

    let ctx = Arc::new(TaskContext {
        tool: tool_snapshot,
        options: spec.options.clone(),
        time_limit: spec.time_limit,
        hard_timeout: (spec.time_limit != 0)
            .then(|| Duration::from_secs(hard_timeout_secs(spec.time_limit))),
        data_dir: data_dir.clone(),
        order_dir: spec.order_dir.clone(),
    });

    let epoch_start = Utc::now().timestamp();
    let reports = dispatch(models, spec.workers.max(1), ctx);

    let mut log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(spec.output_dir.join("campaign.log"))?;
    let mut errors = OpenOptions::new()
        .create(true)
        .append(true)
        .open(spec.output_dir.join("errors.txt"))?;

    let mut outcome = CampaignOutcome {
        output_dir: spec.output_dir.clone(),
        tool_version: tool_version.clone(),
        completed: 0,
        failed: 0,
        timed_out: 0,
        errored: 0,
        elapsed_secs: 0,
    };
    // Completion order is arbitrary; treat it as an unordered stream.
    for report in reports {
        let line = match &report.result {
            Ok(TaskStatus::Completed) => {
                outcome.completed += 1;
                "completed".to_string()
            }
            Ok(TaskStatus::Failed(code)) => {
                outcome.failed += 1;
                match code {
                    Some(c) => format!("failed with code {}", c),
                    None => "terminated by signal".to_string(),
                }
            }
            Ok(TaskStatus::TimedOut) => {
                outcome.timed_out += 1;
                "hard timeout".to_string()
            }
            Err(e) => {
                outcome.errored += 1;
                writeln!(errors, "Problem with model {}", report.model)?;
                writeln!(errors, "{}", e)?;
                format!("error: {}", e)
            }
        };
        if report.result.is_ok() {
            info!(model = %report.model, "{}", line);
        } else {
            warn!(model = %report.model, "{}", line);
        }
        writeln!(log, "{} {}: {}", Utc::now().to_rfc3339(), report.model, line)?;
    }
    let epoch_end = Utc::now().timestamp();
    outcome.elapsed_secs = epoch_end - epoch_start;

    let snapshot = CampaignSnapshot {
        config_version: CONFIG_VERSION.to_string(),
        name: spec.name.clone(),
        epoch_start,
        epoch_end,
        host: host_identity(),
        options: spec.options.clone(),
        tool_version,
        time_limit: spec.time_limit,
    };
    atomic_write_json_pretty(&spec.output_dir.join(CONFIG_FILE), &snapshot)?;

    info!(
        campaign = %spec.name,
        completed = outcome.completed,
        failed = outcome.failed,
        timed_out = outcome.timed_out,
        errored = outcome.errored,
        elapsed = outcome.elapsed_secs,
        "finished"
    );
    Ok(outcome)
}

/// Bounded worker pool: at most `workers` tool processes at any instant.
/// Outcomes are surfaced over a channel in completion order; a task error
/// never cancels its siblings.
fn dispatch(
    models: Vec<Model>,
    workers: usize,
    ctx: Arc<TaskContext>,
) -> mpsc::Receiver<TaskReport> {
    let queue = Arc::new(Mutex::new(VecDeque::from(models)));
    let (tx, rx) = mpsc::channel();
    for _ in 0..workers {
        let queue = Arc::clone(&queue);
        let ctx = Arc::clone(&ctx);
        let tx = tx.clone();
        thread::spawn(move || loop {
            let model = match queue.lock() {
                Ok(mut q) => q.pop_front(),
                Err(_) => None,
            };
            let Some(model) = model else { break };
            let result = run_model_task(&ctx, &model);
            if tx
                .send(TaskReport {
                    model: model.name,
                    result,
                })
                .is_err()
            {
                break;
            }
        });
    }
    rx
}

/// One task = one tool invocation for one model. The decompressed input
/// lives in a scoped temp file that is removed on every exit path.
fn run_model_task(ctx: &TaskContext, model: &Model) -> Result<TaskStatus> {
    let body = decompress_model_body(&model.body)?;
    let mut input = tempfile::NamedTempFile::new()?;
    input.write_all(&body)?;
    input.flush()?;

    let model_dir = ctx.data_dir.join(&model.name);
    let out_path = ctx.data_dir.join(format!("{}.out", model.name));
    let err_path = ctx.data_dir.join(format!("{}.err", model.name));
    let outfile = fs::File::create(&out_path)?;
    let errfile = fs::File::create(&err_path)?;

    let mut cmd = Command::new(&ctx.tool);
    cmd.args(&ctx.options);
    if ctx.time_limit != 0 {
        cmd.arg(format!("--time-limit={}", ctx.time_limit));
    }
    if let Some(order_dir) = &ctx.order_dir {
        let hint = order_dir.join(format!("{}.json", model.name));
        if hint.is_file() {
            let hint = fs::canonicalize(&hint).unwrap_or(hint);
            cmd.arg(format!("--order-load={}", hint.display()));
        }
    }
    cmd.arg(format!("--input={}", model.format));
    cmd.arg("--json=stats");
    cmd.arg("--stats=final-sdd");
    cmd.arg(format!("--output-dir={}", model_dir.display()));
    cmd.arg(input.path());
    cmd.stdout(Stdio::from(outfile));
    cmd.stderr(Stdio::from(errfile));

    let mut child = cmd.spawn()?;
    let status = match ctx.hard_timeout {
        Some(timeout) => match child.wait_timeout(timeout)? {
            Some(status) => status,
            None => {
                // Cancellation must reach the process itself, not just
                // abandon the wait.
                child.kill()?;
                child.wait()?;
                append_line(
                    &err_path,
                    &format!("Error: hard timeout after {} s", timeout.as_secs()),
                )?;
                return Ok(TaskStatus::TimedOut);
            }
        },
        None => child.wait()?,
    };

    if !status.success() {
        let note = match status.code() {
            Some(code) => format!("Error: tool returned code {}", code),
            None => "Error: tool terminated by signal".to_string(),
        };
        append_line(&err_path, &note)?;
        return Ok(TaskStatus::Failed(status.code()));
    }

    if fs::metadata(&err_path).map(|m| m.len()).unwrap_or(0) == 0 {
        let _ = fs::remove_file(&err_path);
    }
    Ok(TaskStatus::Completed)
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "pnbench_runner_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp root");
        dir
    }

    #[cfg(unix)]
    fn write_tool(dir: &Path, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-tool");
        fs::write(&path, format!("#!/bin/sh\n{}\n", script)).expect("write tool");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    fn ctx_for(tool: PathBuf, data_dir: PathBuf, hard_timeout: Option<Duration>) -> TaskContext {
        TaskContext {
            tool,
            options: Vec::new(),
            time_limit: 0,
            hard_timeout,
            data_dir,
            order_dir: None,
        }
    }

    fn model(name: &str, raw: &[u8]) -> Model {
        Model {
            id: 1,
            name: name.to_string(),
            format: "pnml".to_string(),
            body: bench_store::compress_model_body(raw).expect("compress"),
        }
    }

    #[test]
    fn hard_timeout_is_strictly_above_soft_limit() {
        assert_eq!(hard_timeout_secs(600), 670);
        assert_eq!(hard_timeout_secs(60), 76);
        assert!(hard_timeout_secs(1) > 1);
    }

    #[cfg(unix)]
    #[test]
    fn tool_version_failure_is_a_configuration_error() {
        let root = temp_root("version");
        let tool = write_tool(&root, "exit 1");
        let err = query_tool_version(&tool).expect_err("must fail");
        assert!(matches!(
            err.downcast_ref::<BenchError>(),
            Some(BenchError::Configuration { .. })
        ));
        let missing = query_tool_version(&root.join("no-such-tool")).expect_err("must fail");
        assert!(missing.downcast_ref::<BenchError>().is_some());
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn successful_task_removes_empty_stderr_capture_and_temp_input() {
        let root = temp_root("success");
        let data_dir = root.join("data");
        ensure_dir(&data_dir).expect("data dir");
        // The tool records its input path (last argument) so the test can
        // check that the scoped temp file is gone afterwards.
        let tool = write_tool(
            &root,
            "for a in \"$@\"; do last=\"$a\"; done; printf '%s' \"$last\" > \"$(dirname \"$0\")/input_path\"",
        );
        let ctx = ctx_for(tool, data_dir.clone(), None);

        let status = run_model_task(&ctx, &model("m1", b"net body")).expect("task");
        assert_eq!(status, TaskStatus::Completed);
        assert!(!data_dir.join("m1.err").exists());
        assert!(data_dir.join("m1.out").exists());

        let input_path = fs::read_to_string(root.join("input_path")).expect("recorded path");
        assert!(!input_path.trim().is_empty());
        assert!(!Path::new(input_path.trim()).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn order_hint_is_passed_only_when_the_file_exists() {
        let root = temp_root("order");
        let data_dir = root.join("data");
        let order_dir = root.join("orders");
        ensure_dir(&data_dir).expect("data dir");
        ensure_dir(&order_dir).expect("order dir");
        fs::write(order_dir.join("hinted.json"), b"[]").expect("hint");
        let tool = write_tool(&root, "printf '%s\\n' \"$@\" > \"$(dirname \"$0\")/argv\"");
        let mut ctx = ctx_for(tool, data_dir, None);
        ctx.order_dir = Some(order_dir);

        run_model_task(&ctx, &model("hinted", b"net")).expect("task");
        let argv = fs::read_to_string(root.join("argv")).expect("argv");
        assert!(argv.contains("--order-load="), "argv: {}", argv);
        assert!(argv.contains("hinted.json"), "argv: {}", argv);

        run_model_task(&ctx, &model("bare", b"net")).expect("task");
        let argv = fs::read_to_string(root.join("argv")).expect("argv");
        assert!(!argv.contains("--order-load="), "argv: {}", argv);
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_recorded_in_the_stderr_capture() {
        let root = temp_root("failure");
        let data_dir = root.join("data");
        ensure_dir(&data_dir).expect("data dir");
        let tool = write_tool(&root, "exit 3");
        let ctx = ctx_for(tool, data_dir.clone(), None);

        let status = run_model_task(&ctx, &model("m1", b"net body")).expect("task");
        assert_eq!(status, TaskStatus::Failed(Some(3)));
        let err = fs::read_to_string(data_dir.join("m1.err")).expect("capture");
        assert!(err.contains("returned code 3"), "capture: {}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn breached_hard_timeout_kills_the_process() {
        let root = temp_root("timeout");
        let data_dir = root.join("data");
        ensure_dir(&data_dir).expect("data dir");
        let tool = write_tool(&root, "sleep 30");
        let ctx = ctx_for(tool, data_dir.clone(), Some(Duration::from_millis(300)));

        let started = std::time::Instant::now();
        let status = run_model_task(&ctx, &model("m1", b"net body")).expect("task");
        assert_eq!(status, TaskStatus::TimedOut);
        // The kill must actually land: well under the sleep duration.
        assert!(started.elapsed() < Duration::from_secs(5));
        let err = fs::read_to_string(data_dir.join("m1.err")).expect("capture");
        assert!(err.contains("hard timeout"), "capture: {}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn pool_drives_every_task_to_a_terminal_state() {
        let root = temp_root("pool");
        let data_dir = root.join("data");
        ensure_dir(&data_dir).expect("data dir");
        // Fail exactly when the model body says so; failures must not
        // cancel sibling tasks.
        let tool = write_tool(
            &root,
            "for a in \"$@\"; do last=\"$a\"; done; grep -q FAIL \"$last\" && exit 7; exit 0",
        );
        let ctx = Arc::new(ctx_for(tool, data_dir, None));

        let models = vec![
            model("m1", b"ok"),
            model("m2", b"FAIL"),
            model("m3", b"ok"),
            model("m4", b"ok"),
            model("m5", b"FAIL"),
        ];
        let reports: Vec<TaskReport> = dispatch(models, 2, ctx).into_iter().collect();
        assert_eq!(reports.len(), 5);
        let completed = reports
            .iter()
            .filter(|r| matches!(r.result, Ok(TaskStatus::Completed)))
            .count();
        let failed = reports
            .iter()
            .filter(|r| matches!(r.result, Ok(TaskStatus::Failed(Some(7)))))
            .count();
        assert_eq!(completed, 3);
        assert_eq!(failed, 2);
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn pool_never_runs_more_tool_processes_than_workers() {
        let root = temp_root("bound");
        let data_dir = root.join("data");
        let markers = root.join("markers");
        ensure_dir(&data_dir).expect("data dir");
        ensure_dir(&markers).expect("markers dir");
        // Each invocation drops a marker for its own pid, records how many
        // markers are live, lingers long enough to overlap with siblings,
        // then removes its marker.
        let tool = write_tool(
            &root,
            "d=\"$(dirname \"$0\")\"; touch \"$d/markers/$$\"; \
             ls \"$d/markers\" | wc -l >> \"$d/counts\"; \
             sleep 0.3; rm \"$d/markers/$$\"",
        );
        let ctx = Arc::new(ctx_for(tool, data_dir, None));

        let models = (1..=6)
            .map(|i| model(&format!("m{}", i), b"net"))
            .collect();
        let reports: Vec<TaskReport> = dispatch(models, 2, ctx).into_iter().collect();
        assert_eq!(reports.len(), 6);
        assert!(reports
            .iter()
            .all(|r| matches!(r.result, Ok(TaskStatus::Completed))));

        let counts = fs::read_to_string(root.join("counts")).expect("counts");
        let observed: Vec<usize> = counts
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect();
        assert_eq!(observed.len(), 6);
        let max = observed.iter().copied().max().unwrap_or(0);
        assert!(max <= 2, "observed {} concurrent invocations", max);
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn campaign_writes_configuration_snapshot() {
        let root = temp_root("campaign");
        let tool = write_tool(
            &root,
            "if [ \"$1\" = --version ]; then echo 'tool 9.9'; fi; exit 0",
        );
        let output_dir = root.join("out");

        let store = Store::open_in_memory().expect("store");
        store.add_model("m1", "pnml", b"one").expect("add");
        store.add_model("m2", "tina", b"two").expect("add");

        let spec = CampaignSpec {
            name: "nightly".to_string(),
            tool,
            output_dir: output_dir.clone(),
            options: vec!["--order=force".to_string()],
            time_limit: 600,
            workers: 2,
            order_dir: None,
        };
        let outcome = run_campaign(&store, &spec).expect("campaign");
        assert_eq!(outcome.completed, 2);
        assert_eq!(outcome.tool_version, "tool 9.9");

        let raw = fs::read(output_dir.join(CONFIG_FILE)).expect("snapshot");
        let snapshot: CampaignSnapshot = serde_json::from_slice(&raw).expect("parse");
        assert_eq!(snapshot.config_version, CONFIG_VERSION);
        assert_eq!(snapshot.name, "nightly");
        assert_eq!(snapshot.tool_version, "tool 9.9");
        assert_eq!(snapshot.time_limit, 600);
        assert!(snapshot.epoch_end >= snapshot.epoch_start);
        assert!(!snapshot.host.is_empty());
        assert!(output_dir.join("campaign.log").exists());
        let _ = fs::remove_dir_all(root);
    }
}
