use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::Instant;
use tracing::{debug, info, warn};

pub mod config;
pub mod tee;

pub use config::{ConfigError, FailurePolicy, TrainingParams, TrialConfig};
pub use tee::TeeSink;

pub const RUNNER_VERSION: &str = concat!("rust-", env!("CARGO_PKG_VERSION"));
pub const RUN_SUMMARY_FILE: &str = "run_summary.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialStatus {
    Succeeded,
    /// `code` is `None` when the process was killed by a signal or never started.
    Failed { code: Option<i32>, reason: String },
}

impl TrialStatus {
    fn from_exit(status: ExitStatus) -> Self {
        if status.success() {
            return TrialStatus::Succeeded;
        }
        let code = status.code();
        let reason = code
            .map(|c| format!("exit_code_{}", c))
            .unwrap_or_else(|| "signal".to_string());
        TrialStatus::Failed { code, reason }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TrialStatus::Succeeded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrialStatus::Succeeded => "succeeded",
            TrialStatus::Failed { .. } => "failed",
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            TrialStatus::Succeeded => Some(0),
            TrialStatus::Failed { code, .. } => *code,
        }
    }

    pub fn exit_reason(&self) -> Option<&str> {
        match self {
            TrialStatus::Succeeded => None,
            TrialStatus::Failed { reason, .. } => Some(reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrialOutcome {
    pub trial: u32,
    pub status: TrialStatus,
    pub argv: Vec<String>,
    pub log_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub bytes_logged: u64,
}

impl TrialOutcome {
    fn to_json(&self) -> Value {
        json!({
            "trial": self.trial,
            "status": self.status.as_str(),
            "exit_code": self.status.exit_code(),
            "exit_reason": self.status.exit_reason(),
            "log_path": self.log_path.to_string_lossy(),
            "argv": self.argv,
            "started_at": self.started_at.to_rfc3339(),
            "finished_at": self.finished_at.to_rfc3339(),
            "duration_ms": self.duration_ms,
            "bytes_logged": self.bytes_logged,
        })
    }
}

pub struct RunReport {
    pub run_id: String,
    pub output_dir: PathBuf,
    pub config_digest: String,
    pub failure_policy: FailurePolicy,
    pub outcomes: Vec<TrialOutcome>,
    /// Trials never started because an earlier one failed under `abort`.
    pub skipped: Vec<u32>,
}

impl RunReport {
    pub fn all_succeeded(&self) -> bool {
        self.skipped.is_empty() && self.outcomes.iter().all(|o| o.status.is_success())
    }

    pub fn failed_trials(&self) -> Vec<u32> {
        self.outcomes
            .iter()
            .filter(|o| !o.status.is_success())
            .map(|o| o.trial)
            .collect()
    }

    pub fn status(&self) -> &'static str {
        if !self.skipped.is_empty() {
            "aborted"
        } else if self.all_succeeded() {
            "completed"
        } else {
            "completed_with_failures"
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "run_id": self.run_id,
            "status": self.status(),
            "output_dir": self.output_dir.to_string_lossy(),
            "config_digest": self.config_digest,
            "failure_policy": self.failure_policy.as_str(),
            "trials": self.outcomes.iter().map(TrialOutcome::to_json).collect::<Vec<_>>(),
            "skipped": self.skipped,
            "succeeded": self.outcomes.len() - self.failed_trials().len(),
            "failed": self.failed_trials().len(),
        })
    }
}

/// One trial as it would be launched, without launching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTrial {
    pub trial: u32,
    pub argv: Vec<String>,
    pub log_path: PathBuf,
}

pub fn plan_trials(config: &TrialConfig) -> Vec<PlannedTrial> {
    let output_dir = config.output_dir();
    config
        .ordered_trials()
        .into_iter()
        .map(|trial| PlannedTrial {
            trial,
            argv: config.command_line(trial),
            log_path: trial_log_path(&output_dir, trial),
        })
        .collect()
}

pub fn trial_log_path(output_dir: &Path, trial: u32) -> PathBuf {
    output_dir.join(format!("{}.txt", trial))
}

pub fn trial_status_path(output_dir: &Path, trial: u32) -> PathBuf {
    output_dir.join(format!("{}.status.json", trial))
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory {}", path.display()))
}

pub fn canonical_json_digest(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    format!("sha256:{}", hex::encode(Sha256::digest(&bytes)))
}

/// Digest of the resolved configuration; equal digests mean identical launches.
pub fn config_digest(config: &TrialConfig) -> Result<String> {
    let value = serde_json::to_value(config)?;
    Ok(canonical_json_digest(&value))
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
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
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

fn write_trial_status(output_dir: &Path, trial: u32, fields: Value) -> Result<()> {
    let mut payload = json!({
        "schema_version": "trial_status_v1",
        "trial": trial,
    });
    if let Some(dst) = payload.as_object_mut() {
        if let Value::Object(src) = fields {
            dst.extend(src);
        }
        dst.insert("updated_at".to_string(), json!(Utc::now().to_rfc3339()));
    }
    atomic_write_json_pretty(&trial_status_path(output_dir, trial), &payload)
}

/// Marks the trial `failed`/`aborted` unless the runner records a real outcome.
struct TrialStatusGuard {
    output_dir: PathBuf,
    trial: u32,
    done: bool,
}

impl TrialStatusGuard {
    fn new(output_dir: &Path, trial: u32) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            trial,
            done: false,
        }
    }

    fn complete(&mut self, outcome: &TrialOutcome) -> Result<()> {
        write_trial_status(&self.output_dir, self.trial, outcome.to_json())?;
        self.done = true;
        Ok(())
    }
}

impl Drop for TrialStatusGuard {
    fn drop(&mut self) {
        if !self.done {
            // Keep what the running record already knew (argv, log path, start).
            let mut record = fs::read_to_string(trial_status_path(&self.output_dir, self.trial))
                .ok()
                .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
                .filter(Value::is_object)
                .unwrap_or_else(|| json!({}));
            if let Some(obj) = record.as_object_mut() {
                obj.insert("status".to_string(), json!("failed"));
                obj.insert("exit_code".to_string(), Value::Null);
                obj.insert("exit_reason".to_string(), json!("aborted"));
                obj.insert("finished_at".to_string(), json!(Utc::now().to_rfc3339()));
            }
            let _ = write_trial_status(&self.output_dir, self.trial, record);
        }
    }
}

struct RunSummaryGuard {
    path: PathBuf,
    header: Value,
    done: bool,
}

impl RunSummaryGuard {
    fn start(output_dir: &Path, header: Value) -> Result<Self> {
        let guard = Self {
            path: output_dir.join(RUN_SUMMARY_FILE),
            header,
            done: false,
        };
        guard.write(json!({ "status": "running" }))?;
        Ok(guard)
    }

    fn write(&self, fields: Value) -> Result<()> {
        let mut payload = self.header.clone();
        if let (Some(dst), Value::Object(src)) = (payload.as_object_mut(), fields) {
            dst.extend(src);
        }
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("updated_at".to_string(), json!(Utc::now().to_rfc3339()));
        }
        atomic_write_json_pretty(&self.path, &payload)
    }

    fn complete(&mut self, report: &RunReport) -> Result<()> {
        self.write(report.to_json())?;
        self.done = true;
        Ok(())
    }
}

impl Drop for RunSummaryGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.write(json!({ "status": "failed" }));
        }
    }
}

/// Runs every trial, echoing transcripts to this process's stdout.
pub fn run_trials(config: &TrialConfig) -> Result<RunReport> {
    run_trials_with_console(config, |_| io::stdout())
}

/// Runs every trial in ascending order, one at a time. `console` supplies
/// the terminal side of each trial's tee.
pub fn run_trials_with_console<C, F>(config: &TrialConfig, mut console: F) -> Result<RunReport>
where
    C: Write,
    F: FnMut(u32) -> C,
{
    config.validate()?;
    let output_dir = config.output_dir();
    ensure_dir(&output_dir)?;

    let run_id = format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S"));
    let digest = config_digest(config)?;
    let mut summary = RunSummaryGuard::start(
        &output_dir,
        json!({
            "schema_version": "run_summary_v1",
            "run_id": run_id,
            "runner_version": RUNNER_VERSION,
            "config_digest": digest,
            "created_at": Utc::now().to_rfc3339(),
        }),
    )?;

    let trials = config.ordered_trials();
    info!(
        run_id = %run_id,
        output_dir = %output_dir.display(),
        trials = ?trials,
        policy = config.failure_policy.as_str(),
        "starting trial run"
    );

    let mut outcomes = Vec::new();
    let mut skipped = Vec::new();
    for (idx, &trial) in trials.iter().enumerate() {
        let outcome = run_trial(config, trial, &output_dir, console(trial))?;
        let failed = !outcome.status.is_success();
        outcomes.push(outcome);
        if failed && config.failure_policy == FailurePolicy::Abort {
            skipped.extend_from_slice(&trials[idx + 1..]);
            if !skipped.is_empty() {
                warn!(trial, skipped = ?skipped, "aborting remaining trials");
            }
            break;
        }
    }

    let report = RunReport {
        run_id,
        output_dir,
        config_digest: digest,
        failure_policy: config.failure_policy,
        outcomes,
        skipped,
    };
    summary.complete(&report)?;
    info!(
        run_id = %report.run_id,
        status = report.status(),
        failed = ?report.failed_trials(),
        "trial run finished"
    );
    Ok(report)
}

/// Launches one trial and blocks until it exits and its output is drained.
pub fn run_trial<C>(
    config: &TrialConfig,
    trial: u32,
    output_dir: &Path,
    console: C,
) -> Result<TrialOutcome>
where
    C: Write,
{
    let argv = config.command_line(trial);
    let log_path = trial_log_path(output_dir, trial);
    let started_at = Utc::now();
    write_trial_status(
        output_dir,
        trial,
        json!({
            "status": "running",
            "log_path": log_path.to_string_lossy(),
            "argv": argv,
            "started_at": started_at.to_rfc3339(),
        }),
    )?;
    let mut guard = TrialStatusGuard::new(output_dir, trial);

    info!(trial, log = %log_path.display(), "starting trial");
    debug!(trial, argv = ?argv, "trial command line");

    let clock = Instant::now();
    let sink = TeeSink::create(&log_path, console)?;
    let (status, bytes_logged) = execute_tee(&argv, sink)?;
    let finished_at = Utc::now();

    let outcome = TrialOutcome {
        trial,
        status,
        argv,
        log_path,
        started_at,
        finished_at,
        duration_ms: clock.elapsed().as_millis() as u64,
        bytes_logged,
    };
    guard.complete(&outcome)?;

    match &outcome.status {
        TrialStatus::Succeeded => info!(
            trial,
            duration_ms = outcome.duration_ms,
            bytes = outcome.bytes_logged,
            "trial succeeded"
        ),
        TrialStatus::Failed { code, reason } => warn!(
            trial,
            code = ?code,
            reason = %reason,
            log = %outcome.log_path.display(),
            "trial failed"
        ),
    }
    Ok(outcome)
}

fn execute_tee<C>(argv: &[String], mut sink: TeeSink<C>) -> Result<(TrialStatus, u64)>
where
    C: Write,
{
    let program = argv
        .first()
        .ok_or_else(|| anyhow!("empty command line"))?;
    // One pipe for both streams, as with `2>&1`, so the log keeps write order.
    let (mut reader, writer) = io::pipe().context("failed to create output pipe")?;
    let mut cmd = Command::new(program);
    cmd.args(&argv[1..]);
    cmd.stdout(Stdio::from(writer.try_clone()?));
    cmd.stderr(Stdio::from(writer));

    let spawned = cmd.spawn();
    // The command still holds write ends; EOF only arrives once they close.
    drop(cmd);
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            // Leave a transcript behind so the log explains the failure.
            writeln!(sink, "fedtrials: failed to launch {}: {}", program, e)?;
            let bytes = sink.finish()?;
            return Ok((
                TrialStatus::Failed {
                    code: None,
                    reason: format!("spawn_failed: {}", e),
                },
                bytes,
            ));
        }
    };

    let drained = tee::drain(&mut reader, &mut sink);
    let exit = child.wait()?;
    drained.context("failed to capture trial output")?;
    let bytes = sink.finish()?;
    Ok((TrialStatus::from_exit(exit), bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const STUB_PRELUDE: &str =
        r#"for a in "$@"; do case "$a" in --trial=*) t="${a#--trial=}";; esac; done; "#;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "fedtrials_run_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp dir");
        dir
    }

    fn stub_config(root: &Path, body: &str) -> TrialConfig {
        TrialConfig {
            program: vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("{}{}", STUB_PRELUDE, body),
                "stub".to_string(),
            ],
            output_root: root.to_path_buf(),
            ..TrialConfig::default()
        }
    }

    fn read_json(path: &Path) -> Value {
        serde_json::from_str(&fs::read_to_string(path).expect("read")).expect("json")
    }

    #[cfg(unix)]
    #[test]
    fn each_trial_log_holds_its_own_trial_id() {
        let root = scratch_dir("echo");
        let cfg = stub_config(&root, r#"echo "$t""#);
        let dir = cfg.output_dir();
        ensure_dir(&dir).expect("pre-existing dir");

        let report = run_trials_with_console(&cfg, |_| io::sink()).expect("run");
        assert!(report.all_succeeded());
        assert_eq!(report.status(), "completed");
        for trial in [1u32, 2, 3] {
            let log = fs::read_to_string(dir.join(format!("{}.txt", trial))).expect("log");
            assert_eq!(log.trim(), trial.to_string());
        }

        // Second run over the same directory must not trip on it existing.
        let again = run_trials_with_console(&cfg, |_| io::sink()).expect("rerun");
        assert_eq!(again.outcomes.len(), 3);
        assert_eq!(
            fs::read_to_string(dir.join("2.txt")).expect("log").trim(),
            "2"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn stdout_and_stderr_share_one_transcript() {
        let root = scratch_dir("combined");
        let mut cfg = stub_config(&root, r#"echo "out $t"; echo "err $t" 1>&2"#);
        cfg.trials = vec![1];
        run_trials_with_console(&cfg, |_| io::sink()).expect("run");
        let log = fs::read_to_string(cfg.output_dir().join("1.txt")).expect("log");
        assert!(log.contains("out 1"), "log: {}", log);
        assert!(log.contains("err 1"), "log: {}", log);
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_recorded_and_run_continues() {
        let root = scratch_dir("continue");
        let cfg = stub_config(&root, r#"echo "trial $t"; [ "$t" = 2 ] && exit 3; exit 0"#);
        let dir = cfg.output_dir();

        let report = run_trials_with_console(&cfg, |_| io::sink()).expect("run");
        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.failed_trials(), vec![2]);
        assert_eq!(report.status(), "completed_with_failures");
        assert_eq!(
            report.outcomes[1].status,
            TrialStatus::Failed {
                code: Some(3),
                reason: "exit_code_3".to_string()
            }
        );

        let status = read_json(&dir.join("2.status.json"));
        assert_eq!(status["status"], "failed");
        assert_eq!(status["exit_code"], 3);
        let ok = read_json(&dir.join("3.status.json"));
        assert_eq!(ok["status"], "succeeded");
        assert_eq!(ok["exit_code"], 0);
        assert_eq!(
            fs::read_to_string(dir.join("3.txt")).expect("log").trim(),
            "trial 3"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn abort_policy_skips_remaining_trials() {
        let root = scratch_dir("abort");
        let mut cfg = stub_config(&root, r#"echo "trial $t"; [ "$t" = 1 ] && exit 1; exit 0"#);
        cfg.failure_policy = FailurePolicy::Abort;
        let dir = cfg.output_dir();

        let report = run_trials_with_console(&cfg, |_| io::sink()).expect("run");
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.skipped, vec![2, 3]);
        assert_eq!(report.status(), "aborted");
        assert!(dir.join("1.txt").exists());
        assert!(!dir.join("2.txt").exists());
        assert!(!dir.join("3.txt").exists());

        let summary = read_json(&dir.join(RUN_SUMMARY_FILE));
        assert_eq!(summary["status"], "aborted");
        assert_eq!(summary["skipped"], json!([2, 3]));
        assert_eq!(summary["failed"], 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_program_fails_the_trial_with_a_transcript() {
        let root = scratch_dir("missing");
        let cfg = TrialConfig {
            program: vec!["fedtrials-no-such-trainer-binary".to_string()],
            output_root: root.clone(),
            trials: vec![1, 2],
            ..TrialConfig::default()
        };
        let dir = cfg.output_dir();

        let report = run_trials_with_console(&cfg, |_| io::sink()).expect("run");
        assert_eq!(report.failed_trials(), vec![1, 2]);
        match &report.outcomes[0].status {
            TrialStatus::Failed { code, reason } => {
                assert_eq!(*code, None);
                assert!(reason.starts_with("spawn_failed"), "reason: {}", reason);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        let log = fs::read_to_string(dir.join("1.txt")).expect("log");
        assert!(log.contains("failed to launch"), "log: {}", log);
        let status = read_json(&dir.join("1.status.json"));
        assert_eq!(status["exit_code"], Value::Null);
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn trials_run_strictly_in_sequence() {
        let root = scratch_dir("order");
        let journal = root.join("journal.txt");
        let body = format!(
            r#"echo "start $t" >> '{j}'; sleep 0.1; echo "end $t" >> '{j}'"#,
            j = journal.display()
        );
        let mut cfg = stub_config(&root, &body);
        cfg.trials = vec![3, 1, 2];

        let report = run_trials_with_console(&cfg, |_| io::sink()).expect("run");
        let order: Vec<u32> = report.outcomes.iter().map(|o| o.trial).collect();
        assert_eq!(order, vec![1, 2, 3]);
        let lines: Vec<String> = fs::read_to_string(&journal)
            .expect("journal")
            .lines()
            .map(str::to_string)
            .collect();
        assert_eq!(
            lines,
            vec!["start 1", "end 1", "start 2", "end 2", "start 3", "end 3"]
        );
        for pair in report.outcomes.windows(2) {
            assert!(pair[0].finished_at <= pair[1].started_at);
        }
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn run_summary_records_digest_and_trials() {
        let root = scratch_dir("summary");
        let cfg = stub_config(&root, r#"echo "$t""#);
        let report = run_trials_with_console(&cfg, |_| io::sink()).expect("run");

        let summary = read_json(&cfg.output_dir().join(RUN_SUMMARY_FILE));
        assert_eq!(summary["schema_version"], "run_summary_v1");
        assert_eq!(summary["run_id"], report.run_id.as_str());
        assert_eq!(summary["status"], "completed");
        assert_eq!(summary["config_digest"], report.config_digest.as_str());
        assert_eq!(summary["succeeded"], 3);
        assert_eq!(summary["trials"].as_array().map(Vec::len), Some(3));
        assert_eq!(summary["trials"][0]["argv"][4], "--trial=1");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn config_digest_tracks_parameter_changes() {
        let base = TrialConfig::default();
        let same = TrialConfig::default();
        let mut changed = TrialConfig::default();
        changed.params.lr = 0.02;
        let d = config_digest(&base).expect("digest");
        assert!(d.starts_with("sha256:"));
        assert_eq!(d.len(), "sha256:".len() + 64);
        assert_eq!(d, config_digest(&same).expect("digest"));
        assert_ne!(d, config_digest(&changed).expect("digest"));
    }

    #[test]
    fn status_guard_marks_abandoned_trial_failed() {
        let dir = scratch_dir("guard");
        write_trial_status(
            &dir,
            4,
            json!({
                "status": "running",
                "log_path": "out/4.txt",
                "argv": ["python", "main.py", "--trial=4"],
                "started_at": "2026-01-01T00:00:00+00:00",
            }),
        )
        .expect("running");
        {
            let _guard = TrialStatusGuard::new(&dir, 4);
        }
        let status = read_json(&trial_status_path(&dir, 4));
        assert_eq!(status["status"], "failed");
        assert_eq!(status["exit_reason"], "aborted");
        assert_eq!(status["exit_code"], Value::Null);
        assert_eq!(status["log_path"], "out/4.txt");
        assert_eq!(status["argv"][2], "--trial=4");
        assert_eq!(status["started_at"], "2026-01-01T00:00:00+00:00");
        assert!(status["finished_at"].is_string());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn plan_lists_trials_in_order_with_log_paths() {
        let cfg = TrialConfig {
            trials: vec![2, 1],
            ..TrialConfig::default()
        };
        let plan = plan_trials(&cfg);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].trial, 1);
        assert_eq!(plan[0].argv[..3], ["python", "main.py", "--trial=1"]);
        assert_eq!(
            plan[1].log_path,
            PathBuf::from("save_results/fednova/noniid-labeldir/cifar100/2.txt")
        );
    }

    #[cfg(unix)]
    #[test]
    fn interleaved_stdout_and_stderr_keep_write_order() {
        let root = scratch_dir("interleave");
        let mut cfg = stub_config(
            &root,
            r#"i=1; while [ $i -le 300 ]; do echo "o$i"; echo "e$i" 1>&2; i=$((i+1)); done"#,
        );
        cfg.trials = vec![1];
        run_trials_with_console(&cfg, |_| io::sink()).expect("run");

        let log = fs::read_to_string(cfg.output_dir().join("1.txt")).expect("log");
        let expected: Vec<String> = (1..=300)
            .flat_map(|i| [format!("o{}", i), format!("e{}", i)])
            .collect();
        let got: Vec<&str> = log.lines().collect();
        assert_eq!(got.len(), expected.len());
        for (idx, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
            assert_eq!(g, e, "line {} out of order", idx + 1);
        }
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn signal_termination_records_null_exit_code() {
        let root = scratch_dir("signal");
        let mut cfg = stub_config(&root, r#"echo x; kill -9 $$"#);
        cfg.trials = vec![1];
        let dir = cfg.output_dir();

        let report = run_trials_with_console(&cfg, |_| io::sink()).expect("run");
        assert_eq!(
            report.outcomes[0].status,
            TrialStatus::Failed {
                code: None,
                reason: "signal".to_string()
            }
        );
        let status = read_json(&dir.join("1.status.json"));
        assert_eq!(status["status"], "failed");
        assert_eq!(status["exit_code"], Value::Null);
        assert_eq!(status["exit_reason"], "signal");
        assert_eq!(fs::read_to_string(dir.join("1.txt")).expect("log"), "x\n");
        let _ = fs::remove_dir_all(root);
    }

    /// Console writer that keeps its bytes reachable after the run.
    #[derive(Clone, Default)]
    struct SharedBuf(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[cfg(unix)]
    #[test]
    fn transcript_echo_goes_only_to_supplied_console() {
        let root = scratch_dir("console");
        let cfg = stub_config(&root, r#"echo "out $t"; echo "err $t" 1>&2"#);
        let console = SharedBuf::default();
        let handle = console.clone();

        run_trials_with_console(&cfg, move |_| console.clone()).expect("run");
        let echoed = String::from_utf8(handle.0.lock().expect("lock").clone()).expect("utf8");
        assert_eq!(
            echoed,
            "out 1\nerr 1\nout 2\nerr 2\nout 3\nerr 3\n"
        );
        let _ = fs::remove_dir_all(root);
    }
}
