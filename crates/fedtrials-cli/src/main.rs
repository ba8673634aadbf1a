use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use fedtrials_runner::{FailurePolicy, RunReport, TrialConfig};
use serde_json::{json, Value};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "fedtrials",
    version,
    about = "Run repeated FedNova training trials with per-trial logs"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Clone, Default)]
struct ConfigArgs {
    /// YAML file layered over the built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override a config value by dotted path, e.g. `params.lr=0.05`.
    #[arg(long = "set")]
    set_values: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every trial (the default when no command is given).
    Run {
        #[command(flatten)]
        config: ConfigArgs,
        /// Stop after the first failed trial.
        #[arg(long)]
        fail_fast: bool,
        /// Replace the trainer command prefix, one token per flag.
        #[arg(long = "program", allow_hyphen_values = true)]
        program: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved command line of each trial without running it.
    Describe {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long)]
        json: bool,
    },
    /// Write the default configuration as YAML.
    ConfigInit {
        #[arg(long, default_value = "fedtrials.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run {
        config: ConfigArgs::default(),
        fail_fast: false,
        program: Vec::new(),
        json: false,
    });
    let json_mode = command_json_mode(&command);
    match run_command(command) {
        Ok(Outcome { payload, ok }) => {
            if let Some(payload) = payload {
                emit_json(&payload);
            }
            if !ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Where trial transcripts are echoed. JSON mode keeps stdout for the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TranscriptEcho {
    Stdout,
    Stderr,
}

impl TranscriptEcho {
    fn for_mode(json: bool) -> Self {
        if json {
            TranscriptEcho::Stderr
        } else {
            TranscriptEcho::Stdout
        }
    }
}

impl Write for TranscriptEcho {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TranscriptEcho::Stdout => io::stdout().write(buf),
            TranscriptEcho::Stderr => io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TranscriptEcho::Stdout => io::stdout().flush(),
            TranscriptEcho::Stderr => io::stderr().flush(),
        }
    }
}

struct Outcome {
    payload: Option<Value>,
    ok: bool,
}

fn run_command(command: Commands) -> Result<Outcome> {
    match command {
        Commands::Run {
            config,
            fail_fast,
            program,
            json,
        } => {
            let mut overrides = config.set_values.clone();
            if fail_fast {
                overrides.push(format!("failure_policy={}", FailurePolicy::Abort.as_str()));
            }
            if !program.is_empty() {
                overrides.push(format!("program={}", serde_json::to_string(&program)?));
            }
            let resolved = TrialConfig::resolve(config.config.as_deref(), &overrides)?;
            let echo = TranscriptEcho::for_mode(json);
            let report = fedtrials_runner::run_trials_with_console(&resolved, |_| echo)?;
            let ok = report.all_succeeded();
            if json {
                let mut payload = report.to_json();
                if let Some(obj) = payload.as_object_mut() {
                    obj.insert("ok".to_string(), json!(ok));
                }
                return Ok(Outcome {
                    payload: Some(payload),
                    ok,
                });
            }
            print_report(&report);
            Ok(Outcome { payload: None, ok })
        }
        Commands::Describe { config, json } => {
            let resolved = TrialConfig::resolve(config.config.as_deref(), &config.set_values)?;
            let plan = fedtrials_runner::plan_trials(&resolved);
            if json {
                return Ok(Outcome {
                    payload: Some(json!({
                        "ok": true,
                        "output_dir": resolved.output_dir().display().to_string(),
                        "failure_policy": resolved.failure_policy.as_str(),
                        "config_digest": fedtrials_runner::config_digest(&resolved)?,
                        "trials": plan.iter().map(|p| json!({
                            "trial": p.trial,
                            "argv": p.argv,
                            "log_path": p.log_path.display().to_string(),
                        })).collect::<Vec<_>>(),
                    })),
                    ok: true,
                });
            }
            println!("output_dir: {}", resolved.output_dir().display());
            println!("failure_policy: {}", resolved.failure_policy.as_str());
            for p in &plan {
                println!("trial {}: {}", p.trial, shell_join(&p.argv));
                println!("  log: {}", p.log_path.display());
            }
            Ok(Outcome {
                payload: None,
                ok: true,
            })
        }
        Commands::ConfigInit { path, force } => {
            write_default_config(&path, force)?;
            println!("wrote {}", path.display());
            Ok(Outcome {
                payload: None,
                ok: true,
            })
        }
    }
}

fn print_report(report: &RunReport) {
    println!("run: {}", report.run_id);
    println!("output_dir: {}", report.output_dir.display());
    for o in &report.outcomes {
        match o.status.exit_reason() {
            None => println!("trial {}: {} ({} ms)", o.trial, o.status.as_str(), o.duration_ms),
            Some(reason) => println!(
                "trial {}: {} [{}] log={}",
                o.trial,
                o.status.as_str(),
                reason,
                o.log_path.display()
            ),
        }
    }
    for t in &report.skipped {
        println!("trial {}: skipped", t);
    }
    println!("status: {}", report.status());
}

fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(anyhow!(
            "{} already exists (pass --force to overwrite)",
            path.display()
        ));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, TrialConfig::default().to_yaml()?)?;
    Ok(())
}

fn emit_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!("{}", value),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details,
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Describe { json, .. } => *json,
        Commands::ConfigInit { .. } => false,
    }
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
