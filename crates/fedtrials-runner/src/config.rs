//! Resolved trial configuration: built-in defaults, optional YAML file, and
//! `key=value` overrides addressed by dotted path.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid --set '{0}': expected k=v")]
    MalformedOverride(String),
    #[error("invalid --set '{0}': key cannot be empty")]
    EmptyOverrideKey(String),
    #[error("override references unknown config key: {0}")]
    UnknownKey(String),
    #[error("override '{key}' does not fit the configuration: {source}")]
    OverrideType {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode configuration: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// What to do with the remaining trials once one has failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    Continue,
    Abort,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::Continue => "continue",
            FailurePolicy::Abort => "abort",
        }
    }
}

/// Options handed to the trainer, identical for every trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingParams {
    pub rounds: u32,
    pub num_users: u32,
    pub frac: f64,
    pub local_ep: u32,
    pub local_bs: u32,
    pub lr: f64,
    pub momentum: f64,
    pub model: String,
    pub dataset: String,
    pub datadir: String,
    pub logdir: String,
    pub savedir: String,
    pub partition: String,
    pub alg: String,
    pub beta: f64,
    pub local_view: bool,
    pub noise: f64,
    pub gpu: u32,
    pub print_freq: u32,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            rounds: 100,
            num_users: 100,
            frac: 0.1,
            local_ep: 10,
            local_bs: 10,
            lr: 0.01,
            momentum: 0.5,
            model: "resnet9".to_string(),
            dataset: "cifar100".to_string(),
            datadir: "../data/".to_string(),
            logdir: "../logs/".to_string(),
            savedir: "../save_results/".to_string(),
            partition: "noniid-labeldir".to_string(),
            alg: "fednova".to_string(),
            beta: 0.5,
            local_view: true,
            noise: 0.0,
            gpu: 0,
            print_freq: 10,
        }
    }
}

impl TrainingParams {
    /// Renders `--trial=<id>` followed by every fixed option in trainer order.
    pub fn to_args(&self, trial: u32) -> Vec<String> {
        let mut args = vec![
            format!("--trial={}", trial),
            format!("--rounds={}", self.rounds),
            format!("--num_users={}", self.num_users),
            format!("--frac={}", self.frac),
            format!("--local_ep={}", self.local_ep),
            format!("--local_bs={}", self.local_bs),
            format!("--lr={}", self.lr),
            format!("--momentum={}", self.momentum),
            format!("--model={}", self.model),
            format!("--dataset={}", self.dataset),
            format!("--datadir={}", self.datadir),
            format!("--logdir={}", self.logdir),
            format!("--savedir={}", self.savedir),
            format!("--partition={}", self.partition),
            format!("--alg={}", self.alg),
            format!("--beta={}", self.beta),
        ];
        if self.local_view {
            args.push("--local_view".to_string());
        }
        args.push(format!("--noise={}", self.noise));
        args.push(format!("--gpu={}", self.gpu));
        args.push(format!("--print_freq={}", self.print_freq));
        args
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrialConfig {
    /// Command prefix that launches the trainer.
    pub program: Vec<String>,
    pub trials: Vec<u32>,
    pub output_root: PathBuf,
    pub failure_policy: FailurePolicy,
    pub params: TrainingParams,
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            program: vec!["python".to_string(), "main.py".to_string()],
            trials: vec![1, 2, 3],
            output_root: PathBuf::from("save_results"),
            failure_policy: FailurePolicy::Continue,
            params: TrainingParams::default(),
        }
    }
}

impl TrialConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults, then the optional file, then overrides; validated last.
    pub fn resolve(path: Option<&Path>, overrides: &[String]) -> Result<Self, ConfigError> {
        let base = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        let resolved = base.with_overrides(&parse_set_bindings(overrides)?)?;
        resolved.validate()?;
        Ok(resolved)
    }

    pub fn with_overrides(self, bindings: &[(String, Value)]) -> Result<Self, ConfigError> {
        if bindings.is_empty() {
            return Ok(self);
        }
        let mut root = serde_json::to_value(&self)?;
        for (key, value) in bindings {
            let pointer = dotted_key_to_pointer(key);
            let slot = root
                .pointer_mut(&pointer)
                .ok_or_else(|| ConfigError::UnknownKey(key.clone()))?;
            *slot = value.clone();
            // Re-check per key so a type error names the offending override.
            serde_json::from_value::<TrialConfig>(root.clone()).map_err(|source| {
                ConfigError::OverrideType {
                    key: key.clone(),
                    source,
                }
            })?;
        }
        Ok(serde_json::from_value(root)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        if self.program.is_empty() || self.program[0].trim().is_empty() {
            problems.push("program must name an executable".to_string());
        }
        if self.trials.is_empty() {
            problems.push("trials must not be empty".to_string());
        }
        if self.trials.contains(&0) {
            problems.push("trial ids must be positive".to_string());
        }
        let unique: BTreeSet<u32> = self.trials.iter().copied().collect();
        if unique.len() != self.trials.len() {
            problems.push("trial ids must be unique".to_string());
        }
        if self.output_root.as_os_str().is_empty() {
            problems.push("output_root must not be empty".to_string());
        }

        let p = &self.params;
        if p.frac.is_nan() || p.frac <= 0.0 || p.frac > 1.0 {
            problems.push(format!("params.frac must be in (0, 1], got {}", p.frac));
        }
        for (name, value) in [
            ("rounds", p.rounds),
            ("num_users", p.num_users),
            ("local_ep", p.local_ep),
            ("local_bs", p.local_bs),
        ] {
            if value == 0 {
                problems.push(format!("params.{} must be positive", name));
            }
        }
        if p.lr.is_nan() || p.lr <= 0.0 {
            problems.push(format!("params.lr must be positive, got {}", p.lr));
        }
        for (name, value) in [
            ("model", &p.model),
            ("dataset", &p.dataset),
            ("partition", &p.partition),
            ("alg", &p.alg),
        ] {
            if value.trim().is_empty() {
                problems.push(format!("params.{} must not be empty", name));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// `<output_root>/<alg>/<partition>/<dataset>`
    pub fn output_dir(&self) -> PathBuf {
        self.output_root
            .join(&self.params.alg)
            .join(&self.params.partition)
            .join(&self.params.dataset)
    }

    /// Trial ids in execution order.
    pub fn ordered_trials(&self) -> Vec<u32> {
        let mut trials = self.trials.clone();
        trials.sort_unstable();
        trials.dedup();
        trials
    }

    /// Full argv for one trial: program prefix plus rendered options.
    pub fn command_line(&self, trial: u32) -> Vec<String> {
        let mut argv = self.program.clone();
        argv.extend(self.params.to_args(trial));
        argv
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

pub fn parse_set_bindings(values: &[String]) -> Result<Vec<(String, Value)>, ConfigError> {
    let mut out = Vec::new();
    for raw in values {
        let (key, val_raw) = raw
            .split_once('=')
            .ok_or_else(|| ConfigError::MalformedOverride(raw.clone()))?;
        if key.trim().is_empty() {
            return Err(ConfigError::EmptyOverrideKey(raw.clone()));
        }
        let parsed =
            serde_json::from_str::<Value>(val_raw).unwrap_or(Value::String(val_raw.to_string()));
        out.push((key.trim().to_string(), parsed));
    }
    Ok(out)
}

fn encode_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn dotted_key_to_pointer(key: &str) -> String {
    key.split('.')
        .map(|t| format!("/{}", encode_pointer_token(t)))
        .collect()
}
