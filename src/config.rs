//! Configuration for the decoder pool.
//!
//! Loaded from YAML. Either `gpus` (one worker per listed device) or
//! `threads` (number of CPU workers) decides the pool capacity; the two are
//! mutually exclusive.
//!
//! ```yaml
//! model_dir: /opt/engines/default/models/decoder
//! gpus: [0, 1]
//! request_timeout_secs: 30
//! checkpoints:
//!   - direction: en-it
//!     path: /opt/engines/default/models/decoder/en-it.pt
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DecoderError, Result};
use crate::model::{Checkpoint, LanguageDirection};
use crate::pool::Placement;

/// Retry policy for relaunching a crashed worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RespawnPolicy {
    /// Launch attempts per crash before the slot is given up.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles on every further attempt.
    pub backoff_ms: u64,
}

impl Default for RespawnPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1000,
        }
    }
}

impl RespawnPolicy {
    /// Delay to wait before `attempt` (1-based).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u64 << (attempt - 2).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// Checkpoint bound to a language direction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointEntry {
    pub direction: String,
    pub path: PathBuf,
}

/// Decoder pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Model directory handed to every worker process.
    pub model_dir: PathBuf,
    /// Python interpreter used to launch workers.
    pub python: String,
    /// Entry point script of the worker main loop.
    pub main_loop: PathBuf,
    /// GPU device ids; one worker per device.
    pub gpus: Option<Vec<u32>>,
    /// CPU worker count, only valid without `gpus`.
    pub threads: Option<usize>,
    /// Per-request wait before a worker is declared unresponsive.
    pub request_timeout_secs: u64,
    /// Wait for the `READY` handshake of a freshly launched worker.
    pub startup_timeout_secs: u64,
    /// Optional bound on `acquire` in milliseconds; unbounded when absent.
    pub acquire_timeout_ms: Option<u64>,
    /// Maximum number of suggestions forwarded as decoding hints.
    pub suggestions_limit: usize,
    pub respawn: RespawnPolicy,
    /// Consecutive out-of-order dequeues allowed before one FIFO dequeue
    /// is forced. `0` disables the cap.
    pub affinity_streak_limit: usize,
    pub checkpoints: Vec<CheckpointEntry>,
    /// Run without workers, answering every split by pass-through.
    pub echo: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("./models/decoder"),
            python: "python3".to_string(),
            main_loop: PathBuf::from("./lib/pynmt/main_loop.py"),
            gpus: None,
            threads: None,
            request_timeout_secs: 30,
            startup_timeout_secs: 600,
            acquire_timeout_ms: None,
            suggestions_limit: 4,
            respawn: RespawnPolicy::default(),
            affinity_streak_limit: 8,
            checkpoints: Vec::new(),
            echo: false,
        }
    }
}

impl DecoderConfig {
    /// Creates a CPU configuration with the given worker count.
    pub fn cpu(threads: usize) -> Self {
        Self {
            threads: Some(threads),
            ..Default::default()
        }
    }

    /// Creates a GPU configuration, one worker per device.
    pub fn gpu(gpus: Vec<u32>) -> Self {
        Self {
            gpus: Some(gpus),
            ..Default::default()
        }
    }

    /// Reads and validates a YAML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DecoderError::Config(format!("failed to read '{}': {}", path.display(), e))
        })?;
        let config: DecoderConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_model_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.model_dir = dir.into();
        self
    }

    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    pub fn with_main_loop(mut self, script: impl Into<PathBuf>) -> Self {
        self.main_loop = script.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = Some(timeout.as_millis().clamp(1, u64::MAX as u128) as u64);
        self
    }

    pub fn with_respawn(mut self, policy: RespawnPolicy) -> Self {
        self.respawn = policy;
        self
    }

    pub fn with_affinity_streak_limit(mut self, limit: usize) -> Self {
        self.affinity_streak_limit = limit;
        self
    }

    pub fn with_suggestions_limit(mut self, limit: usize) -> Self {
        self.suggestions_limit = limit;
        self
    }

    pub fn with_checkpoint(mut self, direction: &LanguageDirection, path: impl Into<PathBuf>) -> Self {
        self.checkpoints.push(CheckpointEntry {
            direction: direction.to_string(),
            path: path.into(),
        });
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }

    pub fn is_using_gpus(&self) -> bool {
        self.gpus.is_some()
    }

    /// Number of workers the pool will hold.
    pub fn capacity(&self) -> usize {
        match &self.gpus {
            Some(gpus) => gpus.len(),
            None => self.threads.unwrap_or(1),
        }
    }

    /// Placement strategy matching this configuration.
    pub fn placement(&self) -> Placement {
        match &self.gpus {
            Some(gpus) => Placement::gpu(gpus.clone()),
            None => Placement::cpu(self.capacity()),
        }
    }

    /// Resolves the checkpoint table keyed by direction.
    pub fn checkpoint_map(&self) -> Result<HashMap<LanguageDirection, Checkpoint>> {
        let mut map = HashMap::with_capacity(self.checkpoints.len());
        for entry in &self.checkpoints {
            let direction: LanguageDirection =
                entry.direction.parse().map_err(DecoderError::Config)?;
            if map
                .insert(direction.clone(), Checkpoint::new(&entry.path))
                .is_some()
            {
                return Err(DecoderError::Config(format!(
                    "duplicate checkpoint for direction {}",
                    direction
                )));
            }
        }
        Ok(map)
    }

    /// Checks option consistency.
    pub fn validate(&self) -> Result<()> {
        if self.gpus.is_some() && self.threads.is_some() {
            return Err(DecoderError::Config(
                "'threads' can only be set when 'gpus' is absent".to_string(),
            ));
        }

        if let Some(gpus) = &self.gpus {
            let mut sorted = gpus.clone();
            sorted.sort_unstable();
            sorted.dedup();
            if sorted.len() != gpus.len() {
                return Err(DecoderError::Config(format!(
                    "duplicate GPU ids in {:?}",
                    gpus
                )));
            }
        }

        if !self.echo && self.capacity() == 0 {
            return Err(DecoderError::Config(
                "decoder pool capacity must be greater than zero".to_string(),
            ));
        }

        if self.request_timeout_secs == 0 {
            return Err(DecoderError::Config(
                "request_timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.respawn.max_attempts == 0 {
            return Err(DecoderError::Config(
                "respawn.max_attempts must be at least 1".to_string(),
            ));
        }

        self.checkpoint_map()?;
        Ok(())
    }
}
