//! Decoder processes backed by the Python main loop.
//!
//! The launcher runs `<python> <main_loop> <model_dir> [--log-level L] [--gpu N]`
//! and waits for the `READY` handshake. Stderr carries JSON log records
//! which are re-emitted through `tracing`.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStderr;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, warn};

use super::bridge::{BridgeError, ProcessBridge};
use super::protocol::{self, READY};
use super::{DecoderProcess, ProcessLauncher};
use crate::config::DecoderConfig;
use crate::error::{DecoderError, Result};
use crate::model::{Device, LanguageDirection, Sentence, Suggestion, Translation};

/// Grace period between closing stdin and killing the process.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Launches Python decoder processes.
#[derive(Debug, Clone)]
pub struct PythonLauncher {
    python: String,
    main_loop: PathBuf,
    model_dir: PathBuf,
    extra_args: Vec<String>,
    request_timeout: Duration,
    startup_timeout: Duration,
}

impl PythonLauncher {
    pub fn new(
        python: impl Into<String>,
        main_loop: impl Into<PathBuf>,
        model_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            python: python.into(),
            main_loop: main_loop.into(),
            model_dir: model_dir.into(),
            extra_args: Vec::new(),
            request_timeout: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(600),
        }
    }

    pub fn from_config(config: &DecoderConfig) -> Self {
        Self::new(&config.python, &config.main_loop, &config.model_dir)
            .with_request_timeout(config.request_timeout())
            .with_startup_timeout(config.startup_timeout())
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    fn command_args(&self, device: Device) -> Vec<String> {
        let mut args = vec![
            self.main_loop.display().to_string(),
            self.model_dir.display().to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());

        if let Some(level) = native_log_level() {
            args.push("--log-level".to_string());
            args.push(level.to_string());
        }

        if let Device::Gpu(id) = device {
            args.push("--gpu".to_string());
            args.push(id.to_string());
        }

        args
    }

    fn environment(device: Device) -> Vec<(String, String)> {
        vec![
            ("CUDA_DEVICE_ORDER".to_string(), "PCI_BUS_ID".to_string()),
            ("CUDA_VISIBLE_DEVICES".to_string(), device.visible_devices()),
        ]
    }
}

#[async_trait]
impl ProcessLauncher for PythonLauncher {
    async fn launch(&self, device: Device) -> Result<Box<dyn DecoderProcess>> {
        let begin = Instant::now();
        let mut bridge = ProcessBridge::spawn(
            &self.python,
            &self.command_args(device),
            &Self::environment(device),
            self.request_timeout,
        )
        .map_err(|e| DecoderError::WorkerUnavailable(e.to_string()))?;

        if let Some(stderr) = bridge.take_stderr() {
            tokio::spawn(forward_logs(stderr, device));
        }

        let handshake = bridge.receive_within(self.startup_timeout).await;
        match handshake {
            Ok(line) if line == READY => {
                debug!(
                    device = %device,
                    pid = ?bridge.pid(),
                    elapsed_ms = begin.elapsed().as_millis() as u64,
                    "Decoder process ready"
                );
                Ok(Box::new(PythonDecoderProcess {
                    bridge: Some(bridge),
                    device,
                    alive: true,
                }))
            }
            other => {
                let _ = bridge.close(CLOSE_GRACE).await;
                let reason = match other {
                    Ok(line) => format!("unexpected handshake: {}", line),
                    Err(e) => e.to_string(),
                };
                Err(DecoderError::WorkerUnavailable(format!(
                    "failed to start decoder on {}: {}",
                    device, reason
                )))
            }
        }
    }
}

/// A running Python decoder process.
pub struct PythonDecoderProcess {
    bridge: Option<ProcessBridge>,
    device: Device,
    alive: bool,
}

impl PythonDecoderProcess {
    async fn exchange(&mut self, request: String) -> Result<Translation> {
        let result = match self.bridge.as_mut() {
            Some(bridge) if self.alive => match bridge.send_receive(&request).await {
                Ok(line) => protocol::decode_response(&line).and_then(|mut translations| {
                    if translations.is_empty() {
                        Err(DecoderError::WorkerUnavailable(
                            "empty response from decoder".to_string(),
                        ))
                    } else {
                        Ok(translations.swap_remove(0))
                    }
                }),
                Err(BridgeError::Timeout(d)) => Err(DecoderError::WorkerUnavailable(format!(
                    "decoder process not responding after {:?}",
                    d
                ))),
                Err(e) => Err(DecoderError::WorkerUnavailable(format!(
                    "failed to send request to decoder process: {}",
                    e
                ))),
            },
            _ => {
                return Err(DecoderError::WorkerUnavailable(
                    "decoder process not available".to_string(),
                ))
            }
        };

        if let Err(e) = &result {
            if e.is_unavailable() {
                warn!(device = %self.device, error = %e, "Decoder process failed, closing it");
                self.close().await;
            }
        }

        result
    }
}

#[async_trait]
impl DecoderProcess for PythonDecoderProcess {
    fn device(&self) -> Device {
        self.device
    }

    fn is_alive(&mut self) -> bool {
        self.alive && self.bridge.as_mut().is_some_and(|b| b.is_running())
    }

    async fn translate(
        &mut self,
        direction: &LanguageDirection,
        sentence: &Sentence,
        suggestions: &[Suggestion],
    ) -> Result<Translation> {
        let request = protocol::encode_request(direction, sentence, suggestions, None)?;
        self.exchange(request).await
    }

    async fn align(
        &mut self,
        direction: &LanguageDirection,
        sentence: &Sentence,
        target: &[String],
    ) -> Result<Translation> {
        let request = protocol::encode_request(direction, sentence, &[], Some(target))?;
        self.exchange(request).await
    }

    async fn close(&mut self) {
        self.alive = false;
        if let Some(bridge) = self.bridge.take() {
            if let Err(e) = bridge.close(CLOSE_GRACE).await {
                warn!(device = %self.device, error = %e, "Failed to close decoder process cleanly");
            }
        }
    }
}

/// Log level forwarded to the worker so it filters at the source.
fn native_log_level() -> Option<&'static str> {
    let current = LevelFilter::current();
    if current == LevelFilter::OFF {
        None
    } else if current >= LevelFilter::DEBUG {
        Some("debug")
    } else if current == LevelFilter::INFO {
        Some("info")
    } else if current == LevelFilter::WARN {
        Some("warning")
    } else {
        Some("error")
    }
}

#[derive(Debug, Deserialize, PartialEq)]
struct LogRecord {
    level: String,
    message: String,
    #[serde(default)]
    logger: String,
}

fn parse_log_record(line: &str) -> Option<LogRecord> {
    serde_json::from_str(line).ok()
}

async fn forward_logs(stderr: ChildStderr, device: Device) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => forward_log_line(&line, device),
            Ok(None) => break,
            Err(e) => {
                error!(device = %device, error = %e, "Failed to read decoder process stderr");
                break;
            }
        }
    }
}

fn forward_log_line(line: &str, device: Device) {
    if line.trim().is_empty() {
        return;
    }

    let Some(record) = parse_log_record(line) else {
        warn!(device = %device, "Unable to parse decoder log entry: {}", line);
        return;
    };

    match record.level.as_str() {
        "CRITICAL" | "ERROR" => {
            error!(device = %device, logger = %record.logger, "{}", record.message)
        }
        "WARNING" => warn!(device = %device, logger = %record.logger, "{}", record.message),
        "INFO" => info!(device = %device, logger = %record.logger, "{}", record.message),
        _ => debug!(device = %device, logger = %record.logger, "{}", record.message),
    }
}
