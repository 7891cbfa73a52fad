//! In-memory decoder processes for integration tests.
//!
//! Sentences drive the fake worker's behavior:
//! - `CRASH` anywhere in the sentence kills the process
//! - `BADINPUT` yields a structured failure, the process stays alive
//! - `SLOW` holds the call for 200ms before answering
//! - `PANIC` panics inside the call
//! - anything else is "translated" by upper-casing every token

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nmt_pool::error::Result;
use nmt_pool::model::{Alignment, Device, LanguageDirection, Sentence, Suggestion, Translation};
use nmt_pool::process::{DecoderProcess, ProcessLauncher};
use nmt_pool::DecoderError;

/// One call received by a fake worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Translate { device: Device, hints: usize },
    Align { device: Device, target: Vec<String> },
}

/// Shared record of what the fake workers saw.
#[derive(Debug, Default)]
pub struct Journal {
    pub calls: Mutex<Vec<Call>>,
    pub launched: Mutex<Vec<Device>>,
    pub launch_attempts: AtomicUsize,
    pub closed: AtomicUsize,
}

impl Journal {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn launched(&self) -> Vec<Device> {
        self.launched.lock().unwrap().clone()
    }

    pub fn launch_attempts(&self) -> usize {
        self.launch_attempts.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct FakeProcess {
    device: Device,
    alive: bool,
    journal: Arc<Journal>,
}

#[async_trait]
impl DecoderProcess for FakeProcess {
    fn device(&self) -> Device {
        self.device
    }

    fn is_alive(&mut self) -> bool {
        self.alive
    }

    async fn translate(
        &mut self,
        _direction: &LanguageDirection,
        sentence: &Sentence,
        suggestions: &[Suggestion],
    ) -> Result<Translation> {
        self.check_alive()?;
        self.journal.calls.lock().unwrap().push(Call::Translate {
            device: self.device,
            hints: suggestions.len(),
        });

        let tokens = sentence.tokens();
        if tokens.iter().any(|t| t == "SLOW") {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        if tokens.iter().any(|t| t == "PANIC") {
            panic!("decoder panicked on {:?}", tokens);
        }
        if tokens.iter().any(|t| t == "CRASH") {
            self.alive = false;
            return Err(DecoderError::WorkerUnavailable(
                "process exited with code 139".to_string(),
            ));
        }
        if tokens.iter().any(|t| t == "BADINPUT") {
            return Err(DecoderError::Worker {
                kind: "InvalidInput".to_string(),
                message: None,
            });
        }

        let upper: Vec<String> = tokens.iter().map(|t| t.to_uppercase()).collect();
        Ok(Translation::from_tokens(&upper))
    }

    async fn align(
        &mut self,
        _direction: &LanguageDirection,
        sentence: &Sentence,
        target: &[String],
    ) -> Result<Translation> {
        self.check_alive()?;
        self.journal.calls.lock().unwrap().push(Call::Align {
            device: self.device,
            target: target.to_vec(),
        });

        let pairs = sentence.words.len().min(target.len());
        let indexes: Vec<usize> = (0..pairs).collect();
        let mut translation = Translation::from_tokens(target);
        translation.alignment = Some(Alignment::new(indexes.clone(), indexes));
        Ok(translation)
    }

    async fn close(&mut self) {
        if self.alive {
            self.journal.closed.fetch_add(1, Ordering::SeqCst);
        }
        self.alive = false;
    }
}

impl FakeProcess {
    fn check_alive(&self) -> Result<()> {
        if self.alive {
            Ok(())
        } else {
            Err(DecoderError::WorkerUnavailable("process is dead".to_string()))
        }
    }
}

/// Launches fake processes. Launches beyond `max_launches` fail.
pub struct FakeLauncher {
    pub journal: Arc<Journal>,
    max_launches: Option<usize>,
    delay: Duration,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            journal: Arc::new(Journal::default()),
            max_launches: None,
            delay: Duration::ZERO,
        }
    }

    pub fn with_max_launches(mut self, max: usize) -> Self {
        self.max_launches = Some(max);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn launch(&self, device: Device) -> Result<Box<dyn DecoderProcess>> {
        let attempt = self.journal.launch_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.max_launches.is_some_and(|max| attempt > max) {
            return Err(DecoderError::WorkerUnavailable(format!(
                "cannot start decoder on {}",
                device
            )));
        }

        self.journal.launched.lock().unwrap().push(device);
        Ok(Box::new(FakeProcess {
            device,
            alive: true,
            journal: Arc::clone(&self.journal),
        }))
    }
}

/// Polls `condition` every 10ms for up to five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn en_it() -> LanguageDirection {
    LanguageDirection::new("en", "it")
}

pub fn de_en() -> LanguageDirection {
    LanguageDirection::new("de", "en")
}
