//! Worker handle: one backing process plus its pool bookkeeping.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use super::queue::Affine;
use crate::error::{DecoderError, Result};
use crate::model::{Checkpoint, Device, LanguageDirection, Sentence, Suggestion, Translation};
use crate::process::{DecoderProcess, ProcessLauncher};

/// Checkpoint each supported direction resolves to.
pub type CheckpointMap = HashMap<LanguageDirection, Checkpoint>;

/// A pooled worker.
///
/// The backing process is behind an async mutex so that a call in flight
/// keeps exclusive access to it; the pool additionally guarantees that a
/// handle is owned by one caller at a time through [`mark_in_use`].
///
/// [`mark_in_use`]: WorkerHandle::mark_in_use
pub struct WorkerHandle {
    slot: usize,
    device: Device,
    process: tokio::sync::Mutex<Option<Box<dyn DecoderProcess>>>,
    launcher: Arc<dyn ProcessLauncher>,
    checkpoints: Arc<CheckpointMap>,
    last_checkpoint: Mutex<Option<Checkpoint>>,
    in_use: AtomicBool,
    alive: AtomicBool,
}

impl WorkerHandle {
    /// Launches a process on `device` and wraps it.
    pub async fn launch(
        slot: usize,
        device: Device,
        launcher: Arc<dyn ProcessLauncher>,
        checkpoints: Arc<CheckpointMap>,
    ) -> Result<Self> {
        let process = launcher.launch(device).await?;
        debug!(slot = slot, device = %device, "Worker launched");

        Ok(Self {
            slot,
            device,
            process: tokio::sync::Mutex::new(Some(process)),
            launcher,
            checkpoints,
            last_checkpoint: Mutex::new(None),
            in_use: AtomicBool::new(false),
            alive: AtomicBool::new(true),
        })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Checkpoint recorded by the last translate or align call.
    pub fn last_checkpoint(&self) -> Option<Checkpoint> {
        self.last_checkpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_last_checkpoint(&self, checkpoint: Option<Checkpoint>) {
        *self
            .last_checkpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = checkpoint;
    }

    /// Claims the handle. Fails if another caller already holds it.
    pub fn mark_in_use(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Gives the handle back. Returns false if it was already free.
    pub fn mark_free(&self) -> bool {
        self.in_use
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Flags the handle as dead without touching the process. The next
    /// release routes it through crash recovery.
    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Closes the current process and launches a fresh one on the same
    /// device. The checkpoint record is cleared.
    ///
    /// The pool does not use this for crash recovery: a dead handle is
    /// dropped and its slot gets a new handle, possibly on another free
    /// device.
    pub async fn restart(&self) -> Result<()> {
        let mut process = self.process.lock().await;
        if let Some(mut old) = process.take() {
            old.close().await;
        }
        self.alive.store(false, Ordering::SeqCst);
        self.set_last_checkpoint(None);

        let fresh = self.launcher.launch(self.device).await?;
        *process = Some(fresh);
        self.alive.store(true, Ordering::SeqCst);

        info!(slot = self.slot, device = %self.device, "Worker restarted");
        Ok(())
    }

    pub async fn translate(
        &self,
        direction: &LanguageDirection,
        sentence: &Sentence,
        suggestions: &[Suggestion],
    ) -> Result<Translation> {
        self.set_last_checkpoint(self.checkpoints.get(direction).cloned());

        let mut guard = self.process.lock().await;
        let process = self.live_process(&mut guard)?;
        let call = InFlight::start(self);
        let result = process.translate(direction, sentence, suggestions).await;
        call.finish();
        self.alive.store(process.is_alive(), Ordering::SeqCst);
        result
    }

    /// Alignment-only call against a known target.
    pub async fn align(
        &self,
        direction: &LanguageDirection,
        sentence: &Sentence,
        target: &[String],
    ) -> Result<Translation> {
        self.set_last_checkpoint(self.checkpoints.get(direction).cloned());

        let mut guard = self.process.lock().await;
        let process = self.live_process(&mut guard)?;
        let call = InFlight::start(self);
        let result = process.align(direction, sentence, target).await;
        call.finish();
        self.alive.store(process.is_alive(), Ordering::SeqCst);
        result
    }

    fn live_process<'a>(
        &self,
        slot: &'a mut Option<Box<dyn DecoderProcess>>,
    ) -> Result<&'a mut Box<dyn DecoderProcess>> {
        match slot {
            Some(process) => Ok(process),
            None => {
                self.alive.store(false, Ordering::SeqCst);
                Err(DecoderError::WorkerUnavailable(format!(
                    "worker {} has no running process",
                    self.slot
                )))
            }
        }
    }

    /// Terminates the backing process. Safe to call more than once.
    pub async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(mut process) = self.process.lock().await.take() {
            process.close().await;
            debug!(slot = self.slot, device = %self.device, "Worker closed");
        }
    }
}

/// Marks the handle dead if a call is dropped before the process answers.
/// The request/response stream is out of step after that.
struct InFlight<'a> {
    handle: &'a WorkerHandle,
    finished: bool,
}

impl<'a> InFlight<'a> {
    fn start(handle: &'a WorkerHandle) -> Self {
        Self {
            handle,
            finished: false,
        }
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.handle.mark_dead();
            warn!(slot = self.handle.slot, device = %self.handle.device, "Decoder call abandoned");
        }
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("slot", &self.slot)
            .field("device", &self.device)
            .field("last_checkpoint", &self.last_checkpoint())
            .field("in_use", &self.is_in_use())
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Affine for Arc<WorkerHandle> {
    type Key = Checkpoint;

    fn has_affinity(&self, key: &Checkpoint) -> bool {
        self.last_checkpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            == Some(key)
    }
}
