//! Backing decoder processes.
//!
//! A [`DecoderProcess`] is one live inference process bound to a device.
//! A [`ProcessLauncher`] produces them; the pool only ever talks to these
//! two traits, so tests can substitute an in-memory implementation.
//!
//! - **bridge**: async stdin/stdout line transport to a child process
//! - **protocol**: JSON request/response encoding
//! - **python**: launcher and process for the Python decoder main loop

pub mod bridge;
pub mod protocol;
pub mod python;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Device, LanguageDirection, Sentence, Suggestion, Translation};

pub use bridge::{BridgeError, ProcessBridge};
pub use python::{PythonDecoderProcess, PythonLauncher};

/// One live inference process.
///
/// Any error for which [`crate::DecoderError::is_unavailable`] holds must
/// leave the process reporting `is_alive() == false`.
#[async_trait]
pub trait DecoderProcess: Send {
    /// Device the process is bound to.
    fn device(&self) -> Device;

    /// Whether the process is still responsive.
    fn is_alive(&mut self) -> bool;

    /// Generates a translation, optionally biased by suggestion hints.
    async fn translate(
        &mut self,
        direction: &LanguageDirection,
        sentence: &Sentence,
        suggestions: &[Suggestion],
    ) -> Result<Translation>;

    /// Alignment-only mode: the target text is already known and the
    /// process only computes the word alignment against it.
    async fn align(
        &mut self,
        direction: &LanguageDirection,
        sentence: &Sentence,
        target: &[String],
    ) -> Result<Translation>;

    /// Terminates the process. Safe to call more than once.
    async fn close(&mut self);
}

/// Factory for decoder processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Starts a process on `device` and waits until it is ready to serve.
    async fn launch(&self, device: Device) -> Result<Box<dyn DecoderProcess>>;
}
