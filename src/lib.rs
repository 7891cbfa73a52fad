//! nmt-pool: execution layer for neural machine translation decoders.
//!
//! Keeps a fixed-size pool of external decoder processes (one per GPU, or a
//! number of CPU workers), hands them out with checkpoint affinity, replaces
//! crashed ones in the background, and schedules batches of sentences onto
//! them.

pub mod cli;
pub mod config;
pub mod decoder;
pub mod error;
pub mod metrics;
pub mod model;
pub mod pool;
pub mod process;
pub mod scheduler;

pub use config::DecoderConfig;
pub use decoder::NeuralDecoder;
pub use error::DecoderError;
pub use pool::{AvailabilityListener, DecoderPool, WorkerHandle};
pub use scheduler::{Scheduler, TranslationSplit};
