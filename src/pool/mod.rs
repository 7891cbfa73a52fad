//! Decoder process pool.
//!
//! - **handle**: one worker process with its device and checkpoint bookkeeping
//! - **queue**: bounded idle queue with checkpoint-preferential dequeue
//! - **placement**: GPU/CPU device assignment
//! - **decoder_pool**: acquire/release, crash detection and relaunch

pub mod decoder_pool;
pub mod handle;
pub mod placement;
pub mod queue;

pub use decoder_pool::{AvailabilityListener, DecoderPool};
pub use handle::{CheckpointMap, WorkerHandle};
pub use placement::Placement;
pub use queue::{Affine, AffinityQueue};
