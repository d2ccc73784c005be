//! Durable per-episode processing state for predicato.
//!
//! Ingestion walks a fixed 13-step pipeline, and every step's output is
//! cached in an [`EpisodeCheckpoint`] before the step marker advances. A
//! crash, cancellation, or NLP failure therefore loses at most the stage
//! in flight: the next attempt loads the checkpoint and replays from the
//! recorded [`IngestStep`].
//!
//! # Core types
//!
//! - [`IngestStep`] - the fixed, linear step order with progress and
//!   recoverability queries
//! - [`EpisodeCheckpoint`] - the serialized snapshot: inputs, step,
//!   retry counters, and per-stage outputs
//! - [`CheckpointManager`] - file-backed storage with atomic writes,
//!   identifier validation, tolerant listing, GC, and statistics
//!
//! # Quick start
//!
//! ```rust,ignore
//! use predicato_checkpoint::{CheckpointManager, IngestStep};
//!
//! let manager = CheckpointManager::new();
//! let mut cp = manager.load_or_create(&episode, &options, 1000).await?;
//! if !cp.can_retry(3, chrono::Duration::hours(24)) {
//!     return Err(...);
//! }
//! cp.chunks = Some(chunks);
//! manager.save_with_step(&mut cp, IngestStep::Prepared).await?;
//! // ... remaining stages ...
//! manager.delete(&cp.episode_id).await?;
//! ```

pub mod checkpoint;
pub mod error;
pub mod manager;
pub mod step;

pub use checkpoint::{ChunkTuple, EpisodeCheckpoint};
pub use error::{CheckpointError, Result};
pub use manager::{CheckpointManager, CheckpointStatistics};
pub use step::IngestStep;
