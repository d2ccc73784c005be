//! Temporally-aware knowledge-graph ingestion for predicato.
//!
//! The core accepts a stream of textual episodes partitioned by tenant
//! group and incrementally turns each one into nodes and edges of a
//! property graph, preserving temporal validity and deduplicating
//! against prior state.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  IngestionOrchestrator (13-stage state machine)              │
//! │  • loads/creates the episode checkpoint                      │
//! │  • replays from the recorded step                            │
//! │  • persists every stage output before advancing              │
//! └───────┬──────────────────────┬───────────────────────────────┘
//!         │ policy               │ plumbing
//!         ↓                      ↓
//! ┌──────────────────┐   ┌───────────────────────────────────────┐
//! │  GraphModeler    │   │  Capabilities                         │
//! │  • entities      │   │  • GraphDriver (storage + search)     │
//! │  • relationships │   │  • NlpClient (retry-wrapped chat)     │
//! │  • communities   │   │  • Embedder (text -> vector)          │
//! └──────────────────┘   └───────────────────────────────────────┘
//! ```
//!
//! The orchestrator owns concurrency (per-chunk fan-out under a shared
//! semaphore), cancellation, and checkpoint discipline; the modeler owns
//! resolution policy; the capability traits isolate both from providers.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use predicato_core::{IngestionOrchestrator, InMemoryGraphDriver};
//! use predicato_graph::{Episode, IngestionOptions};
//!
//! let driver = Arc::new(InMemoryGraphDriver::new());
//! let orchestrator = IngestionOrchestrator::new(driver, my_nlp, my_embedder);
//!
//! let episode = Episode::new("ep-1", "tenant-a", "Alice works for Acme.");
//! let result = orchestrator.ingest(episode, IngestionOptions::default()).await?;
//! println!("{} entities, {} facts", result.resolved_nodes.len(), result.resolved_edges.len());
//! ```

pub mod driver;
pub mod embedder;
pub mod error;
pub mod modeler;
pub mod nlp;
pub mod ops;
pub mod orchestrator;
pub mod prompts;
pub mod tabular;

pub use driver::{
    EdgeSearchOptions, GraphDriver, GraphStats, InMemoryGraphDriver, NodeSearchOptions,
    VectorSearchOptions,
};
pub use embedder::Embedder;
pub use error::{CoreError, NlpErrorKind, Result};
pub use modeler::{
    validate_modeler, CommunityInput, CommunityOutput, DefaultModeler, EntityResolutionInput,
    EntityResolutionOutput, ErrorMode, GraphModeler, ModelerClients, RelationshipResolutionInput,
    RelationshipResolutionOutput, ResilientModeler, ValidationReport,
};
pub use nlp::{MessageRole, NlpClient, NlpMessage, NlpResponse, RetryConfig, RetryingNlp};
pub use orchestrator::{IngestionOrchestrator, IngestionResult, OrchestratorConfig};
pub use tabular::TabularFormat;

// Re-export the data model for convenience.
pub use predicato_checkpoint::{CheckpointManager, EpisodeCheckpoint, IngestStep};
pub use predicato_graph::{
    Edge, EdgeType, EntityTypeSpec, Episode, EpisodeType, IngestionOptions, Node, NodeType,
};
