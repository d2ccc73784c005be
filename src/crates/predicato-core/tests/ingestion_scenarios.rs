//! End-to-end ingestion scenarios over the in-memory driver and a
//! scripted NLP client.

mod support;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use predicato_core::{
    EntityTypeSpec, Episode, GraphDriver, IngestionOptions, IngestionOrchestrator,
    InMemoryGraphDriver, NodeType, OrchestratorConfig,
};
use predicato_graph::{Edge, Node, IS_DUPLICATE_OF, MENTIONED_IN};
use support::{HashEmbedder, ScriptedNlp};

fn options_with_types() -> IngestionOptions {
    IngestionOptions::new()
        .with_entity_type(EntityTypeSpec::new("PERSON", "a human being"))
        .with_entity_type(EntityTypeSpec::new("ORGANIZATION", "a company or institution"))
}

fn orchestrator(
    driver: Arc<InMemoryGraphDriver>,
    nlp: Arc<ScriptedNlp>,
    dir: &TempDir,
) -> IngestionOrchestrator {
    IngestionOrchestrator::with_config(
        driver,
        nlp,
        Arc::new(HashEmbedder),
        OrchestratorConfig::new().with_checkpoint_dir(dir.path()),
    )
}

fn reference_time() -> DateTime<Utc> {
    "2024-06-01T12:00:00Z".parse().unwrap()
}

const EXTRACTION: &str = "Extract the entities mentioned";
const RESOLUTION: &str = "duplicate of an existing entity";
const EDGE_EXTRACTION: &str = "Extract factual relationships";
const DATING: &str = "when the fact became true";
const CONTRADICTION: &str = "it contradicts";

fn alice_acme_nlp() -> ScriptedNlp {
    ScriptedNlp::new()
        .on(
            EXTRACTION,
            "name\tentity_type_id\tsummary\nAlice\t1\tWorks at Acme\nAcme\t2\tAn employer\n",
        )
        .on(
            EDGE_EXTRACTION,
            "source_name\trelation\ttarget_name\tfact\nAlice\tWORKS_FOR\tAcme\tAlice works for Acme.\n",
        )
}

/// S1: a fresh episode produces two entities, one fact, two mentions,
/// and no leftover checkpoint.
#[tokio::test]
async fn test_fresh_episode_single_chunk() {
    let driver = Arc::new(InMemoryGraphDriver::new());
    let nlp = alice_acme_nlp().into_arc();
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(driver.clone(), nlp, &dir);

    let episode = Episode::new("ep-1", "g", "Alice works for Acme.")
        .with_reference_time(reference_time());
    let result = orchestrator
        .ingest_with_limit(episode, options_with_types(), 1000)
        .await
        .unwrap();

    assert_eq!(result.resolved_nodes.len(), 2);
    let alice = result
        .resolved_nodes
        .iter()
        .find(|n| n.name == "Alice")
        .unwrap();
    assert_eq!(alice.entity_type, "PERSON");
    let acme = result
        .resolved_nodes
        .iter()
        .find(|n| n.name == "Acme")
        .unwrap();
    assert_eq!(acme.entity_type, "ORGANIZATION");

    assert_eq!(result.resolved_edges.len(), 1);
    let fact = &result.resolved_edges[0];
    assert_eq!(fact.name, "WORKS_FOR");
    assert_eq!(fact.source_id, alice.uuid);
    assert_eq!(fact.target_id, acme.uuid);
    assert_eq!(fact.valid_from, reference_time());

    assert_eq!(result.episodic_edges.len(), 2);
    assert!(result.episodic_edges.iter().all(|e| e.name == MENTIONED_IN));
    assert!(result.invalidated_edges.is_empty());

    // The checkpoint is gone and the deltas are committed.
    assert!(!orchestrator.checkpoints().exists("ep-1").await.unwrap());
    assert!(driver.get_node(alice.uuid, "g").await.unwrap().is_some());
    assert!(driver.get_edge(fact.uuid, "g").await.unwrap().is_some());
}

/// S2: an extraction matching an existing node merges instead of
/// minting, and records the duplicate pair as an IS_DUPLICATE_OF edge.
#[tokio::test]
async fn test_duplicate_resolution_against_existing_graph() {
    let driver = Arc::new(InMemoryGraphDriver::new());
    let preexisting = Node::entity("g", "Acme")
        .with_entity_type("ORGANIZATION")
        .with_summary("An employer of record.");
    driver.upsert_node(&preexisting).await.unwrap();

    let nlp = ScriptedNlp::new()
        .on(
            EXTRACTION,
            "name\tentity_type_id\tsummary\nAlice\t1\tNew hire\nAcme\t2\tAn employer\n",
        )
        .on(
            RESOLUTION,
            "id\tduplicate_idx\tduplicates\n0\t-1\tnull\n1\t0\tnull\n",
        )
        .on(
            EDGE_EXTRACTION,
            "source_name\trelation\ttarget_name\tfact\nAlice\tWORKS_FOR\tAcme\tAlice joined Acme.\n",
        )
        .into_arc();
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(driver.clone(), nlp, &dir);

    let episode = Episode::new("ep-2", "g", "Alice joined Acme.")
        .with_reference_time(reference_time());
    let result = orchestrator
        .ingest(episode, options_with_types())
        .await
        .unwrap();

    // The Acme mention resolved onto the preexisting node.
    let acme = result
        .resolved_nodes
        .iter()
        .find(|n| n.name == "Acme")
        .unwrap();
    assert_eq!(acme.uuid, preexisting.uuid);

    // No second Acme node was written.
    let stats = driver.get_stats("g").await.unwrap();
    assert_eq!(stats.nodes_by_type.get("entity"), Some(&2));

    // The fact edge points at the canonical uuid.
    let fact = result
        .resolved_edges
        .iter()
        .find(|e| e.name == "WORKS_FOR")
        .unwrap();
    assert_eq!(fact.target_id, preexisting.uuid);

    // Exactly one IS_DUPLICATE_OF edge for the pair.
    let duplicates: Vec<&Edge> = result
        .resolved_edges
        .iter()
        .filter(|e| e.name == IS_DUPLICATE_OF)
        .collect();
    assert_eq!(duplicates.len(), 1);
    assert_eq!(duplicates[0].target_id, preexisting.uuid);
}

/// S3: a mid-stage NLP failure leaves a resumable checkpoint; the next
/// call finishes the episode and deletes it.
#[tokio::test]
async fn test_mid_stage_failure_then_resume() {
    let driver = Arc::new(InMemoryGraphDriver::new());
    let nlp = alice_acme_nlp()
        .fail_once_on(DATING, "provider refused")
        .into_arc();
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(driver.clone(), nlp, &dir);

    let episode = Episode::new("ep-3", "g", "Alice works for Acme.")
        .with_reference_time(reference_time());

    let err = orchestrator
        .ingest(episode.clone(), options_with_types())
        .await
        .unwrap_err();
    assert_eq!(
        err.failed_step(),
        Some(predicato_core::IngestStep::ResolvedEdges)
    );

    let checkpoint = orchestrator
        .checkpoints()
        .load("ep-3")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.step, predicato_core::IngestStep::ExtractedEdges);
    assert_eq!(checkpoint.attempt_count, 1);
    assert!(checkpoint.last_error.is_some());

    // Second attempt resumes from the failed stage and completes.
    let result = orchestrator
        .ingest(episode, options_with_types())
        .await
        .unwrap();
    assert_eq!(result.resolved_edges.len(), 1);
    assert!(!orchestrator.checkpoints().exists("ep-3").await.unwrap());
}

/// S4: a new contradicting fact closes the old edge's span at the new
/// fact's start.
#[tokio::test]
async fn test_temporal_invalidation() {
    let driver = Arc::new(InMemoryGraphDriver::new());
    let alice = Node::entity("g", "Alice").with_entity_type("PERSON");
    let acme = Node::entity("g", "Acme").with_entity_type("ORGANIZATION");
    let old_edge = Edge::entity(
        "g",
        alice.uuid,
        acme.uuid,
        "WORKS_FOR",
        "Alice works for Acme.",
    )
    .with_valid_from("2022-01-01T00:00:00Z".parse().unwrap());
    driver.upsert_node(&alice).await.unwrap();
    driver.upsert_node(&acme).await.unwrap();
    driver.upsert_edge(&old_edge).await.unwrap();

    let new_start = "2024-06-01T00:00:00Z";
    let nlp = ScriptedNlp::new()
        .on(
            EXTRACTION,
            "name\tentity_type_id\tsummary\nAlice\t1\tnull\nGlobex\t2\tA new employer\n",
        )
        .on(
            RESOLUTION,
            "id\tduplicate_idx\tduplicates\n0\t0\tnull\n1\t-1\tnull\n",
        )
        .on(
            EDGE_EXTRACTION,
            "source_name\trelation\ttarget_name\tfact\nAlice\tWORKS_FOR\tGlobex\tAlice works for Globex.\n",
        )
        .on(DATING, format!("valid_at\tinvalid_at\n{new_start}\tnull\n"))
        .on(CONTRADICTION, "id\n0\n")
        .into_arc();
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(driver.clone(), nlp, &dir);

    let episode = Episode::new("ep-4", "g", "Alice now works for Globex.")
        .with_reference_time(new_start.parse().unwrap());
    let result = orchestrator
        .ingest(episode, options_with_types())
        .await
        .unwrap();

    let cutoff: DateTime<Utc> = new_start.parse().unwrap();

    // The new fact carries the extracted start date.
    let new_fact = result
        .resolved_edges
        .iter()
        .find(|e| e.name == "WORKS_FOR")
        .unwrap();
    assert_eq!(new_fact.valid_from, cutoff);

    // The old fact's span closed at the new fact's start.
    assert_eq!(result.invalidated_edges.len(), 1);
    assert_eq!(result.invalidated_edges[0].uuid, old_edge.uuid);
    assert_eq!(result.invalidated_edges[0].valid_to, Some(cutoff));

    // And the closure was committed.
    let stored = driver.get_edge(old_edge.uuid, "g").await.unwrap().unwrap();
    assert_eq!(stored.valid_to, Some(cutoff));
}

/// Zero chunks: an empty episode reaches completed without touching the
/// graph.
#[tokio::test]
async fn test_zero_chunks_short_circuits() {
    let driver = Arc::new(InMemoryGraphDriver::new());
    let nlp = ScriptedNlp::new().into_arc();
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(driver.clone(), nlp.clone(), &dir);

    let episode = Episode::new("ep-empty", "g", "   ");
    let result = orchestrator
        .ingest(episode, IngestionOptions::default())
        .await
        .unwrap();

    assert!(result.resolved_nodes.is_empty());
    assert!(result.resolved_edges.is_empty());
    assert!(result.episodic_edges.is_empty());
    assert!(!orchestrator.checkpoints().exists("ep-empty").await.unwrap());
    assert_eq!(driver.node_count(), 0);
    assert_eq!(nlp.calls_matching(EXTRACTION), 0);
}

/// Zero extracted entities: later stages flow empty outputs but the
/// episode node itself is still committed.
#[tokio::test]
async fn test_zero_entities_flow_empty() {
    let driver = Arc::new(InMemoryGraphDriver::new());
    let nlp = ScriptedNlp::new()
        .on(EXTRACTION, "name\tentity_type_id\tsummary\n")
        .into_arc();
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(driver.clone(), nlp.clone(), &dir);

    let episode = Episode::new("ep-quiet", "g", "Nothing of note happened.");
    let result = orchestrator
        .ingest(episode, IngestionOptions::default())
        .await
        .unwrap();

    assert!(result.resolved_nodes.is_empty());
    assert!(result.resolved_edges.is_empty());
    assert!(result.episodic_edges.is_empty());
    // Edge extraction never ran: there were no entities to relate.
    assert_eq!(nlp.calls_matching(EDGE_EXTRACTION), 0);

    // The episode node was still written.
    let stats = driver.get_stats("g").await.unwrap();
    assert_eq!(stats.nodes_by_type.get("episodic"), Some(&1));
    assert!(stats.nodes_by_type.get("entity").is_none());
}

/// Re-ingesting a completed episode replays the recorded result until
/// the tombstone is cleared.
#[tokio::test]
async fn test_completed_episode_is_idempotent() {
    let driver = Arc::new(InMemoryGraphDriver::new());
    let nlp = alice_acme_nlp().into_arc();
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(driver.clone(), nlp.clone(), &dir);

    let episode = Episode::new("ep-5", "g", "Alice works for Acme.")
        .with_reference_time(reference_time());
    let first = orchestrator
        .ingest(episode.clone(), options_with_types())
        .await
        .unwrap();
    let extraction_calls = nlp.calls_matching(EXTRACTION);

    let replay = orchestrator
        .ingest(episode.clone(), options_with_types())
        .await
        .unwrap();
    assert_eq!(
        replay.resolved_nodes.len(),
        first.resolved_nodes.len()
    );
    // No new NLP traffic for the replay.
    assert_eq!(nlp.calls_matching(EXTRACTION), extraction_calls);

    // Clearing the tombstone reseeds a clean re-ingestion.
    orchestrator
        .checkpoints()
        .clear_tombstone("ep-5")
        .await
        .unwrap();
    orchestrator
        .ingest(episode, options_with_types())
        .await
        .unwrap();
    assert!(nlp.calls_matching(EXTRACTION) > extraction_calls);
}

/// A multi-chunk episode fans extraction out per chunk and resolves the
/// mentions into one entity set.
#[tokio::test]
async fn test_multi_chunk_extraction() {
    let driver = Arc::new(InMemoryGraphDriver::new());
    let nlp = ScriptedNlp::new()
        .on(
            EXTRACTION,
            "name\tentity_type_id\tsummary\nAlice\t1\tnull\n",
        )
        .into_arc();
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator(driver.clone(), nlp.clone(), &dir);

    let content = "Alice did one thing here.\n\nAlice did another thing there.";
    let episode = Episode::new("ep-6", "g", content).with_reference_time(reference_time());
    let result = orchestrator
        .ingest_with_limit(episode, options_with_types(), 30)
        .await
        .unwrap();

    // Two chunks extracted Alice; resolution collapsed the mentions.
    assert_eq!(nlp.calls_matching(EXTRACTION), 2);
    assert_eq!(result.resolved_nodes.len(), 1);
    assert_eq!(result.resolved_nodes[0].name, "Alice");
    assert_eq!(result.episodic_edges.len(), 1);

    // Chunk episode nodes were committed alongside the main one.
    let episodic: Vec<Node> = driver
        .get_nodes_in_time_range(
            "2024-06-01T00:00:00Z".parse().unwrap(),
            "2024-06-02T00:00:00Z".parse().unwrap(),
            "g",
        )
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.node_type == NodeType::Episodic)
        .collect();
    assert_eq!(episodic.len(), 3);
}
