//! Default modeler: node, edge, and temporal operations composed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use predicato_graph::{EdgeType, Node};

use crate::driver::GraphDriver;
use crate::embedder::Embedder;
use crate::error::Result;
use crate::modeler::{
    CommunityInput, CommunityOutput, EntityResolutionInput, EntityResolutionOutput,
    GraphModeler, RelationshipResolutionInput, RelationshipResolutionOutput,
};
use crate::nlp::NlpClient;
use crate::ops::edges::{build_duplicate_edges, build_episodic_edges, rewrite_endpoints, EdgeOperations};
use crate::ops::nodes::NodeOperations;
use crate::ops::temporal::TemporalOperations;
use crate::prompts;

/// Per-step NLP specialization, each slot falling back to the shared
/// default client.
#[derive(Clone)]
pub struct ModelerClients {
    pub default: Arc<dyn NlpClient>,
    pub extraction: Option<Arc<dyn NlpClient>>,
    pub reflexion: Option<Arc<dyn NlpClient>>,
    pub resolution: Option<Arc<dyn NlpClient>>,
    pub attribute: Option<Arc<dyn NlpClient>>,
    pub edge_extraction: Option<Arc<dyn NlpClient>>,
    pub edge_resolution: Option<Arc<dyn NlpClient>>,
    pub summarization: Option<Arc<dyn NlpClient>>,
}

impl ModelerClients {
    /// Every step shares `default`.
    pub fn shared(default: Arc<dyn NlpClient>) -> Self {
        Self {
            default,
            extraction: None,
            reflexion: None,
            resolution: None,
            attribute: None,
            edge_extraction: None,
            edge_resolution: None,
            summarization: None,
        }
    }

    fn pick(&self, specialized: &Option<Arc<dyn NlpClient>>) -> Arc<dyn NlpClient> {
        specialized.clone().unwrap_or_else(|| self.default.clone())
    }
}

/// Builds community nodes from entities an episode touched.
#[async_trait]
pub trait CommunityBuilder: Send + Sync {
    async fn build(&self, input: &CommunityInput) -> Result<Option<CommunityOutput>>;
}

/// The default [`GraphModeler`]: resolution via [`NodeOperations`] and
/// [`EdgeOperations`], communities via an optional [`CommunityBuilder`].
pub struct DefaultModeler {
    node_ops: NodeOperations,
    edge_ops: EdgeOperations,
    community_builder: Option<Arc<dyn CommunityBuilder>>,
}

impl DefaultModeler {
    /// Modeler sharing one NLP client across all steps.
    pub fn new(
        nlp: Arc<dyn NlpClient>,
        embedder: Arc<dyn Embedder>,
        driver: Arc<dyn GraphDriver>,
    ) -> Self {
        Self::with_clients(ModelerClients::shared(nlp), embedder, driver)
    }

    /// Modeler with per-step NLP specialization.
    pub fn with_clients(
        clients: ModelerClients,
        embedder: Arc<dyn Embedder>,
        driver: Arc<dyn GraphDriver>,
    ) -> Self {
        let node_ops = NodeOperations::new(clients.default.clone(), embedder.clone(), driver.clone())
            .with_extraction_client(clients.pick(&clients.extraction))
            .with_reflexion_client(clients.pick(&clients.reflexion))
            .with_resolution_client(clients.pick(&clients.resolution))
            .with_attribute_client(clients.pick(&clients.attribute));
        let edge_ops = EdgeOperations::new(clients.default.clone(), embedder, driver)
            .with_extraction_client(clients.pick(&clients.edge_extraction))
            .with_resolution_client(clients.pick(&clients.edge_resolution))
            .with_temporal(TemporalOperations::new(
                clients.pick(&clients.summarization),
            ));
        Self {
            node_ops,
            edge_ops,
            community_builder: None,
        }
    }

    /// Attach a community builder; without one,
    /// [`build_communities`](GraphModeler::build_communities) skips.
    pub fn with_community_builder(mut self, builder: Arc<dyn CommunityBuilder>) -> Self {
        self.community_builder = Some(builder);
        self
    }

    /// The node operations this modeler drives (extraction and
    /// attribute fill run through them at the orchestrator's stages).
    pub fn node_ops(&self) -> &NodeOperations {
        &self.node_ops
    }

    /// The edge operations this modeler drives.
    pub fn edge_ops(&self) -> &EdgeOperations {
        &self.edge_ops
    }
}

#[async_trait]
impl GraphModeler for DefaultModeler {
    async fn resolve_entities(
        &self,
        input: EntityResolutionInput,
    ) -> Result<EntityResolutionOutput> {
        let mut output = self
            .node_ops
            .resolve(
                &input.extracted_nodes,
                &input.episode,
                &input.previous_episodes,
                &input.options,
            )
            .await?;
        output.duplicate_pairs = self
            .node_ops
            .filter_existing_duplicate_pairs(&input.group_id, output.duplicate_pairs)
            .await?;
        Ok(output)
    }

    async fn resolve_relationships(
        &self,
        input: RelationshipResolutionInput,
    ) -> Result<RelationshipResolutionOutput> {
        let mut edges = input.extracted_edges.clone();
        rewrite_endpoints(&mut edges, &input.uuid_map);

        let outcome = self
            .edge_ops
            .resolve(edges, &input.episode, &input.previous_episodes, &input.options)
            .await?;

        let duplicate_edges = build_duplicate_edges(&input.group_id, &input.duplicate_pairs);
        let episodic_edges = build_episodic_edges(&input.episode_node, &input.resolved_nodes);

        let mut resolved_edges = outcome.resolved;
        let new_count = outcome.new_count + duplicate_edges.len();
        resolved_edges.extend(duplicate_edges);

        Ok(RelationshipResolutionOutput {
            resolved_edges,
            invalidated_edges: outcome.invalidated,
            episodic_edges,
            new_count,
            updated_count: outcome.updated_count,
        })
    }

    async fn build_communities(&self, input: CommunityInput) -> Result<Option<CommunityOutput>> {
        match &self.community_builder {
            Some(builder) => builder.build(&input).await,
            None => Ok(None),
        }
    }
}

/// Community builder grouping entities by connected components of the
/// episode's resolved edges, with an NLP-written summary per community.
pub struct ConnectedComponentCommunities {
    nlp: Arc<dyn NlpClient>,
}

impl ConnectedComponentCommunities {
    pub fn new(nlp: Arc<dyn NlpClient>) -> Self {
        Self { nlp }
    }
}

#[async_trait]
impl CommunityBuilder for ConnectedComponentCommunities {
    async fn build(&self, input: &CommunityInput) -> Result<Option<CommunityOutput>> {
        let components = connected_components(&input.resolved_nodes, input);
        if components.is_empty() {
            return Ok(None);
        }

        let mut output = CommunityOutput::default();
        for members in components {
            if members.len() < 2 {
                continue;
            }
            let mut names: Vec<&str> = members.iter().map(|n| n.name.as_str()).collect();
            names.sort_unstable();
            let name = names.join(", ");

            let summary = match self.nlp.chat(&prompts::attributes::summarize_community(&members)).await {
                Ok(response) => response.content.trim().to_string(),
                Err(err) => {
                    warn!(error = %err, "community summarization failed, using member list");
                    name.clone()
                }
            };

            let community = Node::community(&input.group_id, &name).with_summary(summary);
            for member in &members {
                let mut edge = predicato_graph::Edge::entity(
                    &input.group_id,
                    community.uuid,
                    member.uuid,
                    "HAS_MEMBER",
                    "",
                );
                edge.edge_type = EdgeType::Community;
                output.community_edges.push(edge);
            }
            output.communities.push(community);
        }

        if output.communities.is_empty() {
            return Ok(None);
        }
        debug!(communities = output.communities.len(), "community refresh");
        Ok(Some(output))
    }
}

fn connected_components(nodes: &[Node], input: &CommunityInput) -> Vec<Vec<Node>> {
    let mut parent: HashMap<Uuid, Uuid> = nodes.iter().map(|n| (n.uuid, n.uuid)).collect();

    fn find(parent: &mut HashMap<Uuid, Uuid>, id: Uuid) -> Uuid {
        let mut root = id;
        while parent[&root] != root {
            root = parent[&root];
        }
        let mut current = id;
        while parent[&current] != root {
            let next = parent[&current];
            parent.insert(current, root);
            current = next;
        }
        root
    }

    for edge in &input.resolved_edges {
        if edge.edge_type != EdgeType::Entity {
            continue;
        }
        if !parent.contains_key(&edge.source_id) || !parent.contains_key(&edge.target_id) {
            continue;
        }
        let a = find(&mut parent, edge.source_id);
        let b = find(&mut parent, edge.target_id);
        if a != b {
            parent.insert(a, b);
        }
    }

    let mut grouped: HashMap<Uuid, Vec<Node>> = HashMap::new();
    for node in nodes {
        let root = find(&mut parent, node.uuid);
        grouped.entry(root).or_default().push(node.clone());
    }
    let mut components: Vec<Vec<Node>> = grouped.into_values().collect();
    for component in &mut components {
        component.sort_by(|a, b| a.uuid.cmp(&b.uuid));
    }
    components.sort_by(|a, b| a[0].uuid.cmp(&b[0].uuid));
    components
}

#[cfg(test)]
mod tests {
    use super::*;
    use predicato_graph::Edge;

    #[test]
    fn test_connected_components_split() {
        let a = Node::entity("g", "a");
        let b = Node::entity("g", "b");
        let c = Node::entity("g", "c");
        let input = CommunityInput {
            resolved_nodes: vec![a.clone(), b.clone(), c.clone()],
            resolved_edges: vec![Edge::entity("g", a.uuid, b.uuid, "KNOWS", "")],
            group_id: "g".to_string(),
        };
        let components = connected_components(&input.resolved_nodes, &input);
        assert_eq!(components.len(), 2);
        let sizes: Vec<usize> = components.iter().map(Vec::len).collect();
        assert!(sizes.contains(&2));
        assert!(sizes.contains(&1));
    }
}
