use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use cgraph_core::{
    CoreError, EdgeType, GraphEdge, GraphNode, NodeProfileMapping, NodeType, Profile,
};
use cgraph_storage::Store;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::embedding::profile_embedding;
use crate::GraphConfig;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PassSummary {
    pub pass: String,
    pub user_id: Option<Uuid>,
    pub nodes_written: usize,
    pub edges_created: usize,
    pub edges_updated: usize,
    pub failures: usize,
}

impl PassSummary {
    fn new(pass: &str, user_id: Option<Uuid>) -> Self {
        Self {
            pass: pass.to_string(),
            user_id,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphBuildSummary {
    pub passes: Vec<PassSummary>,
    pub cancelled: bool,
}

impl GraphBuildSummary {
    pub fn edges_created(&self) -> usize {
        self.passes.iter().map(|p| p.edges_created).sum()
    }

    pub fn failures(&self) -> usize {
        self.passes.iter().map(|p| p.failures).sum()
    }
}

/// Share of distinct lower-cased whitespace tokens the two titles have in common.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let tokens = |s: &str| {
        s.to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
    };
    let (ta, tb) = (tokens(a), tokens(b));
    let distinct = ta.union(&tb).count();
    if distinct == 0 {
        return 0.0;
    }
    ta.intersection(&tb).count() as f64 / distinct as f64
}

/// Runs node sync and the edge passes. Every pass is an upsert over derived
/// keys, so re-running one leaves the persisted graph unchanged.
pub struct GraphBuilder {
    store: Arc<dyn Store>,
    config: GraphConfig,
}

impl GraphBuilder {
    pub fn new(store: Arc<dyn Store>, config: GraphConfig) -> Self {
        Self { store, config }
    }

    /// Build for one user (or every user with connections), then run the
    /// cross-user mutual pass. Cancellation is honoured between passes.
    pub async fn build(
        &self,
        user: Option<Uuid>,
        cancel: &CancellationToken,
    ) -> Result<GraphBuildSummary, CoreError> {
        let users = match user {
            Some(user) => vec![user],
            None => self.store.users().await?,
        };
        let mut summary = GraphBuildSummary::default();

        for user_id in users {
            let span = info_span!("graph_build", %user_id);
            for pass in ["nodes", "affiliation", "title_similarity"] {
                if cancel.is_cancelled() {
                    summary.cancelled = true;
                    info!(edges = summary.edges_created(), "graph build cancelled");
                    return Ok(summary);
                }
                let result = match pass {
                    "nodes" => self.sync_nodes(user_id).instrument(span.clone()).await,
                    "affiliation" => self.affiliation_pass(user_id).instrument(span.clone()).await,
                    _ => self.title_similarity_pass(user_id).instrument(span.clone()).await,
                };
                match result {
                    Ok(pass_summary) => summary.passes.push(pass_summary),
                    Err(err) => {
                        warn!(%user_id, pass, error = %err, "graph pass failed");
                        let mut failed = PassSummary::new(pass, Some(user_id));
                        failed.failures = 1;
                        summary.passes.push(failed);
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            summary.cancelled = true;
            return Ok(summary);
        }
        match self.mutual_pass().await {
            Ok(pass_summary) => summary.passes.push(pass_summary),
            Err(err) => {
                warn!(error = %err, "mutual pass failed");
                let mut failed = PassSummary::new("mutual", None);
                failed.failures = 1;
                summary.passes.push(failed);
            }
        }
        info!(
            passes = summary.passes.len(),
            edges_created = summary.edges_created(),
            failures = summary.failures(),
            "graph build finished"
        );
        Ok(summary)
    }

    /// Upsert profile and attribute nodes for a user's connections and link
    /// each profile to its company, industry and skill nodes.
    pub async fn sync_nodes(&self, user_id: Uuid) -> Result<PassSummary, CoreError> {
        let mut summary = PassSummary::new("nodes", Some(user_id));
        for profile in self.store.profiles_for_user(user_id).await? {
            let profile_key = GraphNode::profile_key(profile.id);
            let mut node = GraphNode::new(&profile_key, NodeType::Profile, &profile.full_name)
                .with_owner(user_id);
            node.embedding = Some(profile_embedding(&profile));

            if let Err(err) = self.store.upsert_node(&node).await {
                warn!(profile_id = %profile.id, error = %err, "profile node upsert failed");
                summary.failures += 1;
                continue;
            }
            summary.nodes_written += 1;

            let mapping = NodeProfileMapping {
                node_key: profile_key.clone(),
                profile_id: profile.id,
                user_id,
            };
            if let Err(err) = self.store.upsert_mapping(&mapping).await {
                warn!(profile_id = %profile.id, error = %err, "node mapping upsert failed");
                summary.failures += 1;
            }

            for (node_type, value, relation) in attribute_values(&profile) {
                let key = GraphNode::attribute_key(node_type, &value);
                let attribute = GraphNode::new(&key, node_type, &value).with_owner(user_id);
                if let Err(err) = self.store.upsert_node(&attribute).await {
                    warn!(node = %key, error = %err, "attribute node upsert failed");
                    summary.failures += 1;
                    continue;
                }
                summary.nodes_written += 1;
                let edge = GraphEdge::new(&profile_key, &key, EdgeType::Connection, 1.0)
                    .with_property("relation", relation);
                self.record_edge(&edge, &mut summary).await;
            }
        }
        info!(nodes = summary.nodes_written, "node sync finished");
        Ok(summary)
    }

    /// One `affiliation` edge per unordered pair of profiles sharing an exact company.
    pub async fn affiliation_pass(&self, user_id: Uuid) -> Result<PassSummary, CoreError> {
        let mut summary = PassSummary::new("affiliation", Some(user_id));
        let mut by_company: BTreeMap<String, Vec<Uuid>> = BTreeMap::new();
        for profile in self.store.profiles_for_user(user_id).await? {
            if let Some(company) = profile.company.filter(|c| !c.trim().is_empty()) {
                by_company.entry(company).or_default().push(profile.id);
            }
        }

        for (company, mut members) in by_company {
            members.sort();
            let keys = self.node_keys(&members, &mut summary).await;
            for (i, a) in keys.iter().enumerate() {
                for b in &keys[i + 1..] {
                    let edge = GraphEdge::new(a, b, EdgeType::Affiliation, 1.0)
                        .with_property("company", company.as_str());
                    self.record_edge(&edge, &mut summary).await;
                }
            }
        }
        info!(created = summary.edges_created, "affiliation pass finished");
        Ok(summary)
    }

    /// Pairs within the same job function whose title similarity reaches the threshold.
    pub async fn title_similarity_pass(&self, user_id: Uuid) -> Result<PassSummary, CoreError> {
        let mut summary = PassSummary::new("title_similarity", Some(user_id));
        let mut by_function: BTreeMap<String, Vec<(Uuid, String)>> = BTreeMap::new();
        for profile in self.store.profiles_for_user(user_id).await? {
            let (Some(function), Some(title)) = (profile.job_function, profile.title) else {
                continue;
            };
            if function.trim().is_empty() || title.trim().is_empty() {
                continue;
            }
            by_function.entry(function).or_default().push((profile.id, title));
        }

        for (function, mut members) in by_function {
            members.sort();
            for (i, (a_id, a_title)) in members.iter().enumerate() {
                for (b_id, b_title) in &members[i + 1..] {
                    let similarity = title_similarity(a_title, b_title);
                    if similarity < self.config.title_similarity_threshold {
                        continue;
                    }
                    let keys = self.node_keys(&[*a_id, *b_id], &mut summary).await;
                    let [a, b] = keys.as_slice() else {
                        continue;
                    };
                    let edge = GraphEdge::new(a, b, EdgeType::TitleSimilarity, similarity)
                        .with_property("job_function", function.as_str())
                        .with_property("similarity", similarity);
                    self.record_edge(&edge, &mut summary).await;
                }
            }
        }
        info!(created = summary.edges_created, "title similarity pass finished");
        Ok(summary)
    }

    /// Across all users: link every multi-owner profile node to the other
    /// multi-owner profile nodes that share at least one owner with it.
    ///
    /// Single-owner profiles are neither seeds nor candidates, even when their
    /// owner also owns the seed. A contact known to one user says nothing about
    /// overlap between networks, so only profiles shared by at least two users
    /// take part.
    pub async fn mutual_pass(&self) -> Result<PassSummary, CoreError> {
        let mut summary = PassSummary::new("mutual", None);
        let shared_nodes = self
            .store
            .list_nodes(Some(NodeType::Profile))
            .await?
            .into_iter()
            .filter(|n| n.owners.len() > 1)
            .collect::<Vec<_>>();

        for seed in &shared_nodes {
            for other in &shared_nodes {
                if other.key == seed.key {
                    continue;
                }
                let shared = seed.owners.intersection(&other.owners).count();
                if shared == 0 {
                    continue;
                }
                let weight = shared as f64 / seed.owners.len() as f64;
                let edge = GraphEdge::new(&seed.key, &other.key, EdgeType::Mutual, weight)
                    .with_property("shared_owners", shared as u64);
                self.record_edge(&edge, &mut summary).await;
            }
        }
        info!(
            seeds = shared_nodes.len(),
            created = summary.edges_created,
            "mutual pass finished"
        );
        Ok(summary)
    }

    /// Resolve profiles to their nodes, skipping (and counting) any without one.
    async fn node_keys(&self, profile_ids: &[Uuid], summary: &mut PassSummary) -> Vec<String> {
        let mut keys = Vec::with_capacity(profile_ids.len());
        for profile_id in profile_ids {
            match self.store.node_for_profile(*profile_id).await {
                Ok(Some(key)) => keys.push(key),
                Ok(None) => {
                    warn!(%profile_id, pass = %summary.pass, "profile has no graph node; skipping");
                    summary.failures += 1;
                }
                Err(err) => {
                    warn!(%profile_id, error = %err, "node lookup failed");
                    summary.failures += 1;
                }
            }
        }
        keys
    }

    async fn record_edge(&self, edge: &GraphEdge, summary: &mut PassSummary) {
        match self.store.upsert_edge(edge).await {
            Ok(true) => summary.edges_created += 1,
            Ok(false) => summary.edges_updated += 1,
            Err(err) => {
                warn!(
                    source = %edge.source,
                    target = %edge.target,
                    edge_type = edge.edge_type.as_str(),
                    error = %err,
                    "edge upsert failed"
                );
                summary.failures += 1;
            }
        }
    }
}

fn attribute_values(profile: &Profile) -> Vec<(NodeType, String, &'static str)> {
    let mut out = Vec::new();
    let mut push = |node_type, value: &str, relation| {
        let value = value.trim();
        if !value.is_empty() {
            out.push((node_type, value.to_string(), relation));
        }
    };
    if let Some(company) = &profile.company {
        push(NodeType::Company, company, "works_at");
    }
    if let Some(industry) = &profile.industry {
        push(NodeType::Industry, industry, "in_industry");
    }
    for skill in &profile.skills {
        push(NodeType::Keyword, skill, "has_skill");
    }
    out
}
