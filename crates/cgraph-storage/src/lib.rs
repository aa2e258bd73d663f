//! Storage boundary for profiles, connections and the contact graph, plus the
//! HTTP and artifact utilities shared by the pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cgraph_core::{
    ComparisonResult, ComparisonSession, Connection, CoreError, EnrichmentFields, GraphEdge,
    GraphNode, NodeProfileMapping, NodeType, Prediction, Profile,
};
use thiserror::Error;
use uuid::Uuid;

mod artifacts;
mod http;
mod memory;
mod pg;

pub use artifacts::{ExportArchive, StoredExport};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, HttpClientConfig, HttpJsonClient,
    PostError, RetryDisposition,
};
pub use memory::MemoryStore;
pub use pg::PgStore;

pub const CRATE_NAME: &str = "cgraph-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid stored value: {0}")]
    Invalid(String),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => CoreError::NotFound(what),
            other => CoreError::Persistence(other.to_string()),
        }
    }
}

/// Relational store reachable through upsert-by-natural-key and filtered reads.
///
/// Profiles are keyed by `profile_url`, connections by `(user_id, profile_id)`,
/// nodes by `key`, edges by `(source, target, edge_type)`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_profile(&self, profile: &Profile) -> Result<Profile, StoreError>;

    /// Batch form of [`Store::upsert_profile`]. Either every row is written or
    /// an error is returned.
    async fn upsert_profiles(&self, profiles: &[Profile]) -> Result<Vec<Profile>, StoreError> {
        let mut out = Vec::with_capacity(profiles.len());
        for profile in profiles {
            out.push(self.upsert_profile(profile).await?);
        }
        Ok(out)
    }

    async fn get_profile(&self, id: Uuid) -> Result<Option<Profile>, StoreError>;
    async fn list_profiles(&self) -> Result<Vec<Profile>, StoreError>;
    async fn profiles_for_user(&self, user_id: Uuid) -> Result<Vec<Profile>, StoreError>;
    async fn unenriched_profiles_for_user(&self, user_id: Uuid) -> Result<Vec<Profile>, StoreError>;
    async fn save_enrichment(
        &self,
        profile_id: Uuid,
        fields: &EnrichmentFields,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn upsert_connections(&self, connections: &[Connection]) -> Result<usize, StoreError>;
    async fn connections_for_user(&self, user_id: Uuid) -> Result<Vec<Connection>, StoreError>;
    async fn users(&self) -> Result<Vec<Uuid>, StoreError>;

    /// Insert or merge a node: owner sets are unioned and an existing embedding
    /// is kept when the incoming node has none.
    async fn upsert_node(&self, node: &GraphNode) -> Result<GraphNode, StoreError>;
    async fn get_node(&self, key: &str) -> Result<Option<GraphNode>, StoreError>;
    async fn list_nodes(&self, node_type: Option<NodeType>) -> Result<Vec<GraphNode>, StoreError>;

    /// Returns `true` when the edge did not exist before.
    async fn upsert_edge(&self, edge: &GraphEdge) -> Result<bool, StoreError>;
    async fn edges_touching(&self, node_key: &str) -> Result<Vec<GraphEdge>, StoreError>;
    async fn list_edges(&self) -> Result<Vec<GraphEdge>, StoreError>;

    async fn upsert_mapping(&self, mapping: &NodeProfileMapping) -> Result<(), StoreError>;
    async fn node_for_profile(&self, profile_id: Uuid) -> Result<Option<String>, StoreError>;

    async fn insert_predictions(&self, predictions: &[Prediction]) -> Result<usize, StoreError>;
    /// Rows from the most recent prediction run for `user_id`.
    async fn latest_predictions(&self, user_id: Uuid) -> Result<Vec<Prediction>, StoreError>;

    async fn save_session(&self, session: &ComparisonSession) -> Result<(), StoreError>;
    async fn get_session(&self, id: Uuid) -> Result<Option<ComparisonSession>, StoreError>;
    async fn insert_results(&self, results: &[ComparisonResult]) -> Result<usize, StoreError>;
    async fn results_for_session(&self, session_id: Uuid) -> Result<Vec<ComparisonResult>, StoreError>;
}
