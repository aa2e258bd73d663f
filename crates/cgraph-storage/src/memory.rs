use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cgraph_core::{
    ComparisonResult, ComparisonSession, Connection, EdgeType, EnrichmentFields, GraphEdge,
    GraphNode, NodeProfileMapping, NodeType, Prediction, Profile,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{Store, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    profiles: BTreeMap<Uuid, Profile>,
    profile_ids_by_url: BTreeMap<String, Uuid>,
    connections: BTreeMap<(Uuid, Uuid), Connection>,
    nodes: BTreeMap<String, GraphNode>,
    edges: BTreeMap<(String, String, EdgeType), GraphEdge>,
    mappings: BTreeSet<(String, Uuid, Uuid)>,
    predictions: Vec<Prediction>,
    sessions: BTreeMap<Uuid, ComparisonSession>,
    results: Vec<ComparisonResult>,
}

/// Process-local [`Store`] with the same upsert semantics as [`crate::PgStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_profile(&self, profile: &Profile) -> Result<Profile, StoreError> {
        let mut state = self.state.write().await;
        if let Some(id) = state.profile_ids_by_url.get(&profile.profile_url).copied() {
            let existing = state
                .profiles
                .get_mut(&id)
                .ok_or_else(|| StoreError::NotFound(format!("profile {id}")))?;
            existing.absorb(profile.clone());
            return Ok(existing.clone());
        }
        state
            .profile_ids_by_url
            .insert(profile.profile_url.clone(), profile.id);
        state.profiles.insert(profile.id, profile.clone());
        Ok(profile.clone())
    }

    async fn get_profile(&self, id: Uuid) -> Result<Option<Profile>, StoreError> {
        Ok(self.state.read().await.profiles.get(&id).cloned())
    }

    async fn list_profiles(&self) -> Result<Vec<Profile>, StoreError> {
        Ok(self.state.read().await.profiles.values().cloned().collect())
    }

    async fn profiles_for_user(&self, user_id: Uuid) -> Result<Vec<Profile>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .connections
            .keys()
            .filter(|(user, _)| *user == user_id)
            .filter_map(|(_, profile_id)| state.profiles.get(profile_id).cloned())
            .collect())
    }

    async fn unenriched_profiles_for_user(&self, user_id: Uuid) -> Result<Vec<Profile>, StoreError> {
        Ok(self
            .profiles_for_user(user_id)
            .await?
            .into_iter()
            .filter(|p| p.enriched_at.is_none())
            .collect())
    }

    async fn save_enrichment(
        &self,
        profile_id: Uuid,
        fields: &EnrichmentFields,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let profile = state
            .profiles
            .get_mut(&profile_id)
            .ok_or_else(|| StoreError::NotFound(format!("profile {profile_id}")))?;
        profile.apply_enrichment(fields.clone(), at);
        Ok(())
    }

    async fn upsert_connections(&self, connections: &[Connection]) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        if let Some(missing) = connections
            .iter()
            .find(|c| !state.profiles.contains_key(&c.profile_id))
        {
            return Err(StoreError::NotFound(format!("profile {}", missing.profile_id)));
        }
        for connection in connections {
            let key = (connection.user_id, connection.profile_id);
            match state.connections.get_mut(&key) {
                Some(existing) => existing.connected_on = connection.connected_on,
                None => {
                    state.connections.insert(key, connection.clone());
                }
            }
        }
        Ok(connections.len())
    }

    async fn connections_for_user(&self, user_id: Uuid) -> Result<Vec<Connection>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .connections
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn users(&self) -> Result<Vec<Uuid>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .connections
            .keys()
            .map(|(user, _)| *user)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect())
    }

    async fn upsert_node(&self, node: &GraphNode) -> Result<GraphNode, StoreError> {
        let mut state = self.state.write().await;
        let stored = state
            .nodes
            .entry(node.key.clone())
            .and_modify(|existing| {
                existing.owners.extend(node.owners.iter().copied());
                existing.label = node.label.clone();
                if node.embedding.is_some() {
                    existing.embedding = node.embedding.clone();
                }
            })
            .or_insert_with(|| node.clone());
        Ok(stored.clone())
    }

    async fn get_node(&self, key: &str) -> Result<Option<GraphNode>, StoreError> {
        Ok(self.state.read().await.nodes.get(key).cloned())
    }

    async fn list_nodes(&self, node_type: Option<NodeType>) -> Result<Vec<GraphNode>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .nodes
            .values()
            .filter(|n| node_type.map_or(true, |t| n.node_type == t))
            .cloned()
            .collect())
    }

    async fn upsert_edge(&self, edge: &GraphEdge) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let created = state.edges.insert(edge.identity(), edge.clone()).is_none();
        Ok(created)
    }

    async fn edges_touching(&self, node_key: &str) -> Result<Vec<GraphEdge>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .edges
            .values()
            .filter(|e| e.touches(node_key))
            .cloned()
            .collect())
    }

    async fn list_edges(&self) -> Result<Vec<GraphEdge>, StoreError> {
        Ok(self.state.read().await.edges.values().cloned().collect())
    }

    async fn upsert_mapping(&self, mapping: &NodeProfileMapping) -> Result<(), StoreError> {
        self.state.write().await.mappings.insert((
            mapping.node_key.clone(),
            mapping.profile_id,
            mapping.user_id,
        ));
        Ok(())
    }

    async fn node_for_profile(&self, profile_id: Uuid) -> Result<Option<String>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .mappings
            .iter()
            .find(|(_, profile, _)| *profile == profile_id)
            .map(|(key, _, _)| key.clone()))
    }

    async fn insert_predictions(&self, predictions: &[Prediction]) -> Result<usize, StoreError> {
        self.state
            .write()
            .await
            .predictions
            .extend(predictions.iter().cloned());
        Ok(predictions.len())
    }

    async fn latest_predictions(&self, user_id: Uuid) -> Result<Vec<Prediction>, StoreError> {
        let state = self.state.read().await;
        let latest = state
            .predictions
            .iter()
            .filter(|p| p.user_id == user_id)
            .map(|p| p.created_at)
            .max();
        let Some(latest) = latest else {
            return Ok(Vec::new());
        };
        let mut rows = state
            .predictions
            .iter()
            .filter(|p| p.user_id == user_id && p.created_at == latest)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.profile_id.cmp(&b.profile_id)));
        Ok(rows)
    }

    async fn save_session(&self, session: &ComparisonSession) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .sessions
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<ComparisonSession>, StoreError> {
        Ok(self.state.read().await.sessions.get(&id).cloned())
    }

    async fn insert_results(&self, results: &[ComparisonResult]) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        for result in results {
            if !state.sessions.contains_key(&result.session_id) {
                return Err(StoreError::NotFound(format!("session {}", result.session_id)));
            }
        }
        state.results.extend(results.iter().cloned());
        Ok(results.len())
    }

    async fn results_for_session(&self, session_id: Uuid) -> Result<Vec<ComparisonResult>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .results
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).single().unwrap()
    }

    fn profile(name: &str, url: &str) -> Profile {
        Profile::new(name, url, at(1))
    }

    #[tokio::test]
    async fn duplicate_profile_url_updates_existing_row() {
        let store = MemoryStore::new();
        let mut first = profile("Jane Doe", "https://x/jane");
        first.company = Some("Acme".into());
        store.upsert_profile(&first).await.unwrap();

        let mut second = profile("Jane Q. Doe", "https://x/jane");
        second.title = Some("CTO".into());
        second.created_at = at(9);
        let stored = store.upsert_profile(&second).await.unwrap();

        let all = store.list_profiles().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(stored.full_name, "Jane Q. Doe");
        assert_eq!(stored.company.as_deref(), Some("Acme"));
        assert_eq!(stored.title.as_deref(), Some("CTO"));
        assert_eq!(stored.created_at, at(1));
    }

    #[tokio::test]
    async fn connections_upsert_per_user_profile_pair() {
        let store = MemoryStore::new();
        let p = store.upsert_profile(&profile("Jane", "https://x/jane")).await.unwrap();
        let user = Uuid::new_v4();
        let conn = Connection {
            user_id: user,
            profile_id: p.id,
            connected_on: at(2),
            created_at: at(2),
        };
        store.upsert_connections(&[conn.clone()]).await.unwrap();
        store
            .upsert_connections(&[Connection {
                connected_on: at(3),
                ..conn
            }])
            .await
            .unwrap();
        let rows = store.connections_for_user(user).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].connected_on, at(3));
        assert_eq!(store.users().await.unwrap(), vec![user]);
    }

    #[tokio::test]
    async fn connection_batch_with_unknown_profile_writes_nothing() {
        let store = MemoryStore::new();
        let p = store.upsert_profile(&profile("Jane", "https://x/jane")).await.unwrap();
        let user = Uuid::new_v4();
        let rows = [p.id, Uuid::new_v4()]
            .into_iter()
            .map(|profile_id| Connection {
                user_id: user,
                profile_id,
                connected_on: at(2),
                created_at: at(2),
            })
            .collect::<Vec<_>>();
        let err = store.upsert_connections(&rows).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.connections_for_user(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enrichment_filter_tracks_enriched_at() {
        let store = MemoryStore::new();
        let p = store.upsert_profile(&profile("Jane", "https://x/jane")).await.unwrap();
        let user = Uuid::new_v4();
        store
            .upsert_connections(&[Connection {
                user_id: user,
                profile_id: p.id,
                connected_on: at(2),
                created_at: at(2),
            }])
            .await
            .unwrap();
        assert_eq!(store.unenriched_profiles_for_user(user).await.unwrap().len(), 1);
        let fields = EnrichmentFields {
            role_level: cgraph_core::RoleLevel::Ic,
            job_function: "Engineering".into(),
            industry: "Technology".into(),
            company_size: None,
            skills: vec![],
            company_location: None,
            is_public: None,
            founded_year: None,
            tags: vec![],
        };
        store.save_enrichment(p.id, &fields, at(4)).await.unwrap();
        assert!(store.unenriched_profiles_for_user(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn node_upsert_unions_owners() {
        let store = MemoryStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let key = GraphNode::profile_key(Uuid::new_v4());
        store
            .upsert_node(&GraphNode::new(&key, NodeType::Profile, "Jane").with_owner(a))
            .await
            .unwrap();
        let merged = store
            .upsert_node(&GraphNode::new(&key, NodeType::Profile, "Jane").with_owner(b))
            .await
            .unwrap();
        assert_eq!(merged.owners.len(), 2);
    }

    #[tokio::test]
    async fn edge_upsert_is_idempotent() {
        let store = MemoryStore::new();
        let edge = GraphEdge::new("a", "b", EdgeType::Affiliation, 1.0);
        assert!(store.upsert_edge(&edge).await.unwrap());
        assert!(!store.upsert_edge(&edge).await.unwrap());
        let other_type = GraphEdge::new("a", "b", EdgeType::Mutual, 0.5);
        assert!(store.upsert_edge(&other_type).await.unwrap());
        assert_eq!(store.edges_touching("b").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn latest_predictions_only_returns_last_run() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let mk = |score: f64, day: u32| Prediction {
            id: Uuid::new_v4(),
            user_id: user,
            profile_id: Uuid::new_v4(),
            score,
            reason: String::new(),
            created_at: at(day),
        };
        store.insert_predictions(&[mk(0.9, 1)]).await.unwrap();
        store.insert_predictions(&[mk(0.2, 2), mk(0.6, 2)]).await.unwrap();
        let latest = store.latest_predictions(user).await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].score, 0.6);
    }
}
