use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use cgraph_core::{CoreError, EdgeType, GraphEdge, Prediction};
use cgraph_storage::Store;
use tracing::{info, warn};
use uuid::Uuid;

const MUTUAL_WEIGHT: f64 = 0.2;
const AFFILIATION_WEIGHT: f64 = 0.15;
const TITLE_WEIGHT: f64 = 0.1;

pub const FALLBACK_REASON: &str = "No shared signals yet; suggested to grow your network";

/// Distinct neighbours of a candidate node, per scored edge type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateSignals {
    pub mutual: usize,
    pub affiliation: usize,
    pub title_similarity: usize,
}

impl CandidateSignals {
    pub fn from_edges(node_key: &str, edges: &[GraphEdge]) -> Self {
        let mut neighbours: BTreeMap<EdgeType, BTreeSet<&str>> = BTreeMap::new();
        for edge in edges.iter().filter(|e| e.touches(node_key)) {
            let other = if edge.source == node_key {
                edge.target.as_str()
            } else {
                edge.source.as_str()
            };
            neighbours.entry(edge.edge_type).or_default().insert(other);
        }
        let count = |t: EdgeType| neighbours.get(&t).map_or(0, BTreeSet::len);
        Self {
            mutual: count(EdgeType::Mutual),
            affiliation: count(EdgeType::Affiliation),
            title_similarity: count(EdgeType::TitleSimilarity),
        }
    }
}

/// Weighted signal sum capped at 1.0, plus a reason naming each nonzero factor
/// in the order mutual, affiliation, title.
pub fn score_candidate(signals: CandidateSignals) -> (f64, String) {
    let score = (signals.mutual as f64 * MUTUAL_WEIGHT
        + signals.affiliation as f64 * AFFILIATION_WEIGHT
        + signals.title_similarity as f64 * TITLE_WEIGHT)
        .min(1.0);

    let mut parts = Vec::new();
    if signals.mutual > 0 {
        parts.push(format!("{} mutual connection(s)", signals.mutual));
    }
    if signals.affiliation > 0 {
        parts.push(format!("{} shared employer link(s)", signals.affiliation));
    }
    if signals.title_similarity > 0 {
        parts.push(format!("{} similar job title(s)", signals.title_similarity));
    }
    let reason = if parts.is_empty() {
        FALLBACK_REASON.to_string()
    } else {
        parts.join(", ")
    };
    (score, reason)
}

/// Score every profile `user_id` is not connected to, persist one row per
/// candidate and return them best first.
pub async fn predict_links(
    store: &dyn Store,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Vec<Prediction>, CoreError> {
    let connected = store
        .connections_for_user(user_id)
        .await?
        .into_iter()
        .map(|c| c.profile_id)
        .collect::<BTreeSet<_>>();

    let mut predictions = Vec::new();
    for profile in store.list_profiles().await? {
        if connected.contains(&profile.id) {
            continue;
        }
        let signals = match store.node_for_profile(profile.id).await? {
            Some(node_key) => match store.edges_touching(&node_key).await {
                Ok(edges) => CandidateSignals::from_edges(&node_key, &edges),
                Err(err) => {
                    warn!(profile_id = %profile.id, error = %err, "edge lookup failed");
                    CandidateSignals::default()
                }
            },
            None => CandidateSignals::default(),
        };
        let (score, reason) = score_candidate(signals);
        predictions.push(Prediction {
            id: Uuid::new_v4(),
            user_id,
            profile_id: profile.id,
            score,
            reason,
            created_at: now,
        });
    }

    predictions.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.profile_id.cmp(&b.profile_id))
    });
    store.insert_predictions(&predictions).await?;
    info!(%user_id, candidates = predictions.len(), "link prediction finished");
    Ok(predictions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgraph_core::{Connection, GraphNode, NodeProfileMapping, NodeType, Profile};
    use cgraph_storage::MemoryStore;

    #[test]
    fn score_combines_weights_in_fixed_order() {
        let (score, reason) = score_candidate(CandidateSignals {
            mutual: 2,
            affiliation: 1,
            title_similarity: 1,
        });
        assert!((score - 0.65).abs() < 1e-9);
        assert_eq!(
            reason,
            "2 mutual connection(s), 1 shared employer link(s), 1 similar job title(s)"
        );
    }

    #[test]
    fn score_is_capped_and_falls_back_to_generic_reason() {
        let (score, _) = score_candidate(CandidateSignals {
            mutual: 9,
            affiliation: 0,
            title_similarity: 0,
        });
        assert_eq!(score, 1.0);
        let (score, reason) = score_candidate(CandidateSignals::default());
        assert_eq!(score, 0.0);
        assert_eq!(reason, FALLBACK_REASON);
    }

    #[test]
    fn signals_ignore_connection_edges_and_duplicate_directions() {
        let edges = vec![
            GraphEdge::new("p", "q", EdgeType::Mutual, 1.0),
            GraphEdge::new("q", "p", EdgeType::Mutual, 0.5),
            GraphEdge::new("p", "company_acme", EdgeType::Connection, 1.0),
            GraphEdge::new("r", "p", EdgeType::Affiliation, 1.0),
        ];
        assert_eq!(
            CandidateSignals::from_edges("p", &edges),
            CandidateSignals {
                mutual: 1,
                affiliation: 1,
                title_similarity: 0,
            }
        );
    }

    #[tokio::test]
    async fn predictions_cover_unconnected_profiles_only() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let now = Utc::now();
        let known = store
            .upsert_profile(&Profile::new("Known", "https://x/known", now))
            .await
            .unwrap();
        let stranger = store
            .upsert_profile(&Profile::new("Stranger", "https://x/stranger", now))
            .await
            .unwrap();
        let quiet = store
            .upsert_profile(&Profile::new("Quiet", "https://x/quiet", now))
            .await
            .unwrap();
        store
            .upsert_connections(&[Connection {
                user_id: user,
                profile_id: known.id,
                connected_on: now,
                created_at: now,
            }])
            .await
            .unwrap();
        for profile in [&known, &stranger] {
            let key = GraphNode::profile_key(profile.id);
            store
                .upsert_node(&GraphNode::new(&key, NodeType::Profile, &profile.full_name))
                .await
                .unwrap();
            store
                .upsert_mapping(&NodeProfileMapping {
                    node_key: key,
                    profile_id: profile.id,
                    user_id: user,
                })
                .await
                .unwrap();
        }
        store
            .upsert_edge(&GraphEdge::new(
                GraphNode::profile_key(known.id),
                GraphNode::profile_key(stranger.id),
                EdgeType::Affiliation,
                1.0,
            ))
            .await
            .unwrap();

        let ranked = predict_links(&store, user, now).await.unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].profile_id, stranger.id);
        assert!((ranked[0].score - 0.15).abs() < 1e-9);
        assert_eq!(ranked[1].profile_id, quiet.id);
        assert_eq!(ranked[1].reason, FALLBACK_REASON);
        assert_eq!(store.latest_predictions(user).await.unwrap().len(), 2);
    }
}
