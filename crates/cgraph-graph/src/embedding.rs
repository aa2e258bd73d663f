use std::cmp::Ordering;

use cgraph_core::{CoreError, NodeType, Profile};
use cgraph_storage::Store;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub const EMBEDDING_DIMS: usize = 64;

/// Feature-hashed bag of attribute tokens, L2-normalised. Profiles with no
/// usable attributes get the zero vector.
pub fn profile_embedding(profile: &Profile) -> Vec<f32> {
    let mut fields = vec![
        profile.title.as_deref(),
        profile.company.as_deref(),
        profile.industry.as_deref(),
        profile.job_function.as_deref(),
    ];
    fields.extend(profile.skills.iter().map(|s| Some(s.as_str())));

    let mut vector = vec![0f32; EMBEDDING_DIMS];
    for token in fields.into_iter().flatten().flat_map(tokenize) {
        let digest = Sha256::digest(token.as_bytes());
        let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
            % EMBEDDING_DIMS;
        let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
    vector
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot = a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
    let na = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimilarProfile {
    pub node_key: String,
    pub label: String,
    pub similarity: f32,
}

/// Top `k` other profile nodes ranked by embedding cosine similarity.
pub async fn similar_profiles(
    store: &dyn Store,
    node_key: &str,
    k: usize,
) -> Result<Vec<SimilarProfile>, CoreError> {
    let seed = store
        .get_node(node_key)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("node {node_key}")))?;
    let Some(seed_embedding) = seed.embedding else {
        return Err(CoreError::NotFound(format!("embedding for node {node_key}")));
    };

    let mut ranked = store
        .list_nodes(Some(NodeType::Profile))
        .await?
        .into_iter()
        .filter(|n| n.key != node_key)
        .filter_map(|n| {
            let similarity = cosine_similarity(&seed_embedding, n.embedding.as_deref()?);
            Some(SimilarProfile {
                node_key: n.key,
                label: n.label,
                similarity,
            })
        })
        .collect::<Vec<_>>();
    ranked.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.node_key.cmp(&b.node_key))
    });
    ranked.truncate(k);
    Ok(ranked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgraph_core::GraphNode;
    use cgraph_storage::MemoryStore;
    use chrono::Utc;

    fn profile(title: &str, company: &str, skills: &[&str]) -> Profile {
        let mut p = Profile::new("X", format!("https://x/{title}/{company}"), Utc::now());
        p.title = Some(title.into());
        p.company = Some(company.into());
        p.skills = skills.iter().map(|s| s.to_string()).collect();
        p
    }

    #[test]
    fn embedding_is_deterministic_and_normalised() {
        let p = profile("Staff Engineer", "Acme", &["Rust", "Postgres"]);
        let a = profile_embedding(&p);
        assert_eq!(a, profile_embedding(&p));
        assert_eq!(a.len(), EMBEDDING_DIMS);
        let norm = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn empty_profile_embeds_to_zero() {
        let p = Profile::new("X", "https://x", Utc::now());
        assert!(profile_embedding(&p).iter().all(|v| *v == 0.0));
        assert_eq!(cosine_similarity(&profile_embedding(&p), &profile_embedding(&p)), 0.0);
    }

    #[tokio::test]
    async fn similar_profiles_ranks_by_shared_attributes() {
        let store = MemoryStore::new();
        let seed = profile("Backend Engineer", "Acme", &["Rust"]);
        let close = profile("Backend Engineer", "Acme", &["Rust", "Go"]);
        let far = profile("Sales Director", "Initech", &["Negotiation"]);
        for (key, p) in [("seed", &seed), ("close", &close), ("far", &far)] {
            let mut node = GraphNode::new(key, NodeType::Profile, key);
            node.embedding = Some(profile_embedding(p));
            store.upsert_node(&node).await.unwrap();
        }

        let ranked = similar_profiles(&store, "seed", 5).await.unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].node_key, "close");
        assert!(ranked[0].similarity > ranked[1].similarity);

        assert_eq!(similar_profiles(&store, "seed", 1).await.unwrap().len(), 1);
        assert!(matches!(
            similar_profiles(&store, "missing", 1).await,
            Err(CoreError::NotFound(_))
        ));
    }
}
