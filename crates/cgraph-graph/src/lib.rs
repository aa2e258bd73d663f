//! Contact graph derivation, link prediction and two-network comparison.

mod builder;
mod compare;
mod embedding;
mod scoring;

pub use builder::{title_similarity, GraphBuildSummary, GraphBuilder, PassSummary};
pub use compare::{
    compare_networks, run_comparison, start_comparison, ComparisonOutcome, MatchFactors,
};
pub use embedding::{cosine_similarity, profile_embedding, similar_profiles, SimilarProfile, EMBEDDING_DIMS};
pub use scoring::{predict_links, score_candidate, CandidateSignals, FALLBACK_REASON};

pub const CRATE_NAME: &str = "cgraph-graph";

pub const DEFAULT_TITLE_SIMILARITY_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, Copy)]
pub struct GraphConfig {
    pub title_similarity_threshold: f64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            title_similarity_threshold: DEFAULT_TITLE_SIMILARITY_THRESHOLD,
        }
    }
}

impl GraphConfig {
    pub fn from_env() -> Self {
        Self {
            title_similarity_threshold: std::env::var("CGRAPH_TITLE_SIMILARITY_THRESHOLD")
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| (0.0..=1.0).contains(v))
                .unwrap_or(DEFAULT_TITLE_SIMILARITY_THRESHOLD),
        }
    }
}
