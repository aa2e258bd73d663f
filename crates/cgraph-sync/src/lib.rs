//! Pipeline orchestration: import, enrichment, graph build, prediction and
//! comparison jobs over a [`Store`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cgraph_core::{ComparisonSession, Prediction};
use cgraph_graph::{
    predict_links, run_comparison, start_comparison, ComparisonOutcome, GraphBuildSummary,
    GraphBuilder, GraphConfig,
};
use cgraph_storage::Store;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

mod enrich;
mod import;
mod notify;
mod reports;

pub use enrich::{
    EnrichmentError, EnrichmentPipeline, EnrichmentRequest, EnrichmentRules, EnrichmentSource,
    EnrichmentSummary, LlmEnricher, RuleEnricher, AI_ENRICHMENT_TAG, RULE_ENRICHMENT_TAG,
};
pub use import::{ImportError, ImportPipeline, ImportSummary};
pub use notify::{Notifier, TracingNotifier, WebhookNotifier, COMPARISON_COMPLETED_TEMPLATE};
pub use reports::{write_import_reports, ReportManifest, ReportManifestFile};

pub const CRATE_NAME: &str = "cgraph-sync";

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub owner_name: Option<String>,
    pub persist_batch_size: usize,
    pub reports_dir: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            owner_name: None,
            persist_batch_size: 200,
            reports_dir: None,
            archive_dir: None,
        }
    }
}

impl ImportConfig {
    pub fn from_env() -> Self {
        Self {
            owner_name: env_string("CGRAPH_OWNER_NAME"),
            persist_batch_size: env_parse("CGRAPH_PERSIST_BATCH_SIZE")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(200),
            reports_dir: Some(
                env_string("CGRAPH_REPORTS_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./reports")),
            ),
            archive_dir: env_string("CGRAPH_ARCHIVE_DIR").map(PathBuf::from),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub batch_size: usize,
    pub rules_path: PathBuf,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout: Duration::from_secs(20),
            batch_size: 100,
            rules_path: PathBuf::from("rules/enrichment.yaml"),
        }
    }
}

impl EnrichmentConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            endpoint: env_string("CGRAPH_ENRICH_URL"),
            api_key: env_string("CGRAPH_ENRICH_API_KEY"),
            timeout: env_parse("CGRAPH_ENRICH_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            batch_size: env_parse("CGRAPH_ENRICH_BATCH_SIZE")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.batch_size),
            rules_path: env_string("CGRAPH_RULES_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.rules_path),
        }
    }
}

/// Notification sink chosen from `CGRAPH_NOTIFY_URL`: webhook when set, log otherwise.
pub fn notifier_from_env() -> Result<Arc<dyn Notifier>> {
    match env_string("CGRAPH_NOTIFY_URL") {
        Some(url) => Ok(Arc::new(
            WebhookNotifier::new(url).context("building webhook notifier")?,
        )),
        None => Ok(Arc::new(TracingNotifier)),
    }
}

pub async fn build_graph(
    store: Arc<dyn Store>,
    config: GraphConfig,
    user: Option<Uuid>,
    cancel: &CancellationToken,
) -> Result<GraphBuildSummary> {
    let builder = GraphBuilder::new(store, config);
    builder.build(user, cancel).await.context("building graph")
}

pub async fn predict_for_user(store: &dyn Store, user_id: Uuid) -> Result<Vec<Prediction>> {
    predict_links(store, user_id, Utc::now())
        .await
        .with_context(|| format!("predicting links for {user_id}"))
}

/// Create a session, run it to completion and tell both participants.
pub async fn compare_users(
    store: &dyn Store,
    notifier: &dyn Notifier,
    user_a: Uuid,
    user_b: Uuid,
) -> Result<ComparisonOutcome> {
    let session = start_comparison(store, user_a, user_b, Utc::now())
        .await
        .context("starting comparison")?;
    complete_comparison(store, notifier, &session).await
}

pub async fn complete_comparison(
    store: &dyn Store,
    notifier: &dyn Notifier,
    session: &ComparisonSession,
) -> Result<ComparisonOutcome> {
    let outcome = run_comparison(store, session.id, Utc::now())
        .await
        .with_context(|| format!("running comparison {}", session.id))?;
    let values = json!({
        "session_id": outcome.session.id,
        "results": outcome.results.len(),
    });
    for user in [outcome.session.user_a, outcome.session.user_b] {
        notifier
            .notify(user, COMPARISON_COMPLETED_TEMPLATE, &values)
            .await;
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgraph_core::{Connection, Profile};
    use cgraph_storage::MemoryStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(Uuid, String)>>,
    }

    #[async_trait::async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, user_id: Uuid, template: &str, _values: &serde_json::Value) {
            self.sent
                .lock()
                .unwrap()
                .push((user_id, template.to_string()));
        }
    }

    #[tokio::test]
    async fn comparison_notifies_both_users() {
        let store = MemoryStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        let shared = store
            .upsert_profile(&Profile::new("Shared", "https://x/shared", now))
            .await
            .unwrap();
        for user in [a, b] {
            store
                .upsert_connections(&[Connection {
                    user_id: user,
                    profile_id: shared.id,
                    connected_on: now,
                    created_at: now,
                }])
                .await
                .unwrap();
        }

        let notifier = RecordingNotifier::default();
        let outcome = compare_users(&store, &notifier, a, b).await.unwrap();
        assert_eq!(outcome.results.len(), 1);
        let sent = notifier.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![
                (a, COMPARISON_COMPLETED_TEMPLATE.to_string()),
                (b, COMPARISON_COMPLETED_TEMPLATE.to_string()),
            ]
        );
    }

    #[test]
    fn enrichment_config_defaults() {
        let config = EnrichmentConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.timeout, Duration::from_secs(20));
        assert_eq!(ImportConfig::default().persist_batch_size, 200);
    }
}
