use async_trait::async_trait;
use cgraph_storage::{BackoffPolicy, HttpClientConfig, HttpJsonClient};
use serde_json::{json, Value as JsonValue};
use tracing::info;
use uuid::Uuid;

pub const COMPARISON_COMPLETED_TEMPLATE: &str = "comparison_completed";

/// Fire-and-forget templated notification. Delivery failures never reach the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: Uuid, template: &str, values: &JsonValue);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, user_id: Uuid, template: &str, values: &JsonValue) {
        info!(%user_id, template, values = %values, "notification");
    }
}

/// Posts `{user_id, template, values}` to a webhook from a background task.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    client: HttpJsonClient,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = HttpJsonClient::new(HttpClientConfig {
            concurrency: 4,
            backoff: BackoffPolicy {
                max_retries: 3,
                ..BackoffPolicy::default()
            },
            ..HttpClientConfig::default()
        })?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, user_id: Uuid, template: &str, values: &JsonValue) {
        let body = json!({
            "user_id": user_id,
            "template": template,
            "values": values,
        });
        self.client.spawn_post(self.url.clone(), body);
    }
}
