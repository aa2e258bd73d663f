use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cgraph_core::{CoreError, EnrichmentFields, Profile, RoleLevel};
use cgraph_storage::{BackoffPolicy, HttpClientConfig, HttpJsonClient, PostError, Store};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::EnrichmentConfig;

pub const AI_ENRICHMENT_TAG: &str = "enrichment:ai";
pub const RULE_ENRICHMENT_TAG: &str = "enrichment:rules";

const RULES_VERSION: u32 = 1;
const BUILTIN_RULES: &str = include_str!("../../../rules/enrichment.yaml");

const RESPONSE_FIELDS: [&str; 9] = [
    "role_level",
    "job_function",
    "industry",
    "company_size",
    "skills",
    "company_location",
    "is_public",
    "founded_year",
    "tags",
];

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("enrichment request failed: {0}")]
    Http(#[from] PostError),
    #[error("enrichment response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("enrichment response rejected: {0}")]
    Malformed(String),
}

impl From<EnrichmentError> for CoreError {
    fn from(err: EnrichmentError) -> Self {
        CoreError::ExternalService(err.to_string())
    }
}

/// Payload sent to the external enrichment service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichmentRequest {
    pub name: String,
    pub title: Option<String>,
    pub company: Option<String>,
    pub connected_date: Option<String>,
}

impl EnrichmentRequest {
    pub fn for_profile(profile: &Profile, connected_on: Option<DateTime<Utc>>) -> Self {
        Self {
            name: profile.full_name.clone(),
            title: profile.title.clone(),
            company: profile.company.clone(),
            connected_date: connected_on.map(|d| d.format("%Y-%m-%d").to_string()),
        }
    }
}

#[async_trait]
pub trait EnrichmentSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn enrich(&self, request: &EnrichmentRequest) -> Result<EnrichmentFields, EnrichmentError>;
}

#[derive(Debug, Clone, Deserialize)]
struct RoleLevelRule {
    level: RoleLevel,
    title_keywords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct JobFunctionRule {
    name: String,
    title_keywords: Vec<String>,
    #[serde(default)]
    skills: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct IndustryRule {
    name: String,
    company_keywords: Vec<String>,
}

/// Keyword tables behind the deterministic fallback, loaded from `rules/enrichment.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct EnrichmentRules {
    version: u32,
    #[serde(default)]
    role_levels: Vec<RoleLevelRule>,
    default_role_level: RoleLevel,
    #[serde(default)]
    job_functions: Vec<JobFunctionRule>,
    default_job_function: String,
    #[serde(default)]
    default_skills: Vec<String>,
    #[serde(default)]
    industries: Vec<IndustryRule>,
    default_industry: String,
}

impl EnrichmentRules {
    pub fn builtin() -> Result<Self> {
        let rules: Self =
            serde_yaml::from_str(BUILTIN_RULES).context("parsing built-in enrichment rules")?;
        rules.checked()
    }

    /// Rules from `path`, or the built-in set when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "enrichment rules file absent; using built-in rules");
            return Self::builtin();
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let rules: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        rules
            .checked()
            .with_context(|| format!("validating {}", path.display()))
    }

    fn checked(self) -> Result<Self> {
        if self.version != RULES_VERSION {
            anyhow::bail!("unsupported enrichment rules version {}", self.version);
        }
        Ok(self)
    }
}

fn normalize_words(text: &str) -> String {
    let words = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { ' ' })
        .collect::<String>();
    format!(" {} ", words.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn has_phrase(normalized: &str, keyword: &str) -> bool {
    let keyword = normalize_words(keyword);
    !keyword.trim().is_empty() && normalized.contains(&keyword)
}

/// Deterministic fallback: title keywords pick role level and job function,
/// company substrings pick industry, job function picks a canned skill list.
#[derive(Debug, Clone)]
pub struct RuleEnricher {
    rules: EnrichmentRules,
}

impl RuleEnricher {
    pub fn new(rules: EnrichmentRules) -> Self {
        Self { rules }
    }

    pub fn infer(&self, request: &EnrichmentRequest) -> EnrichmentFields {
        let title = normalize_words(request.title.as_deref().unwrap_or_default());
        let company = request
            .company
            .as_deref()
            .unwrap_or_default()
            .to_lowercase();

        let role_level = self
            .rules
            .role_levels
            .iter()
            .find(|r| r.title_keywords.iter().any(|k| has_phrase(&title, k)))
            .map(|r| r.level)
            .unwrap_or(self.rules.default_role_level);

        let function = self
            .rules
            .job_functions
            .iter()
            .find(|r| r.title_keywords.iter().any(|k| has_phrase(&title, k)));
        let (job_function, skills) = match function {
            Some(rule) => (rule.name.clone(), rule.skills.clone()),
            None => (
                self.rules.default_job_function.clone(),
                self.rules.default_skills.clone(),
            ),
        };

        let industry = self
            .rules
            .industries
            .iter()
            .find(|r| {
                !company.is_empty()
                    && r.company_keywords
                        .iter()
                        .any(|k| company.contains(&k.to_lowercase()))
            })
            .map(|r| r.name.clone())
            .unwrap_or_else(|| self.rules.default_industry.clone());

        EnrichmentFields {
            role_level,
            job_function,
            industry,
            company_size: None,
            skills,
            company_location: None,
            is_public: None,
            founded_year: None,
            tags: vec![RULE_ENRICHMENT_TAG.to_string()],
        }
    }
}

#[async_trait]
impl EnrichmentSource for RuleEnricher {
    fn name(&self) -> &'static str {
        "rules"
    }

    async fn enrich(&self, request: &EnrichmentRequest) -> Result<EnrichmentFields, EnrichmentError> {
        Ok(self.infer(request))
    }
}

#[derive(Debug, Deserialize)]
struct LlmEnrichmentResponse {
    role_level: String,
    job_function: String,
    industry: String,
    company_size: Option<String>,
    skills: Vec<String>,
    company_location: Option<String>,
    is_public: Option<bool>,
    founded_year: Option<i32>,
    tags: Vec<String>,
}

/// Decode a service reply. All nine fields must be present (null is allowed
/// for the optional ones) or the whole reply is rejected.
pub(crate) fn parse_llm_response(body: &str) -> Result<EnrichmentFields, EnrichmentError> {
    let object: JsonMap<String, JsonValue> = serde_json::from_str(body)?;
    if let Some(missing) = RESPONSE_FIELDS.iter().find(|f| !object.contains_key(**f)) {
        return Err(EnrichmentError::Malformed(format!("missing field {missing}")));
    }
    let response: LlmEnrichmentResponse = serde_json::from_value(JsonValue::Object(object))?;

    let role_level = RoleLevel::parse(&response.role_level).ok_or_else(|| {
        EnrichmentError::Malformed(format!("unknown role level {}", response.role_level))
    })?;
    let required = |name: &str, value: String| {
        let value = value.trim().to_string();
        if value.is_empty() {
            Err(EnrichmentError::Malformed(format!("{name} is empty")))
        } else {
            Ok(value)
        }
    };
    let job_function = required("job_function", response.job_function)?;
    let industry = required("industry", response.industry)?;
    if let Some(year) = response.founded_year {
        if !(1600..=2100).contains(&year) {
            return Err(EnrichmentError::Malformed(format!("founded_year {year} out of range")));
        }
    }

    let mut tags = response.tags;
    if !tags.iter().any(|t| t == AI_ENRICHMENT_TAG) {
        tags.push(AI_ENRICHMENT_TAG.to_string());
    }
    Ok(EnrichmentFields {
        role_level,
        job_function,
        industry,
        company_size: response.company_size,
        skills: response.skills,
        company_location: response.company_location,
        is_public: response.is_public,
        founded_year: response.founded_year,
        tags,
    })
}

/// Client for the external enrichment service; the boundary enforces its own timeout.
#[derive(Debug, Clone)]
pub struct LlmEnricher {
    endpoint: String,
    api_key: Option<String>,
    client: HttpJsonClient,
}

impl LlmEnricher {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = HttpJsonClient::new(HttpClientConfig {
            timeout,
            backoff: BackoffPolicy {
                max_retries: 1,
                ..BackoffPolicy::default()
            },
            ..HttpClientConfig::default()
        })?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl EnrichmentSource for LlmEnricher {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn enrich(&self, request: &EnrichmentRequest) -> Result<EnrichmentFields, EnrichmentError> {
        let body = self
            .client
            .post_json(&self.endpoint, self.api_key.as_deref(), request)
            .await?;
        parse_llm_response(&body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Ai,
    Rules,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichmentSummary {
    pub run_id: Uuid,
    pub user_id: Uuid,
    pub candidates: usize,
    pub batches: usize,
    pub enriched_ai: usize,
    pub enriched_rules: usize,
    pub failed: usize,
    pub cancelled: bool,
}

pub struct EnrichmentPipeline {
    store: Arc<dyn Store>,
    primary: Option<Arc<dyn EnrichmentSource>>,
    rules: RuleEnricher,
    batch_size: usize,
}

impl EnrichmentPipeline {
    pub fn new(store: Arc<dyn Store>, config: &EnrichmentConfig) -> Result<Self> {
        let rules = RuleEnricher::new(EnrichmentRules::load(&config.rules_path)?);
        let primary = match &config.endpoint {
            Some(endpoint) => Some(Arc::new(LlmEnricher::new(
                endpoint.clone(),
                config.api_key.clone(),
                config.timeout,
            )?) as Arc<dyn EnrichmentSource>),
            None => None,
        };
        Ok(Self {
            store,
            primary,
            rules,
            batch_size: config.batch_size.max(1),
        })
    }

    pub fn with_primary(mut self, primary: Option<Arc<dyn EnrichmentSource>>) -> Self {
        self.primary = primary;
        self
    }

    /// Enrich every not-yet-enriched profile of `user_id`. Records within a
    /// batch run concurrently; cancellation is checked between batches.
    pub async fn run(&self, user_id: Uuid, cancel: &CancellationToken) -> Result<EnrichmentSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("enrichment", %run_id, %user_id);
        async move {
            let profiles = self
                .store
                .unenriched_profiles_for_user(user_id)
                .await
                .context("loading unenriched profiles")?;
            let connected_on = self
                .store
                .connections_for_user(user_id)
                .await
                .context("loading connections")?
                .into_iter()
                .map(|c| (c.profile_id, c.connected_on))
                .collect::<BTreeMap<_, _>>();

            let mut summary = EnrichmentSummary {
                run_id,
                user_id,
                candidates: profiles.len(),
                ..EnrichmentSummary::default()
            };

            for batch in profiles.chunks(self.batch_size) {
                if cancel.is_cancelled() {
                    summary.cancelled = true;
                    info!(batches = summary.batches, "enrichment cancelled");
                    break;
                }
                let outcomes = join_all(
                    batch
                        .iter()
                        .map(|p| self.enrich_one(p, connected_on.get(&p.id).copied())),
                )
                .await;
                summary.batches += 1;
                for outcome in outcomes {
                    match outcome {
                        RecordOutcome::Ai => summary.enriched_ai += 1,
                        RecordOutcome::Rules => summary.enriched_rules += 1,
                        RecordOutcome::Failed => summary.failed += 1,
                    }
                }
            }

            info!(
                candidates = summary.candidates,
                ai = summary.enriched_ai,
                rules = summary.enriched_rules,
                failed = summary.failed,
                "enrichment finished"
            );
            Ok::<_, anyhow::Error>(summary)
        }
        .instrument(span)
        .await
    }

    async fn enrich_one(&self, profile: &Profile, connected_on: Option<DateTime<Utc>>) -> RecordOutcome {
        let request = EnrichmentRequest::for_profile(profile, connected_on);
        let (fields, outcome) = match &self.primary {
            Some(source) => match source.enrich(&request).await {
                Ok(fields) => (fields, RecordOutcome::Ai),
                Err(err) => {
                    warn!(
                        profile_id = %profile.id,
                        source = source.name(),
                        error = %err,
                        "enrichment failed; using rule fallback"
                    );
                    (self.rules.infer(&request), RecordOutcome::Rules)
                }
            },
            None => (self.rules.infer(&request), RecordOutcome::Rules),
        };

        match self.store.save_enrichment(profile.id, &fields, Utc::now()).await {
            Ok(()) => outcome,
            Err(err) => {
                warn!(profile_id = %profile.id, error = %err, "saving enrichment failed");
                RecordOutcome::Failed
            }
        }
    }
}
