//! Core domain model and error taxonomy for the contact graph.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cgraph-core";

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed input in {source_name}: {message}")]
    MalformedInput { source_name: String, message: String },
    #[error("validation failed for {entity}: {message}")]
    Validation { entity: String, message: String },
    #[error("external service error: {0}")]
    ExternalService(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid session transition {from} -> {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
}

/// Date value plus a flag telling whether it came from a successful parse or
/// is the "now" fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NormalizedDate {
    pub instant: DateTime<Utc>,
    pub parsed: bool,
}

impl NormalizedDate {
    pub fn parsed(instant: DateTime<Utc>) -> Self {
        Self {
            instant,
            parsed: true,
        }
    }

    pub fn fallback(instant: DateTime<Utc>) -> Self {
        Self {
            instant,
            parsed: false,
        }
    }

    /// RFC 3339 in UTC with whole seconds, e.g. `2023-03-15T00:00:00Z`.
    pub fn canonical(&self) -> String {
        self.instant.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

/// Render an auxiliary value as a `kind:value` tag string.
pub fn render_tag(kind: &str, value: impl fmt::Display) -> String {
    format!("{kind}:{value}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    Connection,
    Contact,
    Invitation,
    Message,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Contact => "contact",
            Self::Invitation => "invitation",
            Self::Message => "message",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvitationDirection {
    Incoming,
    Outgoing,
}

impl InvitationDirection {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "INCOMING" => Some(Self::Incoming),
            "OUTGOING" => Some(Self::Outgoing),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "INCOMING",
            Self::Outgoing => "OUTGOING",
        }
    }
}

/// In-memory merge target for one real-world contact within a single import.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContactRecord {
    pub first_name: String,
    pub last_name: String,
    pub profile_url: Option<String>,
    pub email: Option<String>,
    pub additional_emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub whatsapp_numbers: Vec<String>,
    pub company: Option<String>,
    pub position: Option<String>,
    pub connected_on: Option<NormalizedDate>,
    pub invitation_status: Option<InvitationDirection>,
    pub invitation_sent_at: Option<NormalizedDate>,
    pub invitation_message: Option<String>,
    pub last_message_at: Option<NormalizedDate>,
    pub last_message: Option<String>,
    pub sources: BTreeSet<SourceTag>,
}

impl ContactRecord {
    pub fn new(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            first_name: first_name.into().trim().to_string(),
            last_name: last_name.into().trim().to_string(),
            ..Self::default()
        }
    }

    pub fn full_name(&self) -> String {
        identity_key(&self.first_name, &self.last_name)
    }
}

/// Identity key shared by every row describing the same contact.
pub fn identity_key(first_name: &str, last_name: &str) -> String {
    first_name
        .split_whitespace()
        .chain(last_name.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleLevel {
    #[serde(rename = "IC")]
    Ic,
    Manager,
    Executive,
}

impl RoleLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ic => "IC",
            Self::Manager => "Manager",
            Self::Executive => "Executive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "IC" => Some(Self::Ic),
            "Manager" => Some(Self::Manager),
            "Executive" => Some(Self::Executive),
            _ => None,
        }
    }
}

/// Attribute set produced by one enrichment pass, whichever path produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentFields {
    pub role_level: RoleLevel,
    pub job_function: String,
    pub industry: String,
    pub company_size: Option<String>,
    pub skills: Vec<String>,
    pub company_location: Option<String>,
    pub is_public: Option<bool>,
    pub founded_year: Option<i32>,
    pub tags: Vec<String>,
}

/// Persisted contact. `profile_url` is the natural key at the storage boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub full_name: String,
    pub profile_url: String,
    pub email: Option<String>,
    pub company: Option<String>,
    pub title: Option<String>,
    pub role_level: Option<RoleLevel>,
    pub job_function: Option<String>,
    pub industry: Option<String>,
    pub company_size: Option<String>,
    pub skills: Vec<String>,
    pub company_location: Option<String>,
    pub is_public: Option<bool>,
    pub founded_year: Option<i32>,
    pub enriched_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Profile {
    /// Stable identifier derived from the profile URL.
    pub fn id_for_url(profile_url: &str) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, profile_url.trim().as_bytes())
    }

    pub fn new(
        full_name: impl Into<String>,
        profile_url: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let profile_url = profile_url.into().trim().to_string();
        Self {
            id: Self::id_for_url(&profile_url),
            full_name: full_name.into().trim().to_string(),
            profile_url,
            email: None,
            company: None,
            title: None,
            role_level: None,
            job_function: None,
            industry: None,
            company_size: None,
            skills: Vec::new(),
            company_location: None,
            is_public: None,
            founded_year: None,
            enriched_at: None,
            tags: Vec::new(),
            created_at,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.full_name.trim().is_empty() {
            return Err(CoreError::Validation {
                entity: format!("profile {}", self.profile_url),
                message: "full name is empty".to_string(),
            });
        }
        if self.profile_url.trim().is_empty() {
            return Err(CoreError::Validation {
                entity: format!("profile {}", self.full_name),
                message: "profile url is empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn is_enriched(&self) -> bool {
        self.enriched_at.is_some()
    }

    /// Replace every enrichment attribute with `fields`. `enriched_at` is only
    /// ever set once.
    pub fn apply_enrichment(&mut self, fields: EnrichmentFields, at: DateTime<Utc>) {
        self.role_level = Some(fields.role_level);
        self.job_function = Some(fields.job_function);
        self.industry = Some(fields.industry);
        self.company_size = fields.company_size;
        self.skills = fields.skills;
        self.company_location = fields.company_location;
        self.is_public = fields.is_public;
        self.founded_year = fields.founded_year;
        for tag in fields.tags {
            if !self.tags.contains(&tag) {
                self.tags.push(tag);
            }
        }
        if self.enriched_at.is_none() {
            self.enriched_at = Some(at);
        }
    }

    /// Fold a newer import of the same profile into this one. Identity fields
    /// and enrichment state stay with `self`.
    pub fn absorb(&mut self, incoming: Profile) {
        if !incoming.full_name.is_empty() {
            self.full_name = incoming.full_name;
        }
        if incoming.email.is_some() {
            self.email = incoming.email;
        }
        if incoming.company.is_some() {
            self.company = incoming.company;
        }
        if incoming.title.is_some() {
            self.title = incoming.title;
        }
        for tag in incoming.tags {
            if !self.tags.contains(&tag) {
                self.tags.push(tag);
            }
        }
    }
}

/// One user's link to a profile. Unique per (user_id, profile_id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub user_id: Uuid,
    pub profile_id: Uuid,
    pub connected_on: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Profile,
    Company,
    Industry,
    Keyword,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Company => "company",
            Self::Industry => "industry",
            Self::Keyword => "keyword",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "profile" => Some(Self::Profile),
            "company" => Some(Self::Company),
            "industry" => Some(Self::Industry),
            "keyword" => Some(Self::Keyword),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub key: String,
    pub node_type: NodeType,
    pub label: String,
    pub owners: BTreeSet<Uuid>,
    pub embedding: Option<Vec<f32>>,
}

impl GraphNode {
    pub fn new(key: impl Into<String>, node_type: NodeType, label: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            node_type,
            label: label.into(),
            owners: BTreeSet::new(),
            embedding: None,
        }
    }

    pub fn profile_key(profile_id: Uuid) -> String {
        format!("profile_{profile_id}")
    }

    /// Key for an attribute node (`company_acme_corp`, `keyword_rust`, ...).
    pub fn attribute_key(node_type: NodeType, value: &str) -> String {
        let slug = value
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("_");
        format!("{}_{}", node_type.as_str(), slug)
    }

    pub fn with_owner(mut self, owner: Uuid) -> Self {
        self.owners.insert(owner);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Connection,
    Affiliation,
    TitleSimilarity,
    Mutual,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Affiliation => "affiliation",
            Self::TitleSimilarity => "title_similarity",
            Self::Mutual => "mutual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "connection" => Some(Self::Connection),
            "affiliation" => Some(Self::Affiliation),
            "title_similarity" => Some(Self::TitleSimilarity),
            "mutual" => Some(Self::Mutual),
            _ => None,
        }
    }
}

/// Directed, typed edge. Identity is (source, target, edge_type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub edge_type: EdgeType,
    pub weight: f64,
    pub properties: JsonMap<String, JsonValue>,
}

impl GraphEdge {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        edge_type: EdgeType,
        weight: f64,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            edge_type,
            weight: weight.clamp(0.0, 1.0),
            properties: JsonMap::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn identity(&self) -> (String, String, EdgeType) {
        (self.source.clone(), self.target.clone(), self.edge_type)
    }

    pub fn touches(&self, node_key: &str) -> bool {
        self.source == node_key || self.target == node_key
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeProfileMapping {
    pub node_key: String,
    pub profile_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub profile_id: Uuid,
    pub score: f64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Accepted,
    Rejected,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonSession {
    pub id: Uuid,
    pub user_a: Uuid,
    pub user_b: Uuid,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ComparisonSession {
    pub fn new(user_a: Uuid, user_b: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_a,
            user_b,
            status: SessionStatus::Pending,
            created_at,
            completed_at: None,
        }
    }

    pub fn accept(&mut self) -> Result<(), CoreError> {
        self.transition(SessionStatus::Accepted)
    }

    pub fn reject(&mut self) -> Result<(), CoreError> {
        self.transition(SessionStatus::Rejected)
    }

    pub fn complete(&mut self, at: DateTime<Utc>) -> Result<(), CoreError> {
        self.transition(SessionStatus::Completed)?;
        self.completed_at = Some(at);
        Ok(())
    }

    fn transition(&mut self, to: SessionStatus) -> Result<(), CoreError> {
        use SessionStatus::*;
        let legal = matches!(
            (self.status, to),
            (Pending, Accepted)
                | (Pending, Rejected)
                | (Pending, Completed)
                | (Accepted, Completed)
                | (Rejected, Completed)
        );
        if !legal {
            return Err(CoreError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    MutualConnection,
    PredictedMatch,
    OverlappingTag,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MutualConnection => "mutual_connection",
            Self::PredictedMatch => "predicted_match",
            Self::OverlappingTag => "overlapping_tag",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mutual_connection" => Some(Self::MutualConnection),
            "predicted_match" => Some(Self::PredictedMatch),
            "overlapping_tag" => Some(Self::OverlappingTag),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub id: Uuid,
    pub session_id: Uuid,
    pub match_type: MatchType,
    pub profile_a: Option<Uuid>,
    pub profile_b: Option<Uuid>,
    pub score: f64,
    pub explanation: JsonValue,
}
