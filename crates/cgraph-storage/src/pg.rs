use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cgraph_core::{
    ComparisonResult, ComparisonSession, Connection, EdgeType, EnrichmentFields, GraphEdge,
    GraphNode, MatchType, NodeProfileMapping, NodeType, Prediction, Profile, RoleLevel,
    SessionStatus,
};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row};
use tracing::info;
use uuid::Uuid;

use crate::{Store, StoreError};

const PROFILE_COLUMNS: &str = "id, full_name, profile_url, email, company, title, role_level, \
     job_function, industry, company_size, skills, company_location, is_public, founded_year, \
     enriched_at, tags, created_at";

/// Postgres-backed [`Store`]. Every write is a single-row upsert keyed by the
/// entity's natural key, so independent jobs can interleave freely.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn profile_upsert(profile: &Profile) -> Query<'_, Postgres, PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO profiles (id, full_name, profile_url, email, company, title, tags, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (profile_url) DO UPDATE
           SET full_name = CASE WHEN EXCLUDED.full_name <> '' THEN EXCLUDED.full_name
                                ELSE profiles.full_name END,
               email = COALESCE(EXCLUDED.email, profiles.email),
               company = COALESCE(EXCLUDED.company, profiles.company),
               title = COALESCE(EXCLUDED.title, profiles.title),
               tags = profiles.tags || COALESCE(
                   (SELECT jsonb_agg(t) FROM jsonb_array_elements(EXCLUDED.tags) AS t
                     WHERE NOT profiles.tags @> jsonb_build_array(t)),
                   '[]'::jsonb)
        RETURNING id, full_name, profile_url, email, company, title, role_level,
                  job_function, industry, company_size, skills, company_location, is_public,
                  founded_year, enriched_at, tags, created_at
        "#,
    )
    .bind(profile.id)
    .bind(&profile.full_name)
    .bind(&profile.profile_url)
    .bind(&profile.email)
    .bind(&profile.company)
    .bind(&profile.title)
    .bind(Json(&profile.tags))
    .bind(profile.created_at)
}

fn profile_from_row(row: &PgRow) -> Result<Profile, StoreError> {
    let role_level = row
        .try_get::<Option<String>, _>("role_level")?
        .map(|raw| {
            RoleLevel::parse(&raw).ok_or_else(|| StoreError::Invalid(format!("role level {raw}")))
        })
        .transpose()?;
    let Json(skills): Json<Vec<String>> = row.try_get("skills")?;
    let Json(tags): Json<Vec<String>> = row.try_get("tags")?;
    Ok(Profile {
        id: row.try_get("id")?,
        full_name: row.try_get("full_name")?,
        profile_url: row.try_get("profile_url")?,
        email: row.try_get("email")?,
        company: row.try_get("company")?,
        title: row.try_get("title")?,
        role_level,
        job_function: row.try_get("job_function")?,
        industry: row.try_get("industry")?,
        company_size: row.try_get("company_size")?,
        skills,
        company_location: row.try_get("company_location")?,
        is_public: row.try_get("is_public")?,
        founded_year: row.try_get("founded_year")?,
        enriched_at: row.try_get("enriched_at")?,
        tags,
        created_at: row.try_get("created_at")?,
    })
}

fn node_from_row(row: &PgRow) -> Result<GraphNode, StoreError> {
    let raw_type: String = row.try_get("node_type")?;
    let node_type = NodeType::parse(&raw_type)
        .ok_or_else(|| StoreError::Invalid(format!("node type {raw_type}")))?;
    let owners: Vec<Uuid> = row.try_get("owners")?;
    let embedding: Option<Json<Vec<f32>>> = row.try_get("embedding")?;
    Ok(GraphNode {
        key: row.try_get("key")?,
        node_type,
        label: row.try_get("label")?,
        owners: owners.into_iter().collect(),
        embedding: embedding.map(|Json(v)| v),
    })
}

fn edge_from_row(row: &PgRow) -> Result<GraphEdge, StoreError> {
    let raw_type: String = row.try_get("edge_type")?;
    let edge_type = EdgeType::parse(&raw_type)
        .ok_or_else(|| StoreError::Invalid(format!("edge type {raw_type}")))?;
    let Json(properties): Json<JsonMap<String, JsonValue>> = row.try_get("properties")?;
    Ok(GraphEdge {
        source: row.try_get("source")?,
        target: row.try_get("target")?,
        edge_type,
        weight: row.try_get("weight")?,
        properties,
    })
}

fn prediction_from_row(row: &PgRow) -> Result<Prediction, StoreError> {
    Ok(Prediction {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        profile_id: row.try_get("profile_id")?,
        score: row.try_get("score")?,
        reason: row.try_get("reason")?,
        created_at: row.try_get("created_at")?,
    })
}

fn session_from_row(row: &PgRow) -> Result<ComparisonSession, StoreError> {
    let raw_status: String = row.try_get("status")?;
    let status = SessionStatus::parse(&raw_status)
        .ok_or_else(|| StoreError::Invalid(format!("session status {raw_status}")))?;
    Ok(ComparisonSession {
        id: row.try_get("id")?,
        user_a: row.try_get("user_a")?,
        user_b: row.try_get("user_b")?,
        status,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn result_from_row(row: &PgRow) -> Result<ComparisonResult, StoreError> {
    let raw_type: String = row.try_get("match_type")?;
    let match_type = MatchType::parse(&raw_type)
        .ok_or_else(|| StoreError::Invalid(format!("match type {raw_type}")))?;
    Ok(ComparisonResult {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        match_type,
        profile_a: row.try_get("profile_a")?,
        profile_b: row.try_get("profile_b")?,
        score: row.try_get("score")?,
        explanation: row.try_get("explanation")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_profile(&self, profile: &Profile) -> Result<Profile, StoreError> {
        let row = profile_upsert(profile).fetch_one(&self.pool).await?;
        profile_from_row(&row)
    }

    async fn upsert_profiles(&self, profiles: &[Profile]) -> Result<Vec<Profile>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut out = Vec::with_capacity(profiles.len());
        for profile in profiles {
            let row = profile_upsert(profile).fetch_one(&mut *tx).await?;
            out.push(profile_from_row(&row)?);
        }
        tx.commit().await?;
        Ok(out)
    }

    async fn get_profile(&self, id: Uuid) -> Result<Option<Profile>, StoreError> {
        let sql = format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE id = $1");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(profile_from_row)
            .transpose()
    }

    async fn list_profiles(&self) -> Result<Vec<Profile>, StoreError> {
        let sql = format!("SELECT {PROFILE_COLUMNS} FROM profiles ORDER BY full_name, id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(profile_from_row).collect()
    }

    async fn profiles_for_user(&self, user_id: Uuid) -> Result<Vec<Profile>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.full_name, p.profile_url, p.email, p.company, p.title, p.role_level,
                   p.job_function, p.industry, p.company_size, p.skills, p.company_location,
                   p.is_public, p.founded_year, p.enriched_at, p.tags, p.created_at
              FROM profiles p
              JOIN connections c ON c.profile_id = p.id
             WHERE c.user_id = $1
             ORDER BY p.full_name, p.id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(profile_from_row).collect()
    }

    async fn unenriched_profiles_for_user(&self, user_id: Uuid) -> Result<Vec<Profile>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.full_name, p.profile_url, p.email, p.company, p.title, p.role_level,
                   p.job_function, p.industry, p.company_size, p.skills, p.company_location,
                   p.is_public, p.founded_year, p.enriched_at, p.tags, p.created_at
              FROM profiles p
              JOIN connections c ON c.profile_id = p.id
             WHERE c.user_id = $1
               AND p.enriched_at IS NULL
             ORDER BY p.full_name, p.id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(profile_from_row).collect()
    }

    async fn save_enrichment(
        &self,
        profile_id: Uuid,
        fields: &EnrichmentFields,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE profiles
               SET role_level = $2,
                   job_function = $3,
                   industry = $4,
                   company_size = $5,
                   skills = $6,
                   company_location = $7,
                   is_public = $8,
                   founded_year = $9,
                   tags = tags || COALESCE(
                       (SELECT jsonb_agg(t) FROM jsonb_array_elements($10::jsonb) AS t
                         WHERE NOT profiles.tags @> jsonb_build_array(t)),
                       '[]'::jsonb),
                   enriched_at = COALESCE(enriched_at, $11)
             WHERE id = $1
            "#,
        )
        .bind(profile_id)
        .bind(fields.role_level.as_str())
        .bind(&fields.job_function)
        .bind(&fields.industry)
        .bind(&fields.company_size)
        .bind(Json(&fields.skills))
        .bind(&fields.company_location)
        .bind(fields.is_public)
        .bind(fields.founded_year)
        .bind(Json(&fields.tags))
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("profile {profile_id}")));
        }
        Ok(())
    }

    async fn upsert_connections(&self, connections: &[Connection]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for connection in connections {
            sqlx::query(
                r#"
                INSERT INTO connections (user_id, profile_id, connected_on, created_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (user_id, profile_id) DO UPDATE
                   SET connected_on = EXCLUDED.connected_on
                "#,
            )
            .bind(connection.user_id)
            .bind(connection.profile_id)
            .bind(connection.connected_on)
            .bind(connection.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(connections.len())
    }

    async fn connections_for_user(&self, user_id: Uuid) -> Result<Vec<Connection>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, profile_id, connected_on, created_at
              FROM connections
             WHERE user_id = $1
             ORDER BY profile_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Connection {
                user_id: row.try_get("user_id")?,
                profile_id: row.try_get("profile_id")?,
                connected_on: row.try_get("connected_on")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(out)
    }

    async fn users(&self) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT user_id FROM connections ORDER BY user_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("user_id").map_err(StoreError::from))
            .collect()
    }

    async fn upsert_node(&self, node: &GraphNode) -> Result<GraphNode, StoreError> {
        let owners = node.owners.iter().copied().collect::<Vec<_>>();
        let row = sqlx::query(
            r#"
            INSERT INTO graph_nodes (key, node_type, label, owners, embedding)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (key) DO UPDATE
               SET label = EXCLUDED.label,
                   owners = ARRAY(
                       SELECT DISTINCT o FROM unnest(graph_nodes.owners || EXCLUDED.owners) AS o
                        ORDER BY o),
                   embedding = COALESCE(EXCLUDED.embedding, graph_nodes.embedding)
            RETURNING key, node_type, label, owners, embedding
            "#,
        )
        .bind(&node.key)
        .bind(node.node_type.as_str())
        .bind(&node.label)
        .bind(&owners)
        .bind(node.embedding.as_ref().map(Json))
        .fetch_one(&self.pool)
        .await?;
        node_from_row(&row)
    }

    async fn get_node(&self, key: &str) -> Result<Option<GraphNode>, StoreError> {
        sqlx::query("SELECT key, node_type, label, owners, embedding FROM graph_nodes WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(node_from_row)
            .transpose()
    }

    async fn list_nodes(&self, node_type: Option<NodeType>) -> Result<Vec<GraphNode>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT key, node_type, label, owners, embedding
              FROM graph_nodes
             WHERE $1::text IS NULL OR node_type = $1
             ORDER BY key
            "#,
        )
        .bind(node_type.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(node_from_row).collect()
    }

    async fn upsert_edge(&self, edge: &GraphEdge) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO graph_edges (source, target, edge_type, weight, properties)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source, target, edge_type) DO UPDATE
               SET weight = EXCLUDED.weight,
                   properties = EXCLUDED.properties
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&edge.source)
        .bind(&edge.target)
        .bind(edge.edge_type.as_str())
        .bind(edge.weight)
        .bind(Json(&edge.properties))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("inserted")?)
    }

    async fn edges_touching(&self, node_key: &str) -> Result<Vec<GraphEdge>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT source, target, edge_type, weight, properties
              FROM graph_edges
             WHERE source = $1 OR target = $1
             ORDER BY source, target, edge_type
            "#,
        )
        .bind(node_key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(edge_from_row).collect()
    }

    async fn list_edges(&self) -> Result<Vec<GraphEdge>, StoreError> {
        let rows = sqlx::query(
            "SELECT source, target, edge_type, weight, properties FROM graph_edges ORDER BY source, target, edge_type",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(edge_from_row).collect()
    }

    async fn upsert_mapping(&self, mapping: &NodeProfileMapping) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO node_profile_mappings (node_key, profile_id, user_id)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&mapping.node_key)
        .bind(mapping.profile_id)
        .bind(mapping.user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn node_for_profile(&self, profile_id: Uuid) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            "SELECT node_key FROM node_profile_mappings WHERE profile_id = $1 ORDER BY node_key LIMIT 1",
        )
        .bind(profile_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.try_get("node_key")).transpose()?)
    }

    async fn insert_predictions(&self, predictions: &[Prediction]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for prediction in predictions {
            sqlx::query(
                r#"
                INSERT INTO predictions (id, user_id, profile_id, score, reason, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(prediction.id)
            .bind(prediction.user_id)
            .bind(prediction.profile_id)
            .bind(prediction.score)
            .bind(&prediction.reason)
            .bind(prediction.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(predictions.len())
    }

    async fn latest_predictions(&self, user_id: Uuid) -> Result<Vec<Prediction>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, profile_id, score, reason, created_at
              FROM predictions
             WHERE user_id = $1
               AND created_at = (SELECT MAX(created_at) FROM predictions WHERE user_id = $1)
             ORDER BY score DESC, profile_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(prediction_from_row).collect()
    }

    async fn save_session(&self, session: &ComparisonSession) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO comparison_sessions (id, user_a, user_b, status, created_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
               SET status = EXCLUDED.status,
                   completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(session.id)
        .bind(session.user_a)
        .bind(session.user_b)
        .bind(session.status.as_str())
        .bind(session.created_at)
        .bind(session.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<ComparisonSession>, StoreError> {
        sqlx::query(
            "SELECT id, user_a, user_b, status, created_at, completed_at FROM comparison_sessions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(session_from_row)
        .transpose()
    }

    async fn insert_results(&self, results: &[ComparisonResult]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for result in results {
            sqlx::query(
                r#"
                INSERT INTO comparison_results
                    (id, session_id, match_type, profile_a, profile_b, score, explanation)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(result.id)
            .bind(result.session_id)
            .bind(result.match_type.as_str())
            .bind(result.profile_a)
            .bind(result.profile_b)
            .bind(result.score)
            .bind(&result.explanation)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(results.len())
    }

    async fn results_for_session(&self, session_id: Uuid) -> Result<Vec<ComparisonResult>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_id, match_type, profile_a, profile_b, score, explanation
              FROM comparison_results
             WHERE session_id = $1
             ORDER BY match_type, score DESC, id
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(result_from_row).collect()
    }
}
