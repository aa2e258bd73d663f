use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use cgraph_core::{
    ComparisonResult, ComparisonSession, CoreError, MatchType, Profile, SessionStatus,
};
use cgraph_storage::Store;
use serde::Serialize;
use serde_json::json;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

const PREDICTED_MATCH_THRESHOLD: f64 = 0.3;

/// Additive per-attribute contributions for one cross-network pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchFactors {
    pub same_company: f64,
    pub same_job_function: f64,
    pub same_industry: f64,
    pub same_role_level: f64,
    pub shared_skills: Vec<String>,
    pub skills: f64,
}

impl MatchFactors {
    pub fn between(a: &Profile, b: &Profile) -> Self {
        let same = |x: &Option<String>, y: &Option<String>| match (x, y) {
            (Some(x), Some(y)) => {
                !x.trim().is_empty() && x.trim().eq_ignore_ascii_case(y.trim())
            }
            _ => false,
        };
        let skills_of = |p: &Profile| {
            p.skills
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect::<BTreeSet<_>>()
        };
        let shared_skills = skills_of(a)
            .intersection(&skills_of(b))
            .cloned()
            .collect::<Vec<_>>();
        let flag = |hit: bool, weight: f64| if hit { weight } else { 0.0 };

        Self {
            same_company: flag(same(&a.company, &b.company), 0.3),
            same_job_function: flag(same(&a.job_function, &b.job_function), 0.2),
            same_industry: flag(same(&a.industry, &b.industry), 0.2),
            same_role_level: flag(
                a.role_level.is_some() && a.role_level == b.role_level,
                0.1,
            ),
            skills: shared_skills.len() as f64 * 0.05,
            shared_skills,
        }
    }

    pub fn total(&self) -> f64 {
        self.same_company + self.same_job_function + self.same_industry + self.same_role_level + self.skills
    }
}

/// Match two networks: shared profiles, cross-network look-alikes and shared tags.
pub fn compare_networks(
    session_id: Uuid,
    profiles_a: &[Profile],
    profiles_b: &[Profile],
) -> Vec<ComparisonResult> {
    let ids_a = profiles_a.iter().map(|p| p.id).collect::<BTreeSet<_>>();
    let ids_b = profiles_b.iter().map(|p| p.id).collect::<BTreeSet<_>>();
    let mutual = ids_a.intersection(&ids_b).copied().collect::<BTreeSet<_>>();
    let names = profiles_a
        .iter()
        .map(|p| (p.id, p.full_name.as_str()))
        .collect::<BTreeMap<_, _>>();

    let result = |match_type, profile_a, profile_b, score, explanation| ComparisonResult {
        id: Uuid::new_v4(),
        session_id,
        match_type,
        profile_a,
        profile_b,
        score,
        explanation,
    };

    let mut results = mutual
        .iter()
        .map(|id| {
            result(
                MatchType::MutualConnection,
                Some(*id),
                Some(*id),
                1.0,
                json!({ "full_name": names.get(id).copied().unwrap_or_default() }),
            )
        })
        .collect::<Vec<_>>();

    let mut predicted = Vec::new();
    for a in profiles_a.iter().filter(|p| !mutual.contains(&p.id)) {
        for b in profiles_b.iter().filter(|p| !mutual.contains(&p.id)) {
            let factors = MatchFactors::between(a, b);
            let total = factors.total();
            if total < PREDICTED_MATCH_THRESHOLD {
                continue;
            }
            predicted.push(result(
                MatchType::PredictedMatch,
                Some(a.id),
                Some(b.id),
                total.min(1.0),
                json!({
                    "profile_a": a.full_name,
                    "profile_b": b.full_name,
                    "raw_score": total,
                    "factors": factors,
                }),
            ));
        }
    }
    predicted.sort_by(|x, y| {
        y.score
            .total_cmp(&x.score)
            .then_with(|| x.profile_a.cmp(&y.profile_a))
            .then_with(|| x.profile_b.cmp(&y.profile_b))
    });
    results.extend(predicted);

    let tags = |profiles: &[Profile]| {
        profiles
            .iter()
            .flat_map(|p| p.tags.iter().cloned())
            .collect::<BTreeSet<_>>()
    };
    for tag in tags(profiles_a).intersection(&tags(profiles_b)) {
        results.push(result(
            MatchType::OverlappingTag,
            None,
            None,
            1.0,
            json!({ "tag": tag }),
        ));
    }
    results
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonOutcome {
    pub session: ComparisonSession,
    pub results: Vec<ComparisonResult>,
}

impl ComparisonOutcome {
    pub fn count(&self, match_type: MatchType) -> usize {
        self.results.iter().filter(|r| r.match_type == match_type).count()
    }
}

/// Record a new pending session between two users.
pub async fn start_comparison(
    store: &dyn Store,
    user_a: Uuid,
    user_b: Uuid,
    now: DateTime<Utc>,
) -> Result<ComparisonSession, CoreError> {
    if user_a == user_b {
        return Err(CoreError::Validation {
            entity: format!("comparison {user_a}"),
            message: "a network cannot be compared with itself".to_string(),
        });
    }
    let session = ComparisonSession::new(user_a, user_b, now);
    store.save_session(&session).await?;
    Ok(session)
}

/// Compute and persist results for `session_id`, then mark it completed.
pub async fn run_comparison(
    store: &dyn Store,
    session_id: Uuid,
    now: DateTime<Utc>,
) -> Result<ComparisonOutcome, CoreError> {
    let mut session = store
        .get_session(session_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("comparison session {session_id}")))?;
    if session.status == SessionStatus::Completed {
        return Err(CoreError::InvalidTransition {
            from: session.status,
            to: SessionStatus::Completed,
        });
    }

    let span = info_span!("comparison", %session_id);
    async move {
        let profiles_a = store.profiles_for_user(session.user_a).await?;
        let profiles_b = store.profiles_for_user(session.user_b).await?;
        let results = compare_networks(session.id, &profiles_a, &profiles_b);

        store.insert_results(&results).await?;
        session.complete(now)?;
        store.save_session(&session).await?;

        let outcome = ComparisonOutcome { session, results };
        info!(
            mutual = outcome.count(MatchType::MutualConnection),
            predicted = outcome.count(MatchType::PredictedMatch),
            tags = outcome.count(MatchType::OverlappingTag),
            "comparison completed"
        );
        Ok::<_, CoreError>(outcome)
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgraph_core::{Connection, RoleLevel};
    use cgraph_storage::MemoryStore;

    fn profile(name: &str) -> Profile {
        Profile::new(name, format!("https://x/{name}"), Utc::now())
    }

    #[test]
    fn factors_add_per_matching_attribute() {
        let mut a = profile("A");
        let mut b = profile("B");
        a.company = Some("Acme".into());
        b.company = Some("acme ".into());
        a.role_level = Some(RoleLevel::Manager);
        b.role_level = Some(RoleLevel::Manager);
        a.skills = vec!["Rust".into(), "SQL".into()];
        b.skills = vec!["rust".into(), "Go".into()];
        let factors = MatchFactors::between(&a, &b);
        assert_eq!(factors.same_company, 0.3);
        assert_eq!(factors.same_job_function, 0.0);
        assert_eq!(factors.same_role_level, 0.1);
        assert_eq!(factors.shared_skills, vec!["rust".to_string()]);
        assert!((factors.total() - 0.45).abs() < 1e-9);
    }

    #[test]
    fn shared_profile_is_mutual_and_lookalikes_are_predicted() {
        let session = Uuid::new_v4();
        let p1 = profile("P1");
        let mut p2 = profile("P2");
        let mut p3 = profile("P3");
        p2.company = Some("Acme".into());
        p3.company = Some("Acme".into());
        p2.tags = vec!["source:connection".into()];
        p3.tags = vec!["source:connection".into(), "phone:+1".into()];

        let results = compare_networks(session, &[p1.clone(), p2.clone()], &[p1.clone(), p3.clone()]);
        assert_eq!(results[0].match_type, MatchType::MutualConnection);
        assert_eq!(results[0].profile_a, Some(p1.id));
        assert_eq!(results[0].score, 1.0);

        let predicted = results
            .iter()
            .filter(|r| r.match_type == MatchType::PredictedMatch)
            .collect::<Vec<_>>();
        assert_eq!(predicted.len(), 1);
        assert_eq!(predicted[0].profile_a, Some(p2.id));
        assert_eq!(predicted[0].profile_b, Some(p3.id));
        assert!((predicted[0].score - 0.3).abs() < 1e-9);

        let tags = results
            .iter()
            .filter(|r| r.match_type == MatchType::OverlappingTag)
            .collect::<Vec<_>>();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].explanation["tag"], "source:connection");
        assert!(results.iter().all(|r| r.session_id == session));
    }

    #[test]
    fn weak_pairs_are_not_emitted() {
        let mut p2 = profile("P2");
        let mut p3 = profile("P3");
        p2.industry = Some("Finance".into());
        p3.industry = Some("Finance".into());
        let results = compare_networks(Uuid::new_v4(), &[p2], &[p3]);
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn run_comparison_completes_session_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let shared = store.upsert_profile(&profile("Shared")).await.unwrap();
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

        let session = start_comparison(&store, a, b, now).await.unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        let outcome = run_comparison(&store, session.id, now).await.unwrap();
        assert_eq!(outcome.session.status, SessionStatus::Completed);
        assert_eq!(outcome.session.completed_at, Some(now));
        assert_eq!(outcome.count(MatchType::MutualConnection), 1);
        assert_eq!(store.results_for_session(session.id).await.unwrap().len(), 1);

        assert!(matches!(
            run_comparison(&store, session.id, now).await,
            Err(CoreError::InvalidTransition { .. })
        ));
        assert!(start_comparison(&store, a, a, now).await.is_err());
    }
}
