use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use cgraph_core::{ContactRecord, Profile};
use cgraph_ingest::{
    contact_to_connection, contact_to_profile, export_files_from_bytes, parse_export, ExportFile,
    IdentityResolver, MergeStats, NameCollisionCandidate, OwnerIdentity,
};
use cgraph_storage::{ExportArchive, Store};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{write_import_reports, ImportConfig};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("import for user {user_id} produced no usable contacts")]
    NoUsableContacts { user_id: Uuid },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub run_id: Uuid,
    pub user_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub archived_as: Option<String>,
    pub files_parsed: usize,
    pub skipped_lines: usize,
    pub merge: MergeStats,
    pub contacts_resolved: usize,
    pub validation_failures: usize,
    pub profiles_persisted: usize,
    pub persistence_failures: usize,
    pub connections_upserted: usize,
    pub collisions: Vec<NameCollisionCandidate>,
    pub reports_dir: Option<String>,
}

impl ImportSummary {
    pub fn empty(user_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            user_id,
            started_at,
            finished_at: started_at,
            archived_as: None,
            files_parsed: 0,
            skipped_lines: 0,
            merge: MergeStats::default(),
            contacts_resolved: 0,
            validation_failures: 0,
            profiles_persisted: 0,
            persistence_failures: 0,
            connections_upserted: 0,
            collisions: Vec::new(),
            reports_dir: None,
        }
    }
}

/// Export file(s) → merged contacts → persisted profiles and connections.
pub struct ImportPipeline {
    store: Arc<dyn Store>,
    config: ImportConfig,
}

impl ImportPipeline {
    pub fn new(store: Arc<dyn Store>, config: ImportConfig) -> Self {
        Self { store, config }
    }

    /// Import a single CSV, an archive, or a directory of loose CSV files.
    pub async fn import_path(&self, path: &Path, user_id: Uuid) -> Result<ImportSummary> {
        let metadata = fs::metadata(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        if metadata.is_dir() {
            let files = read_export_dir(path).await?;
            return self.import_files(&files, user_id, None).await;
        }
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        self.import_bytes(&name, &bytes, user_id).await
    }

    pub async fn import_bytes(&self, name: &str, bytes: &[u8], user_id: Uuid) -> Result<ImportSummary> {
        let archived_as = match &self.config.archive_dir {
            Some(root) => {
                let stored = ExportArchive::new(root)
                    .store(Utc::now(), user_id, name, bytes)
                    .await?;
                Some(stored.relative_path.display().to_string())
            }
            None => None,
        };
        let files = export_files_from_bytes(name, bytes).with_context(|| format!("unpacking {name}"))?;
        self.import_files(&files, user_id, archived_as).await
    }

    pub async fn import_files(
        &self,
        files: &[ExportFile],
        user_id: Uuid,
        archived_as: Option<String>,
    ) -> Result<ImportSummary> {
        let mut summary = ImportSummary::empty(user_id, Utc::now());
        summary.archived_as = archived_as;
        let span = info_span!("import", run_id = %summary.run_id, %user_id);
        async move {
            let parsed = parse_export(files);
            summary.files_parsed = parsed.len();
            summary.skipped_lines = parsed.iter().map(|p| p.skipped_lines).sum();

            let owner = self.config.owner_name.as_deref().and_then(OwnerIdentity::new);
            let outcome = IdentityResolver::resolve(owner, &parsed);
            summary.merge = outcome.stats.clone();
            summary.contacts_resolved = outcome.records.len();
            summary.collisions = outcome.collisions.clone();

            let mut mapped: Vec<(&ContactRecord, Profile)> = Vec::new();
            for record in &outcome.records {
                match contact_to_profile(record, summary.started_at) {
                    Ok(profile) => mapped.push((record, profile)),
                    Err(err) => {
                        summary.validation_failures += 1;
                        warn!(name = %record.full_name(), error = %err, "dropping contact");
                    }
                }
            }
            if mapped.is_empty() {
                return Err(ImportError::NoUsableContacts { user_id }.into());
            }

            let stored = self.persist_profiles(&mapped, &mut summary).await;
            let imported_at = summary.started_at;
            let upserted = self
                .persist_connections(&mapped, &stored, user_id, imported_at, &mut summary)
                .await;
            summary.connections_upserted = upserted;

            summary.finished_at = Utc::now();
            if let Some(root) = &self.config.reports_dir {
                let run_dir = root.join(summary.run_id.to_string());
                summary.reports_dir = Some(run_dir.display().to_string());
                let profiles = stored.values().cloned().collect::<Vec<_>>();
                write_import_reports(&run_dir, &summary, &outcome.records, &profiles)
                    .await
                    .context("writing import reports")?;
            }

            info!(
                contacts = summary.contacts_resolved,
                persisted = summary.profiles_persisted,
                connections = summary.connections_upserted,
                rejected = summary.validation_failures,
                "import finished"
            );
            Ok::<_, anyhow::Error>(summary)
        }
        .instrument(span)
        .await
    }

    /// Upsert in bounded batches. A failed batch is retried record by record
    /// so one bad row costs only itself.
    async fn persist_profiles(
        &self,
        mapped: &[(&ContactRecord, Profile)],
        summary: &mut ImportSummary,
    ) -> BTreeMap<String, Profile> {
        let mut stored = BTreeMap::new();
        let batch_size = self.config.persist_batch_size.max(1);
        for chunk in mapped.chunks(batch_size) {
            let profiles = chunk.iter().map(|(_, p)| p.clone()).collect::<Vec<_>>();
            match self.store.upsert_profiles(&profiles).await {
                Ok(saved) => {
                    for profile in saved {
                        stored.insert(profile.profile_url.clone(), profile);
                    }
                }
                Err(err) => {
                    warn!(size = profiles.len(), error = %err, "profile batch failed; retrying per record");
                    for profile in &profiles {
                        match self.store.upsert_profile(profile).await {
                            Ok(saved) => {
                                stored.insert(saved.profile_url.clone(), saved);
                            }
                            Err(err) => {
                                summary.persistence_failures += 1;
                                warn!(profile_url = %profile.profile_url, error = %err, "profile upsert failed");
                            }
                        }
                    }
                }
            }
        }
        summary.profiles_persisted = stored.len();
        stored
    }

    async fn persist_connections(
        &self,
        mapped: &[(&ContactRecord, Profile)],
        stored: &BTreeMap<String, Profile>,
        user_id: Uuid,
        imported_at: DateTime<Utc>,
        summary: &mut ImportSummary,
    ) -> usize {
        let connections = mapped
            .iter()
            .filter_map(|(record, profile)| {
                stored
                    .get(&profile.profile_url)
                    .map(|saved| contact_to_connection(record, user_id, saved.id, imported_at))
            })
            .collect::<Vec<_>>();

        let mut upserted = 0;
        for chunk in connections.chunks(self.config.persist_batch_size.max(1)) {
            match self.store.upsert_connections(chunk).await {
                Ok(count) => upserted += count,
                Err(err) => {
                    summary.persistence_failures += chunk.len();
                    warn!(size = chunk.len(), error = %err, "connection batch failed");
                }
            }
        }
        upserted
    }
}

async fn read_export_dir(dir: &Path) -> Result<Vec<ExportFile>> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    let mut paths: Vec<PathBuf> = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("reading {}", dir.display()))?
    {
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            paths.push(entry.path());
        }
    }
    paths.sort();

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        files.push(ExportFile {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            content: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgraph_storage::MemoryStore;

    fn fixture_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/export")
    }

    fn config(reports_dir: Option<PathBuf>) -> ImportConfig {
        ImportConfig {
            owner_name: Some("Sam Owner".into()),
            persist_batch_size: 4,
            reports_dir,
            archive_dir: None,
        }
    }

    #[tokio::test]
    async fn fixture_export_persists_profiles_and_connections() {
        let store = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        let user = Uuid::new_v4();
        let pipeline = ImportPipeline::new(store.clone(), config(Some(dir.path().to_path_buf())));

        let summary = pipeline.import_path(&fixture_dir(), user).await.unwrap();
        assert_eq!(summary.files_parsed, 6);
        assert_eq!(summary.contacts_resolved, 6);
        assert_eq!(summary.profiles_persisted, 6);
        assert_eq!(summary.connections_upserted, 6);
        assert_eq!(summary.persistence_failures, 0);
        assert_eq!(store.profiles_for_user(user).await.unwrap().len(), 6);

        let reports_dir = PathBuf::from(summary.reports_dir.as_deref().unwrap());
        assert!(reports_dir.join("manifest.json").exists());
        assert!(reports_dir.join("snapshots/profiles.parquet").exists());
    }

    #[tokio::test]
    async fn reimport_upserts_instead_of_duplicating() {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        let pipeline = ImportPipeline::new(store.clone(), config(None));
        pipeline.import_path(&fixture_dir(), user).await.unwrap();
        pipeline.import_path(&fixture_dir(), user).await.unwrap();

        assert_eq!(store.list_profiles().await.unwrap().len(), 6);
        assert_eq!(store.connections_for_user(user).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn archive_copy_is_written_before_parsing() {
        let store = Arc::new(MemoryStore::new());
        let archive = tempfile::tempdir().unwrap();
        let mut config = config(None);
        config.archive_dir = Some(archive.path().to_path_buf());
        let pipeline = ImportPipeline::new(store, config);

        let csv = std::fs::read(fixture_dir().join("Connections.csv")).unwrap();
        let summary = pipeline
            .import_bytes("Connections.csv", &csv, Uuid::new_v4())
            .await
            .unwrap();
        let archived = summary.archived_as.unwrap();
        assert!(archive.path().join(archived).exists());
        assert_eq!(summary.contacts_resolved, 4);
    }

    #[tokio::test]
    async fn export_without_contacts_fails_whole_import() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = ImportPipeline::new(store, config(None));
        let files = vec![ExportFile {
            name: "Connections.csv".into(),
            content: "First Name,Last Name,URL\n,,https://x/nameless\n".into(),
        }];
        let err = pipeline
            .import_files(&files, Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ImportError>(),
            Some(ImportError::NoUsableContacts { .. })
        ));
    }

    #[tokio::test]
    async fn contacts_without_profile_url_are_dropped() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = ImportPipeline::new(store, config(None));
        let files = vec![ExportFile {
            name: "Connections.csv".into(),
            content: "First Name,Last Name,URL,Company\nAda,Lovelace,https://x/ada,Acme\nNo,Url,,Acme\n"
                .into(),
        }];
        let summary = pipeline.import_files(&files, Uuid::new_v4(), None).await.unwrap();
        assert_eq!(summary.contacts_resolved, 2);
        assert_eq!(summary.validation_failures, 1);
        assert_eq!(summary.profiles_persisted, 1);
    }
}
