use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Int32Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use cgraph_core::{ContactRecord, Profile};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::ImportSummary;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write the brief, delta and parquet snapshots of one import into
/// `reports_dir`, plus a `manifest.json` listing every file with its digest.
pub async fn write_import_reports(
    reports_dir: &Path,
    summary: &ImportSummary,
    records: &[ContactRecord],
    profiles: &[Profile],
) -> Result<ReportManifest> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let brief_path = reports_dir.join("import_brief.md");
    fs::write(&brief_path, import_brief(summary, profiles))
        .await
        .context("writing import_brief.md")?;

    let delta_path = reports_dir.join("import_delta.json");
    let delta = serde_json::to_vec_pretty(&serde_json::json!({
        "summary": summary,
        "records": records,
        "collisions": summary.collisions,
    }))
    .context("serializing import delta")?;
    fs::write(&delta_path, delta)
        .await
        .context("writing import_delta.json")?;

    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;
    let profiles_path = snapshot_dir.join("profiles.parquet");
    let tags_path = snapshot_dir.join("tags.parquet");
    write_profiles_parquet(&profiles_path, profiles)?;
    write_tags_parquet(&tags_path, profiles)?;

    let manifest = ReportManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("import_brief", reports_dir, &brief_path)?,
            manifest_entry("import_delta", reports_dir, &delta_path)?,
            manifest_entry("profiles", reports_dir, &profiles_path)?,
            manifest_entry("tags", reports_dir, &tags_path)?,
        ],
    };
    let manifest_path = reports_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest)
}

fn import_brief(summary: &ImportSummary, profiles: &[Profile]) -> String {
    let mut companies: BTreeMap<&str, usize> = BTreeMap::new();
    for profile in profiles {
        if let Some(company) = profile.company.as_deref() {
            *companies.entry(company).or_default() += 1;
        }
    }
    let mut top = companies.into_iter().collect::<Vec<_>>();
    top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let collisions = if summary.collisions.is_empty() {
        "- none".to_string()
    } else {
        summary
            .collisions
            .iter()
            .map(|c| format!("- {} / {} ({:.3})", c.name_a, c.name_b, c.similarity))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "# Contact Import Brief\n\n- Run ID: `{}`\n- User: `{}`\n- Started: {}\n- Finished: {}\n- Files parsed: {}\n- Skipped lines: {}\n- Contacts resolved: {}\n- Rejected (validation): {}\n- Profiles persisted: {}\n- Persistence failures: {}\n- Connections upserted: {}\n\n## Top Companies\n{}\n\n## Possible Duplicate Names\n{}\n",
        summary.run_id,
        summary.user_id,
        summary.started_at,
        summary.finished_at,
        summary.files_parsed,
        summary.skipped_lines,
        summary.contacts_resolved,
        summary.validation_failures,
        summary.profiles_persisted,
        summary.persistence_failures,
        summary.connections_upserted,
        top.iter()
            .take(10)
            .map(|(company, count)| format!("- {company}: {count}"))
            .collect::<Vec<_>>()
            .join("\n"),
        collisions,
    )
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_profiles_parquet(path: &Path, profiles: &[Profile]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("profile_id", DataType::Utf8, false),
        ArrowField::new("full_name", DataType::Utf8, false),
        ArrowField::new("profile_url", DataType::Utf8, false),
        ArrowField::new("email", DataType::Utf8, true),
        ArrowField::new("company", DataType::Utf8, true),
        ArrowField::new("title", DataType::Utf8, true),
        ArrowField::new("role_level", DataType::Utf8, true),
        ArrowField::new("industry", DataType::Utf8, true),
        ArrowField::new("founded_year", DataType::Int32, true),
        ArrowField::new("enriched", DataType::Boolean, false),
    ]));

    let ids = StringArray::from(
        profiles
            .iter()
            .map(|p| Some(p.id.to_string()))
            .collect::<Vec<_>>(),
    );
    let names = StringArray::from(
        profiles
            .iter()
            .map(|p| Some(p.full_name.as_str()))
            .collect::<Vec<_>>(),
    );
    let urls = StringArray::from(
        profiles
            .iter()
            .map(|p| Some(p.profile_url.as_str()))
            .collect::<Vec<_>>(),
    );
    let emails = StringArray::from(profiles.iter().map(|p| p.email.as_deref()).collect::<Vec<_>>());
    let companies = StringArray::from(profiles.iter().map(|p| p.company.as_deref()).collect::<Vec<_>>());
    let titles = StringArray::from(profiles.iter().map(|p| p.title.as_deref()).collect::<Vec<_>>());
    let role_levels = StringArray::from(
        profiles
            .iter()
            .map(|p| p.role_level.map(|r| r.as_str()))
            .collect::<Vec<_>>(),
    );
    let industries = StringArray::from(profiles.iter().map(|p| p.industry.as_deref()).collect::<Vec<_>>());
    let founded = Int32Array::from(profiles.iter().map(|p| p.founded_year).collect::<Vec<_>>());
    let enriched = BooleanArray::from(profiles.iter().map(|p| p.is_enriched()).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(names),
            Arc::new(urls),
            Arc::new(emails),
            Arc::new(companies),
            Arc::new(titles),
            Arc::new(role_levels),
            Arc::new(industries),
            Arc::new(founded),
            Arc::new(enriched),
        ],
    )
    .context("building profiles record batch")?;
    write_parquet(path, batch)
}

fn write_tags_parquet(path: &Path, profiles: &[Profile]) -> Result<()> {
    let rows = profiles
        .iter()
        .flat_map(|p| p.tags.iter().map(move |tag| (p.id.to_string(), tag.as_str())))
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("profile_id", DataType::Utf8, false),
        ArrowField::new("tag", DataType::Utf8, false),
    ]));
    let ids = StringArray::from(rows.iter().map(|(id, _)| Some(id.as_str())).collect::<Vec<_>>());
    let tags = StringArray::from(rows.iter().map(|(_, t)| Some(*t)).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(schema, vec![Arc::new(ids), Arc::new(tags)])
        .context("building tags record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ReportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ReportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
