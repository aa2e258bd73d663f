//! Export unpacking, format detection and tabular parsing for contact archives.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub mod dates;
pub mod merge;
pub mod profile;

pub use dates::{normalize_date, normalize_date_with_now};
pub use merge::{IdentityResolver, MergeOutcome, MergeStats, NameCollisionCandidate, OwnerIdentity};
pub use profile::{contact_to_connection, contact_to_profile, derive_tags, primary_email};

pub const CRATE_NAME: &str = "cgraph-ingest";

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// One parsed data line keyed by the header vocabulary of its file.
pub type RawRow = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Connections,
    Contacts,
    PhoneNumbers,
    WhatsappNumbers,
    Invitations,
    Messages,
    Unknown,
}

impl FileKind {
    /// Fixed order in which parsed files are folded into the resolver.
    pub const MERGE_ORDER: [FileKind; 7] = [
        FileKind::Connections,
        FileKind::Contacts,
        FileKind::Invitations,
        FileKind::Messages,
        FileKind::PhoneNumbers,
        FileKind::WhatsappNumbers,
        FileKind::Unknown,
    ];

    pub fn merge_priority(&self) -> usize {
        Self::MERGE_ORDER
            .iter()
            .position(|k| k == self)
            .unwrap_or(Self::MERGE_ORDER.len())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connections => "connections",
            Self::Contacts => "contacts",
            Self::PhoneNumbers => "phone_numbers",
            Self::WhatsappNumbers => "whatsapp_numbers",
            Self::Invitations => "invitations",
            Self::Messages => "messages",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("reading export: {0}")]
    Io(#[from] std::io::Error),
    #[error("reading archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("export {0} contains no files")]
    Empty(String),
}

/// Raw text of one file inside an export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportFile {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedFile {
    pub file_name: String,
    pub kind: FileKind,
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
    pub skipped_lines: usize,
}

/// Read an export from disk: either an archive or a single delimited file.
pub fn load_export(path: impl AsRef<Path>) -> Result<Vec<ExportFile>> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    export_files_from_bytes(&name, &bytes).with_context(|| format!("unpacking {}", path.display()))
}

pub fn export_files_from_bytes(name: &str, bytes: &[u8]) -> Result<Vec<ExportFile>, IngestError> {
    if bytes.starts_with(ZIP_MAGIC) {
        return unwrap_archive(name, bytes);
    }
    Ok(vec![ExportFile {
        name: name.to_string(),
        content: String::from_utf8_lossy(bytes).into_owned(),
    }])
}

fn unwrap_archive(name: &str, bytes: &[u8]) -> Result<Vec<ExportFile>, IngestError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let mut files = Vec::new();
    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(archive = name, index, error = %err, "skipping unreadable archive entry");
                continue;
            }
        };
        if entry.is_dir() {
            continue;
        }
        let entry_name = entry.name().to_string();
        let mut raw = Vec::new();
        if let Err(err) = entry.read_to_end(&mut raw) {
            warn!(archive = name, entry = %entry_name, error = %err, "skipping unreadable archive entry");
            continue;
        }
        files.push(ExportFile {
            name: entry_name,
            content: String::from_utf8_lossy(&raw).into_owned(),
        });
    }
    if files.is_empty() {
        return Err(IngestError::Empty(name.to_string()));
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

/// Parse every file of an export. Files whose kind cannot be determined are
/// dropped; a missing connections file is logged but not fatal.
pub fn parse_export(files: &[ExportFile]) -> Vec<ParsedFile> {
    let parsed = files
        .iter()
        .map(|file| parse_file(&file.name, &file.content))
        .filter(|parsed| {
            if parsed.kind == FileKind::Unknown {
                debug!(file = %parsed.file_name, "no tabular header found; skipping file");
                return false;
            }
            true
        })
        .collect::<Vec<_>>();
    if files.len() > 1 && !parsed.iter().any(|p| p.kind == FileKind::Connections) {
        warn!("export has no connections file; merging remaining files only");
    }
    parsed
}

/// Locate the header, split data lines and classify the file.
pub fn parse_file(file_name: &str, content: &str) -> ParsedFile {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let mut headers: Option<Vec<String>> = None;
    let mut preamble: Vec<Vec<String>> = Vec::new();
    let mut rows = Vec::new();
    let mut skipped_lines = 0usize;

    for (index, record) in reader.records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    file = file_name,
                    record = index + 1,
                    line = error_line(&err),
                    error = %err,
                    "skipping malformed line"
                );
                skipped_lines += 1;
                continue;
            }
        };
        let values = record.iter().map(clean_value).collect::<Vec<_>>();
        if values.iter().all(|v| v.is_empty()) {
            continue;
        }

        if headers.is_none() {
            if is_header_line(&values) {
                headers = Some(values);
            } else {
                preamble.push(values);
            }
            continue;
        }
        let Some(header) = headers.as_ref() else {
            continue;
        };

        if values.len() < header.len() {
            debug!(
                file = file_name,
                line = index + 1,
                expected = header.len(),
                found = values.len(),
                "short line; mapping overlapping prefix"
            );
        }
        let row = header
            .iter()
            .zip(values)
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, value)| (name.clone(), value))
            .collect::<RawRow>();
        rows.push(row);
    }

    // No recognizable header: fall back to the first multi-column line.
    if headers.is_none() {
        if let Some(position) = preamble.iter().position(|v| non_empty_count(v) >= 2) {
            let mut remaining = preamble.split_off(position).into_iter();
            let header = remaining.next().unwrap_or_default();
            for values in remaining {
                rows.push(
                    header
                        .iter()
                        .zip(values)
                        .filter(|(name, _)| !name.is_empty())
                        .map(|(name, value)| (name.clone(), value))
                        .collect(),
                );
            }
            headers = Some(header);
        }
    }

    let headers = headers.unwrap_or_default();
    let kind = if headers.is_empty() {
        FileKind::Unknown
    } else {
        detect_file_kind(file_name, &headers)
    };

    ParsedFile {
        file_name: file_name.to_string(),
        kind,
        headers,
        rows,
        skipped_lines,
    }
}

/// Filename hints win over header hints; anything undetermined is treated as
/// the primary connections list.
pub fn detect_file_kind(file_name: &str, headers: &[String]) -> FileKind {
    kind_from_file_name(file_name)
        .or_else(|| kind_from_headers(headers))
        .unwrap_or(FileKind::Connections)
}

fn kind_from_file_name(file_name: &str) -> Option<FileKind> {
    let base = Path::new(file_name)
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if base.contains("whatsapp") {
        Some(FileKind::WhatsappNumbers)
    } else if base.contains("phone") {
        Some(FileKind::PhoneNumbers)
    } else if base.contains("invitation") {
        Some(FileKind::Invitations)
    } else if base.contains("message") {
        Some(FileKind::Messages)
    } else if base.contains("connection") {
        Some(FileKind::Connections)
    } else if base.contains("contact") {
        Some(FileKind::Contacts)
    } else {
        None
    }
}

fn kind_from_headers(headers: &[String]) -> Option<FileKind> {
    let tokens = headers.iter().map(|h| header_token(h)).collect::<Vec<_>>();
    let has = |t: &str| tokens.iter().any(|x| x == t);

    if has("direction") || (has("from") && has("to") && has("sentat")) {
        Some(FileKind::Invitations)
    } else if has("conversationid") || (has("from") && has("content")) {
        Some(FileKind::Messages)
    } else if tokens.iter().any(|t| t.contains("whatsapp")) {
        Some(FileKind::WhatsappNumbers)
    } else if (has("number") || has("phonenumber")) && !has("connectedon") {
        Some(FileKind::PhoneNumbers)
    } else if has("emails") || has("phonenumbers") || has("companies") {
        Some(FileKind::Contacts)
    } else if has("connectedon") {
        Some(FileKind::Connections)
    } else {
        None
    }
}

const HEADER_TOKENS: &[&str] = &[
    "firstname",
    "lastname",
    "fullname",
    "name",
    "url",
    "profileurl",
    "emailaddress",
    "emails",
    "company",
    "companies",
    "position",
    "title",
    "connectedon",
    "from",
    "to",
    "sentat",
    "direction",
    "message",
    "conversationid",
    "content",
    "date",
    "number",
    "phonenumber",
    "phonenumbers",
];

fn is_header_line(values: &[String]) -> bool {
    non_empty_count(values) >= 2
        && values
            .iter()
            .any(|v| HEADER_TOKENS.contains(&header_token(v).as_str()))
}

fn non_empty_count(values: &[String]) -> usize {
    values.iter().filter(|v| !v.is_empty()).count()
}

/// Case- and punctuation-insensitive header form: `"Connected On"` -> `connectedon`.
pub fn header_token(header: &str) -> String {
    header
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn clean_value(value: &str) -> String {
    value
        .trim_start_matches('\u{feff}')
        .trim()
        .trim_matches('"')
        .trim()
        .to_string()
}

/// Header-alias lookup over a [`RawRow`].
pub fn row_value(row: &RawRow, aliases: &[&str]) -> Option<String> {
    aliases.iter().find_map(|alias| {
        let wanted = header_token(alias);
        row.iter()
            .find(|(name, _)| header_token(name) == wanted)
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    })
}

/// Physical line the failing record starts on, when the reader knows it.
fn error_line(err: &csv::Error) -> Option<u64> {
    err.position().map(csv::Position::line)
}
