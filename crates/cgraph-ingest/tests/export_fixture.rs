use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use cgraph_core::{InvitationDirection, SourceTag};
use cgraph_ingest::{
    contact_to_profile, load_export, parse_export, ExportFile, FileKind, IdentityResolver,
    OwnerIdentity,
};
use chrono::Utc;

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/export")
        .canonicalize()
        .expect("fixture dir")
}

fn fixture_files() -> Vec<ExportFile> {
    let mut files = fs::read_dir(fixture_dir())
        .expect("read fixture dir")
        .filter_map(|e| e.ok())
        .map(|e| ExportFile {
            name: e.file_name().to_string_lossy().to_string(),
            content: fs::read_to_string(e.path()).expect("read fixture"),
        })
        .collect::<Vec<_>>();
    files.sort_by(|a, b| a.name.cmp(&b.name));
    files
}

#[test]
fn fixture_export_detects_every_kind() {
    let parsed = parse_export(&fixture_files());
    let mut kinds = parsed.iter().map(|p| p.kind).collect::<Vec<_>>();
    kinds.sort();
    assert_eq!(
        kinds,
        vec![
            FileKind::Connections,
            FileKind::Contacts,
            FileKind::PhoneNumbers,
            FileKind::WhatsappNumbers,
            FileKind::Invitations,
            FileKind::Messages,
        ]
    );
}

#[test]
fn fixture_export_resolves_six_contacts() {
    let parsed = parse_export(&fixture_files());
    let outcome = IdentityResolver::resolve(OwnerIdentity::new("Sam Owner"), &parsed);
    let names = outcome
        .records
        .iter()
        .map(|r| r.full_name())
        .collect::<Vec<_>>();
    assert_eq!(
        names,
        vec![
            "Ada Lovelace",
            "Alan Turing",
            "Barbara Liskov",
            "Grace Hopper",
            "Katherine Johnson",
            "Linus Pauling",
        ]
    );

    let ada = &outcome.records[0];
    assert_eq!(ada.email.as_deref(), Some("ada@analytical.io"));
    assert_eq!(ada.additional_emails, vec!["ada.personal@mail.com".to_string()]);
    assert_eq!(ada.last_message.as_deref(), Some("Likewise!"));
    assert!(ada.sources.contains(&SourceTag::Message));

    let alan = &outcome.records[1];
    assert_eq!(alan.whatsapp_numbers, vec!["+44 7700 900123".to_string()]);
    assert_eq!(alan.company.as_deref(), Some("Bletchley Labs, Ltd."));

    let linus = &outcome.records[5];
    assert_eq!(linus.invitation_status, Some(InvitationDirection::Outgoing));
    assert_eq!(
        linus.profile_url.as_deref(),
        Some("https://www.linkedin.com/in/linuspauling")
    );
    assert_eq!(linus.company.as_deref(), Some("Caltech Bank"));

    let katherine = &outcome.records[4];
    assert!(katherine.connected_on.is_none());

    let now = Utc::now();
    let profiles = outcome
        .records
        .iter()
        .filter_map(|r| contact_to_profile(r, now).ok())
        .collect::<Vec<_>>();
    assert_eq!(profiles.len(), 6);
}

#[test]
fn zipped_export_matches_loose_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let zip_path = dir.path().join("export.zip");
    let file = fs::File::create(&zip_path).expect("create zip");
    let mut writer = zip::ZipWriter::new(file);
    for export_file in fixture_files() {
        writer
            .start_file(
                format!("Basic_Export/{}", export_file.name),
                zip::write::SimpleFileOptions::default(),
            )
            .expect("start file");
        writer
            .write_all(export_file.content.as_bytes())
            .expect("write file");
    }
    writer.finish().expect("finish zip");

    let zipped = load_export(&zip_path).expect("load zip");
    let owner = OwnerIdentity::new("Sam Owner");
    let from_zip = IdentityResolver::resolve(owner.clone(), &parse_export(&zipped));
    let from_dir = IdentityResolver::resolve(owner, &parse_export(&fixture_files()));
    assert_eq!(from_zip.records, from_dir.records);
}

#[test]
fn connections_file_alone_is_accepted() {
    let path = fixture_dir().join("Connections.csv");
    let files = load_export(&path).expect("load single file");
    let parsed = parse_export(&files);
    assert_eq!(parsed.len(), 1);
    let outcome = IdentityResolver::resolve(OwnerIdentity::new("Sam Owner"), &parsed);
    assert_eq!(outcome.records.len(), 4);
}
