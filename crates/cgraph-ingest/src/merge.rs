//! Identity resolution across the files of one export.
//!
//! Rows are keyed by derived full name. Scalar fields keep the first non-empty
//! value; list fields are unioned. Files are folded in [`FileKind::MERGE_ORDER`]
//! (then by file name), never in arrival order.

use std::collections::BTreeMap;

use cgraph_core::{ContactRecord, InvitationDirection, NormalizedDate, SourceTag};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tracing::{debug, info};

use crate::dates::normalize_optional;
use crate::{row_value, FileKind, ParsedFile, RawRow};

pub const NAME_COLLISION_THRESHOLD: f64 = 0.95;

/// The account holder whose own rows must never become contacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerIdentity {
    full_name: String,
}

impl OwnerIdentity {
    pub fn new(full_name: &str) -> Option<Self> {
        let normalized = normalize_name(full_name);
        if normalized.is_empty() {
            None
        } else {
            Some(Self {
                full_name: normalized,
            })
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        normalize_name(name) == self.full_name
    }
}

fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub files_merged: usize,
    pub rows_seen: usize,
    pub rows_admitted: usize,
    pub rows_without_name: usize,
    pub owner_rows_skipped: usize,
    pub rows_unattributable: usize,
}

/// Two distinct keys similar enough that they may describe one person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameCollisionCandidate {
    pub name_a: String,
    pub name_b: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub records: Vec<ContactRecord>,
    pub stats: MergeStats,
    pub collisions: Vec<NameCollisionCandidate>,
}

pub struct IdentityResolver {
    owner: Option<OwnerIdentity>,
    records: BTreeMap<String, ContactRecord>,
    stats: MergeStats,
}

impl IdentityResolver {
    pub fn new(owner: Option<OwnerIdentity>) -> Self {
        Self {
            owner,
            records: BTreeMap::new(),
            stats: MergeStats::default(),
        }
    }

    /// Merge a whole export in the fixed kind order.
    pub fn resolve(owner: Option<OwnerIdentity>, files: &[ParsedFile]) -> MergeOutcome {
        let mut ordered = files.iter().collect::<Vec<_>>();
        ordered.sort_by(|a, b| {
            a.kind
                .merge_priority()
                .cmp(&b.kind.merge_priority())
                .then_with(|| a.file_name.cmp(&b.file_name))
        });
        let mut resolver = Self::new(owner);
        for file in ordered {
            resolver.merge_file(file);
        }
        resolver.finish()
    }

    pub fn merge_file(&mut self, file: &ParsedFile) {
        debug!(file = %file.file_name, kind = file.kind.as_str(), rows = file.rows.len(), "merging file");
        self.stats.files_merged += 1;
        for row in &file.rows {
            self.stats.rows_seen += 1;
            let extracted = match file.kind {
                FileKind::Connections => extract_connection(row),
                FileKind::Contacts => extract_contact(row),
                FileKind::PhoneNumbers => extract_number(row, false),
                FileKind::WhatsappNumbers => extract_number(row, true),
                FileKind::Invitations => self.extract_invitation(row),
                FileKind::Messages => self.extract_message(row),
                FileKind::Unknown => None,
            };
            let Some(record) = extracted else {
                self.stats.rows_unattributable += 1;
                continue;
            };
            self.admit(record);
        }
    }

    pub fn finish(self) -> MergeOutcome {
        let mut records = self.records.into_values().collect::<Vec<_>>();
        for record in &mut records {
            if let Some(primary) = record.email.clone() {
                record
                    .additional_emails
                    .retain(|e| !e.eq_ignore_ascii_case(&primary));
            }
        }
        let collisions = find_name_collisions(&records);
        info!(
            records = records.len(),
            rows_seen = self.stats.rows_seen,
            collisions = collisions.len(),
            "identity resolution complete"
        );
        MergeOutcome {
            records,
            stats: self.stats,
            collisions,
        }
    }

    fn admit(&mut self, incoming: ContactRecord) {
        let key = incoming.full_name();
        if key.is_empty() {
            self.stats.rows_without_name += 1;
            return;
        }
        if self.owner.as_ref().is_some_and(|o| o.matches(&key)) {
            self.stats.owner_rows_skipped += 1;
            return;
        }
        self.stats.rows_admitted += 1;
        match self.records.get_mut(&key) {
            Some(existing) => merge_into(existing, incoming),
            None => {
                self.records.insert(key, incoming);
            }
        }
    }

    fn is_owner(&self, name: &str) -> bool {
        self.owner.as_ref().is_some_and(|o| o.matches(name))
    }

    fn extract_invitation(&self, row: &RawRow) -> Option<ContactRecord> {
        let from = row_value(row, &["From"]);
        let to = row_value(row, &["To"]);
        let direction = row_value(row, &["Direction"])
            .and_then(|d| InvitationDirection::parse(&d))
            .or_else(|| {
                if from.as_deref().is_some_and(|f| self.is_owner(f)) {
                    Some(InvitationDirection::Outgoing)
                } else if to.as_deref().is_some_and(|t| self.is_owner(t)) {
                    Some(InvitationDirection::Incoming)
                } else {
                    None
                }
            })?;

        let (name, url) = match direction {
            InvitationDirection::Outgoing => (
                to?,
                row_value(row, &["inviteeProfileUrl", "Invitee Profile URL", "To URL"]),
            ),
            InvitationDirection::Incoming => (
                from?,
                row_value(row, &["inviterProfileUrl", "Inviter Profile URL", "From URL"]),
            ),
        };
        let mut record = record_from_full_name(&name);
        record.profile_url = url;
        record.invitation_status = Some(direction);
        record.invitation_sent_at = normalize_optional(row_value(row, &["Sent At", "SentAt"]).as_deref());
        record.invitation_message = row_value(row, &["Message"]);
        record.sources.insert(SourceTag::Invitation);
        Some(record)
    }

    fn extract_message(&self, row: &RawRow) -> Option<ContactRecord> {
        let from = row_value(row, &["FROM"]);
        let (name, url) = match from {
            Some(sender) if self.is_owner(&sender) => {
                let recipient = row_value(row, &["TO"])?;
                let first_recipient = first_list_item(&recipient)?;
                let url = row_value(row, &["RECIPIENT PROFILE URLS", "Recipient Profile URL"])
                    .and_then(|u| first_list_item(&u));
                (first_recipient, url)
            }
            Some(sender) => (sender, row_value(row, &["SENDER PROFILE URL"])),
            None => return None,
        };
        let mut record = record_from_full_name(&name);
        record.profile_url = url;
        record.last_message_at = normalize_optional(row_value(row, &["DATE"]).as_deref());
        record.last_message = row_value(row, &["CONTENT"]);
        record.sources.insert(SourceTag::Message);
        Some(record)
    }
}

fn extract_connection(row: &RawRow) -> Option<ContactRecord> {
    let mut record = record_from_name_columns(row)?;
    record.profile_url = row_value(row, &["URL", "Profile URL"]);
    record.email = row_value(row, &["Email Address", "Email"]);
    record.company = row_value(row, &["Company"]);
    record.position = row_value(row, &["Position", "Title"]);
    record.connected_on = normalize_optional(row_value(row, &["Connected On"]).as_deref());
    record.sources.insert(SourceTag::Connection);
    Some(record)
}

fn extract_contact(row: &RawRow) -> Option<ContactRecord> {
    let mut record = record_from_name_columns(row)?;
    record.profile_url = row_value(row, &["Profiles", "Profile URL", "URL"])
        .and_then(|u| first_list_item(&u));
    if let Some(emails) = row_value(row, &["Emails", "Email Address", "Email"]) {
        record.additional_emails = split_list(&emails);
    }
    if let Some(phones) = row_value(row, &["PhoneNumbers", "Phone Numbers"]) {
        record.phone_numbers = split_list(&phones);
    }
    record.company = row_value(row, &["Companies", "Company"]).and_then(|c| first_list_item(&c));
    record.position = row_value(row, &["Title", "Position"]);
    record.sources.insert(SourceTag::Contact);
    Some(record)
}

fn extract_number(row: &RawRow, whatsapp: bool) -> Option<ContactRecord> {
    let mut record = record_from_name_columns(row)?;
    let numbers = row_value(row, &["Number", "Phone Number", "PhoneNumber", "WhatsApp Number"])
        .map(|n| split_list(&n))
        .unwrap_or_default();
    if whatsapp {
        record.whatsapp_numbers = numbers;
    } else {
        record.phone_numbers = numbers;
    }
    Some(record)
}

fn record_from_name_columns(row: &RawRow) -> Option<ContactRecord> {
    let first = row_value(row, &["First Name", "FirstName"]).unwrap_or_default();
    let last = row_value(row, &["Last Name", "LastName"]).unwrap_or_default();
    if !first.is_empty() || !last.is_empty() {
        return Some(ContactRecord::new(first, last));
    }
    row_value(row, &["Full Name", "FullName", "Name"]).map(|n| record_from_full_name(&n))
}

fn record_from_full_name(name: &str) -> ContactRecord {
    let mut parts = name.split_whitespace();
    let first = parts.next().unwrap_or_default().to_string();
    let last = parts.collect::<Vec<_>>().join(" ");
    ContactRecord::new(first, last)
}

fn split_list(value: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in value.split([',', ';']).map(str::trim).filter(|s| !s.is_empty()) {
        if !out.iter().any(|x| x == item) {
            out.push(item.to_string());
        }
    }
    out
}

fn first_list_item(value: &str) -> Option<String> {
    split_list(value).into_iter().next()
}

fn fill(slot: &mut Option<String>, incoming: Option<String>) {
    if slot.as_deref().map_or(true, str::is_empty) {
        if let Some(value) = incoming.filter(|v| !v.is_empty()) {
            *slot = Some(value);
        }
    }
}

fn fill_date(slot: &mut Option<NormalizedDate>, incoming: Option<NormalizedDate>) {
    if slot.is_none() {
        *slot = incoming;
    }
}

fn union(target: &mut Vec<String>, incoming: Vec<String>) {
    for item in incoming {
        if !target.iter().any(|x| x.eq_ignore_ascii_case(&item)) {
            target.push(item);
        }
    }
}

fn merge_into(existing: &mut ContactRecord, incoming: ContactRecord) {
    fill(&mut existing.profile_url, incoming.profile_url);

    // A losing primary email is kept as an additional one.
    if let Some(other) = incoming.email.filter(|e| !e.is_empty()) {
        let duplicate = existing
            .email
            .as_deref()
            .is_some_and(|current| current.eq_ignore_ascii_case(&other));
        if existing.email.is_none() {
            existing.email = Some(other);
        } else if !duplicate {
            union(&mut existing.additional_emails, vec![other]);
        }
    }
    union(&mut existing.additional_emails, incoming.additional_emails);
    union(&mut existing.phone_numbers, incoming.phone_numbers);
    union(&mut existing.whatsapp_numbers, incoming.whatsapp_numbers);

    fill(&mut existing.company, incoming.company);
    fill(&mut existing.position, incoming.position);
    fill_date(&mut existing.connected_on, incoming.connected_on);

    if existing.invitation_status.is_none() {
        existing.invitation_status = incoming.invitation_status;
    }
    fill_date(&mut existing.invitation_sent_at, incoming.invitation_sent_at);
    fill(&mut existing.invitation_message, incoming.invitation_message);

    if newer_message(
        existing.last_message_at.as_ref(),
        existing.last_message.as_deref(),
        incoming.last_message_at.as_ref(),
        incoming.last_message.as_deref(),
    ) {
        existing.last_message_at = incoming.last_message_at;
        existing.last_message = incoming.last_message;
    }

    existing.sources.extend(incoming.sources);
}

/// Most recent genuinely-dated message wins; ties go to the greater content
/// so the outcome does not depend on row order.
fn newer_message(
    current_at: Option<&NormalizedDate>,
    current_body: Option<&str>,
    incoming_at: Option<&NormalizedDate>,
    incoming_body: Option<&str>,
) -> bool {
    let Some(incoming_at) = incoming_at else {
        return current_at.is_none() && current_body.is_none() && incoming_body.is_some();
    };
    let Some(current_at) = current_at else {
        return true;
    };
    match (current_at.parsed, incoming_at.parsed) {
        (false, true) => true,
        (true, false) => false,
        _ => match incoming_at.instant.cmp(&current_at.instant) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => incoming_body > current_body,
        },
    }
}

fn find_name_collisions(records: &[ContactRecord]) -> Vec<NameCollisionCandidate> {
    let names = records
        .iter()
        .map(|r| (r.full_name(), r.full_name().to_lowercase()))
        .collect::<Vec<_>>();
    let mut out = Vec::new();
    for i in 0..names.len() {
        for j in (i + 1)..names.len() {
            let similarity = jaro_winkler(&names[i].1, &names[j].1);
            if similarity >= NAME_COLLISION_THRESHOLD {
                out.push(NameCollisionCandidate {
                    name_a: names[i].0.clone(),
                    name_b: names[j].0.clone(),
                    similarity,
                });
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_file;

    const CONNECTIONS: &str = "First Name,Last Name,URL,Email Address,Company,Position,Connected On\n\
Jane,Doe,https://www.linkedin.com/in/janedoe,jane@example.com,Acme,Software Engineer,15 Mar 2023\n\
Owner,Person,https://www.linkedin.com/in/owner,,Self,CEO,1 Jan 2020\n\
,,https://www.linkedin.com/in/ghost,,Nowhere,,\n";

    const CONTACTS: &str = "Source,FirstName,LastName,Companies,Title,Emails,PhoneNumbers\n\
Google,Jane,Doe,Other Co,Staff Engineer,\"jane.doe@gmail.com,jane@example.com\",+1 555 0100\n\
Google,Bob,Stone,Initech,Manager,bob@initech.com,\n";

    const INVITATIONS: &str = "From,To,Sent At,Message,Direction,inviterProfileUrl,inviteeProfileUrl\n\
Owner Person,Carol King,\"10/15/23, 3:45 PM\",Hi Carol,OUTGOING,https://www.linkedin.com/in/owner,https://www.linkedin.com/in/carolking\n\
Dan Brown,Owner Person,\"11/02/23, 9:00 AM\",,INCOMING,https://www.linkedin.com/in/danbrown,https://www.linkedin.com/in/owner\n";

    const MESSAGES: &str = "CONVERSATION ID,FROM,SENDER PROFILE URL,TO,RECIPIENT PROFILE URLS,DATE,CONTENT\n\
c1,Jane Doe,https://www.linkedin.com/in/janedoe,Owner Person,https://www.linkedin.com/in/owner,2023-10-01 10:00:00 UTC,older\n\
c1,Owner Person,https://www.linkedin.com/in/owner,Jane Doe,https://www.linkedin.com/in/janedoe,2023-10-02 10:00:00 UTC,newer\n";

    const PHONES: &str = "First Name,Last Name,Number\nBob,Stone,+1 555 0199\n,,+1 555 0000\n";

    fn files() -> Vec<ParsedFile> {
        vec![
            parse_file("Connections.csv", CONNECTIONS),
            parse_file("Contacts.csv", CONTACTS),
            parse_file("Invitations.csv", INVITATIONS),
            parse_file("messages.csv", MESSAGES),
            parse_file("PhoneNumbers.csv", PHONES),
        ]
    }

    fn owner() -> Option<OwnerIdentity> {
        OwnerIdentity::new("Owner  Person")
    }

    fn find<'a>(outcome: &'a MergeOutcome, name: &str) -> &'a ContactRecord {
        outcome
            .records
            .iter()
            .find(|r| r.full_name() == name)
            .unwrap_or_else(|| panic!("{name} missing"))
    }

    #[test]
    fn records_merge_across_files_by_full_name() {
        let outcome = IdentityResolver::resolve(owner(), &files());
        let jane = find(&outcome, "Jane Doe");
        assert_eq!(jane.company.as_deref(), Some("Acme"));
        assert_eq!(jane.position.as_deref(), Some("Software Engineer"));
        assert_eq!(jane.email.as_deref(), Some("jane@example.com"));
        assert_eq!(jane.additional_emails, vec!["jane.doe@gmail.com".to_string()]);
        assert_eq!(jane.phone_numbers, vec!["+1 555 0100".to_string()]);
        assert!(jane.sources.contains(&SourceTag::Connection));
        assert!(jane.sources.contains(&SourceTag::Contact));
        assert!(jane.sources.contains(&SourceTag::Message));
        assert_eq!(jane.last_message.as_deref(), Some("newer"));
    }

    #[test]
    fn owner_is_excluded_from_output() {
        let outcome = IdentityResolver::resolve(owner(), &files());
        assert!(outcome.records.iter().all(|r| r.full_name() != "Owner Person"));
        assert!(outcome.stats.owner_rows_skipped >= 1);
    }

    #[test]
    fn nameless_rows_are_not_admitted() {
        let outcome = IdentityResolver::resolve(owner(), &files());
        assert_eq!(outcome.stats.rows_without_name + outcome.stats.rows_unattributable, 2);
        assert!(outcome.records.iter().all(|r| !r.full_name().is_empty()));
    }

    #[test]
    fn only_nameless_rows_yield_no_records() {
        let parsed = parse_file(
            "Connections.csv",
            "First Name,Last Name,URL\n,,https://a\n , ,https://b\n",
        );
        let outcome = IdentityResolver::resolve(None, &[parsed]);
        assert!(outcome.records.is_empty());
    }

    #[test]
    fn invitation_direction_selects_counterparty() {
        let outcome = IdentityResolver::resolve(owner(), &files());
        let carol = find(&outcome, "Carol King");
        assert_eq!(carol.invitation_status, Some(InvitationDirection::Outgoing));
        assert_eq!(carol.profile_url.as_deref(), Some("https://www.linkedin.com/in/carolking"));
        assert_eq!(carol.invitation_message.as_deref(), Some("Hi Carol"));
        assert!(carol.invitation_sent_at.unwrap().parsed);

        let dan = find(&outcome, "Dan Brown");
        assert_eq!(dan.invitation_status, Some(InvitationDirection::Incoming));
        assert_eq!(dan.profile_url.as_deref(), Some("https://www.linkedin.com/in/danbrown"));
    }

    #[test]
    fn phone_rows_union_numbers() {
        let outcome = IdentityResolver::resolve(owner(), &files());
        let bob = find(&outcome, "Bob Stone");
        assert_eq!(bob.phone_numbers, vec!["+1 555 0199".to_string()]);
        assert_eq!(bob.additional_emails, vec!["bob@initech.com".to_string()]);
    }

    #[test]
    fn file_order_does_not_change_output() {
        let forward = IdentityResolver::resolve(owner(), &files());
        let mut reversed_files = files();
        reversed_files.reverse();
        let reversed = IdentityResolver::resolve(owner(), &reversed_files);
        assert_eq!(forward.records, reversed.records);
    }

    #[test]
    fn similar_names_are_reported_not_merged() {
        let parsed = parse_file(
            "Connections.csv",
            "First Name,Last Name,URL\nJonathan,Smith,https://a\nJonathon,Smith,https://b\n",
        );
        let outcome = IdentityResolver::resolve(None, &[parsed]);
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.collisions.len(), 1);
        assert!(outcome.collisions[0].similarity >= NAME_COLLISION_THRESHOLD);
    }
}
