//! Mapping merged contact records into persisted profiles and connections.

use chrono::{DateTime, Utc};
use cgraph_core::{render_tag, Connection, ContactRecord, CoreError, Profile};
use uuid::Uuid;

/// Explicit primary email first, then the first additional one.
pub fn primary_email(record: &ContactRecord) -> Option<String> {
    record
        .email
        .clone()
        .filter(|e| !e.is_empty())
        .or_else(|| record.additional_emails.first().cloned())
}

/// Fold auxiliary record data into `kind:value` tags.
pub fn derive_tags(record: &ContactRecord) -> Vec<String> {
    let primary = primary_email(record);
    let mut tags = Vec::new();
    let mut push = |tag: String| {
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    };

    for source in &record.sources {
        push(render_tag("source", source.as_str()));
    }
    for email in &record.additional_emails {
        if primary.as_deref() != Some(email.as_str()) {
            push(render_tag("email", email));
        }
    }
    for phone in &record.phone_numbers {
        push(render_tag("phone", phone));
    }
    for number in &record.whatsapp_numbers {
        push(render_tag("whatsapp", number));
    }
    if let Some(status) = record.invitation_status {
        push(render_tag("invitation", status.as_str()));
    }
    // Fallback ("now") dates are not facts about the contact.
    if let Some(sent_at) = record.invitation_sent_at.filter(|d| d.parsed) {
        push(render_tag("invited_at", sent_at.canonical()));
    }
    if let Some(last) = record.last_message_at.filter(|d| d.parsed) {
        push(render_tag("last_message", last.canonical()));
    }
    tags
}

pub fn contact_to_profile(record: &ContactRecord, created_at: DateTime<Utc>) -> Result<Profile, CoreError> {
    let profile_url = record.profile_url.clone().unwrap_or_default();
    let mut profile = Profile::new(record.full_name(), profile_url, created_at);
    profile.validate()?;
    profile.email = primary_email(record);
    profile.company = record.company.clone();
    profile.title = record.position.clone();
    profile.tags = derive_tags(record);
    Ok(profile)
}

/// Connection row for `record`; a missing or unparsed connected-on date falls
/// back to the import instant.
pub fn contact_to_connection(
    record: &ContactRecord,
    user_id: Uuid,
    profile_id: Uuid,
    imported_at: DateTime<Utc>,
) -> Connection {
    let connected_on = record
        .connected_on
        .filter(|d| d.parsed)
        .map(|d| d.instant)
        .unwrap_or(imported_at);
    Connection {
        user_id,
        profile_id,
        connected_on,
        created_at: imported_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use cgraph_core::{InvitationDirection, NormalizedDate, SourceTag};

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, day, 0, 0, 0).single().unwrap()
    }

    fn record() -> ContactRecord {
        let mut record = ContactRecord::new("Jane", "Doe");
        record.profile_url = Some("https://www.linkedin.com/in/janedoe".into());
        record.additional_emails = vec!["jane@work.com".into(), "jane@home.com".into()];
        record.phone_numbers = vec!["+1 555 0100".into()];
        record.whatsapp_numbers = vec!["+44 7700 900000".into()];
        record.company = Some("Acme".into());
        record.position = Some("Engineer".into());
        record.invitation_status = Some(InvitationDirection::Outgoing);
        record.invitation_sent_at = Some(NormalizedDate::parsed(at(3)));
        record.last_message_at = Some(NormalizedDate::fallback(at(9)));
        record.sources.insert(SourceTag::Contact);
        record.sources.insert(SourceTag::Invitation);
        record
    }

    #[test]
    fn primary_email_prefers_explicit_field() {
        let mut r = record();
        assert_eq!(primary_email(&r).as_deref(), Some("jane@work.com"));
        r.email = Some("jane@primary.com".into());
        assert_eq!(primary_email(&r).as_deref(), Some("jane@primary.com"));
    }

    #[test]
    fn tags_render_auxiliary_data() {
        let tags = derive_tags(&record());
        assert_eq!(
            tags,
            vec![
                "source:contact".to_string(),
                "source:invitation".to_string(),
                "email:jane@home.com".to_string(),
                "phone:+1 555 0100".to_string(),
                "whatsapp:+44 7700 900000".to_string(),
                "invitation:OUTGOING".to_string(),
                "invited_at:2024-02-03T00:00:00Z".to_string(),
            ]
        );
    }

    #[test]
    fn profile_carries_mapped_fields() {
        let profile = contact_to_profile(&record(), at(1)).unwrap();
        assert_eq!(profile.full_name, "Jane Doe");
        assert_eq!(profile.email.as_deref(), Some("jane@work.com"));
        assert_eq!(profile.company.as_deref(), Some("Acme"));
        assert_eq!(profile.title.as_deref(), Some("Engineer"));
        assert_eq!(profile.id, Profile::id_for_url("https://www.linkedin.com/in/janedoe"));
        assert!(profile.enriched_at.is_none());
    }

    #[test]
    fn profile_without_url_is_rejected() {
        let mut r = record();
        r.profile_url = None;
        assert!(matches!(
            contact_to_profile(&r, at(1)),
            Err(CoreError::Validation { .. })
        ));
    }

    #[test]
    fn connection_uses_parsed_date_or_import_instant() {
        let mut r = record();
        let user = Uuid::new_v4();
        let profile = Uuid::new_v4();
        assert_eq!(contact_to_connection(&r, user, profile, at(5)).connected_on, at(5));
        r.connected_on = Some(NormalizedDate::parsed(at(2)));
        assert_eq!(contact_to_connection(&r, user, profile, at(5)).connected_on, at(2));
    }
}
