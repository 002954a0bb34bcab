//! Content fingerprints used to match the same logical item under different GUIDs.
//!
//! Two devices that create the same bookmark before they ever synchronize end
//! up with two GUIDs for one item. A fingerprint is the concatenation of a
//! configurable list of payload fields; a store that finds no local record by
//! GUID falls back to a fingerprint lookup.

use serde::{Deserialize, Serialize};

use crate::record::{Collection, Payload, Record};

/// Separator between fingerprint fields. Cannot occur in URIs or titles typed by users.
const FIELD_SEPARATOR: char = '\u{1f}';

/// A payload field that can take part in a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintField {
    /// Bookmark or history title.
    Title,
    /// Bookmark or history URI.
    Uri,
    /// Bookmark kind.
    Type,
    /// Title of the containing bookmark folder.
    ParentName,
    /// Form field name.
    FieldName,
    /// Form field value.
    Value,
    /// Login origin.
    Hostname,
    /// Login form action origin.
    FormSubmitUrl,
    /// Login username field name.
    UsernameField,
    /// Login password field name.
    PasswordField,
    /// Login username.
    Username,
}

impl FingerprintField {
    fn extract<'a>(&self, payload: &'a Payload) -> Option<&'a str> {
        match (self, payload) {
            (Self::Title, Payload::Bookmark(b)) => Some(&b.title),
            (Self::Uri, Payload::Bookmark(b)) => Some(b.uri.as_deref().unwrap_or("")),
            (Self::Type, Payload::Bookmark(b)) => Some(b.kind.as_str()),
            (Self::ParentName, Payload::Bookmark(b)) => Some(&b.parent_name),
            (Self::Title, Payload::History(h)) => Some(&h.title),
            (Self::Uri, Payload::History(h)) => Some(&h.uri),
            (Self::FieldName, Payload::FormHistory(f)) => Some(&f.field_name),
            (Self::Value, Payload::FormHistory(f)) => Some(&f.value),
            (Self::Hostname, Payload::Password(p)) => Some(&p.hostname),
            (Self::FormSubmitUrl, Payload::Password(p)) => Some(&p.form_submit_url),
            (Self::UsernameField, Payload::Password(p)) => Some(&p.username_field),
            (Self::PasswordField, Payload::Password(p)) => Some(&p.password_field),
            (Self::Username, Payload::Password(p)) => Some(&p.username),
            _ => None,
        }
    }
}

/// Ordered list of fields forming a collection's fingerprint.
///
/// An empty list disables fingerprint matching (GUID-only).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FingerprintSpec {
    fields: Vec<FingerprintField>,
}

impl FingerprintSpec {
    /// Create a spec from an explicit field list.
    pub fn new(fields: Vec<FingerprintField>) -> Self {
        Self { fields }
    }

    /// Default fields for a collection.
    pub fn for_collection(collection: Collection) -> Self {
        use FingerprintField::*;
        let fields = match collection {
            Collection::Bookmarks => vec![Title, Uri, Type, ParentName],
            Collection::History => vec![Title, Uri],
            Collection::Forms => vec![FieldName, Value],
            Collection::Passwords => vec![
                Hostname,
                FormSubmitUrl,
                UsernameField,
                PasswordField,
                Username,
            ],
            Collection::Tabs | Collection::Clients => Vec::new(),
        };
        Self { fields }
    }

    /// The configured fields.
    pub fn fields(&self) -> &[FingerprintField] {
        &self.fields
    }

    /// True if matching is GUID-only.
    pub fn is_disabled(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fingerprint of a record, or `None` for tombstones, disabled specs and
    /// payloads that lack one of the fields.
    pub fn fingerprint(&self, record: &Record) -> Option<String> {
        if record.deleted || self.fields.is_empty() {
            return None;
        }
        let mut out = String::new();
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                out.push(FIELD_SEPARATOR);
            }
            out.push_str(field.extract(&record.payload)?);
        }
        Some(out)
    }
}
