//! Records exchanged between replicas and their collection-specific payloads.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Replica-local handle for a stored record (e.g. a row id).
///
/// Never serialized: it has no meaning outside the replica that assigned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// GUID of the root of the bookmark tree.
pub const PLACES_ROOT: &str = "places";
/// GUID of the mobile bookmarks folder.
pub const MOBILE_ROOT: &str = "mobile";
/// GUID of the toolbar folder.
pub const TOOLBAR_ROOT: &str = "toolbar";
/// GUID of the bookmarks menu folder.
pub const MENU_ROOT: &str = "menu";
/// GUID of the unsorted bookmarks folder; orphans are filed here.
pub const UNFILED_ROOT: &str = "unfiled";

/// Well-known folders that exist on every replica. `places` comes first.
pub const SPECIAL_FOLDERS: [&str; 5] =
    [PLACES_ROOT, MOBILE_ROOT, TOOLBAR_ROOT, MENU_ROOT, UNFILED_ROOT];

/// Folder that receives records whose parent never resolved.
pub const FALLBACK_ROOT: &str = UNFILED_ROOT;

/// The synchronized collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    /// Bookmarks and bookmark folders.
    Bookmarks,
    /// Browsing history.
    History,
    /// Saved form field values.
    Forms,
    /// Saved logins.
    Passwords,
    /// Open tabs per device.
    Tabs,
    /// Per-device identity records.
    Clients,
}

impl Collection {
    /// All collections, in a stable order.
    pub const ALL: [Collection; 6] = [
        Collection::Bookmarks,
        Collection::History,
        Collection::Forms,
        Collection::Passwords,
        Collection::Tabs,
        Collection::Clients,
    ];

    /// The collection's storage name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bookmarks => "bookmarks",
            Self::History => "history",
            Self::Forms => "forms",
            Self::Passwords => "passwords",
            Self::Tabs => "tabs",
            Self::Clients => "clients",
        }
    }

    /// Look a collection up by its storage name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }

    /// True if records form a tree and must be admitted parent-first.
    pub fn is_hierarchical(&self) -> bool {
        matches!(self, Self::Bookmarks)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of a bookmark record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookmarkKind {
    /// A plain bookmark.
    #[default]
    Bookmark,
    /// A folder.
    Folder,
    /// A separator line.
    Separator,
    /// A saved query.
    Query,
    /// A live bookmark.
    Livemark,
    /// A microsummary.
    Microsummary,
}

impl BookmarkKind {
    /// Kinds the local store can hold. The rest are acknowledged and skipped.
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Bookmark | Self::Folder)
    }

    /// Lowercase name, as used in fingerprints.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bookmark => "bookmark",
            Self::Folder => "folder",
            Self::Separator => "separator",
            Self::Query => "query",
            Self::Livemark => "livemark",
            Self::Microsummary => "microsummary",
        }
    }
}

/// Bookmark or folder fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BookmarkPayload {
    /// Bookmark kind.
    #[serde(default)]
    pub kind: BookmarkKind,
    /// Display title.
    #[serde(default)]
    pub title: String,
    /// Target URI (bookmarks only).
    #[serde(default)]
    pub uri: Option<String>,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// GUID of the containing folder.
    pub parent_id: String,
    /// Title of the containing folder, used for de-duplication.
    #[serde(default)]
    pub parent_name: String,
    /// Ordered child GUIDs (folders only).
    #[serde(default)]
    pub children: Vec<String>,
    /// Tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Keyword shortcut.
    #[serde(default)]
    pub keyword: Option<String>,
}

/// A single history visit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visit {
    /// Visit time in microseconds.
    pub date: i64,
    /// Transition type.
    pub transition: u32,
}

/// History entry fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HistoryPayload {
    /// Page title.
    #[serde(default)]
    pub title: String,
    /// Page URI.
    pub uri: String,
    /// Known visits, newest first.
    #[serde(default)]
    pub visits: Vec<Visit>,
}

/// Form history fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FormHistoryPayload {
    /// Name of the form field.
    pub field_name: String,
    /// Saved value.
    pub value: String,
}

/// Saved login fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PasswordPayload {
    /// Origin the login belongs to.
    pub hostname: String,
    /// Form action origin.
    #[serde(default)]
    pub form_submit_url: String,
    /// HTTP auth realm.
    #[serde(default)]
    pub http_realm: Option<String>,
    /// Name of the username form field.
    #[serde(default)]
    pub username_field: String,
    /// Name of the password form field.
    #[serde(default)]
    pub password_field: String,
    /// Username.
    #[serde(default)]
    pub username: String,
    /// Password.
    #[serde(default)]
    pub password: String,
}

/// One open tab.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tab {
    /// Tab title.
    pub title: String,
    /// Back-history URLs, current first.
    #[serde(default)]
    pub url_history: Vec<String>,
    /// Favicon URL.
    #[serde(default)]
    pub icon: Option<String>,
    /// Last use, seconds since the epoch.
    #[serde(default)]
    pub last_used: i64,
}

/// Open tabs of one device.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TabsPayload {
    /// Name of the device the tabs belong to.
    pub client_name: String,
    /// The tabs.
    #[serde(default)]
    pub tabs: Vec<Tab>,
}

/// Per-device identity fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClientPayload {
    /// Human-readable device name.
    pub name: String,
    /// Device type, e.g. "mobile" or "desktop".
    #[serde(default)]
    pub device_type: String,
}

/// Collection-specific record contents.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// Bookmark or folder.
    Bookmark(BookmarkPayload),
    /// History entry.
    History(HistoryPayload),
    /// Form history entry.
    FormHistory(FormHistoryPayload),
    /// Saved login.
    Password(PasswordPayload),
    /// Open tabs of one device.
    Tabs(TabsPayload),
    /// Device identity.
    Client(ClientPayload),
    /// No payload (tombstones).
    #[default]
    Empty,
}

/// A synchronized item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Globally unique identifier, stable across replicas once reconciled.
    pub guid: String,
    /// Owning collection.
    pub collection: Collection,
    /// Milliseconds since the epoch, assigned by the replica that wrote it.
    pub last_modified: i64,
    /// Tombstone flag.
    #[serde(default)]
    pub deleted: bool,
    /// Server-side ordering hint.
    #[serde(default)]
    pub sort_index: i64,
    /// Replica-local handle, if this record came from (or went into) local storage.
    #[serde(skip)]
    pub local_id: Option<LocalId>,
    /// Collection-specific fields.
    #[serde(default)]
    pub payload: Payload,
}

impl Record {
    /// Create a live record.
    pub fn new(
        guid: impl Into<String>,
        collection: Collection,
        last_modified: i64,
        payload: Payload,
    ) -> Self {
        Self {
            guid: guid.into(),
            collection,
            last_modified,
            deleted: false,
            sort_index: 0,
            local_id: None,
            payload,
        }
    }

    /// Create a tombstone.
    pub fn tombstone(guid: impl Into<String>, collection: Collection, last_modified: i64) -> Self {
        Self {
            guid: guid.into(),
            collection,
            last_modified,
            deleted: true,
            sort_index: 0,
            local_id: None,
            payload: Payload::Empty,
        }
    }

    /// Convenience constructor for a bookmark.
    pub fn bookmark(
        guid: impl Into<String>,
        parent_id: impl Into<String>,
        title: impl Into<String>,
        uri: impl Into<String>,
        last_modified: i64,
    ) -> Self {
        Self::new(
            guid,
            Collection::Bookmarks,
            last_modified,
            Payload::Bookmark(BookmarkPayload {
                kind: BookmarkKind::Bookmark,
                title: title.into(),
                uri: Some(uri.into()),
                parent_id: parent_id.into(),
                ..Default::default()
            }),
        )
    }

    /// Convenience constructor for a bookmark folder.
    pub fn folder(
        guid: impl Into<String>,
        parent_id: impl Into<String>,
        title: impl Into<String>,
        children: Vec<String>,
        last_modified: i64,
    ) -> Self {
        Self::new(
            guid,
            Collection::Bookmarks,
            last_modified,
            Payload::Bookmark(BookmarkPayload {
                kind: BookmarkKind::Folder,
                title: title.into(),
                parent_id: parent_id.into(),
                children,
                ..Default::default()
            }),
        )
    }

    /// Generate a fresh 12-character URL-safe GUID.
    pub fn generate_guid() -> String {
        uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
    }

    /// Copy of this record with a different GUID and local id.
    pub fn copy_with_ids(&self, guid: impl Into<String>, local_id: Option<LocalId>) -> Self {
        let mut copy = self.clone();
        copy.guid = guid.into();
        copy.local_id = local_id;
        copy
    }

    /// Bookmark fields, if this is a bookmark record.
    pub fn bookmark_payload(&self) -> Option<&BookmarkPayload> {
        match &self.payload {
            Payload::Bookmark(b) => Some(b),
            _ => None,
        }
    }

    /// Mutable bookmark fields.
    pub fn bookmark_payload_mut(&mut self) -> Option<&mut BookmarkPayload> {
        match &mut self.payload {
            Payload::Bookmark(b) => Some(b),
            _ => None,
        }
    }

    /// True for bookmark folders.
    pub fn is_folder(&self) -> bool {
        self.bookmark_payload()
            .map(|b| b.kind == BookmarkKind::Folder)
            .unwrap_or(false)
    }

    /// Declared parent GUID for hierarchical records.
    pub fn parent_id(&self) -> Option<&str> {
        self.bookmark_payload().map(|b| b.parent_id.as_str())
    }

    /// Same GUID and collection.
    pub fn equal_identifiers(&self, other: &Record) -> bool {
        self.guid == other.guid && self.collection == other.collection
    }

    /// Same identity, deletion state and payload, ignoring timestamps and local ids.
    pub fn equal_payloads(&self, other: &Record) -> bool {
        self.equal_identifiers(other)
            && self.deleted == other.deleted
            && self.payload == other.payload
    }

    /// Local ids agree, treating an unset id as compatible with any other.
    pub fn congruent_local_ids(&self, other: &Record) -> bool {
        match (self.local_id, other.local_id) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}
