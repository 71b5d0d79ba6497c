use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Items
// ============================================================================

/// A single post as returned by the backend.
///
/// Identity is `id`; every other field may change between fetches or through
/// change notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Backend identifier. Numeric ids are accepted and stored as text.
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub author: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
    pub posted_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Number(n) => n.to_string(),
    })
}

/// One page of results: the items in backend order plus the exact number of
/// records matching the query (across all pages).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub items: Vec<Item>,
    pub total_count: u64,
}

// ============================================================================
// Filters
// ============================================================================

/// Active view filter. Every present field must match (logical AND); absent
/// fields impose no constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Filter {
    /// Exact author match.
    pub author: Option<String>,
    /// Case-insensitive substring match on content.
    pub search: Option<String>,
    /// Earliest posted day, inclusive.
    pub date_from: Option<NaiveDate>,
    /// Latest posted day, inclusive (the whole day counts).
    pub date_to: Option<NaiveDate>,
}

impl Filter {
    /// True when no field constrains the view.
    pub fn is_empty(&self) -> bool {
        self.author.is_none()
            && self.search.is_none()
            && self.date_from.is_none()
            && self.date_to.is_none()
    }

    /// Returns a copy with blank text fields dropped, so `Some("")` and `None`
    /// describe the same view.
    pub fn normalized(&self) -> Filter {
        Filter {
            author: non_blank(self.author.as_deref()),
            search: non_blank(self.search.as_deref()),
            date_from: self.date_from,
            date_to: self.date_to,
        }
    }

    /// Merges a partial update into this filter, field by field.
    pub fn apply(&mut self, patch: FilterPatch) {
        if let Some(author) = patch.author {
            self.author = non_blank(author.as_deref());
        }
        if let Some(search) = patch.search {
            self.search = non_blank(search.as_deref());
        }
        if let Some(date_from) = patch.date_from {
            self.date_from = date_from;
        }
        if let Some(date_to) = patch.date_to {
            self.date_to = date_to;
        }
    }

    /// Evaluates the filter against an item locally.
    pub fn matches(&self, item: &Item) -> bool {
        crate::feed::query::Predicate::from_filter(self).matches(item)
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// A partial filter update.
///
/// The outer `Option` says whether the field is touched at all; the inner one
/// is the new value (`None` or a blank string clears it).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterPatch {
    pub author: Option<Option<String>>,
    pub search: Option<Option<String>>,
    pub date_from: Option<Option<NaiveDate>>,
    pub date_to: Option<Option<NaiveDate>>,
}

impl FilterPatch {
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(Some(author.into()));
        self
    }

    pub fn search(mut self, term: impl Into<String>) -> Self {
        self.search = Some(Some(term.into()));
        self
    }

    pub fn date_from(mut self, day: NaiveDate) -> Self {
        self.date_from = Some(Some(day));
        self
    }

    pub fn date_to(mut self, day: NaiveDate) -> Self {
        self.date_to = Some(Some(day));
        self
    }

    /// Patch that resets every field.
    pub fn clear_all() -> Self {
        Self {
            author: Some(None),
            search: Some(None),
            date_from: Some(None),
            date_to: Some(None),
        }
    }
}

// ============================================================================
// Sorting
// ============================================================================

/// Column the window is ordered by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    PostedAt,
    CreatedAt,
    Author,
}

impl SortField {
    /// Backend column name.
    pub fn column(self) -> &'static str {
        match self {
            SortField::PostedAt => "posted_at",
            SortField::CreatedAt => "created_at",
            SortField::Author => "author",
        }
    }
}

impl FromStr for SortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "posted_at" | "posted" => Ok(SortField::PostedAt),
            "created_at" | "created" => Ok(SortField::CreatedAt),
            "author" => Ok(SortField::Author),
            other => Err(format!(
                "unknown sort field '{other}' (expected posted_at, created_at or author)"
            )),
        }
    }
}

impl fmt::Display for SortField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(format!("unknown sort order '{other}' (expected asc or desc)")),
        }
    }
}

/// The single active ordering. Defaults to newest posts first.
///
/// Ties have no secondary key; callers rely on stable sorting so equal items
/// keep a deterministic relative order for identical inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sort {
    pub field: SortField,
    pub order: SortOrder,
}

impl Sort {
    pub fn new(field: SortField, order: SortOrder) -> Self {
        Self { field, order }
    }

    /// Compares two items in window order: `Less` means `a` is shown first.
    pub fn compare(&self, a: &Item, b: &Item) -> Ordering {
        let ord = match self.field {
            SortField::PostedAt => a.posted_at.cmp(&b.posted_at),
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            SortField::Author => a.author.cmp(&b.author),
        };
        match self.order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    }

    /// True when every adjacent pair of `items` is in window order.
    pub fn is_sorted(&self, items: &[Item]) -> bool {
        items
            .windows(2)
            .all(|pair| self.compare(&pair[0], &pair[1]) != Ordering::Greater)
    }
}

// ============================================================================
// Change Events
// ============================================================================

/// Out-of-band notification about a single record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Insert(Item),
    Update(Item),
    Delete { id: String },
}

/// Errors decoding a realtime change payload.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Invalid change payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unknown change event type: {0}")]
    UnknownEvent(String),
    #[error("Change payload has no record for {0}")]
    MissingRecord(&'static str),
}

#[derive(Deserialize)]
struct RealtimePayload {
    #[serde(rename = "eventType")]
    event_type: String,
    #[serde(default)]
    new: Option<serde_json::Value>,
    #[serde(default)]
    old: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct RecordKey {
    #[serde(deserialize_with = "deserialize_id")]
    id: String,
}

impl ChangeEvent {
    /// Identifier of the record the event is about.
    pub fn id(&self) -> &str {
        match self {
            ChangeEvent::Insert(item) | ChangeEvent::Update(item) => &item.id,
            ChangeEvent::Delete { id } => id,
        }
    }

    /// Short operation tag for logging.
    pub fn op(&self) -> &'static str {
        match self {
            ChangeEvent::Insert(_) => "insert",
            ChangeEvent::Update(_) => "update",
            ChangeEvent::Delete { .. } => "delete",
        }
    }

    /// Decodes a postgres-changes payload of the form
    /// `{"eventType": "INSERT", "new": {..}, "old": {..}}`.
    pub fn from_realtime_json(payload: &str) -> Result<Self, PayloadError> {
        let raw: RealtimePayload = serde_json::from_str(payload)?;
        match raw.event_type.to_ascii_uppercase().as_str() {
            "INSERT" => {
                let record = raw.new.ok_or(PayloadError::MissingRecord("INSERT"))?;
                Ok(ChangeEvent::Insert(serde_json::from_value(record)?))
            }
            "UPDATE" => {
                let record = raw.new.ok_or(PayloadError::MissingRecord("UPDATE"))?;
                Ok(ChangeEvent::Update(serde_json::from_value(record)?))
            }
            "DELETE" => {
                let record = raw.old.ok_or(PayloadError::MissingRecord("DELETE"))?;
                let key: RecordKey = serde_json::from_value(record)?;
                Ok(ChangeEvent::Delete { id: key.id })
            }
            other => Err(PayloadError::UnknownEvent(other.to_string())),
        }
    }
}
