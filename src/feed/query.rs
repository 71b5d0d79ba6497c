//! Translation of {filter, sort, page window} into a backend query descriptor.
//!
//! Everything here is pure: equal inputs give equal descriptors, and
//! [`evaluate`] runs a descriptor the same way against any in-memory
//! collection.

use super::types::{Filter, Item, Page, Sort};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// Offsets must be non-negative and limits positive.
    #[error("Invalid cursor: offset {offset}, limit {limit}")]
    InvalidCursor { offset: i64, limit: i64 },
}

/// Offset/limit window into the filtered, sorted collection.
///
/// Signed so that bad arithmetic upstream is reported as
/// [`QueryError::InvalidCursor`] instead of wrapping silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cursor {
    pub offset: i64,
    pub limit: i64,
}

impl Cursor {
    pub fn new(offset: i64, limit: i64) -> Self {
        Self { offset, limit }
    }

    /// Cursor for a 1-based page: `offset = (page - 1) * limit`.
    pub fn for_page(page: u32, limit: u32) -> Self {
        let page = i64::from(page.max(1));
        let limit = i64::from(limit);
        Self {
            offset: (page - 1) * limit,
            limit,
        }
    }

    /// Cursor covering the first `pages` pages in a single request.
    pub fn leading_pages(pages: u32, limit: u32) -> Self {
        Self {
            offset: 0,
            limit: i64::from(pages.max(1)) * i64::from(limit),
        }
    }
}

/// Row predicate shared by backends that evaluate queries locally and by the
/// change reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Predicate {
    pub author: Option<String>,
    pub content_contains: Option<String>,
    /// Inclusive lower bound on `posted_at`.
    pub posted_from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `posted_at`.
    pub posted_before: Option<DateTime<Utc>>,
}

impl Predicate {
    pub fn from_filter(filter: &Filter) -> Self {
        let filter = filter.normalized();
        Self {
            author: filter.author,
            content_contains: filter.search,
            posted_from: filter.date_from.map(start_of_day),
            // date_to is inclusive of the whole day
            posted_before: filter
                .date_to
                .and_then(|day| day.succ_opt())
                .map(start_of_day),
        }
    }

    pub fn matches(&self, item: &Item) -> bool {
        if let Some(author) = &self.author {
            if item.author != *author {
                return false;
            }
        }
        if let Some(term) = &self.content_contains {
            if !item.content.to_lowercase().contains(&term.to_lowercase()) {
                return false;
            }
        }
        if let Some(from) = self.posted_from {
            if item.posted_at < from {
                return false;
            }
        }
        if let Some(before) = self.posted_before {
            if item.posted_at >= before {
                return false;
            }
        }
        true
    }
}

fn start_of_day(day: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0).unwrap_or_default())
}

/// Everything a backend needs to run one page query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryDescriptor {
    pub predicate: Predicate,
    pub sort: Sort,
    pub offset: u64,
    pub limit: u64,
}

/// Builds the descriptor for one page fetch.
///
/// # Errors
///
/// [`QueryError::InvalidCursor`] if the offset is negative or the limit is
/// not positive.
pub fn build(filter: &Filter, sort: Sort, cursor: Cursor) -> Result<QueryDescriptor, QueryError> {
    if cursor.offset < 0 || cursor.limit < 1 {
        return Err(QueryError::InvalidCursor {
            offset: cursor.offset,
            limit: cursor.limit,
        });
    }

    Ok(QueryDescriptor {
        predicate: Predicate::from_filter(filter),
        sort,
        offset: cursor.offset.unsigned_abs(),
        limit: cursor.limit.unsigned_abs(),
    })
}

/// Runs a descriptor against an in-memory collection.
///
/// Matching rows are stably sorted, so ties keep collection order and repeated
/// evaluation over the same collection yields the same page.
pub fn evaluate(descriptor: &QueryDescriptor, collection: &[Item]) -> Page {
    let mut matched: Vec<&Item> = collection
        .iter()
        .filter(|item| descriptor.predicate.matches(item))
        .collect();
    matched.sort_by(|a, b| descriptor.sort.compare(a, b));

    let total_count = matched.len() as u64;
    let offset = usize::try_from(descriptor.offset).unwrap_or(usize::MAX);
    let limit = usize::try_from(descriptor.limit).unwrap_or(usize::MAX);
    let items = matched
        .into_iter()
        .skip(offset)
        .take(limit)
        .cloned()
        .collect();

    Page { items, total_count }
}
