//! The feed state machine: sole owner of the window.
//!
//! Every operation is synchronous and returns the [`FetchRequest`] (if any)
//! the caller must execute. Results come back through [`FeedState::complete`]
//! tagged with the request's epoch; only the live epoch is ever applied, so an
//! abandoned fetch can finish at any time without touching the window.

use super::fetcher::{ErrorClass, FetchError};
use super::query::{self, Cursor, QueryDescriptor, QueryError};
use super::reconcile::{self, WindowPatch};
use super::types::{ChangeEvent, Filter, FilterPatch, Item, Page, Sort};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Page size used when nothing else is configured.
pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// What a background refresh does with pages beyond the first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshPolicy {
    /// Re-fetch page 1 and drop deeper pages.
    #[default]
    Truncate,
    /// Re-fetch every loaded page in one request and keep the page counter.
    Refill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    /// Initial or reset fetch in flight; the window is empty.
    Loading,
    /// Append fetch in flight.
    LoadingMore,
    /// Background refresh in flight; the old window stays visible.
    Refreshing,
    /// Last operation failed. Any previously loaded window is kept.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    Reset,
    Append,
    Refresh,
}

impl FetchKind {
    fn status(self) -> Status {
        match self {
            FetchKind::Reset => Status::Loading,
            FetchKind::Append => Status::LoadingMore,
            FetchKind::Refresh => Status::Refreshing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Page arithmetic produced an invalid cursor. Not retryable.
    InvalidCursor,
    Transient,
    Permanent,
}

/// Error attached to state instead of being returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedError {
    pub kind: ErrorKind,
    pub message: String,
    /// True when there is no window to fall back on; the consumer should
    /// show a blocking error with a retry action instead of a notice.
    pub blocking: bool,
}

impl FeedError {
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

/// A fetch the caller must run and report back via [`FeedState::complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub epoch: u64,
    pub kind: FetchKind,
    pub descriptor: QueryDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Failed,
    /// Result belonged to a superseded request and was dropped.
    Stale,
}

#[derive(Debug)]
pub struct Completion {
    pub outcome: Outcome,
    /// Follow-up fetch that was queued behind the completed one.
    pub next: Option<FetchRequest>,
}

#[derive(Debug, Clone, Copy)]
struct LiveFetch {
    epoch: u64,
    kind: FetchKind,
    /// Page counter to adopt on success.
    target_page: u32,
    /// Requested limit; a page of exactly this size means more may follow.
    limit: u64,
}

/// Read-only view handed to consumers.
///
/// `items` is shared with the state machine until the next mutation, so
/// snapshots are cheap to publish on every transition.
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub items: Arc<Vec<Item>>,
    pub status: Status,
    pub error: Option<FeedError>,
    pub has_more: bool,
    pub total: u64,
    pub filter: Filter,
    pub sort: Sort,
    pub page: u32,
}

impl FeedSnapshot {
    pub fn loading(&self) -> bool {
        matches!(
            self.status,
            Status::Loading | Status::LoadingMore | Status::Refreshing
        )
    }

    /// Sorted, de-duplicated authors present in the window.
    pub fn authors(&self) -> Vec<String> {
        self.items
            .iter()
            .map(|item| item.author.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(str::to_string)
            .collect()
    }
}

pub struct FeedState {
    page_size: u32,
    policy: RefreshPolicy,
    filter: Filter,
    sort: Sort,
    page: u32,
    items: Arc<Vec<Item>>,
    total: u64,
    has_more: bool,
    status: Status,
    error: Option<FeedError>,
    epoch: u64,
    live: Option<LiveFetch>,
    load_more_queued: bool,
}

impl FeedState {
    pub fn new(page_size: u32, filter: Filter, sort: Sort) -> Self {
        Self {
            page_size,
            policy: RefreshPolicy::default(),
            filter: filter.normalized(),
            sort,
            page: 1,
            items: Arc::new(Vec::new()),
            total: 0,
            has_more: false,
            status: Status::Idle,
            error: None,
            epoch: 0,
            live: None,
            load_more_queued: false,
        }
    }

    pub fn with_policy(mut self, policy: RefreshPolicy) -> Self {
        self.policy = policy;
        self
    }

    // ------------------------------------------------------------------------
    // Intents
    // ------------------------------------------------------------------------

    /// Initial load of page 1.
    pub fn start(&mut self) -> Option<FetchRequest> {
        self.begin_reset()
    }

    /// Replaces the filter. An unchanged filter is a no-op.
    pub fn set_filter(&mut self, filter: Filter) -> Option<FetchRequest> {
        let filter = filter.normalized();
        if filter == self.filter {
            tracing::debug!("Filter unchanged, not refetching");
            return None;
        }
        self.filter = filter;
        self.begin_reset()
    }

    pub fn update_filter(&mut self, patch: FilterPatch) -> Option<FetchRequest> {
        let mut filter = self.filter.clone();
        filter.apply(patch);
        self.set_filter(filter)
    }

    pub fn clear_filters(&mut self) -> Option<FetchRequest> {
        self.set_filter(Filter::default())
    }

    pub fn set_sort(&mut self, sort: Sort) -> Option<FetchRequest> {
        if sort == self.sort {
            return None;
        }
        self.sort = sort;
        self.begin_reset()
    }

    /// Requests the next page.
    ///
    /// No-op without more pages or while another load-more is in flight.
    /// Behind a reset or refresh it is queued and re-evaluated once that
    /// fetch resolves.
    pub fn load_more(&mut self) -> Option<FetchRequest> {
        if !self.has_more {
            tracing::debug!(page = self.page, "No more pages, ignoring load-more");
            return None;
        }
        if let Some(live) = self.live {
            if live.kind == FetchKind::Append {
                tracing::debug!(epoch = live.epoch, "Load-more already in flight");
            } else {
                tracing::debug!(epoch = live.epoch, "Queueing load-more behind in-flight fetch");
                self.load_more_queued = true;
            }
            return None;
        }
        if self.error.as_ref().is_some_and(|e| e.blocking) {
            return None;
        }

        let next_page = self.page.saturating_add(1);
        self.issue(
            FetchKind::Append,
            Cursor::for_page(next_page, self.page_size),
            next_page,
        )
    }

    /// Background refresh with stale-while-revalidate semantics.
    ///
    /// With an empty window this is a retry and goes through `Loading`.
    /// A refresh supersedes an in-flight load-more and coalesces with an
    /// in-flight reset or refresh.
    pub fn refresh(&mut self) -> Option<FetchRequest> {
        match self.live.map(|live| live.kind) {
            Some(FetchKind::Reset | FetchKind::Refresh) => {
                tracing::debug!("Page 1 already being fetched, coalescing refresh");
                return None;
            }
            Some(FetchKind::Append) => {
                tracing::debug!("Refresh supersedes in-flight load-more");
                self.load_more_queued = false;
            }
            None => {}
        }

        if self.items.is_empty() {
            return self.begin_reset();
        }

        let (cursor, target_page) = match self.policy {
            RefreshPolicy::Truncate => (Cursor::for_page(1, self.page_size), 1),
            RefreshPolicy::Refill => (Cursor::leading_pages(self.page, self.page_size), self.page),
        };
        self.issue(FetchKind::Refresh, cursor, target_page)
    }

    /// Clears a non-blocking error notice. Blocking errors need a retry.
    pub fn dismiss_error(&mut self) {
        if self.error.as_ref().is_some_and(|e| e.blocking) {
            return;
        }
        self.error = None;
        if self.status == Status::Error {
            self.status = Status::Idle;
        }
    }

    // ------------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------------

    /// Applies the result of fetch `epoch` if it is still the live one.
    pub fn complete(&mut self, epoch: u64, result: Result<Page, FetchError>) -> Completion {
        let live = match self.live {
            Some(live) if live.epoch == epoch => live,
            _ => {
                tracing::debug!(
                    epoch,
                    live_epoch = ?self.live.map(|l| l.epoch),
                    "Discarding stale fetch result"
                );
                return Completion {
                    outcome: Outcome::Stale,
                    next: None,
                };
            }
        };
        self.live = None;

        let outcome = match result {
            Ok(page) => {
                self.apply_page(live, page);
                Outcome::Applied
            }
            Err(err) => {
                self.apply_failure(live, &err);
                Outcome::Failed
            }
        };

        let next = if std::mem::take(&mut self.load_more_queued) {
            self.load_more()
        } else {
            None
        };

        Completion { outcome, next }
    }

    /// Merges a change notification into the window.
    ///
    /// The returned patch tells the caller whether a confirming refresh is
    /// worthwhile; the total count is adjusted optimistically.
    pub fn apply_change(&mut self, event: &ChangeEvent) -> WindowPatch {
        let patch = reconcile::apply(event, &self.filter, self.sort, &self.items, self.has_more);

        match &patch {
            WindowPatch::Insert { index, item, .. } => {
                Arc::make_mut(&mut self.items).insert(*index, item.clone());
            }
            WindowPatch::Replace { index, item } => {
                Arc::make_mut(&mut self.items)[*index] = item.clone();
            }
            WindowPatch::Relocate { from, to, item } => {
                let items = Arc::make_mut(&mut self.items);
                items.remove(*from);
                items.insert(*to, item.clone());
            }
            WindowPatch::Remove { index } | WindowPatch::Evict { index } => {
                Arc::make_mut(&mut self.items).remove(*index);
            }
            WindowPatch::Deferred { .. } | WindowPatch::Noop => {}
        }
        self.total = self.total.saturating_add_signed(patch.total_delta());

        tracing::debug!(op = event.op(), id = %event.id(), patch = ?patch_name(&patch), "Applied change event");
        patch
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn error(&self) -> Option<&FeedError> {
        self.error.as_ref()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn sort(&self) -> Sort {
        self.sort
    }

    /// Number of pages currently materialized (1 before the first load).
    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn is_fetching(&self) -> bool {
        self.live.is_some()
    }

    /// Whether timer- or change-driven refreshes may run. Permanent failures
    /// wait for an explicit user retry.
    pub fn auto_refresh_allowed(&self) -> bool {
        self.error.as_ref().map_or(true, FeedError::is_retryable)
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            items: Arc::clone(&self.items),
            status: self.status,
            error: self.error.clone(),
            has_more: self.has_more,
            total: self.total,
            filter: self.filter.clone(),
            sort: self.sort,
            page: self.page,
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Drops the window and fetches page 1 for the current view, abandoning
    /// whatever was in flight.
    fn begin_reset(&mut self) -> Option<FetchRequest> {
        if let Some(live) = self.live {
            tracing::debug!(epoch = live.epoch, kind = ?live.kind, "Superseding in-flight fetch");
        }
        self.load_more_queued = false;
        self.items = Arc::new(Vec::new());
        self.total = 0;
        self.has_more = false;
        self.page = 1;
        self.issue(FetchKind::Reset, Cursor::for_page(1, self.page_size), 1)
    }

    fn issue(&mut self, kind: FetchKind, cursor: Cursor, target_page: u32) -> Option<FetchRequest> {
        let descriptor = match query::build(&self.filter, self.sort, cursor) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                self.fail_query(err);
                return None;
            }
        };

        self.epoch = self.epoch.wrapping_add(1);
        self.live = Some(LiveFetch {
            epoch: self.epoch,
            kind,
            target_page,
            limit: descriptor.limit,
        });
        self.status = kind.status();
        self.error = None;

        tracing::debug!(
            epoch = self.epoch,
            ?kind,
            offset = descriptor.offset,
            limit = descriptor.limit,
            "Issuing fetch"
        );
        Some(FetchRequest {
            epoch: self.epoch,
            kind,
            descriptor,
        })
    }

    fn fail_query(&mut self, err: QueryError) {
        tracing::error!(error = %err, "Could not build page query");
        self.live = None;
        self.load_more_queued = false;
        self.status = Status::Error;
        self.error = Some(FeedError {
            kind: ErrorKind::InvalidCursor,
            message: err.to_string(),
            blocking: self.items.is_empty(),
        });
    }

    fn apply_page(&mut self, live: LiveFetch, page: Page) {
        let fetched = page.items.len() as u64;
        self.has_more = fetched == live.limit;
        self.total = page.total_count;
        self.page = live.target_page;

        match live.kind {
            FetchKind::Reset | FetchKind::Refresh => {
                let mut items = Vec::with_capacity(page.items.len());
                merge_into(&mut items, page.items, self.sort);
                self.items = Arc::new(items);
            }
            FetchKind::Append => {
                merge_into(Arc::make_mut(&mut self.items), page.items, self.sort);
            }
        }

        self.status = Status::Idle;
        self.error = None;
        tracing::debug!(
            epoch = live.epoch,
            kind = ?live.kind,
            fetched,
            window = self.items.len(),
            total = self.total,
            has_more = self.has_more,
            "Applied page"
        );
    }

    fn apply_failure(&mut self, live: LiveFetch, err: &FetchError) {
        let kind = match err.class() {
            ErrorClass::Transient => ErrorKind::Transient,
            ErrorClass::Permanent => ErrorKind::Permanent,
        };
        let blocking = self.items.is_empty();
        tracing::warn!(
            epoch = live.epoch,
            kind = ?live.kind,
            error = %err,
            retryable = err.is_retryable(),
            "Fetch failed, keeping current window"
        );

        self.status = Status::Error;
        self.error = Some(FeedError {
            kind,
            message: err.to_string(),
            blocking,
        });
    }
}

/// Appends `incoming` to `window`, skipping ids already present (keeping the
/// newer copy), then restores sort order. The sort is stable, so ties keep
/// their existing relative order.
fn merge_into(window: &mut Vec<Item>, incoming: Vec<Item>, sort: Sort) {
    let mut positions: HashMap<String, usize> = window
        .iter()
        .enumerate()
        .map(|(i, item)| (item.id.clone(), i))
        .collect();

    let mut duplicates = 0usize;
    for item in incoming {
        match positions.get(&item.id) {
            Some(&i) => {
                duplicates += 1;
                if item.updated_at > window[i].updated_at {
                    window[i] = item;
                }
            }
            None => {
                positions.insert(item.id.clone(), window.len());
                window.push(item);
            }
        }
    }

    if duplicates > 0 {
        tracing::debug!(duplicates, "Skipped fetched items already in window");
    }
    window.sort_by(|a, b| sort.compare(a, b));
}

fn patch_name(patch: &WindowPatch) -> &'static str {
    match patch {
        WindowPatch::Insert { .. } => "insert",
        WindowPatch::Replace { .. } => "replace",
        WindowPatch::Relocate { .. } => "relocate",
        WindowPatch::Remove { .. } => "remove",
        WindowPatch::Evict { .. } => "evict",
        WindowPatch::Deferred { .. } => "deferred",
        WindowPatch::Noop => "noop",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::query::evaluate;
    use crate::feed::types::{SortField, SortOrder};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn item(id: &str, author: &str, day: u32) -> Item {
        let ts = Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap();
        Item {
            id: id.to_string(),
            author: author.to_string(),
            content: format!("post {id}"),
            image_urls: Vec::new(),
            posted_at: ts,
            created_at: ts,
            updated_at: ts,
        }
    }

    fn ids(state: &FeedState) -> Vec<&str> {
        state.items().iter().map(|i| i.id.as_str()).collect()
    }

    /// Runs a request against `collection` and feeds the result back.
    fn resolve(state: &mut FeedState, request: &FetchRequest, collection: &[Item]) -> Completion {
        let page = evaluate(&request.descriptor, collection);
        state.complete(request.epoch, Ok(page))
    }

    fn alice_scenario() -> Vec<Item> {
        vec![item("1", "alice", 3), item("2", "bob", 2), item("3", "alice", 1)]
    }

    fn alice_filter() -> Filter {
        Filter {
            author: Some("alice".into()),
            ..Filter::default()
        }
    }

    fn numbered(count: u32) -> Vec<Item> {
        // Newest first by day: id "1" is day 28
        (1..=count).map(|n| item(&n.to_string(), "alice", 29 - n)).collect()
    }

    #[test]
    fn test_author_filter_full_page_then_empty_page() {
        let collection = alice_scenario();
        let mut state = FeedState::new(2, alice_filter(), Sort::default());

        let request = state.start().unwrap();
        assert_eq!(state.status(), Status::Loading);
        resolve(&mut state, &request, &collection);

        assert_eq!(ids(&state), vec!["1", "3"]);
        assert_eq!(state.total(), 2);
        // Page came back with exactly `limit` items
        assert!(state.has_more());

        let request = state.load_more().unwrap();
        assert_eq!(request.descriptor.offset, 2);
        resolve(&mut state, &request, &collection);
        assert_eq!(ids(&state), vec!["1", "3"]);
        assert!(!state.has_more());
        assert_eq!(state.page(), 2);

        assert!(state.load_more().is_none());
        assert_eq!(state.status(), Status::Idle);
    }

    #[test]
    fn test_short_first_page_disables_load_more() {
        let collection = alice_scenario();
        let mut state = FeedState::new(3, alice_filter(), Sort::default());
        let request = state.start().unwrap();
        resolve(&mut state, &request, &collection);

        assert_eq!(ids(&state), vec!["1", "3"]);
        assert_eq!(state.total(), 2);
        assert!(!state.has_more());
        assert!(state.load_more().is_none());
        assert!(!state.is_fetching());
    }

    #[test]
    fn test_stale_epoch_discarded_after_filter_change() {
        let collection = alice_scenario();
        let mut state = FeedState::new(10, Filter::default(), Sort::default());

        let fetch_a = state.start().unwrap();
        let fetch_b = state.set_filter(alice_filter()).unwrap();
        assert!(fetch_b.epoch > fetch_a.epoch);

        let done_b = resolve(&mut state, &fetch_b, &collection);
        assert_eq!(done_b.outcome, Outcome::Applied);

        let done_a = resolve(&mut state, &fetch_a, &collection);
        assert_eq!(done_a.outcome, Outcome::Stale);
        assert_eq!(ids(&state), vec!["1", "3"]);
        assert_eq!(state.total(), 2);
    }

    #[test]
    fn test_refresh_supersedes_in_flight_load_more() {
        let collection = numbered(4);
        let mut state = FeedState::new(2, Filter::default(), Sort::default());
        let first = state.start().unwrap();
        resolve(&mut state, &first, &collection);
        assert_eq!(ids(&state), vec!["1", "2"]);

        let page_two = state.load_more().unwrap();
        assert_eq!(state.status(), Status::LoadingMore);

        let refresh = state.refresh().unwrap();
        assert_eq!(refresh.kind, FetchKind::Refresh);
        assert_eq!(refresh.descriptor.offset, 0);
        assert_eq!(state.status(), Status::Refreshing);

        assert_eq!(
            resolve(&mut state, &refresh, &collection).outcome,
            Outcome::Applied
        );
        // Late page-2 response must not be appended
        assert_eq!(
            resolve(&mut state, &page_two, &collection).outcome,
            Outcome::Stale
        );
        assert_eq!(ids(&state), vec!["1", "2"]);
        assert_eq!(state.page(), 1);
    }

    #[test]
    fn test_load_more_coalesces_and_queues() {
        let collection = numbered(6);
        let mut state = FeedState::new(2, Filter::default(), Sort::default());
        let first = state.start().unwrap();
        resolve(&mut state, &first, &collection);

        let append = state.load_more().unwrap();
        assert!(state.load_more().is_none()); // same operation, coalesced
        resolve(&mut state, &append, &collection);
        assert_eq!(ids(&state), vec!["1", "2", "3", "4"]);

        let refresh = state.refresh().unwrap();
        assert!(state.refresh().is_none()); // coalesced with itself
        assert!(state.load_more().is_none()); // queued behind the refresh

        let done = resolve(&mut state, &refresh, &collection);
        assert_eq!(ids(&state), vec!["1", "2"]);
        let next = done.next.expect("queued load-more should run");
        assert_eq!(next.kind, FetchKind::Append);
        assert_eq!(next.descriptor.offset, 2);
        resolve(&mut state, &next, &collection);
        assert_eq!(ids(&state), vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn test_refresh_keeps_window_until_resolved() {
        let mut collection = numbered(3);
        let mut state = FeedState::new(10, Filter::default(), Sort::default());
        let first = state.start().unwrap();
        resolve(&mut state, &first, &collection);

        collection.remove(0);
        let refresh = state.refresh().unwrap();
        assert_eq!(state.status(), Status::Refreshing);
        assert_eq!(ids(&state), vec!["1", "2", "3"]);

        resolve(&mut state, &refresh, &collection);
        assert_eq!(ids(&state), vec!["2", "3"]);
        assert_eq!(state.total(), 2);
    }

    #[test]
    fn test_refill_policy_refetches_loaded_pages() {
        let collection = numbered(5);
        let mut state =
            FeedState::new(2, Filter::default(), Sort::default()).with_policy(RefreshPolicy::Refill);
        let first = state.start().unwrap();
        resolve(&mut state, &first, &collection);
        let second = state.load_more().unwrap();
        resolve(&mut state, &second, &collection);
        assert_eq!(state.page(), 2);

        let refresh = state.refresh().unwrap();
        assert_eq!(refresh.descriptor.offset, 0);
        assert_eq!(refresh.descriptor.limit, 4);
        resolve(&mut state, &refresh, &collection);
        assert_eq!(ids(&state), vec!["1", "2", "3", "4"]);
        assert_eq!(state.page(), 2);
        assert!(state.has_more());

        let third = state.load_more().unwrap();
        assert_eq!(third.descriptor.offset, 4);
    }

    #[test]
    fn test_append_skips_items_merged_by_reconciler() {
        let mut collection = numbered(4);
        let mut state = FeedState::new(2, Filter::default(), Sort::default());
        let first = state.start().unwrap();
        resolve(&mut state, &first, &collection);

        // A new newest post shifts every offset by one
        let fresh = item("new", "alice", 30);
        collection.insert(0, fresh.clone());
        state.apply_change(&ChangeEvent::Insert(fresh));
        assert_eq!(ids(&state), vec!["new", "1", "2"]);

        let append = state.load_more().unwrap();
        resolve(&mut state, &append, &collection);
        // Page 2 is now ["2", "3"]; "2" is already shown
        assert_eq!(ids(&state), vec!["new", "1", "2", "3"]);
    }

    #[test]
    fn test_failed_load_more_keeps_window_and_cursor() {
        let collection = numbered(4);
        let mut state = FeedState::new(2, Filter::default(), Sort::default());
        let first = state.start().unwrap();
        resolve(&mut state, &first, &collection);

        let append = state.load_more().unwrap();
        let done = state.complete(append.epoch, Err(FetchError::HttpStatus(503)));
        assert_eq!(done.outcome, Outcome::Failed);
        assert_eq!(state.status(), Status::Error);
        assert_eq!(ids(&state), vec!["1", "2"]);
        assert_eq!(state.page(), 1);

        let error = state.error().unwrap();
        assert_eq!(error.kind, ErrorKind::Transient);
        assert!(!error.blocking);

        state.dismiss_error();
        assert_eq!(state.status(), Status::Idle);
        assert!(state.error().is_none());

        // Retry asks for the same page again
        let retry = state.load_more().unwrap();
        assert_eq!(retry.descriptor.offset, 2);
    }

    #[test]
    fn test_first_load_failure_is_blocking() {
        let mut state = FeedState::new(10, Filter::default(), Sort::default());
        let first = state.start().unwrap();
        state.complete(first.epoch, Err(FetchError::HttpStatus(401)));

        let error = state.error().unwrap().clone();
        assert!(error.blocking);
        assert_eq!(error.kind, ErrorKind::Permanent);
        assert!(!state.auto_refresh_allowed());

        // Blocking errors are not dismissible
        state.dismiss_error();
        assert_eq!(state.status(), Status::Error);

        // Retry goes back through Loading
        let retry = state.refresh().unwrap();
        assert_eq!(retry.kind, FetchKind::Reset);
        assert_eq!(state.status(), Status::Loading);
    }

    #[test]
    fn test_failed_refresh_keeps_window() {
        let collection = numbered(3);
        let mut state = FeedState::new(10, Filter::default(), Sort::default());
        let first = state.start().unwrap();
        resolve(&mut state, &first, &collection);

        let refresh = state.refresh().unwrap();
        state.complete(refresh.epoch, Err(FetchError::Timeout(std::time::Duration::from_secs(30))));
        assert_eq!(state.status(), Status::Error);
        assert_eq!(ids(&state), vec!["1", "2", "3"]);
        assert!(state.auto_refresh_allowed());
    }

    #[test]
    fn test_sort_change_resets_window_and_cursor() {
        let collection = numbered(4);
        let mut state = FeedState::new(2, Filter::default(), Sort::default());
        let first = state.start().unwrap();
        resolve(&mut state, &first, &collection);
        let second = state.load_more().unwrap();
        resolve(&mut state, &second, &collection);
        assert_eq!(state.page(), 2);

        let asc = Sort::new(SortField::PostedAt, SortOrder::Asc);
        let reset = state.set_sort(asc).unwrap();
        assert_eq!(reset.descriptor.offset, 0);
        assert!(state.items().is_empty());
        assert_eq!(state.page(), 1);
        resolve(&mut state, &reset, &collection);
        assert_eq!(ids(&state), vec!["4", "3"]);

        // Same sort again does nothing
        assert!(state.set_sort(asc).is_none());
    }

    #[test]
    fn test_change_excluded_by_filter_never_appears() {
        let collection = alice_scenario();
        let mut state = FeedState::new(10, alice_filter(), Sort::default());
        let first = state.start().unwrap();
        resolve(&mut state, &first, &collection);

        let patch = state.apply_change(&ChangeEvent::Insert(item("9", "bob", 9)));
        assert_eq!(patch, WindowPatch::Noop);
        assert_eq!(ids(&state), vec!["1", "3"]);
        assert_eq!(state.total(), 2);
    }

    #[test]
    fn test_change_adjusts_total_optimistically() {
        let collection = alice_scenario();
        let mut state = FeedState::new(10, Filter::default(), Sort::default());
        let first = state.start().unwrap();
        resolve(&mut state, &first, &collection);

        state.apply_change(&ChangeEvent::Insert(item("4", "carol", 4)));
        assert_eq!(ids(&state), vec!["4", "1", "2", "3"]);
        assert_eq!(state.total(), 4);

        state.apply_change(&ChangeEvent::Delete { id: "2".into() });
        assert_eq!(ids(&state), vec!["4", "1", "3"]);
        assert_eq!(state.total(), 3);

        let patch = state.apply_change(&ChangeEvent::Delete { id: "missing".into() });
        assert_eq!(patch, WindowPatch::Noop);
        assert_eq!(state.total(), 3);
    }

    #[test]
    fn test_edit_on_unloaded_page_keeps_total() {
        let collection = numbered(4);
        let mut state = FeedState::new(2, Filter::default(), Sort::default());
        let first = state.start().unwrap();
        resolve(&mut state, &first, &collection);
        assert_eq!(state.total(), 4);

        let mut edited = collection[3].clone();
        edited.content = "edited".into();
        edited.updated_at += chrono::Duration::hours(1);
        let patch = state.apply_change(&ChangeEvent::Update(edited));

        assert_eq!(patch, WindowPatch::Deferred { counted: false });
        assert_eq!(ids(&state), vec!["1", "2"]);
        assert_eq!(state.total(), 4);

        // A genuine insert past the loaded pages still counts
        let patch = state.apply_change(&ChangeEvent::Insert(item("5", "alice", 1)));
        assert_eq!(patch, WindowPatch::Deferred { counted: true });
        assert_eq!(state.total(), 5);
    }

    #[test]
    fn test_filter_patch_merges_and_resets() {
        let collection = alice_scenario();
        let mut state = FeedState::new(10, Filter::default(), Sort::default());
        let first = state.start().unwrap();
        resolve(&mut state, &first, &collection);

        let request = state
            .update_filter(FilterPatch::default().author("alice"))
            .unwrap();
        assert_eq!(request.kind, FetchKind::Reset);
        resolve(&mut state, &request, &collection);
        assert_eq!(state.filter().author.as_deref(), Some("alice"));

        let request = state.clear_filters().unwrap();
        resolve(&mut state, &request, &collection);
        assert_eq!(ids(&state), vec!["1", "2", "3"]);
        assert!(state.clear_filters().is_none());
    }

    #[test]
    fn test_snapshot_authors_sorted_unique() {
        let collection = alice_scenario();
        let mut state = FeedState::new(10, Filter::default(), Sort::default());
        let first = state.start().unwrap();
        resolve(&mut state, &first, &collection);

        let snapshot = state.snapshot();
        assert_eq!(snapshot.authors(), vec!["alice".to_string(), "bob".to_string()]);
        assert!(!snapshot.loading());
        assert_eq!(snapshot.items.len(), 3);
    }

    #[test]
    fn test_duplicate_ids_within_page_are_collapsed() {
        let mut state = FeedState::new(3, Filter::default(), Sort::default());
        let first = state.start().unwrap();
        let page = Page {
            items: vec![item("1", "a", 3), item("1", "a", 3), item("2", "a", 2)],
            total_count: 2,
        };
        state.complete(first.epoch, Ok(page));
        assert_eq!(ids(&state), vec!["1", "2"]);
        // Three rows were fetched, so the backend may have more
        assert!(state.has_more());
    }
}
