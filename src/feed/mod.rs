//! Paginated, filtered, live-reconciled post feed.
//!
//! - [`types`] - Items, filters, sort keys and change events
//! - [`query`] - Pure translation of a view and cursor into a query descriptor
//! - [`fetcher`] - The [`Backend`] seam, fetch errors and timeout handling
//! - [`rest`] / [`file`] - PostgREST-style and flat-file backends
//! - [`state`] - The feed state machine owning the window
//! - [`reconcile`] - Merging change notifications into the window
//! - [`scheduler`] - Single-flight coalescing of refresh triggers
//! - [`session`] - The actor task tying it all together
//!
//! # Example
//!
//! ```ignore
//! let backend = Arc::new(FileBackend::new("posts.json"));
//! let feed = session::spawn(backend, SessionOptions::default(), None);
//! feed.dispatch(Intent::ChangeFilter(FilterPatch::default().author("alice"))).await?;
//! let snapshot = feed.wait_until(|s| !s.loading()).await?;
//! ```

pub mod fetcher;
pub mod file;
pub mod query;
pub mod reconcile;
pub mod rest;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod types;

pub use fetcher::{fetch_page, Backend, ErrorClass, FetchError, DEFAULT_FETCH_TIMEOUT};
pub use file::FileBackend;
pub use query::{Cursor, QueryDescriptor, QueryError};
pub use reconcile::WindowPatch;
pub use rest::RestBackend;
pub use session::{spawn, FeedHandle, Intent, SessionError, SessionOptions};
pub use state::{
    ErrorKind, FeedError, FeedSnapshot, FeedState, RefreshPolicy, Status, DEFAULT_PAGE_SIZE,
};
pub use types::{
    ChangeEvent, Filter, FilterPatch, Item, Page, PayloadError, Sort, SortField, SortOrder,
};
