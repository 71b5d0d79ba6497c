//! Flat-file fallback backend: a JSON array of posts evaluated in memory.
//!
//! Two record shapes are accepted. Full rows carry every [`Item`] field.
//! Scraper output (`{"content", "images", "timestamp"}`) has no id, author
//! or per-row timestamps; those are filled in from the feed's account and a
//! hash of the record.

use super::fetcher::{Backend, FetchError};
use super::query::{evaluate, QueryDescriptor};
use super::types::{Item, Page};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Suffix the scraper appends to the account name for its output file.
const SCRAPER_FILE_SUFFIX: &str = "_threads";

/// Reads the whole posts file on every fetch, so external writers (the
/// scraper) are picked up by the next refresh.
pub struct FileBackend {
    path: PathBuf,
    author: String,
}

impl FileBackend {
    /// Scraped records are attributed to the account named by the file
    /// (`{account}_threads.json`) until [`FileBackend::with_author`] says otherwise.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let author = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(|stem| stem.strip_suffix(SCRAPER_FILE_SUFFIX).unwrap_or(stem))
            .unwrap_or_default()
            .to_string();
        Self { path, author }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredPost {
    Row(Item),
    Scraped(ScrapedPost),
}

#[derive(Deserialize)]
struct ScrapedPost {
    #[serde(default)]
    content: String,
    #[serde(default)]
    images: Vec<String>,
    timestamp: DateTime<Utc>,
}

impl ScrapedPost {
    fn into_item(self, author: &str) -> Item {
        Item {
            id: scraped_id(&self.content, &self.timestamp),
            author: author.to_string(),
            content: self.content,
            image_urls: self.images,
            posted_at: self.timestamp,
            created_at: self.timestamp,
            updated_at: self.timestamp,
        }
    }
}

/// Stable id for a scraped record. Content and timestamp are the scraper's
/// own de-duplication key.
fn scraped_id(content: &str, timestamp: &DateTime<Utc>) -> String {
    let input = format!("{}|{}", timestamp.to_rfc3339(), content);
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

/// Loads all posts from `path`. A missing or blank file is an empty collection.
pub async fn load_items(path: &Path, author: &str) -> Result<Vec<Item>, FetchError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "No posts file yet, using empty collection");
            return Ok(Vec::new());
        }
        Err(e) => return Err(FetchError::Io(e)),
    };

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let stored: Vec<StoredPost> =
        serde_json::from_slice(&bytes).map_err(|e| FetchError::Parse(e.to_string()))?;
    Ok(stored
        .into_iter()
        .map(|post| match post {
            StoredPost::Row(item) => item,
            StoredPost::Scraped(post) => post.into_item(author),
        })
        .collect())
}

#[async_trait]
impl Backend for FileBackend {
    async fn fetch(&self, descriptor: &QueryDescriptor) -> Result<Page, FetchError> {
        let items = load_items(&self.path, &self.author).await?;
        Ok(evaluate(descriptor, &items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::query::{build, Cursor};
    use crate::feed::types::{Filter, Sort};

    const POSTS: &str = r#"[
        {"id": "1", "author": "alice", "content": "Hello", "posted_at": "2024-01-03T00:00:00Z",
         "created_at": "2024-01-03T00:00:00Z", "updated_at": "2024-01-03T00:00:00Z"},
        {"id": "2", "author": "bob", "content": "World", "posted_at": "2024-01-02T00:00:00Z",
         "created_at": "2024-01-02T00:00:00Z", "updated_at": "2024-01-02T00:00:00Z"}
    ]"#;

    fn temp_file(name: &str, content: Option<&str>) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("postfeed_file_backend_{name}"));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("posts.json");
        let _ = std::fs::remove_file(&path);
        if let Some(content) = content {
            std::fs::write(&path, content).unwrap();
        }
        path
    }

    fn first_page() -> QueryDescriptor {
        build(&Filter::default(), Sort::default(), Cursor::for_page(1, 10)).unwrap()
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_page() {
        let path = temp_file("missing", None);
        let page = FileBackend::new(&path).fetch(&first_page()).await.unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.total_count, 0);
    }

    #[tokio::test]
    async fn test_fetch_evaluates_descriptor() {
        let path = temp_file("evaluate", Some(POSTS));
        let filter = Filter {
            search: Some("world".into()),
            ..Filter::default()
        };
        let descriptor = build(&filter, Sort::default(), Cursor::for_page(1, 10)).unwrap();
        let page = FileBackend::new(&path).fetch(&descriptor).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].author, "bob");
        assert_eq!(page.total_count, 1);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_malformed_file_is_parse_error() {
        let path = temp_file("malformed", Some("[{\"id\": "));
        let err = FileBackend::new(&path).fetch(&first_page()).await.unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
        assert!(!err.is_retryable());
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_blank_file_is_empty_collection() {
        let path = temp_file("blank", Some("  \n"));
        let items = load_items(&path, "alice").await.unwrap();
        assert!(items.is_empty());
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_scraper_output_is_readable() {
        let path = temp_file(
            "scraped",
            Some(
                r#"[
                {"content": "hi", "images": [], "timestamp": "2024-01-01T00:00:00Z"},
                {"content": "chart", "images": ["https://example.com/a.jpg"],
                 "timestamp": "2024-01-02T00:00:00Z"}
            ]"#,
            ),
        );
        let backend = FileBackend::new(&path).with_author("j.p_morgan_trading");
        let page = backend.fetch(&first_page()).await.unwrap();

        assert_eq!(page.total_count, 2);
        // Newest first
        assert_eq!(page.items[0].content, "chart");
        assert_eq!(page.items[0].image_urls, vec!["https://example.com/a.jpg"]);
        assert_eq!(page.items[1].author, "j.p_morgan_trading");
        assert_eq!(
            page.items[1].posted_at,
            "2024-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert_eq!(page.items[1].updated_at, page.items[1].posted_at);
        assert_ne!(page.items[0].id, page.items[1].id);

        // Ids survive a reload, so refreshes reconcile instead of duplicating
        let again = backend.fetch(&first_page()).await.unwrap();
        assert_eq!(again.items, page.items);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_scraper_author_defaults_to_file_name() {
        let dir = std::env::temp_dir().join("postfeed_file_backend_account");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("someone_threads.json");
        std::fs::write(&path, r#"[{"content": "x", "timestamp": "2024-01-01T00:00:00Z"}]"#).unwrap();

        let page = FileBackend::new(&path).fetch(&first_page()).await.unwrap();
        assert_eq!(page.items[0].author, "someone");
        assert!(page.items[0].image_urls.is_empty());
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_full_rows_and_scraped_records_mix() {
        let path = temp_file(
            "mixed",
            Some(
                r#"[
                {"id": 7, "author": "bob", "posted_at": "2024-01-03T00:00:00Z",
                 "created_at": "2024-01-03T00:00:00Z", "updated_at": "2024-01-03T00:00:00Z"},
                {"content": "scraped", "timestamp": "2024-01-02T00:00:00Z"}
            ]"#,
            ),
        );
        let items = load_items(&path, "alice").await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "7");
        assert_eq!(items[0].author, "bob");
        assert_eq!(items[1].author, "alice");
        std::fs::remove_file(&path).ok();
    }
}
