//! PostgREST-style backend (the hosted Supabase `posts` table).

use super::fetcher::{Backend, FetchError};
use super::query::QueryDescriptor;
use super::types::{Item, Page};
use crate::util::{validate_backend_url, UrlValidationError};
use async_trait::async_trait;
use chrono::SecondsFormat;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use url::Url;

const MAX_PAGE_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Queries `{base}/rest/v1/{table}` with exact counts.
pub struct RestBackend {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Option<SecretString>,
}

impl RestBackend {
    /// # Errors
    ///
    /// Returns [`UrlValidationError`] if `base_url` is not an acceptable
    /// backend URL (see [`validate_backend_url`]).
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        table: &str,
        api_key: Option<SecretString>,
    ) -> Result<Self, UrlValidationError> {
        let mut endpoint = validate_backend_url(base_url)?;
        endpoint
            .path_segments_mut()
            .map_err(|_| UrlValidationError::CannotBeBase)?
            .pop_if_empty()
            .extend(["rest", "v1", table]);

        tracing::debug!(endpoint = %endpoint, "Configured REST backend");
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }

    /// Renders a descriptor as a request URL.
    pub fn request_url(&self, descriptor: &QueryDescriptor) -> Url {
        let mut url = self.endpoint.clone();
        {
            let predicate = &descriptor.predicate;
            let mut query = url.query_pairs_mut();
            query.append_pair("select", "*");
            if let Some(author) = &predicate.author {
                query.append_pair("author", &format!("eq.{author}"));
            }
            if let Some(term) = &predicate.content_contains {
                query.append_pair("content", &content_filter(term));
            }
            if let Some(from) = predicate.posted_from {
                query.append_pair(
                    "posted_at",
                    &format!("gte.{}", from.to_rfc3339_opts(SecondsFormat::Secs, true)),
                );
            }
            if let Some(before) = predicate.posted_before {
                query.append_pair(
                    "posted_at",
                    &format!("lt.{}", before.to_rfc3339_opts(SecondsFormat::Secs, true)),
                );
            }
            query.append_pair(
                "order",
                &format!(
                    "{}.{}",
                    descriptor.sort.field.column(),
                    descriptor.sort.order.as_str()
                ),
            );
            query.append_pair("offset", &descriptor.offset.to_string());
            query.append_pair("limit", &descriptor.limit.to_string());
        }
        url
    }
}

#[async_trait]
impl Backend for RestBackend {
    async fn fetch(&self, descriptor: &QueryDescriptor) -> Result<Page, FetchError> {
        let url = self.request_url(descriptor);

        let mut request = self
            .client
            .get(url.as_str())
            .header("Accept", "application/json")
            .header("Prefer", "count=exact");
        if let Some(key) = &self.api_key {
            request = request
                .header("apikey", key.expose_secret())
                .header("Authorization", format!("Bearer {}", key.expose_secret()));
        }

        let response = request.send().await?;
        let status = response.status();
        let content_range = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        // Offset past the end of the collection
        if status == reqwest::StatusCode::RANGE_NOT_SATISFIABLE {
            let total_count = content_range
                .as_deref()
                .and_then(parse_total)
                .unwrap_or(descriptor.offset);
            return Ok(Page {
                items: Vec::new(),
                total_count,
            });
        }

        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), url = %url, "Backend rejected page query");
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let bytes = read_limited_bytes(response, MAX_PAGE_SIZE).await?;
        let items: Vec<Item> =
            serde_json::from_slice(&bytes).map_err(|e| FetchError::Parse(e.to_string()))?;

        let total_count = match content_range.as_deref().and_then(parse_total) {
            Some(total) => total,
            None => {
                tracing::warn!(
                    content_range = ?content_range,
                    "Backend returned no exact count, estimating from page"
                );
                descriptor.offset + items.len() as u64
            }
        };

        Ok(Page { items, total_count })
    }
}

/// Parses the total from a `Content-Range` value (`0-9/42` or `*/0`).
fn parse_total(content_range: &str) -> Option<u64> {
    let (_, total) = content_range.trim().rsplit_once('/')?;
    total.parse().ok()
}

/// Case-insensitive substring filter on `content`.
///
/// PostgREST rewrites every `*` in a `like`/`ilike` value to `%`, so a term
/// containing a literal `*` is sent as an escaped `imatch` regex instead.
fn content_filter(term: &str) -> String {
    if term.contains('*') {
        format!("imatch.{}", escape_regex(term))
    } else {
        format!("ilike.*{}*", escape_like(term))
    }
}

fn escape_regex(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if "\\.^$|?*+()[]{}".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Escapes LIKE metacharacters so the search term matches literally.
fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
