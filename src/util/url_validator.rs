use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur while validating a backend base URL.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// Plain http to a remote host would send the API key in clear text.
    #[error("Insecure URL: {0} (https required for non-local hosts)")]
    InsecureRemote(String),
    /// Credentials belong in `api_key`, not in the URL.
    #[error("URL must not embed credentials")]
    EmbeddedCredentials,
    /// The URL cannot have path segments appended (e.g. `data:` URLs).
    #[error("URL cannot be used as a base")]
    CannotBeBase,
}

/// Validates the base URL of a REST backend.
///
/// Accepts `https` anywhere and plain `http` only for loopback hosts, which
/// covers local development servers and test doubles. Query strings and
/// fragments are dropped since the query is rebuilt for every request.
///
/// # Errors
///
/// Returns [`UrlValidationError`] if:
/// - The URL cannot be parsed ([`UrlValidationError::InvalidUrl`])
/// - The scheme is not `http` or `https` ([`UrlValidationError::UnsupportedScheme`])
/// - The scheme is `http` and the host is not loopback ([`UrlValidationError::InsecureRemote`])
/// - The URL carries a username or password ([`UrlValidationError::EmbeddedCredentials`])
///
/// # Examples
///
/// ```
/// use postfeed::util::validate_backend_url;
///
/// let url = validate_backend_url("https://demo.supabase.co").unwrap();
/// assert_eq!(url.host_str(), Some("demo.supabase.co"));
///
/// assert!(validate_backend_url("http://127.0.0.1:54321").is_ok());
/// assert!(validate_backend_url("http://demo.supabase.co").is_err());
/// assert!(validate_backend_url("file:///etc/passwd").is_err());
/// ```
pub fn validate_backend_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let mut url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "https" => {}
        "http" => {
            if !url.host_str().is_some_and(is_loopback_host) {
                return Err(UrlValidationError::InsecureRemote(url.to_string()));
            }
        }
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    if !url.username().is_empty() || url.password().is_some() {
        return Err(UrlValidationError::EmbeddedCredentials);
    }
    if url.cannot_be_a_base() {
        return Err(UrlValidationError::CannotBeBase);
    }

    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    // Strip brackets from IPv6 addresses for parsing
    let host_for_parse = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    host_for_parse
        .parse::<IpAddr>()
        .is_ok_and(|ip| ip.is_loopback())
}
