//! Utility functions shared by the backends and the terminal output.
//!
//! - **URL validation**: scheme and transport checks for backend base URLs
//! - **Text processing**: Unicode-aware width, truncation and sanitizing of
//!   post content before it reaches a terminal

mod text;
mod url_validator;

pub use text::{display_width, excerpt, strip_control_chars, truncate_to_width};
pub use url_validator::{validate_backend_url, UrlValidationError};
