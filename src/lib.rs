//! postfeed: a paginated, filterable post feed kept consistent with a backend
//! under concurrent user intents, polling and change notifications.

pub mod config;
pub mod feed;
pub mod render;
pub mod server;
pub mod util;
