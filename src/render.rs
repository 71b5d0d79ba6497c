//! Plain-text rendering of a feed snapshot for the `watch` command.

use crate::feed::{FeedSnapshot, Item, Status};
use crate::util::{excerpt, strip_control_chars, truncate_to_width};
use std::fmt::Write;

const AUTHOR_WIDTH: usize = 20;

/// Renders the window, status line and footer. Output is terminal-safe:
/// backend text is stripped of control sequences.
pub fn format_snapshot(snapshot: &FeedSnapshot, width: usize) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "{}", header(snapshot));
    if let Some(error) = &snapshot.error {
        let prefix = if error.blocking { "Error" } else { "Notice" };
        let _ = writeln!(out, "{prefix}: {}", strip_control_chars(&error.message));
    }

    if snapshot.items.is_empty() {
        match snapshot.status {
            Status::Loading => out.push_str("Loading posts...\n"),
            Status::Error => {}
            _ => out.push_str("No posts found.\n"),
        }
        return out;
    }

    for item in snapshot.items.iter() {
        let _ = writeln!(out, "{}", format_item(item, width));
    }

    let _ = writeln!(
        out,
        "Showing {} of {} posts",
        snapshot.items.len(),
        snapshot.total
    );
    match snapshot.status {
        Status::LoadingMore => out.push_str("Loading more...\n"),
        _ if !snapshot.has_more => out.push_str("You're all caught up!\n"),
        _ => {}
    }
    out
}

fn header(snapshot: &FeedSnapshot) -> String {
    let mut parts = vec![format!(
        "sort: {} {}",
        snapshot.sort.field,
        snapshot.sort.order.as_str()
    )];
    let filter = &snapshot.filter;
    if filter.is_empty() {
        parts.push("all posts".to_string());
    }
    if let Some(author) = &filter.author {
        parts.push(format!("author: {author}"));
    }
    if let Some(search) = &filter.search {
        parts.push(format!("search: \"{search}\""));
    }
    match (filter.date_from, filter.date_to) {
        (Some(from), Some(to)) => parts.push(format!("dates: {from}..{to}")),
        (Some(from), None) => parts.push(format!("from: {from}")),
        (None, Some(to)) => parts.push(format!("until: {to}")),
        (None, None) => {}
    }
    if snapshot.status == Status::Refreshing {
        parts.push("refreshing".to_string());
    }
    strip_control_chars(&parts.join(" | ")).into_owned()
}

/// One line per post: timestamp, author column, content preview.
pub fn format_item(item: &Item, width: usize) -> String {
    let when = item.posted_at.format("%Y-%m-%d %H:%M").to_string();
    let author = strip_control_chars(&item.author);
    let author = truncate_to_width(&author, AUTHOR_WIDTH);
    let images = if item.image_urls.is_empty() {
        String::new()
    } else {
        format!(" [{} img]", item.image_urls.len())
    };

    let prefix = format!("{when}  {author:<AUTHOR_WIDTH$}  ");
    let remaining = width
        .saturating_sub(prefix.chars().count())
        .saturating_sub(images.len());
    format!("{prefix}{}{images}", excerpt(&item.content, remaining))
}
