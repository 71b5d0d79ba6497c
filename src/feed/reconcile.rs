//! Merges out-of-band change notifications into the loaded window.
//!
//! [`apply`] only proposes a [`WindowPatch`]; the feed state machine is the one
//! that mutates the window and decides whether a confirming refresh is needed.

use super::types::{ChangeEvent, Filter, Item, Sort};
use std::cmp::Ordering;

/// A single proposed edit to the window.
///
/// Indices refer to the window the patch was computed against. For
/// [`WindowPatch::Relocate`], `to` is the index after `from` has been removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowPatch {
    /// Matching record that was not in the window, inside the loaded
    /// coverage. `counted` is set when it is new to the backend as well.
    Insert {
        index: usize,
        item: Item,
        counted: bool,
    },
    /// Existing record changed without moving.
    Replace { index: usize, item: Item },
    /// Existing record changed its sort key and moves.
    Relocate { from: usize, to: usize, item: Item },
    /// Record left the view (deleted or no longer matching).
    Remove { index: usize },
    /// Record still matches but now sorts past the loaded pages.
    Evict { index: usize },
    /// Matching record that was not in the window and sorts past the loaded
    /// pages. `counted` as for [`WindowPatch::Insert`].
    Deferred { counted: bool },
    /// Nothing to do.
    Noop,
}

impl WindowPatch {
    /// Expected change to the backend's total count.
    pub fn total_delta(&self) -> i64 {
        match self {
            WindowPatch::Insert { counted: true, .. } | WindowPatch::Deferred { counted: true } => 1,
            WindowPatch::Remove { .. } => -1,
            _ => 0,
        }
    }

    /// Whether the patch was derived from partial knowledge and should be
    /// confirmed by a background refresh.
    pub fn needs_confirmation(&self) -> bool {
        !matches!(self, WindowPatch::Noop)
    }
}

/// Computes the patch for one event against the current view.
///
/// `window` must already be ordered by `sort`. `has_more` tells whether pages
/// exist past the end of `window`; a new record that would land after the last
/// loaded item is then not inserted, since it may belong to an unloaded page.
pub fn apply(
    event: &ChangeEvent,
    filter: &Filter,
    sort: Sort,
    window: &[Item],
    has_more: bool,
) -> WindowPatch {
    let existing = window.iter().position(|i| i.id == event.id());

    let item = match event {
        ChangeEvent::Delete { .. } => {
            return existing.map_or(WindowPatch::Noop, |index| WindowPatch::Remove { index });
        }
        // At-least-once delivery: an insert for a known id is an update and
        // an update for an unknown id may be a record that just started matching.
        ChangeEvent::Insert(item) | ChangeEvent::Update(item) => item,
    };

    if !filter.matches(item) {
        return existing.map_or(WindowPatch::Noop, |index| WindowPatch::Remove { index });
    }

    let Some(index) = existing else {
        // An update for an unknown id is an existing record, either on an
        // unloaded page or one that just started matching. Only inserts
        // grow the backend's total.
        let counted = matches!(event, ChangeEvent::Insert(_));
        let index = insertion_point(window, item, sort);
        if index == window.len() && has_more {
            return WindowPatch::Deferred { counted };
        }
        return WindowPatch::Insert {
            index,
            item: item.clone(),
            counted,
        };
    };

    let current = &window[index];
    if item.updated_at < current.updated_at {
        tracing::debug!(id = %item.id, "Ignoring out-of-order change older than window copy");
        return WindowPatch::Noop;
    }
    if item == current {
        return WindowPatch::Noop;
    }

    let after_prev = index == 0 || sort.compare(&window[index - 1], item) != Ordering::Greater;
    let before_next =
        index + 1 >= window.len() || sort.compare(item, &window[index + 1]) != Ordering::Greater;
    if after_prev && before_next {
        return WindowPatch::Replace {
            index,
            item: item.clone(),
        };
    }

    let mut rest: Vec<&Item> = Vec::with_capacity(window.len().saturating_sub(1));
    rest.extend(window[..index].iter());
    rest.extend(window[index + 1..].iter());
    let to = rest.partition_point(|other| sort.compare(other, item) != Ordering::Greater);
    if to == rest.len() && has_more {
        return WindowPatch::Evict { index };
    }

    WindowPatch::Relocate {
        from: index,
        to,
        item: item.clone(),
    }
}

/// Index after every item that sorts at or before `item`, so ties keep
/// arrival order.
fn insertion_point(window: &[Item], item: &Item, sort: Sort) -> usize {
    window.partition_point(|other| sort.compare(other, item) != Ordering::Greater)
}
