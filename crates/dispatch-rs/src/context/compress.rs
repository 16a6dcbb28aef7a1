//! Fitting ranked context into a size budget.
//!
//! Size is measured as the serialized JSON length of each entry. Entries are
//! assumed to be in rank order (best first). Compression proceeds in three
//! phases, each only if the previous one left the window over budget:
//!
//! 1. Drop the lowest-ranked entries, except the best entry of every
//!    distinct [`ContextKind`](super::ContextKind) (diversity floor).
//! 2. Drop the lowest-ranked entries regardless of kind, except the top one.
//! 3. Cut the top entry's content to fit.

use std::collections::HashSet;

use tracing::debug;

use super::entry::ContextEntry;

/// Total serialized size of `entries`.
pub fn window_size(entries: &[ContextEntry]) -> usize {
    entries.iter().map(ContextEntry::serialized_len).sum()
}

/// Compress `entries` to at most `target_size` serialized bytes.
pub fn compress_context_window(entries: &[ContextEntry], target_size: usize) -> Vec<ContextEntry> {
    let sizes: Vec<usize> = entries.iter().map(ContextEntry::serialized_len).collect();
    let mut total: usize = sizes.iter().sum();
    if total <= target_size || entries.is_empty() {
        return entries.to_vec();
    }
    let original = total;

    // Best-ranked entry of each kind.
    let mut seen_kinds = HashSet::new();
    let floor: Vec<bool> = entries.iter().map(|e| seen_kinds.insert(e.kind)).collect();
    let mut keep = vec![true; entries.len()];

    for i in (0..entries.len()).rev() {
        if total <= target_size {
            break;
        }
        if !floor[i] {
            keep[i] = false;
            total -= sizes[i];
        }
    }

    for i in (1..entries.len()).rev() {
        if total <= target_size {
            break;
        }
        if keep[i] {
            keep[i] = false;
            total -= sizes[i];
        }
    }

    let mut kept: Vec<ContextEntry> = entries
        .iter()
        .zip(&keep)
        .filter(|(_, keep)| **keep)
        .map(|(e, _)| e.clone())
        .collect();

    if total > target_size
        && let Some(top) = kept.first_mut()
    {
        truncate_to_fit(top, target_size);
        total = top.serialized_len();
    }

    debug!(
        "[context] compressed window from {original} to {total} bytes ({} of {} entries kept)",
        kept.len(),
        entries.len()
    );
    kept
}

/// Shorten `entry.content` until the entry serializes within `target_size`,
/// cutting on character boundaries.
fn truncate_to_fit(entry: &mut ContextEntry, target_size: usize) {
    let overflow = entry.serialized_len().saturating_sub(target_size);
    let keep_chars = entry.content.chars().count().saturating_sub(overflow);
    entry.content = entry.content.chars().take(keep_chars).collect();
    // Escaped characters serialize longer than one byte each.
    while entry.serialized_len() > target_size && entry.content.pop().is_some() {}
}
