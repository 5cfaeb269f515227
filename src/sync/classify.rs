// src/sync/classify.rs
//! Splits a poll batch into removals and upserts.

use crate::sync::types::{Posting, PostingState};

/// `flagged_status` value the feed uses for postings pulled by moderation.
pub const FLAGGED_REMOVED: i64 = 1;

/// True when the posting must be deleted downstream instead of written.
pub fn is_removal(p: &Posting) -> bool {
    matches!(p.state, PostingState::Expired | PostingState::Unavailable)
        || p.deleted
        || p.flagged_status == Some(FLAGGED_REMOVED)
}

/// Result of classifying one poll batch.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Classified {
    /// Feed order.
    pub removals: Vec<Posting>,
    /// Ascending `timestamp`; ties keep feed order.
    pub upserts: Vec<Posting>,
}

impl Classified {
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty() && self.upserts.is_empty()
    }
}

pub fn classify(postings: Vec<Posting>) -> Classified {
    let (removals, mut upserts): (Vec<_>, Vec<_>) = postings.into_iter().partition(is_removal);
    // stable, so equal timestamps stay in delivery order
    upserts.sort_by_key(|p| p.timestamp);
    Classified { removals, upserts }
}
