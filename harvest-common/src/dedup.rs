//! # Dedup
//!
//! Decides which items on a crawled page still need an enrichment request.
use std::collections::HashSet;

use crate::checkpoint::PartitionCursor;
use crate::records::SearchItem;
use crate::storage::{ItemStore, StoreError};

/// Combines the cursor's emitted ids with a persisted existence check.
pub struct DedupGuard<'a, S: ItemStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: ItemStore + ?Sized> DedupGuard<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Items not yet emitted according to `cursor` nor durably recorded as enqueued, in page
    /// order. Repeats of an id within the page are dropped as well.
    pub async fn filter_unseen(
        &self,
        cursor: &PartitionCursor,
        items: Vec<SearchItem>,
    ) -> Result<Vec<SearchItem>, StoreError> {
        let mut seen = HashSet::new();
        let candidates: Vec<SearchItem> = items
            .into_iter()
            .filter(|item| !cursor.has_emitted(&item.id) && seen.insert(item.id.clone()))
            .collect();

        if candidates.is_empty() {
            return Ok(candidates);
        }

        let ids: Vec<String> = candidates.iter().map(|i| i.id.clone()).collect();
        let persisted = self.store.enqueued_among(&ids).await?;

        Ok(candidates
            .into_iter()
            .filter(|item| !persisted.contains(&item.id))
            .collect())
    }
}
