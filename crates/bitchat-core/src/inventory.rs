// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Per-channel content held for relay, with a time-window retention.

use std::{
    collections::{BTreeSet, HashMap},
    time::{Duration, Instant},
};

use crate::ids::ContentId;

#[derive(Debug, Clone)]
struct InventoryItem {
    content: Vec<u8>,
    first_seen: Instant,
    last_stored: Instant,
}

#[derive(Debug, Clone)]
pub struct InventoryStore {
    items: HashMap<ContentId, InventoryItem>,
    /// Items first seen at or after this instant have not been announced.
    last_broadcast: Instant,
    window: Duration,
}

impl InventoryStore {
    pub fn new(window: Duration) -> Self {
        Self {
            items: HashMap::new(),
            last_broadcast: Instant::now(),
            window,
        }
    }

    /// Store `content` under `id`. Returns `true` for new content.
    ///
    /// Storing known content again leaves it and the broadcast watermark
    /// untouched but restarts its retention window.
    pub fn insert(&mut self, id: ContentId, content: Vec<u8>) -> bool {
        self.insert_at(id, content, Instant::now())
    }

    pub(crate) fn insert_at(&mut self, id: ContentId, content: Vec<u8>, now: Instant) -> bool {
        if let Some(item) = self.items.get_mut(&id) {
            item.last_stored = now;
            return false;
        }
        self.items.insert(
            id,
            InventoryItem {
                content,
                first_seen: now,
                last_stored: now,
            },
        );
        true
    }

    pub fn contains(&self, id: &ContentId) -> bool {
        self.items.contains_key(id)
    }

    pub fn get(&self, id: &ContentId) -> Option<&[u8]> {
        self.items.get(id).map(|item| item.content.as_slice())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn ids(&self) -> BTreeSet<ContentId> {
        self.items.keys().copied().collect()
    }

    /// Items first seen since the last call, advancing the watermark.
    pub fn take_new_since_watermark(&mut self) -> BTreeSet<ContentId> {
        self.take_new_since_watermark_at(Instant::now())
    }

    pub(crate) fn take_new_since_watermark_at(&mut self, now: Instant) -> BTreeSet<ContentId> {
        let watermark = self.last_broadcast;
        self.last_broadcast = now;
        self.items
            .iter()
            .filter(|(_, item)| item.first_seen >= watermark)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Drop everything not stored within the retention window.
    pub fn evict_expired(&mut self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    pub(crate) fn evict_expired_at(&mut self, now: Instant) -> usize {
        let before = self.items.len();
        let window = self.window;
        self.items
            .retain(|_, item| now.saturating_duration_since(item.last_stored) < window);
        before - self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> ContentId {
        ContentId([byte; 32])
    }

    #[test]
    fn stored_item_is_retained_until_window_passes() {
        let start = Instant::now();
        let mut store = InventoryStore::new(Duration::from_secs(60));
        assert!(store.insert_at(id(1), b"one".to_vec(), start));
        assert!(store.contains(&id(1)));
        assert_eq!(store.get(&id(1)), Some(&b"one"[..]));

        assert_eq!(store.evict_expired_at(start + Duration::from_secs(59)), 0);
        assert!(store.contains(&id(1)));
        assert_eq!(store.evict_expired_at(start + Duration::from_secs(60)), 1);
        assert!(!store.contains(&id(1)));
    }

    #[test]
    fn reinsert_is_idempotent_but_refreshes_retention() {
        let start = Instant::now();
        let mut store = InventoryStore::new(Duration::from_secs(60));
        store.last_broadcast = start;
        store.insert_at(id(1), b"one".to_vec(), start);
        let announced = store.take_new_since_watermark_at(start + Duration::from_secs(1));
        assert_eq!(announced, [id(1)].into_iter().collect());

        assert!(!store.insert_at(id(1), b"one".to_vec(), start + Duration::from_secs(40)));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&id(1)), Some(&b"one"[..]));
        assert!(store
            .take_new_since_watermark_at(start + Duration::from_secs(41))
            .is_empty());

        assert_eq!(store.evict_expired_at(start + Duration::from_secs(70)), 0);
        assert_eq!(store.evict_expired_at(start + Duration::from_secs(100)), 1);
    }

    #[test]
    fn watermark_only_reports_newer_items() {
        let start = Instant::now();
        let mut store = InventoryStore::new(Duration::from_secs(60));
        store.last_broadcast = start;
        store.insert_at(id(1), vec![1], start);
        let first = store.take_new_since_watermark_at(start + Duration::from_millis(10));
        assert_eq!(first.len(), 1);

        store.insert_at(id(2), vec![2], start + Duration::from_millis(20));
        let second = store.take_new_since_watermark_at(start + Duration::from_millis(30));
        assert_eq!(second, [id(2)].into_iter().collect());
        assert!(store
            .take_new_since_watermark_at(start + Duration::from_millis(40))
            .is_empty());
        assert_eq!(store.ids().len(), 2);
    }
}
