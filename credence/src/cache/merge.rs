//! Reconciliation of in-memory state with the last loaded cache document
//!
//! `old` is the document as it was last loaded and `update` is the current
//! in-memory state. A key missing from one of `update`'s buckets was removed
//! in this process and is removed from `old`, even though the stale document
//! still holds it. Keys in `update` are inserted or merged record by record.

use super::{
    entities::{merge_value, Merge},
    store::{Bucket, CredentialStore},
};

/// Merges `update` into `old`, producing the document to persist
pub fn merge(mut old: CredentialStore, update: CredentialStore) -> CredentialStore {
    merge_bucket(&mut old.access_tokens, update.access_tokens);
    merge_bucket(&mut old.refresh_tokens, update.refresh_tokens);
    merge_bucket(&mut old.id_tokens, update.id_tokens);
    merge_bucket(&mut old.accounts, update.accounts);
    merge_bucket(&mut old.app_metadata, update.app_metadata);

    for (name, value) in update.other {
        match old.other.get_mut(&name) {
            Some(current) => merge_value(current, value),
            None => {
                old.other.insert(name, value);
            }
        }
    }

    old
}

/// Applies removals, then inserts and record merges, to a single bucket
pub fn merge_bucket<T: Merge>(old: &mut Bucket<T>, update: Bucket<T>) {
    old.retain(|key, _| update.contains_key(key));

    for (key, record) in update {
        match old.get_mut(&key) {
            Some(existing) => existing.merge_from(record),
            None => {
                old.insert(key, record);
            }
        }
    }
}
