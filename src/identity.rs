//! Friend identities: the node universe of the network.

use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{NetworkError, Result};

/// One friend as reported by the local friend-list source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendRecord {
    pub user_id: String,
    pub display_name: String,
}

impl FriendRecord {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Normalized, deduplicated set of known friends keyed by user id.
///
/// Ids iterate in ascending order, which is the canonical node order for the
/// rest of the pipeline.
#[derive(Debug, Clone, Default)]
pub struct IdentityStore {
    names: BTreeMap<String, String>,
}

impl IdentityStore {
    /// Build from source records, failing fast on an empty list.
    ///
    /// Ids and names are trimmed, blank ids are dropped, a blank name falls back
    /// to the id, and the first record wins for a repeated id.
    pub fn from_records<I>(records: I) -> Result<Self>
    where
        I: IntoIterator<Item = FriendRecord>,
    {
        let mut names = BTreeMap::new();
        let mut duplicates = 0usize;

        for record in records {
            let id = record.user_id.trim();
            if id.is_empty() {
                continue;
            }
            let name = normalize_name(&record.display_name).unwrap_or_else(|| id.to_string());
            if names.contains_key(id) {
                duplicates += 1;
                continue;
            }
            names.insert(id.to_string(), name);
        }

        if names.is_empty() {
            return Err(NetworkError::EmptyFriendList);
        }
        if duplicates > 0 {
            debug!(duplicates, "Dropped duplicate friend records");
        }
        Ok(Self { names })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.names.contains_key(user_id)
    }

    pub fn display_name(&self, user_id: &str) -> Option<&str> {
        self.names.get(user_id).map(String::as_str)
    }

    /// Known ids in ascending order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.names.keys().map(String::as_str)
    }

    pub fn records(&self) -> impl Iterator<Item = FriendRecord> + '_ {
        self.names
            .iter()
            .map(|(id, name)| FriendRecord::new(id.clone(), name.clone()))
    }

    /// Replace a stale name with a fresher one. Unknown ids are ignored so the
    /// node universe never grows. Returns whether the name changed.
    pub fn refresh_display_name(&mut self, user_id: &str, display_name: &str) -> bool {
        let Some(fresh) = normalize_name(display_name) else {
            return false;
        };
        match self.names.get_mut(user_id) {
            Some(current) if *current != fresh => {
                *current = fresh;
                true
            }
            _ => false,
        }
    }
}

fn normalize_name(name: &str) -> Option<String> {
    let trimmed = name.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[derive(Debug, Deserialize)]
struct FriendRow {
    user_id: String,
    #[serde(default)]
    display_name: Option<String>,
}

/// Read a `user_id,display_name` CSV exported from the local friend list
pub fn load_friend_csv(path: &Path) -> Result<Vec<FriendRecord>> {
    let mut reader = ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)?;

    let mut records = Vec::new();
    for row in reader.deserialize::<FriendRow>() {
        let row = row?;
        if row.user_id.is_empty() {
            continue;
        }
        let name = row.display_name.unwrap_or_default();
        records.push(FriendRecord::new(row.user_id, name));
    }

    info!(count = records.len(), path = %path.display(), "Loaded friend list");
    Ok(records)
}
