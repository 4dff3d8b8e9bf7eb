//! Subscription filters: REQ parsing and the in-memory match predicate.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::event::{Event, Tag};

/// A single Nostr filter; fields are a conjunction, set members a disjunction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Hex id prefixes (any length up to 64, odd lengths included).
    pub ids: Option<Vec<String>>,
    /// Hex pubkey prefixes.
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u16>>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<i64>,
    /// Inclusive upper bound on `created_at`.
    pub until: Option<i64>,
    /// Cap on backfill results; `Some(0)` means live-only.
    pub limit: Option<usize>,
    /// `#X` single-letter tag queries: tag name to accepted values.
    pub tags: BTreeMap<char, Vec<String>>,
    /// NIP-50 case-insensitive substring search.
    pub search: Option<String>,
}

impl Filter {
    /// Build a `Filter` from one REQ filter object.
    pub fn from_value(val: &Value) -> Self {
        let ids = string_array(val.get("ids"));
        let authors = string_array(val.get("authors"));
        let kinds = val.get("kinds").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64().and_then(|k| u16::try_from(k).ok()))
                .collect()
        });
        let since = val.get("since").and_then(|v| v.as_i64());
        let until = val.get("until").and_then(|v| v.as_i64());
        let limit = val
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize);
        let search = val.get("search").and_then(|v| v.as_str()).map(|s| s.to_string());

        // Single-letter tag queries: "#e", "#p", "#t", ...
        let mut tags = BTreeMap::new();
        if let Some(obj) = val.as_object() {
            for (key, v) in obj {
                let mut chars = key.chars();
                if let (Some('#'), Some(letter), None) = (chars.next(), chars.next(), chars.next()) {
                    let values = v
                        .as_array()
                        .map(|arr| {
                            arr.iter()
                                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                                .collect()
                        })
                        .unwrap_or_default();
                    tags.insert(letter, values);
                }
            }
        }

        Filter {
            ids,
            authors,
            kinds,
            since,
            until,
            limit,
            tags,
            search,
        }
    }

    /// Whether the event satisfies every constraint of this filter.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|p| ev.id.starts_with(p.as_str())) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|p| ev.pubkey.starts_with(p.as_str())) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if ev.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if ev.created_at > until {
                return false;
            }
        }
        for (letter, values) in &self.tags {
            let name = letter.to_string();
            let hit = ev.tags.iter().any(|Tag(fields)| {
                fields.len() >= 2 && fields[0] == name && values.contains(&fields[1])
            });
            if !hit {
                return false;
            }
        }
        if let Some(search) = &self.search {
            if !search.is_empty() && !search_matches(ev, search) {
                return false;
            }
        }
        true
    }
}

/// Whether the event matches any filter in the set.
pub fn matches_any(ev: &Event, filters: &[Filter]) -> bool {
    filters.iter().any(|f| f.matches(ev))
}

/// Case-insensitive substring over content and tag values.
fn search_matches(ev: &Event, needle: &str) -> bool {
    let needle = needle.to_lowercase();
    if ev.content.to_lowercase().contains(&needle) {
        return true;
    }
    ev.tags
        .iter()
        .any(|Tag(fields)| fields.iter().skip(1).any(|v| v.to_lowercase().contains(&needle)))
}

fn string_array(val: Option<&Value>) -> Option<Vec<String>> {
    val.and_then(|v| v.as_array()).map(|arr| {
        arr.iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect()
    })
}
