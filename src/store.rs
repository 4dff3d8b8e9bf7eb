//! Embedded SQLite event store.
//!
//! One `relay.db` file per data directory, WAL journal, a single serialized
//! writer behind the connection mutex. Replaceable-event bookkeeping happens
//! transactionally inside `put`; deleted events leave a tombstone so they are
//! never accepted again.

use std::{
    collections::HashSet,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, types::Type, Connection, OptionalExtension};
use tracing::warn;

use crate::event::{is_parameterized_replaceable, is_replaceable, Event};
use crate::filter::Filter;

/// Result of a `put` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Stored; supersedes were removed in the same transaction.
    Inserted,
    /// Same id already present; accepting is idempotent.
    Duplicate,
    /// A newer (or tie-winning) replaceable with the same identity is stored.
    Stale,
}

/// Persistent store for events rooted at `DATA_DIR/relay.db`.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if needed) the database inside `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;
        let conn = Connection::open(data_dir.join("relay.db"))
            .with_context(|| format!("opening relay.db in {}", data_dir.display()))?;
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        let _ = conn.pragma_update(None, "synchronous", "FULL");
        let _ = conn.busy_timeout(std::time::Duration::from_secs(5));
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id          TEXT PRIMARY KEY,
                pubkey      TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                kind        INTEGER NOT NULL,
                tags        TEXT NOT NULL,
                content     TEXT NOT NULL,
                sig         TEXT NOT NULL,
                received_at INTEGER NOT NULL,
                expires_at  INTEGER,
                d_tag       TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_events_pubkey ON events(pubkey);
            CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
            CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_events_author_kind ON events(pubkey, kind);
            CREATE INDEX IF NOT EXISTS idx_events_author_kind_d ON events(pubkey, kind, d_tag);
            CREATE TABLE IF NOT EXISTS tombstones (
                id     TEXT PRIMARY KEY,
                pubkey TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("store mutex poisoned"))
    }

    /// Insert an event, enforcing replaceable semantics transactionally.
    pub fn put(&self, ev: &Event, received_at: i64) -> Result<PutOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let exists: Option<String> = tx
            .query_row("SELECT id FROM events WHERE id = ?1", params![ev.id], |r| r.get(0))
            .optional()?;
        if exists.is_some() {
            return Ok(PutOutcome::Duplicate);
        }

        let d_tag: Option<String> = if is_parameterized_replaceable(ev.kind) {
            Some(ev.d_tag().to_string())
        } else {
            None
        };

        if is_replaceable(ev.kind) {
            let prior: Option<(i64, String)> = tx
                .query_row(
                    "SELECT created_at, id FROM events WHERE pubkey = ?1 AND kind = ?2
                     ORDER BY created_at DESC, id ASC LIMIT 1",
                    params![ev.pubkey, ev.kind],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            if let Some((ts, id)) = prior {
                if loses_to(ev, ts, &id) {
                    return Ok(PutOutcome::Stale);
                }
                tx.execute(
                    "DELETE FROM events WHERE pubkey = ?1 AND kind = ?2",
                    params![ev.pubkey, ev.kind],
                )?;
            }
        } else if let Some(d) = &d_tag {
            let prior: Option<(i64, String)> = tx
                .query_row(
                    "SELECT created_at, id FROM events WHERE pubkey = ?1 AND kind = ?2 AND d_tag = ?3
                     ORDER BY created_at DESC, id ASC LIMIT 1",
                    params![ev.pubkey, ev.kind, d],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            if let Some((ts, id)) = prior {
                if loses_to(ev, ts, &id) {
                    return Ok(PutOutcome::Stale);
                }
                tx.execute(
                    "DELETE FROM events WHERE pubkey = ?1 AND kind = ?2 AND d_tag = ?3",
                    params![ev.pubkey, ev.kind, d],
                )?;
            }
        }

        tx.execute(
            "INSERT INTO events (id, pubkey, created_at, kind, tags, content, sig, received_at, expires_at, d_tag)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                ev.id,
                ev.pubkey,
                ev.created_at,
                ev.kind,
                serde_json::to_string(&ev.tags)?,
                ev.content,
                ev.sig,
                received_at,
                ev.expiration(),
                d_tag,
            ],
        )?;
        tx.commit()?;
        Ok(PutOutcome::Inserted)
    }

    /// Remove the listed ids, but only rows authored by `author`.
    ///
    /// Each removed id is tombstoned so a later re-submission is refused.
    /// Returns the number of rows removed.
    pub fn delete_by_author(&self, author: &str, ids: &[&str]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        for id in ids {
            let n = tx.execute(
                "DELETE FROM events WHERE id = ?1 AND pubkey = ?2",
                params![id, author],
            )?;
            if n > 0 {
                tx.execute(
                    "INSERT OR IGNORE INTO tombstones (id, pubkey) VALUES (?1, ?2)",
                    params![id, author],
                )?;
                removed += n;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Whether a kind-5 deletion already removed this id.
    pub fn is_tombstoned(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let hit: Option<String> = conn
            .query_row("SELECT id FROM tombstones WHERE id = ?1", params![id], |r| r.get(0))
            .optional()?;
        Ok(hit.is_some())
    }

    /// Backfill query: the filter disjunction, newest first, deduplicated by
    /// id, per-filter limit capped by `global_limit`, expired rows skipped.
    pub fn query(&self, filters: &[Filter], global_limit: usize, now: i64) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        let mut seen: HashSet<String> = HashSet::new();
        let mut out: Vec<Event> = Vec::new();
        for f in filters {
            let cap = f.limit.map_or(global_limit, |l| l.min(global_limit));
            if cap == 0 || matches_nothing(f) {
                continue;
            }
            let mut taken = 0usize;
            scan(&conn, f, now, |ev| {
                if taken >= cap {
                    return false;
                }
                if f.matches(&ev) {
                    taken += 1;
                    if seen.insert(ev.id.clone()) {
                        out.push(ev);
                    }
                }
                true
            })?;
        }
        out.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(out)
    }

    /// NIP-45 count: same matching as `query`, no ordering or limits.
    pub fn count(&self, filters: &[Filter], now: i64) -> Result<i64> {
        let conn = self.conn()?;
        let mut seen: HashSet<String> = HashSet::new();
        for f in filters {
            if matches_nothing(f) {
                continue;
            }
            scan(&conn, f, now, |ev| {
                if f.matches(&ev) {
                    seen.insert(ev.id.clone());
                }
                true
            })?;
        }
        Ok(seen.len() as i64)
    }

    /// Number of stored events, expired ones included until vacuumed.
    pub fn total_events(&self) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?)
    }

    /// Physically remove expired rows and compact the database file.
    pub fn vacuum(&self, now: i64) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM events WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now],
        )?;
        conn.execute_batch("VACUUM")?;
        Ok(n)
    }
}

/// Whether the candidate loses the replaceable tie-break against a stored row.
fn loses_to(ev: &Event, stored_created_at: i64, stored_id: &str) -> bool {
    stored_created_at > ev.created_at
        || (stored_created_at == ev.created_at && stored_id < ev.id.as_str())
}

/// A filter with an explicitly empty member set can never match.
fn matches_nothing(f: &Filter) -> bool {
    f.ids.as_ref().is_some_and(|v| v.is_empty())
        || f.authors.as_ref().is_some_and(|v| v.is_empty())
        || f.kinds.as_ref().is_some_and(|v| v.is_empty())
        || f.tags.values().any(|v| v.is_empty())
}

/// Stream rows for one filter, newest first, pushing down what SQL can
/// express; the caller post-filters with the compiled predicate and returns
/// `false` to stop early.
fn scan(
    conn: &Connection,
    f: &Filter,
    now: i64,
    mut visit: impl FnMut(Event) -> bool,
) -> Result<()> {
    let mut sql = String::from(
        "SELECT id, pubkey, created_at, kind, tags, content, sig FROM events
         WHERE (expires_at IS NULL OR expires_at > ?1)",
    );
    let mut args: Vec<rusqlite::types::Value> = vec![now.into()];

    if let Some(kinds) = &f.kinds {
        sql.push_str(&format!(" AND kind IN ({})", placeholders(args.len(), kinds.len())));
        args.extend(kinds.iter().map(|k| rusqlite::types::Value::from(*k as i64)));
    }
    // Exact ids/authors push down; prefixes stay in the post-filter.
    if let Some(ids) = &f.ids {
        if ids.iter().all(|s| s.len() == 64) {
            sql.push_str(&format!(" AND id IN ({})", placeholders(args.len(), ids.len())));
            args.extend(ids.iter().map(|s| rusqlite::types::Value::from(s.clone())));
        }
    }
    if let Some(authors) = &f.authors {
        if authors.iter().all(|s| s.len() == 64) {
            sql.push_str(&format!(" AND pubkey IN ({})", placeholders(args.len(), authors.len())));
            args.extend(authors.iter().map(|s| rusqlite::types::Value::from(s.clone())));
        }
    }
    if let Some(since) = f.since {
        sql.push_str(&format!(" AND created_at >= ?{}", args.len() + 1));
        args.push(since.into());
    }
    if let Some(until) = f.until {
        sql.push_str(&format!(" AND created_at <= ?{}", args.len() + 1));
        args.push(until.into());
    }
    sql.push_str(" ORDER BY created_at DESC, id ASC");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(args), row_to_event)?;
    for row in rows {
        match row {
            Ok(ev) => {
                if !visit(ev) {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "skipping undecodable event row"),
        }
    }
    Ok(())
}

fn placeholders(offset: usize, n: usize) -> String {
    (0..n)
        .map(|i| format!("?{}", offset + i + 1))
        .collect::<Vec<_>>()
        .join(", ")
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let tags_json: String = row.get(4)?;
    let tags = serde_json::from_str(&tags_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    Ok(Event {
        id: row.get(0)?,
        pubkey: row.get(1)?,
        created_at: row.get(2)?,
        kind: row.get(3)?,
        tags,
        content: row.get(5)?,
        sig: row.get(6)?,
    })
}
