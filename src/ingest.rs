//! Event acceptance pipeline: validation verdicts, kind-specific treatment,
//! persistence, and fan-out.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::event::{self, Event, Tag, KIND_AUTH, KIND_DELETION};
use crate::hub::{Hub, SessionHandle};
use crate::store::{PutOutcome, Store};

/// Machine-readable rejection, mapped onto the OK-message prefixes.
#[derive(Debug, Clone, PartialEq)]
pub enum Reject {
    Invalid(String),
    Pow(String),
    Restricted(String),
    Storage,
}

impl Reject {
    pub fn message(&self) -> String {
        match self {
            Reject::Invalid(detail) => format!("invalid: {detail}"),
            Reject::Pow(detail) => format!("pow: {detail}"),
            Reject::Restricted(detail) => format!("restricted: {detail}"),
            Reject::Storage => "error: storage".into(),
        }
    }
}

/// Shared acceptance pipeline; one per relay process.
pub struct Ingest {
    store: Store,
    hub: Arc<Hub>,
    settings: Arc<Settings>,
    /// Serializes persist+publish so fan-out follows store acceptance order.
    write_order: tokio::sync::Mutex<()>,
}

impl Ingest {
    pub fn new(store: Store, hub: Arc<Hub>, settings: Arc<Settings>) -> Self {
        Ingest {
            store,
            hub,
            settings,
            write_order: tokio::sync::Mutex::new(()),
        }
    }

    /// Run the full pipeline for an EVENT frame from `session`.
    ///
    /// The OK verdict is enqueued on the submitting session before the event
    /// fans out, so a session subscribed to its own events sees OK first.
    pub async fn submit(&self, ev: Event, session: &SessionHandle) {
        let now = event::unix_now();
        if let Err(rej) = self.precheck(&ev, now) {
            debug!(id = %ev.id, reason = %rej.message(), "event rejected");
            session.try_send(ok_frame(&ev.id, false, &rej.message()));
            return;
        }

        let _order = self.write_order.lock().await;
        let outcome = if ev.kind == KIND_DELETION {
            self.apply_deletion(&ev).and_then(|_| self.store.put(&ev, now))
        } else {
            self.store.put(&ev, now)
        };
        match outcome {
            Ok(PutOutcome::Inserted) => {
                info!(id = %ev.id, kind = ev.kind, pubkey = %ev.pubkey, "event accepted");
                session.try_send(ok_frame(&ev.id, true, ""));
                self.hub.publish(&ev).await;
            }
            Ok(PutOutcome::Duplicate) => {
                session.try_send(ok_frame(&ev.id, true, "duplicate:"));
            }
            Ok(PutOutcome::Stale) => {
                session.try_send(ok_frame(
                    &ev.id,
                    false,
                    "invalid: older than stored replaceable event",
                ));
            }
            Err(e) => {
                warn!(id = %ev.id, error = %e, "storage failure");
                session.try_send(ok_frame(&ev.id, false, &Reject::Storage.message()));
            }
        }
    }

    /// Rules 1–9 of the acceptance order; the first failure wins.
    fn precheck(&self, ev: &Event, now: i64) -> Result<(), Reject> {
        ev.validate().map_err(|e| Reject::Invalid(e.to_string()))?;
        event::verify_event(ev).map_err(|e| Reject::Invalid(e.to_string()))?;
        if ev.created_at > now + self.settings.created_at_future_limit {
            return Err(Reject::Invalid("created_at too far in the future".into()));
        }
        if ev.created_at < now - self.settings.created_at_past_limit {
            return Err(Reject::Invalid("created_at too far in the past".into()));
        }
        if ev.expiration().is_some_and(|exp| exp <= now) {
            return Err(Reject::Invalid("expired".into()));
        }
        if self.settings.owner_only
            && self.settings.owner_pubkey.as_deref() != Some(ev.pubkey.as_str())
        {
            return Err(Reject::Restricted("only owner can publish".into()));
        }
        if self.settings.min_pow > 0 {
            let bits = event::pow_difficulty(&ev.id);
            if bits < self.settings.min_pow {
                return Err(Reject::Pow(format!(
                    "difficulty {bits} is below the required {}",
                    self.settings.min_pow
                )));
            }
        }
        check_delegation(ev)?;
        if ev.kind == KIND_AUTH {
            return Err(Reject::Invalid("auth event must be sent via AUTH".into()));
        }
        match self.store.is_tombstoned(&ev.id) {
            Ok(true) => Err(Reject::Invalid("event was deleted".into())),
            Ok(false) => Ok(()),
            Err(e) => {
                warn!(error = %e, "tombstone lookup failed");
                Err(Reject::Storage)
            }
        }
    }

    fn apply_deletion(&self, ev: &Event) -> anyhow::Result<usize> {
        let ids = ev.e_tag_ids();
        let removed = self.store.delete_by_author(&ev.pubkey, &ids)?;
        debug!(pubkey = %ev.pubkey, requested = ids.len(), removed, "deletion applied");
        Ok(removed)
    }
}

fn ok_frame(id: &str, accepted: bool, message: &str) -> String {
    serde_json::json!(["OK", id, accepted, message]).to_string()
}

/// NIP-26: verify the delegation token and enforce its conditions.
fn check_delegation(ev: &Event) -> Result<(), Reject> {
    let fields = match ev
        .tags
        .iter()
        .find(|Tag(f)| f.first().is_some_and(|n| n == "delegation"))
    {
        Some(Tag(f)) => f,
        None => return Ok(()),
    };
    let (delegator, conditions, sig) = match fields.as_slice() {
        [_, d, c, s, ..] => (d, c, s),
        _ => return Err(Reject::Invalid("malformed delegation tag".into())),
    };
    let token = format!("nostr:delegation:{}:{}", ev.pubkey, conditions);
    let digest: [u8; 32] = Sha256::digest(token.as_bytes()).into();
    event::verify_schnorr(sig, &digest, delegator)
        .map_err(|_| Reject::Invalid("bad delegation signature".into()))?;

    let mut allowed_kinds: Vec<u16> = Vec::new();
    for cond in conditions.split('&').filter(|c| !c.is_empty()) {
        if let Some(v) = cond.strip_prefix("kind=") {
            let kind = v
                .parse()
                .map_err(|_| Reject::Invalid("malformed delegation kind condition".into()))?;
            allowed_kinds.push(kind);
        } else if let Some(v) = cond.strip_prefix("created_at<") {
            let bound: i64 = v
                .parse()
                .map_err(|_| Reject::Invalid("malformed delegation time condition".into()))?;
            if ev.created_at >= bound {
                return Err(Reject::Invalid("delegation time window violated".into()));
            }
        } else if let Some(v) = cond.strip_prefix("created_at>") {
            let bound: i64 = v
                .parse()
                .map_err(|_| Reject::Invalid("malformed delegation time condition".into()))?;
            if ev.created_at <= bound {
                return Err(Reject::Invalid("delegation time window violated".into()));
            }
        } else {
            return Err(Reject::Invalid(format!(
                "unsupported delegation condition {cond:?}"
            )));
        }
    }
    if !allowed_kinds.is_empty() && !allowed_kinds.contains(&ev.kind) {
        return Err(Reject::Invalid("kind not allowed by delegation".into()));
    }
    Ok(())
}

/// NIP-42: validate an event arriving on the AUTH frame against the session
/// challenge. Returns the OK-message reason on failure.
pub fn validate_auth_event(
    ev: &Event,
    challenge: &str,
    relay_url: Option<&str>,
    now: i64,
) -> Result<(), String> {
    ev.validate().map_err(|e| format!("invalid: {e}"))?;
    event::verify_event(ev).map_err(|e| format!("invalid: {e}"))?;
    if ev.kind != KIND_AUTH {
        return Err("invalid: wrong kind for auth".into());
    }
    if (ev.created_at - now).abs() > 600 {
        return Err("invalid: auth event timestamp out of range".into());
    }
    if ev.first_tag_value("challenge") != Some(challenge) {
        return Err("invalid: challenge mismatch".into());
    }
    let relay_tag = ev
        .first_tag_value("relay")
        .ok_or_else(|| "invalid: missing relay tag".to_string())?;
    if let Some(url) = relay_url {
        if normalize_url(url) != normalize_url(relay_tag) {
            return Err("invalid: relay mismatch".into());
        }
    }
    Ok(())
}

fn normalize_url(url: &str) -> String {
    url.trim_end_matches('/').to_lowercase()
}
