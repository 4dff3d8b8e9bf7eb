//! Nostr event model and cryptographic checks.

use anyhow::{anyhow, bail, Result};
use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Maximum accepted `content` length in bytes.
pub const MAX_CONTENT_LEN: usize = 65_536;
/// Maximum number of tags on a single event.
pub const MAX_EVENT_TAGS: usize = 2_000;
/// Kind reserved for NIP-42 authentication events.
pub const KIND_AUTH: u16 = 22_242;
/// Kind for NIP-09 deletion events.
pub const KIND_DELETION: u16 = 5;

/// Simple tag wrapper preserving tag fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

/// Core Nostr event, immutable once validated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 over the canonical serialization).
    pub id: String,
    /// Author public key (x-only, hex).
    pub pubkey: String,
    /// Unix timestamp of creation.
    pub created_at: i64,
    /// Kind number, e.g. `1` or `30023`.
    pub kind: u16,
    /// Ordered tags; each inner sequence starts with the tag name.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// Parse an event out of a JSON value and run structural validation.
    pub fn parse(val: &serde_json::Value) -> Result<Event> {
        let ev: Event = serde_json::from_value(val.clone())?;
        ev.validate()?;
        Ok(ev)
    }

    /// Check field lengths, hex charsets, and tag arity.
    pub fn validate(&self) -> Result<()> {
        if self.id.len() != 64 || !is_lower_hex(&self.id) {
            bail!("id must be 64 lowercase hex chars");
        }
        if self.pubkey.len() != 64 || !is_lower_hex(&self.pubkey) {
            bail!("pubkey must be 64 lowercase hex chars");
        }
        if self.sig.len() != 128 || !is_lower_hex(&self.sig) {
            bail!("sig must be 128 lowercase hex chars");
        }
        if self.content.len() > MAX_CONTENT_LEN {
            bail!("content exceeds {} bytes", MAX_CONTENT_LEN);
        }
        if self.tags.len() > MAX_EVENT_TAGS {
            bail!("too many tags");
        }
        if self.tags.iter().any(|Tag(fields)| fields.is_empty()) {
            bail!("tag without a name");
        }
        Ok(())
    }

    /// First value of the named tag, if any.
    pub fn first_tag_value(&self, name: &str) -> Option<&str> {
        self.tags.iter().find_map(|Tag(fields)| match fields.as_slice() {
            [t, val, ..] if t == name => Some(val.as_str()),
            _ => None,
        })
    }

    /// The `d` tag value keying parameterized replaceables; absent means `""`.
    pub fn d_tag(&self) -> &str {
        self.first_tag_value("d").unwrap_or("")
    }

    /// Expiration timestamp from the `expiration` tag; unparseable values are ignored.
    pub fn expiration(&self) -> Option<i64> {
        self.first_tag_value("expiration").and_then(|v| v.parse().ok())
    }

    /// All `e`-tag event ids, in order.
    pub fn e_tag_ids(&self) -> Vec<&str> {
        self.tags
            .iter()
            .filter_map(|Tag(fields)| match fields.as_slice() {
                [t, val, ..] if t == "e" => Some(val.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Whether `kind` replaces prior events keyed by `(pubkey, kind)`.
pub fn is_replaceable(kind: u16) -> bool {
    kind == 0 || kind == 3 || (10_000..20_000).contains(&kind)
}

/// Whether `kind` replaces prior events keyed by `(pubkey, kind, d)`.
pub fn is_parameterized_replaceable(kind: u16) -> bool {
    (30_000..40_000).contains(&kind)
}

/// Recompute the Nostr event hash from its fields.
///
/// serde_json emits the canonical form: no insignificant whitespace, short
/// escapes for `"` `\` and the named control characters, `\uXXXX` for the
/// remaining control characters, raw UTF-8 for everything else.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}

/// Verify an event's id and Schnorr signature.
pub fn verify_event(ev: &Event) -> Result<()> {
    let hash = event_hash(ev)?;
    if hex::encode(hash) != ev.id {
        return Err(anyhow!("id mismatch"));
    }
    verify_schnorr(&ev.sig, &hash, &ev.pubkey)
}

/// Verify a hex Schnorr signature over a 32-byte digest against an x-only key.
pub fn verify_schnorr(sig_hex: &str, digest: &[u8; 32], pubkey_hex: &str) -> Result<()> {
    let sig = Signature::from_slice(&hex::decode(sig_hex)?)?;
    let pk = XOnlyPublicKey::from_slice(&hex::decode(pubkey_hex)?)?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(digest)?;
    secp.verify_schnorr(&sig, &msg, &pk)?;
    Ok(())
}

/// NIP-13 difficulty: leading zero bits of the event id.
pub fn pow_difficulty(id: &str) -> u32 {
    let mut bits = 0;
    for c in id.chars() {
        match c.to_digit(16) {
            Some(0) => bits += 4,
            Some(d) => {
                bits += d.leading_zeros() - 28;
                break;
            }
            None => break,
        }
    }
    bits
}

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}
