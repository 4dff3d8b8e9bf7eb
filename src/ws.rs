//! WebSocket sessions: per-connection state machine and frame dispatch.

use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::event::{self, Event};
use crate::filter::Filter;
use crate::hub::SessionHandle;
use crate::ingest;
use crate::server::AppState;

/// Largest inbound frame in bytes; larger frames draw a NOTICE.
pub const MAX_FRAME_LEN: usize = 65_536;
/// Filters accepted per REQ; excess filters are dropped with a NOTICE.
pub const MAX_FILTERS: usize = 10;
/// Hard cap on backfill results per filter.
pub const MAX_LIMIT: usize = 500;
/// Longest accepted subscription id.
pub const MAX_SUBID_LEN: usize = 64;
/// Concurrent subscriptions per session.
pub const MAX_SUBSCRIPTIONS: usize = 64;

const OUTBOUND_QUEUE: usize = 256;
const PING_INTERVAL: Duration = Duration::from_secs(54);
const IDLE_TIMEOUT: Duration = Duration::from_secs(108);
const PARSE_FAILURE_LIMIT: usize = 10;
const PARSE_FAILURE_WINDOW: Duration = Duration::from_secs(60);

/// Per-connection state owned by the reader task.
struct Session {
    id: u64,
    challenge: String,
    authed_pubkey: Option<String>,
    handle: SessionHandle,
    outbound: mpsc::Sender<String>,
    state: AppState,
    parse_failures: Vec<Instant>,
    bucket: TokenBucket,
}

/// Drive one WebSocket connection until it closes.
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let (ws_tx, ws_rx) = socket.split();
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let handle = SessionHandle::new(outbound.clone());
    let session_id = state.hub.register(handle.clone()).await;
    let writer = tokio::spawn(write_loop(ws_tx, outbound_rx, handle.clone()));

    let mut session = Session {
        id: session_id,
        challenge: new_challenge(),
        authed_pubkey: None,
        handle: handle.clone(),
        outbound,
        state: state.clone(),
        parse_failures: Vec::new(),
        bucket: TokenBucket::new(state.settings.max_frames_per_minute),
    };
    info!(session = session_id, "client connected");
    session.send_json(json!(["AUTH", session.challenge])).await;

    session.read_loop(ws_rx).await;

    state.hub.unregister(session_id).await;
    handle.begin_close();
    let _ = writer.await;
    info!(
        session = session_id,
        authed = session.authed_pubkey.is_some(),
        "client disconnected"
    );
}

/// Forward queued frames to the socket, pinging on an idle timer.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<String>,
    handle: SessionHandle,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;
    loop {
        if handle.is_closing() {
            let _ = ws_tx.send(Message::Close(None)).await;
            break;
        }
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(text) => {
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        handle.begin_close();
                        break;
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    handle.begin_close();
                    break;
                }
            }
            _ = handle.closed() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

impl Session {
    async fn read_loop(&mut self, mut ws_rx: SplitStream<WebSocket>) {
        loop {
            if self.handle.is_closing() {
                break;
            }
            let frame = tokio::select! {
                f = tokio::time::timeout(IDLE_TIMEOUT, ws_rx.next()) => f,
                _ = self.handle.closed() => break,
            };
            match frame {
                Err(_) => {
                    debug!(session = self.id, "idle timeout");
                    self.handle.begin_close();
                    break;
                }
                Ok(None) | Ok(Some(Err(_))) => break,
                Ok(Some(Ok(Message::Text(txt)))) => {
                    if !self.dispatch(&txt).await {
                        self.handle.begin_close();
                        break;
                    }
                }
                Ok(Some(Ok(Message::Close(_)))) => break,
                // Pings, pongs, and binary frames only refresh the idle timer.
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    /// Handle one text frame; returns false to drop the connection.
    async fn dispatch(&mut self, txt: &str) -> bool {
        if txt.len() > MAX_FRAME_LEN {
            self.send_notice("invalid: message too large").await;
            return true;
        }
        let val: Value = match serde_json::from_str(txt) {
            Ok(v) => v,
            Err(_) => return self.on_parse_failure("invalid: malformed JSON").await,
        };
        let arr = match val.as_array() {
            Some(arr) => arr,
            None => return self.on_parse_failure("invalid: expected a JSON array").await,
        };
        let word = match arr.first().and_then(Value::as_str) {
            Some(w) => w,
            None => return self.on_parse_failure("invalid: missing command word").await,
        };
        if !self.bucket.allow() {
            if word == "EVENT" {
                let id = arr
                    .get(1)
                    .and_then(|e| e.get("id"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.send_json(json!(["OK", id, false, "rate-limited: slow down"]))
                    .await;
            } else {
                self.send_notice("rate-limited: slow down").await;
            }
            return true;
        }
        match word {
            "EVENT" => self.on_event(arr).await,
            "REQ" => self.on_req(arr).await,
            "CLOSE" => self.on_close(arr).await,
            "COUNT" => self.on_count(arr).await,
            "AUTH" => self.on_auth(arr).await,
            other => {
                self.send_notice(&format!("unsupported: {other}")).await;
            }
        }
        true
    }

    async fn on_event(&mut self, arr: &[Value]) {
        let raw = match arr.get(1) {
            Some(v) if v.is_object() => v,
            _ => {
                self.send_notice("invalid: EVENT requires an event object").await;
                return;
            }
        };
        let ev = match Event::parse(raw) {
            Ok(ev) => ev,
            Err(e) => {
                let id = raw.get("id").and_then(Value::as_str).unwrap_or_default();
                self.send_json(json!(["OK", id, false, format!("invalid: {e}")]))
                    .await;
                return;
            }
        };
        // The pipeline enqueues the OK itself, ahead of any fan-out copy.
        self.state.ingest.submit(ev, &self.handle).await;
    }

    async fn on_req(&mut self, arr: &[Value]) {
        let sub_id = match self.subscription_id(arr).await {
            Some(s) => s,
            None => return,
        };
        let mut raw_filters = &arr[2..];
        if raw_filters.is_empty() {
            self.send_notice("invalid: REQ requires at least one filter").await;
            return;
        }
        if raw_filters.len() > MAX_FILTERS {
            self.send_notice(&format!(
                "truncated: at most {MAX_FILTERS} filters per REQ, using the first {MAX_FILTERS}"
            ))
            .await;
            raw_filters = &raw_filters[..MAX_FILTERS];
        }
        let filters: Vec<Filter> = raw_filters.iter().map(Filter::from_value).collect();

        {
            let mut subs = self.handle.subscriptions.write().await;
            subs.remove(&sub_id);
            if subs.len() >= MAX_SUBSCRIPTIONS {
                drop(subs);
                self.send_notice(&format!(
                    "truncated: at most {MAX_SUBSCRIPTIONS} subscriptions per connection"
                ))
                .await;
                return;
            }
        }

        let now = event::unix_now();
        match self.state.store.query(&filters, MAX_LIMIT, now) {
            Ok(events) => {
                debug!(session = self.id, sub = %sub_id, n = events.len(), "backfill");
                for ev in events {
                    self.send_json(json!(["EVENT", sub_id, ev])).await;
                }
            }
            Err(e) => {
                warn!(session = self.id, error = %e, "backfill query failed");
                self.send_notice("error: storage").await;
            }
        }
        self.send_json(json!(["EOSE", sub_id])).await;
        self.handle
            .subscriptions
            .write()
            .await
            .insert(sub_id, filters);
    }

    async fn on_close(&mut self, arr: &[Value]) {
        if let Some(sub_id) = arr.get(1).and_then(Value::as_str) {
            // Unknown subscription ids are silently ignored.
            self.handle.subscriptions.write().await.remove(sub_id);
        }
    }

    async fn on_count(&mut self, arr: &[Value]) {
        let sub_id = match self.subscription_id(arr).await {
            Some(s) => s,
            None => return,
        };
        let raw_filters = &arr[2..];
        if raw_filters.is_empty() {
            self.send_notice("invalid: COUNT requires at least one filter").await;
            return;
        }
        let filters: Vec<Filter> = raw_filters
            .iter()
            .take(MAX_FILTERS)
            .map(Filter::from_value)
            .collect();
        match self.state.store.count(&filters, event::unix_now()) {
            Ok(n) => {
                self.send_json(json!(["COUNT", sub_id, {"count": n}])).await;
            }
            Err(e) => {
                warn!(session = self.id, error = %e, "count query failed");
                self.send_notice("error: storage").await;
            }
        }
    }

    async fn on_auth(&mut self, arr: &[Value]) {
        let raw = match arr.get(1) {
            Some(v) if v.is_object() => v,
            _ => {
                self.send_notice("invalid: AUTH requires an event object").await;
                return;
            }
        };
        let ev = match Event::parse(raw) {
            Ok(ev) => ev,
            Err(e) => {
                let id = raw.get("id").and_then(Value::as_str).unwrap_or_default();
                self.send_json(json!(["OK", id, false, format!("invalid: {e}")]))
                    .await;
                return;
            }
        };
        let verdict = ingest::validate_auth_event(
            &ev,
            &self.challenge,
            self.state.settings.relay_url.as_deref(),
            event::unix_now(),
        );
        match verdict {
            Ok(()) => {
                info!(session = self.id, pubkey = %ev.pubkey, "session authenticated");
                self.authed_pubkey = Some(ev.pubkey.clone());
                self.send_json(json!(["OK", ev.id, true, ""])).await;
            }
            Err(reason) => {
                self.send_json(json!(["OK", ev.id, false, reason])).await;
            }
        }
    }

    /// Validate the subscription id of a REQ/COUNT frame.
    async fn subscription_id(&mut self, arr: &[Value]) -> Option<String> {
        match arr.get(1).and_then(Value::as_str) {
            Some(s) if !s.is_empty() && s.len() <= MAX_SUBID_LEN => Some(s.to_string()),
            _ => {
                self.send_notice("invalid: subscription id must be 1 to 64 chars").await;
                None
            }
        }
    }

    async fn on_parse_failure(&mut self, notice: &str) -> bool {
        self.send_notice(notice).await;
        let now = Instant::now();
        self.parse_failures
            .retain(|t| now.duration_since(*t) < PARSE_FAILURE_WINDOW);
        self.parse_failures.push(now);
        if self.parse_failures.len() > PARSE_FAILURE_LIMIT {
            warn!(session = self.id, "too many parse failures, dropping connection");
            return false;
        }
        true
    }

    async fn send_json(&self, v: Value) {
        if self.outbound.send(v.to_string()).await.is_err() {
            self.handle.begin_close();
        }
    }

    async fn send_notice(&self, text: &str) {
        self.send_json(json!(["NOTICE", text])).await;
    }
}

fn new_challenge() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Per-session token bucket over inbound frames; zero capacity disables it.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(per_minute: u32) -> Self {
        let capacity = per_minute as f64;
        TokenBucket {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 60.0,
            last: Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        if self.capacity == 0.0 {
            return true;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::event::Tag;
    use crate::server;
    use crate::store::Store;
    use secp256k1::{Keypair, Message as SecpMessage, Secp256k1};
    use tempfile::TempDir;
    use tokio_tungstenite::tungstenite::protocol::Message as TungMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    fn test_settings() -> Settings {
        Settings {
            port: 0,
            data_dir: "./data".into(),
            owner_only: false,
            owner_pubkey: None,
            name: "homestr-test".into(),
            description: String::new(),
            contact: String::new(),
            relay_url: None,
            min_pow: 0,
            created_at_past_limit: 2_592_000,
            created_at_future_limit: 600,
            max_frames_per_minute: 0,
        }
    }

    async fn spawn_relay(dir: &TempDir, settings: Settings) -> std::net::SocketAddr {
        let store = Store::open(dir.path()).unwrap();
        let state = server::build_state(settings, store);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            server::serve(listener, state, std::future::pending()).await.unwrap();
        });
        addr
    }

    async fn connect(addr: std::net::SocketAddr) -> WsClient {
        let (ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        ws
    }

    fn signed(kind: u16, created_at: i64, tags: Vec<Tag>, content: &str) -> Event {
        let secp = Secp256k1::new();
        let kp = Keypair::from_seckey_slice(&secp, &[1u8; 32]).unwrap();
        let mut ev = Event {
            id: String::new(),
            pubkey: hex::encode(kp.x_only_public_key().0.serialize()),
            created_at,
            kind,
            tags,
            content: content.into(),
            sig: String::new(),
        };
        let hash = event::event_hash(&ev).unwrap();
        ev.id = hex::encode(hash);
        let msg = SecpMessage::from_digest_slice(&hash).unwrap();
        ev.sig = hex::encode(secp.sign_schnorr_no_aux_rand(&msg, &kp).as_ref());
        ev
    }

    /// Read text frames until one whose command word matches, skipping pings.
    async fn next_frame(ws: &mut WsClient, word: &str) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame")
                .unwrap()
                .unwrap();
            if let TungMessage::Text(txt) = msg {
                let val: Value = serde_json::from_str(&txt).unwrap();
                if val[0] == *word {
                    return val;
                }
            }
        }
    }

    async fn send_json(ws: &mut WsClient, v: Value) {
        ws.send(TungMessage::Text(v.to_string())).await.unwrap();
    }

    #[tokio::test]
    async fn sends_auth_challenge_on_connect() {
        let dir = TempDir::new().unwrap();
        let addr = spawn_relay(&dir, test_settings()).await;
        let mut ws = connect(addr).await;
        let frame = next_frame(&mut ws, "AUTH").await;
        assert!(frame[1].as_str().unwrap().len() >= 16);
    }

    #[tokio::test]
    async fn publish_then_fetch() {
        let dir = TempDir::new().unwrap();
        let addr = spawn_relay(&dir, test_settings()).await;
        let ev = signed(1, event::unix_now(), vec![], "hello");

        let mut alice = connect(addr).await;
        send_json(&mut alice, json!(["EVENT", ev])).await;
        let ok = next_frame(&mut alice, "OK").await;
        assert_eq!(ok[1], ev.id);
        assert_eq!(ok[2], true);

        let mut bob = connect(addr).await;
        send_json(&mut bob, json!(["REQ", "s", {"authors": [ev.pubkey]}])).await;
        let frame = next_frame(&mut bob, "EVENT").await;
        assert_eq!(frame[1], "s");
        assert_eq!(frame[2]["id"], ev.id);
        next_frame(&mut bob, "EOSE").await;
    }

    #[tokio::test]
    async fn live_delivery_after_eose() {
        let dir = TempDir::new().unwrap();
        let addr = spawn_relay(&dir, test_settings()).await;

        let mut bob = connect(addr).await;
        send_json(&mut bob, json!(["REQ", "s", {"kinds": [1]}])).await;
        next_frame(&mut bob, "EOSE").await;

        let ev = signed(1, event::unix_now(), vec![], "live");
        let mut alice = connect(addr).await;
        send_json(&mut alice, json!(["EVENT", ev])).await;
        next_frame(&mut alice, "OK").await;

        let frame = next_frame(&mut bob, "EVENT").await;
        assert_eq!(frame[2]["id"], ev.id);
    }

    #[tokio::test]
    async fn close_stops_live_delivery() {
        let dir = TempDir::new().unwrap();
        let addr = spawn_relay(&dir, test_settings()).await;

        let mut bob = connect(addr).await;
        send_json(&mut bob, json!(["REQ", "s", {"kinds": [1]}])).await;
        next_frame(&mut bob, "EOSE").await;
        send_json(&mut bob, json!(["CLOSE", "s"])).await;
        // Closing an unknown id is silently ignored.
        send_json(&mut bob, json!(["CLOSE", "never-existed"])).await;

        let ev = signed(1, event::unix_now(), vec![], "after close");
        let mut alice = connect(addr).await;
        send_json(&mut alice, json!(["EVENT", ev])).await;
        next_frame(&mut alice, "OK").await;

        // A follow-up REQ still works and the closed sub delivered nothing.
        send_json(&mut bob, json!(["REQ", "s2", {"kinds": [2]}])).await;
        let frame = next_frame(&mut bob, "EOSE").await;
        assert_eq!(frame[1], "s2");
    }

    #[tokio::test]
    async fn replacing_a_subscription_reuses_its_id() {
        let dir = TempDir::new().unwrap();
        let addr = spawn_relay(&dir, test_settings()).await;

        let mut bob = connect(addr).await;
        send_json(&mut bob, json!(["REQ", "s", {"kinds": [2]}])).await;
        next_frame(&mut bob, "EOSE").await;
        send_json(&mut bob, json!(["REQ", "s", {"kinds": [1]}])).await;
        next_frame(&mut bob, "EOSE").await;

        let ev = signed(1, event::unix_now(), vec![], "replaced sub");
        let mut alice = connect(addr).await;
        send_json(&mut alice, json!(["EVENT", ev])).await;
        next_frame(&mut alice, "OK").await;

        let frame = next_frame(&mut bob, "EVENT").await;
        assert_eq!(frame[1], "s");
        assert_eq!(frame[2]["id"], ev.id);
    }

    #[tokio::test]
    async fn limit_zero_gives_eose_then_live_only() {
        let dir = TempDir::new().unwrap();
        let addr = spawn_relay(&dir, test_settings()).await;

        let stored = signed(1, event::unix_now() - 10, vec![], "stored");
        let mut alice = connect(addr).await;
        send_json(&mut alice, json!(["EVENT", stored])).await;
        next_frame(&mut alice, "OK").await;

        let mut bob = connect(addr).await;
        send_json(&mut bob, json!(["REQ", "s", {"kinds": [1], "limit": 0}])).await;
        let frame = next_frame(&mut bob, "EOSE").await;
        assert_eq!(frame[1], "s");

        let live = signed(1, event::unix_now(), vec![], "live");
        send_json(&mut alice, json!(["EVENT", live])).await;
        next_frame(&mut alice, "OK").await;
        let frame = next_frame(&mut bob, "EVENT").await;
        assert_eq!(frame[2]["id"], live.id);
    }

    #[tokio::test]
    async fn count_reports_matching_events() {
        let dir = TempDir::new().unwrap();
        let addr = spawn_relay(&dir, test_settings()).await;
        let mut alice = connect(addr).await;
        let now = event::unix_now();
        let pubkey = signed(1, now, vec![], "x").pubkey.clone();
        for i in 0..3 {
            let ev = signed(1, now - i, vec![], &format!("n{i}"));
            send_json(&mut alice, json!(["EVENT", ev])).await;
            next_frame(&mut alice, "OK").await;
        }
        send_json(
            &mut alice,
            json!(["COUNT", "c", {"authors": [pubkey], "kinds": [1]}]),
        )
        .await;
        let frame = next_frame(&mut alice, "COUNT").await;
        assert_eq!(frame[1], "c");
        assert_eq!(frame[2]["count"], 3);
    }

    #[tokio::test]
    async fn auth_flow_accepts_matching_challenge() {
        let dir = TempDir::new().unwrap();
        let addr = spawn_relay(&dir, test_settings()).await;
        let mut ws = connect(addr).await;
        let challenge = next_frame(&mut ws, "AUTH").await[1]
            .as_str()
            .unwrap()
            .to_string();

        let auth = signed(
            event::KIND_AUTH,
            event::unix_now(),
            vec![
                Tag(vec!["challenge".into(), challenge]),
                Tag(vec!["relay".into(), format!("ws://{addr}/")]),
            ],
            "",
        );
        send_json(&mut ws, json!(["AUTH", auth])).await;
        let ok = next_frame(&mut ws, "OK").await;
        assert_eq!(ok[2], true);

        // A wrong challenge is refused.
        let bad = signed(
            event::KIND_AUTH,
            event::unix_now(),
            vec![
                Tag(vec!["challenge".into(), "wrong".into()]),
                Tag(vec!["relay".into(), format!("ws://{addr}/")]),
            ],
            "",
        );
        send_json(&mut ws, json!(["AUTH", bad])).await;
        let ok = next_frame(&mut ws, "OK").await;
        assert_eq!(ok[2], false);
    }

    #[tokio::test]
    async fn auth_kind_is_refused_on_event_frame() {
        let dir = TempDir::new().unwrap();
        let addr = spawn_relay(&dir, test_settings()).await;
        let mut ws = connect(addr).await;
        let ev = signed(event::KIND_AUTH, event::unix_now(), vec![], "");
        send_json(&mut ws, json!(["EVENT", ev])).await;
        let ok = next_frame(&mut ws, "OK").await;
        assert_eq!(ok[2], false);
        assert!(ok[3].as_str().unwrap().starts_with("invalid:"));
    }

    #[tokio::test]
    async fn unknown_command_draws_notice() {
        let dir = TempDir::new().unwrap();
        let addr = spawn_relay(&dir, test_settings()).await;
        let mut ws = connect(addr).await;
        send_json(&mut ws, json!(["PUBLISH", "x"])).await;
        let frame = next_frame(&mut ws, "NOTICE").await;
        assert_eq!(frame[1], "unsupported: PUBLISH");
    }

    #[tokio::test]
    async fn oversized_frame_draws_notice() {
        let dir = TempDir::new().unwrap();
        let addr = spawn_relay(&dir, test_settings()).await;
        let mut ws = connect(addr).await;
        // A frame one byte over the cap; the content is never parsed.
        let padding = "x".repeat(MAX_FRAME_LEN - 11);
        let frame = format!("[\"EVENT\",\"{padding}\"]");
        assert_eq!(frame.len(), MAX_FRAME_LEN + 1);
        ws.send(TungMessage::Text(frame)).await.unwrap();
        let notice = next_frame(&mut ws, "NOTICE").await;
        assert_eq!(notice[1], "invalid: message too large");
    }

    #[tokio::test]
    async fn frame_at_exact_limit_is_processed() {
        let dir = TempDir::new().unwrap();
        let addr = spawn_relay(&dir, test_settings()).await;
        let mut ws = connect(addr).await;
        let padding = "x".repeat(MAX_FRAME_LEN - 12);
        let frame = format!("[\"EVENT\",\"{padding}\"]");
        assert_eq!(frame.len(), MAX_FRAME_LEN);
        ws.send(TungMessage::Text(frame)).await.unwrap();
        // Processed as an EVENT frame with a malformed body, not as oversized.
        let notice = next_frame(&mut ws, "NOTICE").await;
        assert_eq!(notice[1], "invalid: EVENT requires an event object");
    }

    #[tokio::test]
    async fn malformed_json_draws_notice_and_repeats_disconnect() {
        let dir = TempDir::new().unwrap();
        let addr = spawn_relay(&dir, test_settings()).await;
        let mut ws = connect(addr).await;
        send_json(&mut ws, json!({"not": "an array"})).await;
        let notice = next_frame(&mut ws, "NOTICE").await;
        assert!(notice[1].as_str().unwrap().starts_with("invalid:"));

        for _ in 0..12 {
            let _ = ws.send(TungMessage::Text("not json".into())).await;
        }
        // The server closes after more than 10 parse failures inside a minute.
        let mut closed = false;
        for _ in 0..64 {
            match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
                Ok(Some(Ok(TungMessage::Close(_)))) | Ok(None) | Err(_) => {
                    closed = true;
                    break;
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(_))) => {
                    closed = true;
                    break;
                }
            }
        }
        assert!(closed);
    }

    #[tokio::test]
    async fn req_validates_subscription_id_and_filters() {
        let dir = TempDir::new().unwrap();
        let addr = spawn_relay(&dir, test_settings()).await;
        let mut ws = connect(addr).await;

        send_json(&mut ws, json!(["REQ", "", {}])).await;
        let notice = next_frame(&mut ws, "NOTICE").await;
        assert!(notice[1].as_str().unwrap().contains("subscription id"));

        send_json(&mut ws, json!(["REQ", "x".repeat(65), {}])).await;
        let notice = next_frame(&mut ws, "NOTICE").await;
        assert!(notice[1].as_str().unwrap().contains("subscription id"));

        send_json(&mut ws, json!(["REQ", "s"])).await;
        let notice = next_frame(&mut ws, "NOTICE").await;
        assert!(notice[1].as_str().unwrap().contains("filter"));

        // Eleven filters: the extra one is dropped with a NOTICE, then EOSE.
        let mut frame = vec![json!("REQ"), json!("s")];
        for k in 0..11 {
            frame.push(json!({"kinds": [k]}));
        }
        send_json(&mut ws, Value::Array(frame)).await;
        let notice = next_frame(&mut ws, "NOTICE").await;
        assert!(notice[1].as_str().unwrap().starts_with("truncated:"));
        next_frame(&mut ws, "EOSE").await;
    }

    #[tokio::test]
    async fn rate_limit_rejects_excess_frames() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_settings();
        cfg.max_frames_per_minute = 2;
        let addr = spawn_relay(&dir, cfg).await;
        let mut ws = connect(addr).await;

        send_json(&mut ws, json!(["REQ", "a", {}])).await;
        next_frame(&mut ws, "EOSE").await;
        send_json(&mut ws, json!(["REQ", "b", {}])).await;
        next_frame(&mut ws, "EOSE").await;
        // Third frame exceeds the bucket.
        send_json(&mut ws, json!(["REQ", "c", {}])).await;
        let notice = next_frame(&mut ws, "NOTICE").await;
        assert!(notice[1].as_str().unwrap().starts_with("rate-limited"));

        // An EVENT over the limit gets a rate-limited OK instead.
        let ev = signed(1, event::unix_now(), vec![], "over");
        send_json(&mut ws, json!(["EVENT", ev])).await;
        let ok = next_frame(&mut ws, "OK").await;
        assert_eq!(ok[2], false);
        assert!(ok[3].as_str().unwrap().starts_with("rate-limited"));
    }

    #[test]
    fn token_bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(60);
        for _ in 0..60 {
            assert!(bucket.allow());
        }
        assert!(!bucket.allow());
        // Simulate a second passing; one token returns.
        bucket.last -= Duration::from_secs(1);
        assert!(bucket.allow());
        assert!(!bucket.allow());
    }

    #[test]
    fn disabled_token_bucket_always_allows() {
        let mut bucket = TokenBucket::new(0);
        for _ in 0..10_000 {
            assert!(bucket.allow());
        }
    }
}
