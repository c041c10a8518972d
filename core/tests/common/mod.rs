#![allow(dead_code)]
/// Shared fixtures: an in-memory messaging backend with controllable latency
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use flux_core::api::MessagingBackend;
use flux_core::messenger_types::{Message, Peer, UserId, UserPage, UserProfile};
use flux_core::{FluxError, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

pub const ME: UserId = 1;

pub fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

/// Message with an id between `from` and `to`
pub fn msg(id: u64, from: UserId, to: UserId, secs: i64) -> Message {
    Message::new(Some(id), from, to, format!("message {}", id), ts(secs))
}

pub fn ids(messages: &[Message]) -> Vec<u64> {
    messages.iter().filter_map(|m| m.id).collect()
}

pub fn profile(id: UserId, username: &str) -> UserProfile {
    UserProfile {
        id,
        username: username.to_string(),
        email: None,
        followers_count: 0,
        following_count: 0,
        is_following: None,
    }
}

/// Unsigned three-segment token carrying the given claims
pub fn token_for(user_id: UserId, username: &str) -> String {
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let header = engine.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = serde_json::json!({
        "user_id": user_id as f64,
        "username": username,
        "exp": 4_102_444_800u64,
    });
    let payload = engine.encode(claims.to_string());
    format!("{}.{}.sig", header, payload)
}

#[derive(Default)]
struct Inner {
    histories: HashMap<UserId, Vec<Message>>,
    history_gates: HashMap<UserId, VecDeque<oneshot::Receiver<()>>>,
    send_gates: VecDeque<oneshot::Receiver<()>>,
    following: Vec<Peer>,
    users: Vec<UserProfile>,
}

/// In-memory stand-in for the REST API, scoped to one signed-in user
pub struct FakeBackend {
    me: UserId,
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    fail_sends: AtomicBool,
    pub history_calls: AtomicUsize,
    pub send_calls: AtomicUsize,
    pub users_calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new(me: UserId) -> Arc<Self> {
        Arc::new(Self {
            me,
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(1000),
            fail_sends: AtomicBool::new(false),
            history_calls: AtomicUsize::new(0),
            send_calls: AtomicUsize::new(0),
            users_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_history(&self, peer_id: UserId, messages: Vec<Message>) {
        self.inner.lock().unwrap().histories.insert(peer_id, messages);
    }

    /// Next history fetch for `peer_id` blocks until the returned sender fires
    pub fn hold_history(&self, peer_id: UserId) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .unwrap()
            .history_gates
            .entry(peer_id)
            .or_default()
            .push_back(rx);
        tx
    }

    /// Next send blocks until the returned sender fires
    pub fn hold_send(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().unwrap().send_gates.push_back(rx);
        tx
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn set_following(&self, peers: Vec<Peer>) {
        self.inner.lock().unwrap().following = peers;
    }

    pub fn set_users(&self, users: Vec<UserProfile>) {
        self.inner.lock().unwrap().users = users;
    }
}

#[async_trait]
impl MessagingBackend for FakeBackend {
    async fn conversation(&self, peer_id: UserId) -> Result<Vec<Message>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self
            .inner
            .lock()
            .unwrap()
            .history_gates
            .get_mut(&peer_id)
            .and_then(VecDeque::pop_front);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(self
            .inner
            .lock()
            .unwrap()
            .histories
            .get(&peer_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(&self, receiver_id: UserId, content: &str) -> Result<Message> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.inner.lock().unwrap().send_gates.pop_front();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(FluxError::Http("connection refused".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = Message::new(Some(id), self.me, receiver_id, content, Utc::now());
        self.inner
            .lock()
            .unwrap()
            .histories
            .entry(receiver_id)
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn following(&self) -> Result<Vec<Peer>> {
        Ok(self.inner.lock().unwrap().following.clone())
    }

    async fn users(&self, page: u32, limit: u32) -> Result<UserPage> {
        self.users_calls.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();
        let limit = limit.max(1) as usize;
        let total = inner.users.len();
        let start = (page.saturating_sub(1) as usize) * limit;
        let users = inner.users.iter().skip(start).take(limit).cloned().collect();
        Ok(UserPage {
            users,
            page,
            limit: limit as u32,
            total_pages: total.div_ceil(limit) as u64,
            total_count: total as u64,
        })
    }
}
