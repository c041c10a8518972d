/// REST client for the Flux backend
///
/// Endpoints (JSON over HTTP/1.1, bearer token):
///   POST   /auth/login                     body: {"username","password"}
///   POST   /auth/register                  body: {"username","email","password"}
///   GET    /posts | /posts/:id
///   POST   /posts                          body: {"caption","image_url"}
///   PUT    /posts/:id | DELETE /posts/:id | POST /posts/:id/like
///   GET    /feed                           ?page=N&limit=N
///   GET    /friends/followers | /friends/following
///   GET    /friends/users                  ?page=N&limit=N
///   GET    /friends/search                 ?q=...
///   GET    /friends/status/:id
///   POST   /friends/follow                 body: {"user_id"}
///   DELETE /friends/unfollow/:id
///   POST   /messages                       body: {"receiver_id","content"}
///   GET    /messages/conversation          ?user_id=N
use crate::config::Config;
use crate::error::{FluxError, Result};
use crate::messenger_types::{
    AuthToken, FeedPage, Message, Peer, Post, UserId, UserPage, UserProfile,
};
use crate::session::Session;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

// ─── Messaging seam ──────────────────────────────────────────────────────────

/// The part of the REST surface the messaging core depends on
#[async_trait]
pub trait MessagingBackend: Send + Sync {
    /// Authoritative history between the caller and `peer_id`
    async fn conversation(&self, peer_id: UserId) -> Result<Vec<Message>>;

    /// Persist an outbound message; returns the server-confirmed record
    async fn send_message(&self, receiver_id: UserId, content: &str) -> Result<Message>;

    /// Users the caller follows
    async fn following(&self) -> Result<Vec<Peer>>;

    /// One page of all users
    async fn users(&self, page: u32, limit: u32) -> Result<UserPage>;
}

// ─── Client ──────────────────────────────────────────────────────────────────

type HttpClient = Client<HttpConnector, Full<Bytes>>;

#[derive(Clone)]
pub struct ApiClient {
    base: String,
    token: Option<String>,
    timeout: Duration,
    http: HttpClient,
}

impl ApiClient {
    /// Unauthenticated client (enough for login/register)
    pub fn new(config: &Config) -> Self {
        Self {
            base: config.api_url.trim_end_matches('/').to_string(),
            token: None,
            timeout: config.request_timeout,
            http: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    pub fn for_session(config: &Config, session: &Session) -> Self {
        Self::new(config).with_token(session.token())
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    // ── Auth ──

    pub async fn login(&self, username: &str, password: &str) -> Result<String> {
        let value = self
            .call(
                Method::POST,
                "/auth/login",
                Some(json!({ "username": username, "password": password })),
            )
            .await?;
        let auth: AuthToken = decode(value, "POST /auth/login")?;
        Ok(auth.token)
    }

    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<String> {
        let value = self
            .call(
                Method::POST,
                "/auth/register",
                Some(json!({ "username": username, "email": email, "password": password })),
            )
            .await?;
        let auth: AuthToken = decode(value, "POST /auth/register")?;
        Ok(auth.token)
    }

    // ── Posts ──

    pub async fn posts(&self) -> Result<Vec<Post>> {
        let value = self.call(Method::GET, "/posts", None).await?;
        take_list(value, "posts", "GET /posts")
    }

    pub async fn post(&self, id: u64) -> Result<Post> {
        let value = self.call(Method::GET, &format!("/posts/{}", id), None).await?;
        take_field(value, "post", "GET /posts/:id")
    }

    pub async fn create_post(&self, caption: &str, image_url: &str) -> Result<Post> {
        let value = self
            .call(
                Method::POST,
                "/posts",
                Some(json!({ "caption": caption, "image_url": image_url })),
            )
            .await?;
        take_field(value, "post", "POST /posts")
    }

    pub async fn update_post(&self, id: u64, caption: &str, image_url: &str) -> Result<Post> {
        let value = self
            .call(
                Method::PUT,
                &format!("/posts/{}", id),
                Some(json!({ "caption": caption, "image_url": image_url })),
            )
            .await?;
        take_field(value, "post", "PUT /posts/:id")
    }

    pub async fn delete_post(&self, id: u64) -> Result<()> {
        self.call(Method::DELETE, &format!("/posts/{}", id), None).await?;
        Ok(())
    }

    pub async fn like_post(&self, id: u64) -> Result<Post> {
        let value = self
            .call(Method::POST, &format!("/posts/{}/like", id), None)
            .await?;
        take_field(value, "post", "POST /posts/:id/like")
    }

    pub async fn feed(&self, page: u32, limit: u32) -> Result<FeedPage> {
        let value = self
            .call(Method::GET, &format!("/feed?page={}&limit={}", page, limit), None)
            .await?;
        decode(value, "GET /feed")
    }

    // ── Friends ──

    pub async fn followers(&self) -> Result<Vec<Peer>> {
        let value = self.call(Method::GET, "/friends/followers", None).await?;
        follow_entries(value, "followers", "follower")
    }

    pub async fn search_users(&self, query: &str) -> Result<Vec<UserProfile>> {
        let path = format!("/friends/search?q={}", urlencoding::encode(query));
        let value = self.call(Method::GET, &path, None).await?;
        take_list(value, "users", "GET /friends/search")
    }

    pub async fn follow_status(&self, user_id: UserId) -> Result<bool> {
        let value = self
            .call(Method::GET, &format!("/friends/status/{}", user_id), None)
            .await?;
        take_field(value, "is_following", "GET /friends/status/:id")
    }

    pub async fn follow(&self, user_id: UserId) -> Result<()> {
        self.call(Method::POST, "/friends/follow", Some(json!({ "user_id": user_id })))
            .await?;
        Ok(())
    }

    pub async fn unfollow(&self, user_id: UserId) -> Result<()> {
        self.call(Method::DELETE, &format!("/friends/unfollow/{}", user_id), None)
            .await?;
        Ok(())
    }

    // ── Transport ──

    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let label = format!("{} {}", method, path);
        let uri = format!("{}{}", self.base, path);

        let mut builder = Request::builder()
            .method(method)
            .uri(&uri)
            .header(CONTENT_TYPE, "application/json");
        if let Some(token) = &self.token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let payload = match body {
            Some(v) => Bytes::from(serde_json::to_vec(&v).map_err(FluxError::Serialization)?),
            None => Bytes::new(),
        };
        let req = builder
            .body(Full::new(payload))
            .map_err(|e| FluxError::Http(format!("{}: invalid request: {}", label, e)))?;

        let resp = timeout(self.timeout, self.http.request(req))
            .await
            .map_err(|_| FluxError::Timeout(label.clone()))?
            .map_err(|e| FluxError::Http(format!("{}: {}", label, e)))?;
        let status = resp.status();
        let bytes = timeout(self.timeout, resp.into_body().collect())
            .await
            .map_err(|_| FluxError::Timeout(label.clone()))?
            .map_err(|e| FluxError::Http(format!("{}: body read error: {}", label, e)))?
            .to_bytes();
        debug!("{} -> {} ({} bytes)", label, status, bytes.len());

        let value: Value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .map_err(|e| FluxError::Protocol(format!("{}: invalid JSON body: {}", label, e)))?
        };

        let error = value.get("error").and_then(Value::as_str).map(str::to_string);
        if status == StatusCode::UNAUTHORIZED {
            return Err(FluxError::Unauthorized(
                error.unwrap_or_else(|| "token rejected".to_string()),
            ));
        }
        if let Some(message) = error {
            warn!("{} failed with {}: {}", label, status, message);
            return Err(FluxError::Api {
                status: status.as_u16(),
                message,
            });
        }
        if !status.is_success() {
            return Err(FluxError::Api {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("request failed").to_string(),
            });
        }
        Ok(value)
    }
}

#[async_trait]
impl MessagingBackend for ApiClient {
    async fn conversation(&self, peer_id: UserId) -> Result<Vec<Message>> {
        let value = self
            .call(
                Method::GET,
                &format!("/messages/conversation?user_id={}", peer_id),
                None,
            )
            .await?;
        take_list(value, "messages", "GET /messages/conversation")
    }

    async fn send_message(&self, receiver_id: UserId, content: &str) -> Result<Message> {
        let value = self
            .call(
                Method::POST,
                "/messages",
                Some(json!({ "receiver_id": receiver_id, "content": content })),
            )
            .await?;
        take_field(value, "message", "POST /messages")
    }

    async fn following(&self) -> Result<Vec<Peer>> {
        let value = self.call(Method::GET, "/friends/following", None).await?;
        follow_entries(value, "following", "following")
    }

    async fn users(&self, page: u32, limit: u32) -> Result<UserPage> {
        let value = self
            .call(
                Method::GET,
                &format!("/friends/users?page={}&limit={}", page, limit),
                None,
            )
            .await?;
        decode(value, "GET /friends/users")
    }
}

// ─── Decoding helpers ────────────────────────────────────────────────────────

fn decode<T: DeserializeOwned>(value: Value, label: &str) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| FluxError::Protocol(format!("{}: unexpected response shape: {}", label, e)))
}

fn take_field<T: DeserializeOwned>(mut value: Value, key: &str, label: &str) -> Result<T> {
    match value.get_mut(key).map(Value::take) {
        Some(field) => decode(field, label),
        None => Err(FluxError::Protocol(format!("{}: missing `{}` in response", label, key))),
    }
}

// A missing or null list is an empty list.
fn take_list<T: DeserializeOwned>(mut value: Value, key: &str, label: &str) -> Result<Vec<T>> {
    match value.get_mut(key).map(Value::take) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(list) => decode(list, label),
    }
}

/// Follow-graph entries wrap the user under `inner`; tolerate bare users too
fn follow_entries(value: Value, key: &str, inner: &str) -> Result<Vec<Peer>> {
    let label = format!("GET /friends/{}", key);
    let entries: Vec<Value> = take_list(value, key, &label)?;
    entries
        .into_iter()
        .map(|mut entry| {
            let user = match entry.get_mut(inner).map(Value::take) {
                Some(user) if user.is_object() => user,
                _ => entry,
            };
            decode::<UserProfile>(user, &label).map(Peer::from)
        })
        .collect()
}
