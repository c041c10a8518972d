/// Session identity: who is signed in, derived from the trust token
use crate::error::{FluxError, Result};
use crate::messenger_types::{Actor, UserId};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const SESSION_FILE: &str = "session.json";

/// Derive the signed-in actor.
///
/// A cached profile wins. Otherwise the middle segment of a three-segment
/// token is decoded as a JSON claims object carrying `user_id` and
/// `username`. Anything malformed yields `None` (anonymous).
pub fn resolve_actor(token: Option<&str>, cached: Option<&Actor>) -> Option<Actor> {
    if let Some(actor) = cached {
        return Some(actor.clone());
    }
    let claims = decode_claims(token?)?;
    let id = claim_as_id(claims.get("user_id")?)?;
    let username = claims
        .get("username")
        .and_then(Value::as_str)
        .unwrap_or("Unknown")
        .to_string();
    Some(Actor { id, username })
}

fn decode_claims(token: &str) -> Option<serde_json::Map<String, Value>> {
    let mut segments = token.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() || payload.is_empty() {
        return None;
    }
    let bytes = general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

// JSON numbers from the token issuer may arrive as floats (`5.0`) or strings.
fn claim_as_id(value: &Value) -> Option<UserId> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= u64::MAX as f64)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Explicit session context handed to the channel, store and composer
#[derive(Debug, Clone)]
pub struct Session {
    token: String,
    actor: Actor,
    expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Start a session; `None` when no actor can be derived (anonymous)
    pub fn init(token: impl Into<String>, cached: Option<Actor>) -> Option<Self> {
        let token = token.into();
        let actor = resolve_actor(Some(&token), cached.as_ref())?;
        let expires_at = decode_claims(&token)
            .and_then(|claims| claims.get("exp").and_then(Value::as_i64))
            .and_then(|exp| DateTime::from_timestamp(exp, 0));
        debug!("Session initialised for user {} ({})", actor.username, actor.id);
        Some(Self {
            token,
            actor,
            expires_at,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| exp <= now).unwrap_or(false)
    }

    /// End the session; token and actor are dropped with it
    pub fn teardown(self) {
        debug!("Session for user {} torn down", self.actor.id);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionFileV1 {
    version: u8,
    token: String,
    user: Option<Actor>,
}

/// Login remembered between CLI invocations (`<data_dir>/session.json`)
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(SESSION_FILE),
        }
    }

    /// Load the stored session, if any
    pub fn load(&self) -> Result<Option<Session>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path).map_err(FluxError::Io)?;
        let parsed: SessionFileV1 = serde_json::from_str(&raw).map_err(FluxError::Serialization)?;
        if parsed.version != 1 {
            return Err(FluxError::Config(format!(
                "Unsupported session file version: {}",
                parsed.version
            )));
        }
        Ok(Session::init(parsed.token, parsed.user))
    }

    pub fn save(&self, session: &Session) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(FluxError::Io)?;
        }
        let file = SessionFileV1 {
            version: 1,
            token: session.token.clone(),
            user: Some(session.actor.clone()),
        };
        let json = serde_json::to_string_pretty(&file).map_err(FluxError::Serialization)?;
        fs::write(&self.path, json).map_err(FluxError::Io)?;

        // Best-effort file permissions (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600));
        }
        Ok(())
    }

    /// Forget the stored session; returns whether one existed
    pub fn clear(&self) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        fs::remove_file(&self.path).map_err(FluxError::Io)?;
        Ok(true)
    }
}

#[cfg(test)]
pub(crate) fn test_token(claims: &Value) -> String {
    let header = general_purpose::URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = general_purpose::URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.signature", header, payload)
}
