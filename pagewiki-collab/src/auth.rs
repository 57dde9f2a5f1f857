//! JWT-based identity for collaboration sessions and search.
//!
//! Tokens are optional unless `require_auth` is set. A token carries the
//! opaque user id, a capability list and an optional page glob allow-list.
//! Two secrets may be configured at once so signing keys can be rotated via
//! the `kid` header.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use glob_match::glob_match;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use pagewiki_types::UserId;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const PRIMARY_KID: &str = "primary";
pub const PREVIOUS_KID: &str = "previous";

/// Capabilities that can be granted to a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Join a page and receive its state.
    Read,
    /// Submit updates.
    Edit,
    Search,
}

impl Capability {
    pub fn all() -> Vec<Capability> {
        vec![Capability::Read, Capability::Edit, Capability::Search]
    }
}

/// JWT claims structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Opaque user id
    pub sub: String,
    /// Allowed page patterns (glob). None = all pages allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_pages: Option<Vec<String>>,
    pub capabilities: Vec<Capability>,
    /// Expiry (Unix timestamp)
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

impl Claims {
    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    pub fn page_allowed(&self, page: &str) -> bool {
        match &self.allowed_pages {
            None => true,
            Some(patterns) => patterns.iter().any(|pattern| glob_match(pattern, page)),
        }
    }

    /// Validate that this token can perform `cap`, optionally on `page`.
    pub fn authorize(&self, cap: Capability, page: Option<&str>) -> Result<(), AuthError> {
        if !self.has_capability(cap) {
            return Err(AuthError::MissingCapability(cap));
        }
        if let Some(p) = page {
            if !self.page_allowed(p) {
                return Err(AuthError::PageNotAllowed(p.to_string()));
            }
        }
        Ok(())
    }
}

/// Who is connecting and what they may do, with or without a token.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user: UserId,
    claims: Option<Claims>,
}

impl Identity {
    /// No token: the anonymous user with every capability.
    pub fn from_claims(claims: Option<Claims>) -> Self {
        match claims {
            Some(c) => Self {
                user: UserId::new(c.sub.clone()),
                claims: Some(c),
            },
            None => Self {
                user: UserId::anonymous(),
                claims: None,
            },
        }
    }

    pub fn authorize(&self, cap: Capability, page: Option<&str>) -> Result<(), AuthError> {
        match &self.claims {
            Some(c) => c.authorize(cap, page),
            None => Ok(()),
        }
    }
}

/// Errors during authentication/authorization.
#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidToken(String),
    Expired,
    MissingCapability(Capability),
    PageNotAllowed(String),
    UnknownKeyId(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::MissingToken => write!(f, "missing authorization token"),
            AuthError::InvalidToken(msg) => write!(f, "invalid token: {}", msg),
            AuthError::Expired => write!(f, "token expired"),
            AuthError::MissingCapability(cap) => write!(f, "missing capability: {:?}", cap),
            AuthError::PageNotAllowed(page) => write!(f, "page not allowed: {}", page),
            AuthError::UnknownKeyId(kid) => write!(f, "unknown key id: {}", kid),
        }
    }
}

impl std::error::Error for AuthError {}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthError::MissingToken
            | AuthError::InvalidToken(_)
            | AuthError::UnknownKeyId(_)
            | AuthError::Expired => StatusCode::UNAUTHORIZED,
            AuthError::MissingCapability(_) | AuthError::PageNotAllowed(_) => StatusCode::FORBIDDEN,
        };
        (status, self.to_string()).into_response()
    }
}

/// Holds signing keys for JWT verification.
/// Supports multiple keys via `kid` for rotation.
#[derive(Clone)]
pub struct KeyStore {
    keys: HashMap<String, DecodingKey>,
    /// Used when a token has no kid
    default_kid: Option<String>,
    expected_aud: Option<String>,
    /// Clock skew leeway in seconds
    leeway_secs: u64,
}

impl KeyStore {
    pub fn new() -> Self {
        Self {
            keys: HashMap::new(),
            default_kid: None,
            expected_aud: None,
            leeway_secs: 60,
        }
    }

    /// Add a key with the given id and secret. The first key added becomes
    /// the default.
    pub fn add_key(&mut self, kid: impl Into<String>, secret: impl AsRef<[u8]>) {
        let kid = kid.into();
        let key = DecodingKey::from_secret(secret.as_ref());
        if self.default_kid.is_none() {
            self.default_kid = Some(kid.clone());
        }
        self.keys.insert(kid, key);
    }

    pub fn set_expected_aud(&mut self, aud: impl Into<String>) {
        self.expected_aud = Some(aud.into());
    }

    pub fn set_leeway(&mut self, secs: u64) {
        self.leeway_secs = secs;
    }

    pub fn has_keys(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Decode and validate a JWT token.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        // Fail closed if no keys configured
        if self.keys.is_empty() {
            return Err(AuthError::InvalidToken("no keys configured".into()));
        }

        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        let kid = header
            .kid
            .or_else(|| self.default_kid.clone())
            .ok_or_else(|| AuthError::InvalidToken("no key id and no default key".into()))?;

        let key = self
            .keys
            .get(&kid)
            .ok_or_else(|| AuthError::UnknownKeyId(kid.clone()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = self.leeway_secs;

        if let Some(ref aud) = self.expected_aud {
            validation.set_audience(&[aud]);
        } else {
            validation.validate_aud = false;
        }

        let token_data = decode::<Claims>(token, key, &validation).map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
            jsonwebtoken::errors::ErrorKind::InvalidAudience => {
                AuthError::InvalidToken("audience mismatch".into())
            }
            _ => AuthError::InvalidToken(e.to_string()),
        })?;

        Ok(token_data.claims)
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for authentication.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Current signing secret (env: PAGEWIKI_AUTH_SECRET)
    pub secret: Option<String>,
    /// Secret being rotated out, still accepted under kid "previous"
    pub previous_secret: Option<String>,
    pub expected_aud: Option<String>,
    /// Whether a token is required (false = anonymous access allowed)
    pub require_auth: bool,
}

impl AuthConfig {
    pub fn build_keystore(&self) -> KeyStore {
        let mut store = KeyStore::new();
        if let Some(ref secret) = self.secret {
            store.add_key(PRIMARY_KID, secret.as_bytes());
        }
        if let Some(ref secret) = self.previous_secret {
            store.add_key(PREVIOUS_KID, secret.as_bytes());
        }
        if let Some(ref aud) = self.expected_aud {
            store.set_expected_aud(aud);
        }
        store
    }
}

/// Wrapper for optional authenticated claims (routes that work with or without auth)
#[derive(Debug, Clone)]
pub struct MaybeClaims(pub Option<Claims>);

/// State extension that holds auth config
#[derive(Clone)]
pub struct AuthState {
    pub keystore: Arc<KeyStore>,
    pub require_auth: bool,
}

fn extract_bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Browsers cannot set headers on a WebSocket upgrade, so `?token=` is
/// accepted as well.
fn extract_query_token(parts: &Parts) -> Option<&str> {
    parts
        .uri
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|t| !t.is_empty())
}

impl<S> FromRequestParts<S> for MaybeClaims
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(auth_state) = parts.extensions.get::<AuthState>().cloned() else {
            // No auth configured, allow through
            return Ok(MaybeClaims(None));
        };

        let Some(token) = extract_bearer_token(parts).or_else(|| extract_query_token(parts)) else {
            if auth_state.require_auth {
                return Err(AuthError::MissingToken);
            }
            return Ok(MaybeClaims(None));
        };

        match auth_state.keystore.verify(token) {
            Ok(claims) => Ok(MaybeClaims(Some(claims))),
            Err(e) => {
                warn!("auth failed: {}", e);
                Err(e)
            }
        }
    }
}

/// Mint a token signed under `kid`. Used by tests and operator tooling.
pub fn create_token(
    secret: &[u8],
    kid: &str,
    sub: &str,
    capabilities: Vec<Capability>,
    allowed_pages: Option<Vec<String>>,
    expires_in_secs: u64,
) -> Result<String> {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let now = u64::try_from(Utc::now().timestamp()).unwrap_or(0);
    let claims = Claims {
        sub: sub.to_string(),
        allowed_pages,
        capabilities,
        exp: now + expires_in_secs,
        aud: None,
    };

    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(kid.to_string());

    encode(&header, &claims, &EncodingKey::from_secret(secret))
        .map_err(|e| anyhow!("failed to encode token: {}", e))
}
