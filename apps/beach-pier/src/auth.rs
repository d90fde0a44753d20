use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

type HmacSha256 = Hmac<sha2::Sha256>;

/// Tokens expiring sooner than this are re-signed on refresh.
const REFRESH_WINDOW: Duration = Duration::minutes(15);
const REFRESH_LIFETIME: Duration = Duration::hours(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    /// Relay token signed with the shared secret.
    Token,
    /// JWT validated on every use.
    Bearer,
    /// Unauthenticated session accepted in insecure mode.
    Anonymous,
}

#[derive(Debug, Clone)]
pub struct AuthToken {
    pub kind: AuthKind,
    pub subject: String,
    /// Raw credential as presented by the client.
    pub value: String,
    pub expires_at: Option<OffsetDateTime>,
    pub claims: Map<String, Value>,
}

impl AuthToken {
    pub fn anonymous(subject: impl Into<String>) -> Self {
        Self {
            kind: AuthKind::Anonymous,
            subject: subject.into(),
            value: String::new(),
            expires_at: None,
            claims: Map::new(),
        }
    }

    /// Display name claim, falling back to the subject.
    pub fn name(&self) -> String {
        self.claims
            .get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.subject)
            .to_string()
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing authorization")]
    Missing,
    #[error("unsupported authorization scheme {0}")]
    UnsupportedScheme(String),
    #[error("malformed token: {0}")]
    Malformed(&'static str),
    #[error("token signature mismatch")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("token missing subject")]
    MissingSubject,
    #[error("bearer validation failed: {0}")]
    Bearer(#[from] jsonwebtoken::errors::Error),
    #[error("token encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Source of truth for client credentials.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Validates an `Authorization` header value (`<scheme> <credentials>`).
    async fn authenticate(&self, authorization: &str) -> Result<AuthToken, AuthError>;

    /// Re-checks a relay token previously produced by `authenticate`.
    fn is_valid_token(&self, token: &AuthToken) -> bool;

    /// Extends the token's lifetime. Returns a freshly signed token when the
    /// client should replace the credential it holds.
    fn refresh_token(&self, token: &AuthToken) -> Option<AuthToken>;

    async fn validate_bearer(&self, raw: &str) -> Result<(String, Map<String, Value>), AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct RelayClaims {
    sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    exp: i64,
}

/// Issues and validates relay tokens and HS256 bearer tokens with one
/// shared secret.
#[derive(Clone)]
pub struct SharedSecretAuthenticator {
    secret: Vec<u8>,
}

impl SharedSecretAuthenticator {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    pub fn issue(
        &self,
        subject: &str,
        name: Option<&str>,
        ttl: std::time::Duration,
    ) -> Result<String, AuthError> {
        let ttl = Duration::try_from(ttl).map_err(|_| AuthError::Malformed("ttl out of range"))?;
        let claims = RelayClaims {
            sub: subject.to_string(),
            name: name.map(str::to_string),
            exp: (OffsetDateTime::now_utc() + ttl).unix_timestamp(),
        };
        self.sign(&claims)
    }

    fn sign(&self, claims: &RelayClaims) -> Result<String, AuthError> {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{payload}.{signature}"))
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|_| AuthError::Malformed("signing key"))
    }

    fn decode_relay_token(&self, value: &str) -> Result<AuthToken, AuthError> {
        let (payload, signature) = value
            .split_once('.')
            .ok_or(AuthError::Malformed("missing signature"))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::Malformed("signature encoding"))?;
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AuthError::Malformed("payload encoding"))?;
        let claims: RelayClaims = serde_json::from_slice(&bytes)?;
        if claims.sub.trim().is_empty() {
            return Err(AuthError::MissingSubject);
        }
        let expires_at = OffsetDateTime::from_unix_timestamp(claims.exp)
            .map_err(|_| AuthError::Malformed("expiry out of range"))?;
        if expires_at <= OffsetDateTime::now_utc() {
            return Err(AuthError::Expired);
        }

        let mut extra = Map::new();
        if let Some(name) = claims.name {
            extra.insert("name".to_string(), Value::String(name));
        }
        Ok(AuthToken {
            kind: AuthKind::Token,
            subject: claims.sub,
            value: value.to_string(),
            expires_at: Some(expires_at),
            claims: extra,
        })
    }
}

#[async_trait]
impl Authenticator for SharedSecretAuthenticator {
    async fn authenticate(&self, authorization: &str) -> Result<AuthToken, AuthError> {
        let (scheme, credentials) = authorization
            .trim()
            .split_once(' ')
            .ok_or(AuthError::Missing)?;
        let credentials = credentials.trim();
        if credentials.is_empty() {
            return Err(AuthError::Missing);
        }
        match scheme.to_ascii_lowercase().as_str() {
            "token" => self.decode_relay_token(credentials),
            "bearer" => {
                let (subject, claims) = self.validate_bearer(credentials).await?;
                let expires_at = claims
                    .get("exp")
                    .and_then(Value::as_i64)
                    .and_then(|exp| OffsetDateTime::from_unix_timestamp(exp).ok());
                Ok(AuthToken {
                    kind: AuthKind::Bearer,
                    subject,
                    value: credentials.to_string(),
                    expires_at,
                    claims,
                })
            }
            other => Err(AuthError::UnsupportedScheme(other.to_string())),
        }
    }

    fn is_valid_token(&self, token: &AuthToken) -> bool {
        match token.kind {
            AuthKind::Token => self
                .decode_relay_token(&token.value)
                .is_ok_and(|decoded| decoded.subject == token.subject),
            AuthKind::Bearer => !token.is_expired(OffsetDateTime::now_utc()),
            AuthKind::Anonymous => true,
        }
    }

    fn refresh_token(&self, token: &AuthToken) -> Option<AuthToken> {
        if token.kind != AuthKind::Token || !self.is_valid_token(token) {
            return None;
        }
        let now = OffsetDateTime::now_utc();
        let expires_at = token.expires_at?;
        if expires_at > now + REFRESH_WINDOW {
            return None;
        }
        let claims = RelayClaims {
            sub: token.subject.clone(),
            name: token
                .claims
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string),
            exp: (now + REFRESH_LIFETIME).unix_timestamp(),
        };
        let value = self.sign(&claims).ok()?;
        self.decode_relay_token(&value).ok()
    }

    async fn validate_bearer(&self, raw: &str) -> Result<(String, Map<String, Value>), AuthError> {
        let key = DecodingKey::from_secret(&self.secret);
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Map<String, Value>>(raw, &key, &validation)?;
        let subject = data
            .claims
            .get("sub")
            .and_then(Value::as_str)
            .filter(|sub| !sub.trim().is_empty())
            .ok_or(AuthError::MissingSubject)?
            .to_string();
        Ok((subject, data.claims))
    }
}
