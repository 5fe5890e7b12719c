//! Session token envelopes
//!
//! A session token is a signed envelope around the caller's [`Claims`].
//! The signature only proves the claims were minted here; whether the
//! session is still live is decided by the credential store, which is why
//! the envelope's own `exp` is not enforced on decode.

use authz_core::Claims;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to encode session token: {0}")]
    Encoding(#[from] jsonwebtoken::errors::Error),

    #[error("Malformed session token")]
    Malformed,

    #[error("Invalid session token signature")]
    InvalidSignature,
}

/// Pluggable signing primitive for session tokens
pub trait TokenCodec: Send + Sync {
    fn encode(
        &self,
        jti: &str,
        claims: &Claims,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<String, CodecError>;

    fn decode(&self, token: &str) -> Result<Claims, CodecError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    iss: String,
    jti: String,
    iat: i64,
    exp: i64,
    #[serde(flatten)]
    claims: Claims,
}

/// HMAC-SHA256 signed envelopes
pub struct JwtCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
}

impl JwtCodec {
    pub fn new(secret: &str, issuer: impl Into<String>) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.into(),
        }
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.validate_exp = false;
        validation
    }
}

impl std::fmt::Debug for JwtCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtCodec")
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl TokenCodec for JwtCodec {
    fn encode(
        &self,
        jti: &str,
        claims: &Claims,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<String, CodecError> {
        let envelope = Envelope {
            iss: self.issuer.clone(),
            jti: jti.to_string(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
            claims: claims.clone(),
        };

        Ok(encode(
            &Header::new(Algorithm::HS256),
            &envelope,
            &self.encoding_key,
        )?)
    }

    fn decode(&self, token: &str) -> Result<Claims, CodecError> {
        let data = decode::<Envelope>(token, &self.decoding_key, &self.validation()).map_err(
            |e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::InvalidSignature => CodecError::InvalidSignature,
                _ => CodecError::Malformed,
            },
        )?;
        Ok(data.claims.claims)
    }
}
