//! Token issuer
//!
//! Creates, reads and invalidates every credential kind, and hashes and
//! checks passwords. Expiry is enforced here on every read (through
//! [`Credential::is_live`]); stale rows are deleted lazily and by the
//! periodic sweep.

use super::clock::Clock;
use super::codec::TokenCodec;
use super::models::{token_digest, Credential, CredentialKind};
use super::password::{self, PasswordConfig, PasswordError};
use super::store::{CredentialStore, StoreError, StoreGuard};
use authz_core::{AuthError, Claims, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, Rng, RngCore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};
use uuid::Uuid;

/// 256-bit random token, base64url without padding
pub fn generate_opaque_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn generate_otp() -> String {
    OsRng.gen_range(10_000..100_000).to_string()
}

/// OTP codes are only unique per user, so the stored key binds both
fn otp_key(user_id: Uuid, code: &str) -> String {
    format!("{user_id}:{code}")
}

pub struct TokenIssuer {
    store: Arc<dyn CredentialStore>,
    codec: Arc<dyn TokenCodec>,
    clock: Arc<dyn Clock>,
    guard: StoreGuard,
    password_config: PasswordConfig,
    revoke_prior_reset_tokens: bool,
}

impl TokenIssuer {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        codec: Arc<dyn TokenCodec>,
        clock: Arc<dyn Clock>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            codec,
            clock,
            guard: StoreGuard::new(store_timeout),
            password_config: PasswordConfig::default(),
            revoke_prior_reset_tokens: false,
        }
    }

    pub fn with_password_config(mut self, config: PasswordConfig) -> Self {
        self.password_config = config;
        self
    }

    pub fn with_revoke_prior_reset_tokens(mut self, revoke: bool) -> Self {
        self.revoke_prior_reset_tokens = revoke;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ------------------------------------------------------------------
    // Passwords
    // ------------------------------------------------------------------

    /// Salted Argon2id hash, computed on the blocking pool
    pub async fn hash_password(&self, plaintext: &str) -> Result<String> {
        let plaintext = plaintext.to_string();
        let config = self.password_config.clone();

        tokio::task::spawn_blocking(move || password::hash_password_with_config(&plaintext, &config))
            .await
            .map_err(|e| AuthError::Internal(format!("hashing task failed: {e}")))?
            .map_err(|e| match e {
                PasswordError::Empty => AuthError::WeakInput("password must not be empty".into()),
                other => {
                    error!(error = %other, "Password hashing failed");
                    AuthError::Internal("password hashing failed".into())
                }
            })
    }

    /// Never errors; a mismatch, a malformed hash or a failed task is `false`
    pub async fn verify_password(&self, hash: &str, plaintext: &str) -> bool {
        let hash = hash.to_string();
        let plaintext = plaintext.to_string();

        tokio::task::spawn_blocking(move || password::verify_password(&hash, &plaintext))
            .await
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Issuance
    // ------------------------------------------------------------------

    /// Mint a session token carrying `claims` and persist its row
    pub async fn issue_session(
        &self,
        claims: &Claims,
        ttl: Duration,
    ) -> Result<(String, DateTime<Utc>)> {
        let now = self.now();
        let jti = generate_opaque_token();
        let credential = Credential::new(CredentialKind::Session, "", claims.user_id, now, ttl)
            .with_org(claims.org_id);

        let token = self
            .codec
            .encode(&jti, claims, now, credential.expires_at)
            .map_err(|e| {
                error!(error = %e, "Session token encoding failed");
                AuthError::Internal("session token encoding failed".into())
            })?;

        let credential = Credential {
            token_hash: token_digest(&token),
            ..credential
        };
        let expires_at = credential.expires_at;
        self.insert(credential).await?;

        Ok((token, expires_at))
    }

    pub async fn issue_refresh_token(
        &self,
        user_id: Uuid,
        ttl: Duration,
    ) -> Result<(String, DateTime<Utc>)> {
        let token = generate_opaque_token();
        let credential = Credential::new(CredentialKind::Refresh, &token, user_id, self.now(), ttl);
        let expires_at = credential.expires_at;
        self.insert(credential).await?;
        Ok((token, expires_at))
    }

    /// Earlier unexpired reset tokens stay valid unless configured otherwise
    pub async fn issue_password_reset(&self, user_id: Uuid, ttl: Duration) -> Result<String> {
        if self.revoke_prior_reset_tokens {
            self.revoke_all(CredentialKind::PasswordReset, user_id).await?;
        }

        let token = Uuid::new_v4().to_string();
        self.insert(Credential::new(
            CredentialKind::PasswordReset,
            &token,
            user_id,
            self.now(),
            ttl,
        ))
        .await?;
        Ok(token)
    }

    /// Five-digit code; replaces any outstanding code for the user
    pub async fn issue_password_reset_otp(&self, user_id: Uuid, ttl: Duration) -> Result<String> {
        self.revoke_all(CredentialKind::PasswordResetOtp, user_id).await?;

        let code = generate_otp();
        self.insert(Credential::new(
            CredentialKind::PasswordResetOtp,
            &otp_key(user_id, &code),
            user_id,
            self.now(),
            ttl,
        ))
        .await?;
        Ok(code)
    }

    /// Supersedes any verification token previously issued to the user
    pub async fn issue_email_verification(&self, user_id: Uuid, ttl: Duration) -> Result<String> {
        self.revoke_all(CredentialKind::EmailVerification, user_id).await?;

        let token = Uuid::new_v4().to_string();
        self.insert(Credential::new(
            CredentialKind::EmailVerification,
            &token,
            user_id,
            self.now(),
            ttl,
        ))
        .await?;
        Ok(token)
    }

    async fn insert(&self, credential: Credential) -> Result<()> {
        let kind = credential.kind;
        self.guard
            .try_call("insert_credential", self.store.insert_credential(credential))
            .await?
            .map_err(|e| match e {
                StoreError::Conflict(_) => {
                    error!(kind = %kind, "Generated credential collided with an existing one");
                    AuthError::Internal("credential collision".into())
                }
                other => other.into(),
            })
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Look up a live credential without consuming it
    ///
    /// An expired row is deleted on sight and reported as `Expired`.
    pub async fn peek_token(&self, kind: CredentialKind, token: &str) -> Result<Credential> {
        self.live(kind, &token_digest(token)).await
    }

    /// Accept a credential exactly once
    ///
    /// The row is deleted as part of acceptance; when two callers race on
    /// the same token only the one whose delete succeeds gets it.
    pub async fn consume_token(&self, kind: CredentialKind, token: &str) -> Result<Credential> {
        let hash = token_digest(token);
        let credential = self.live(kind, &hash).await?;

        let removed = self
            .guard
            .call("delete_credential", self.store.delete_credential(kind, &hash))
            .await?;
        if !removed {
            return Err(AuthError::NotFound);
        }
        Ok(credential)
    }

    pub async fn consume_otp(&self, user_id: Uuid, code: &str) -> Result<Credential> {
        self.consume_token(CredentialKind::PasswordResetOtp, &otp_key(user_id, code))
            .await
    }

    async fn live(&self, kind: CredentialKind, hash: &str) -> Result<Credential> {
        let credential = self
            .guard
            .call("find_credential", self.store.find_credential(kind, hash))
            .await?
            .ok_or(AuthError::NotFound)?;

        if credential.is_live(self.now()) {
            return Ok(credential);
        }

        if let Err(e) = self
            .guard
            .call("delete_credential", self.store.delete_credential(kind, hash))
            .await
        {
            debug!(kind = %kind, error = %e, "Stale credential left for the sweep");
        }
        Err(AuthError::Expired)
    }

    /// Verify the envelope of a session token and return its claims
    pub fn decode_session(&self, token: &str) -> Result<Claims> {
        self.codec.decode(token).map_err(|e| {
            debug!(error = %e, "Session envelope rejected");
            AuthError::InvalidToken
        })
    }

    /// Live credentials of one kind belonging to a user
    pub async fn list_live(&self, kind: CredentialKind, user_id: Uuid) -> Result<Vec<Credential>> {
        let now = self.now();
        let credentials = self
            .guard
            .call(
                "list_user_credentials",
                self.store.list_user_credentials(kind, user_id),
            )
            .await?;
        Ok(credentials.into_iter().filter(|c| c.is_live(now)).collect())
    }

    // ------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------

    /// Idempotent; returns whether a row was removed
    pub async fn revoke(&self, kind: CredentialKind, token: &str) -> Result<bool> {
        self.guard
            .call(
                "delete_credential",
                self.store.delete_credential(kind, &token_digest(token)),
            )
            .await
    }

    pub async fn revoke_all(&self, kind: CredentialKind, user_id: Uuid) -> Result<u64> {
        self.guard
            .call(
                "delete_user_credentials",
                self.store.delete_user_credentials(kind, user_id),
            )
            .await
    }

    /// Purge every expired row
    pub async fn sweep_expired(&self) -> Result<u64> {
        let now = self.now();
        self.guard
            .call("purge_expired", self.store.purge_expired(now))
            .await
    }
}
