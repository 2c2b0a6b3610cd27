//! Capability tokens: signed, opaque, single-use.
//!
//! The token itself is an HS256 JWT attesting `{token_id, file_path,
//! tunnel_id, iat, exp}`. Possession is the only credential in the system.
//! Single use is enforced against the state store: consumption is a
//! compare-and-set of the record's `consumed` field, so exactly one of any
//! number of concurrent presentations wins.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;
use utils::auth::TokenSigner;
use utils::id::TunnelId;
use uuid::Uuid;

use crate::metrics::{TOKENS_CONSUMED, TOKENS_MINTED, TOKENS_REJECTED, TOKENS_SWEPT};
use crate::store::{CasOutcome, StateStore, StoreError};

/// Floor for requested token lifetimes; the ceiling is the configured
/// maximum tunnel lifetime.
pub const MIN_TOKEN_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Bad signature, expired, already consumed, malformed: deliberately
    /// one opaque variant, the public boundary must not leak which.
    #[error("invalid token")]
    Invalid,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub token_id: Uuid,
    pub file_path: String,
    pub tunnel_id: TunnelId,
    pub iat: i64,
    pub exp: i64,
}

fn token_key(token_id: Uuid) -> String {
    format!("token:{token_id}")
}

pub struct TokenService {
    signer: TokenSigner,
    store: Arc<dyn StateStore>,
    max_ttl: Duration,
}

impl TokenService {
    pub fn new(
        secret: &[u8],
        store: Arc<dyn StateStore>,
        max_ttl: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            signer: TokenSigner::new(secret)?,
            store,
            max_ttl,
        })
    }

    pub fn clamp_ttl(&self, requested: Duration) -> Duration {
        requested.clamp(MIN_TOKEN_TTL, self.max_ttl)
    }

    /// Mint a token bound to a file and tunnel. The requested TTL is
    /// clamped into `[60s, max_tunnel_lifetime]`.
    pub async fn mint(
        &self,
        file_path: &str,
        ttl: Duration,
        tunnel_id: TunnelId,
    ) -> Result<String, TokenError> {
        let ttl = self.clamp_ttl(ttl);
        let now = Utc::now().timestamp();
        let claims = TokenClaims {
            token_id: Uuid::new_v4(),
            file_path: file_path.to_owned(),
            tunnel_id,
            iat: now,
            exp: now + ttl.as_secs() as i64,
        };

        let key = token_key(claims.token_id);
        self.store
            .hash_set(
                &key,
                &[
                    ("file_path", claims.file_path.clone()),
                    ("tunnel_id", claims.tunnel_id.to_string()),
                    ("issued_at", claims.iat.to_string()),
                    ("expires_at", claims.exp.to_string()),
                    ("consumed", "0".to_string()),
                ],
            )
            .await?;
        self.store.expire(&key, ttl).await?;

        let token = self.signer.encode(&claims).map_err(|e| {
            debug!("failed to sign token: {e}");
            TokenError::Invalid
        })?;
        TOKENS_MINTED.inc();
        Ok(token)
    }

    /// Signature and expiry check only; does not burn the token. Used by
    /// metadata rendering paths.
    pub fn peek(&self, token: &str) -> Result<TokenClaims, TokenError> {
        self.signer
            .decode::<TokenClaims>(token)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!("token rejected at peek: {e}");
                TOKENS_REJECTED.inc();
                TokenError::Invalid
            })
    }

    /// Verify and atomically consume. Exactly one call per token may
    /// succeed; every later presentation observes `consumed` and fails.
    pub async fn validate_and_consume(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let claims = self.peek(token)?;

        let key = token_key(claims.token_id);
        match self
            .store
            .hash_compare_and_set(&key, "consumed", "0", "1")
            .await?
        {
            CasOutcome::Swapped => {
                TOKENS_CONSUMED.inc();
                Ok(claims)
            }
            CasOutcome::Mismatch { .. } => {
                debug!(token_id = %claims.token_id, "token already consumed");
                TOKENS_REJECTED.inc();
                Err(TokenError::Invalid)
            }
            CasOutcome::Missing => {
                // Record expired out of the store (or was never ours).
                debug!(token_id = %claims.token_id, "no token record");
                TOKENS_REJECTED.inc();
                Err(TokenError::Invalid)
            }
        }
    }

    /// Remove token records whose deadline has passed. The store TTL
    /// normally handles this; the sweep is the belt-and-braces pass run
    /// periodically and by `POST /admin/cleanup`.
    pub async fn sweep_expired(&self) -> Result<u64, TokenError> {
        let now = Utc::now().timestamp();
        let mut swept = 0u64;
        for key in self.store.list_keys("token:").await? {
            let expires_at = match self.store.hash_get(&key, "expires_at").await? {
                Some(v) => v.parse::<i64>().unwrap_or(0),
                None => continue,
            };
            if expires_at < now {
                self.store.delete(&key).await?;
                swept += 1;
            }
        }
        if swept > 0 {
            TOKENS_SWEPT.inc_by(swept);
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStateStore;

    const SECRET: &[u8] = b"test-secret-test-secret-test-secret!";

    fn service(store: Arc<dyn StateStore>) -> TokenService {
        TokenService::new(SECRET, store, Duration::from_secs(3600)).unwrap()
    }

    #[tokio::test]
    async fn mint_peek_roundtrip() {
        let svc = service(Arc::new(MemStateStore::default()));
        let tunnel_id: TunnelId = "0a1b2c3d".parse().unwrap();
        let token = svc
            .mint("docs/a.txt", Duration::from_secs(120), tunnel_id)
            .await
            .unwrap();

        let claims = svc.peek(&token).unwrap();
        assert_eq!(claims.file_path, "docs/a.txt");
        assert_eq!(claims.tunnel_id, tunnel_id);
        assert_eq!(claims.exp - claims.iat, 120);
    }

    #[tokio::test]
    async fn ttl_is_clamped_both_ways() {
        let svc = service(Arc::new(MemStateStore::default()));
        let tunnel_id: TunnelId = "0a1b2c3d".parse().unwrap();

        let token = svc
            .mint("a", Duration::from_secs(5), tunnel_id)
            .await
            .unwrap();
        let claims = svc.peek(&token).unwrap();
        assert_eq!(claims.exp - claims.iat, 60);

        let token = svc
            .mint("a", Duration::from_secs(86400), tunnel_id)
            .await
            .unwrap();
        let claims = svc.peek(&token).unwrap();
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[tokio::test]
    async fn consume_is_single_use() {
        let svc = service(Arc::new(MemStateStore::default()));
        let tunnel_id: TunnelId = "0a1b2c3d".parse().unwrap();
        let token = svc
            .mint("a", Duration::from_secs(120), tunnel_id)
            .await
            .unwrap();

        svc.validate_and_consume(&token).await.unwrap();
        assert!(matches!(
            svc.validate_and_consume(&token).await,
            Err(TokenError::Invalid)
        ));
    }

    #[tokio::test]
    async fn garbage_token_rejected() {
        let svc = service(Arc::new(MemStateStore::default()));
        assert!(matches!(
            svc.validate_and_consume("not.a.token").await,
            Err(TokenError::Invalid)
        ));
        assert!(matches!(svc.peek(""), Err(TokenError::Invalid)));
    }

    #[tokio::test]
    async fn token_without_record_rejected() {
        // Valid signature, but the record is gone from the store (TTL).
        let store: Arc<dyn StateStore> = Arc::new(MemStateStore::default());
        let svc = service(store.clone());
        let tunnel_id: TunnelId = "0a1b2c3d".parse().unwrap();
        let token = svc
            .mint("a", Duration::from_secs(120), tunnel_id)
            .await
            .unwrap();
        let claims = svc.peek(&token).unwrap();
        store.delete(&token_key(claims.token_id)).await.unwrap();

        assert!(matches!(
            svc.validate_and_consume(&token).await,
            Err(TokenError::Invalid)
        ));
    }

    #[tokio::test]
    async fn sweep_removes_stale_records() {
        let store: Arc<dyn StateStore> = Arc::new(MemStateStore::default());
        let svc = service(store.clone());

        // A record that outlived its deadline without a store TTL.
        store
            .hash_set(
                "token:stale",
                &[
                    ("expires_at", (Utc::now().timestamp() - 100).to_string()),
                    ("consumed", "0".to_string()),
                ],
            )
            .await
            .unwrap();
        let tunnel_id: TunnelId = "0a1b2c3d".parse().unwrap();
        svc.mint("a", Duration::from_secs(120), tunnel_id)
            .await
            .unwrap();

        assert_eq!(svc.sweep_expired().await.unwrap(), 1);
        assert_eq!(store.list_keys("token:").await.unwrap().len(), 1);
    }
}
