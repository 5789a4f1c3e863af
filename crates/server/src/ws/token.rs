// Signed subscription tokens.
//
// A token authenticates the WebSocket *upgrade*, not the session: short
// fixed validity window, single use (the registry tracks redeemed `jti`s).

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use handoff_common::types::Tier;

use crate::auth::CapabilityKey;

/// Token validity window in seconds.
pub const TOKEN_TTL_SECONDS: i64 = 60;

/// Claims bound into a subscription token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionClaims {
    pub workspace_id: String,
    pub tier: Tier,
    pub key_hash: String,
    pub scope: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// Why a token failed validation; maps onto close codes 4001/4002.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    Expired,
    Invalid,
}

#[derive(Clone)]
pub struct SubscriptionTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl SubscriptionTokenService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("token secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Mint a token binding the key's workspace, tier, hash, and scope.
    pub fn issue(
        &self,
        key: &CapabilityKey,
        scope: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<(String, SubscriptionClaims)> {
        let claims = SubscriptionClaims {
            workspace_id: key.workspace_id.clone(),
            tier: key.permission,
            key_hash: key.key_hash.clone(),
            scope: scope.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: now.timestamp() + TOKEN_TTL_SECONDS,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode subscription token")?;

        Ok((token, claims))
    }

    pub fn validate(&self, token: &str) -> Result<SubscriptionClaims, TokenError> {
        decode::<SubscriptionClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|error| match error.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            })
    }
}
