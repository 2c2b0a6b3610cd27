use jsonwebtoken::{DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Tokens are plain HS256 JWTs: HMAC-SHA256 over the canonical JSON payload,
/// rendered as `header.payload.sig` with base64url segments.
const TOKEN_ALGORITHM: jsonwebtoken::Algorithm = jsonwebtoken::Algorithm::HS256;

/// The secret doubles as the only credential in the system, so refuse
/// anything short enough to brute-force.
pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("signing secret must be at least {MIN_SECRET_LEN} bytes")]
    SecretTooShort,
    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// Symmetric signer/verifier shared by everything that mints or checks
/// capability tokens in this process.
pub struct TokenSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenSigner {
    pub fn new(secret: &[u8]) -> Result<Self, AuthError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(AuthError::SecretTooShort);
        }
        let mut validation = Validation::new(TOKEN_ALGORITHM);
        // The default 60s leeway would keep expired tokens alive past their
        // advertised deadline.
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);
        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        })
    }

    pub fn encode<C: Serialize>(&self, claims: &C) -> Result<String, AuthError> {
        Ok(jsonwebtoken::encode(
            &Header::new(TOKEN_ALGORITHM),
            claims,
            &self.encoding_key,
        )?)
    }

    /// Signature and expiry check; does not touch any consumption state.
    pub fn decode<C: DeserializeOwned>(&self, token: &str) -> Result<TokenData<C>, AuthError> {
        Ok(jsonwebtoken::decode(
            token,
            &self.decoding_key,
            &self.validation,
        )?)
    }
}
