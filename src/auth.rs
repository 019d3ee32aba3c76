use std::time::Duration;

use jsonwebtoken::{decode, encode, get_current_timestamp, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::{RelayError, RelayResult};

/// Verified claims bound to a connection for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub email: String,
    pub role: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(alias = "userId")]
    id: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    role: String,
    exp: u64,
}

impl From<Claims> for Identity {
    fn from(Claims { id, email, role, .. }: Claims) -> Self {
        Identity { user_id: id, email, role }
    }
}

#[derive(Clone)]
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);
        validation.validate_aud = false;

        TokenVerifier {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> RelayResult<Identity> {
        let token = token.trim();
        if token.is_empty() {
            tracing::debug!("rejecting handshake without token");
            return Err(RelayError::Unauthorized);
        }

        match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(data) if !data.claims.id.is_empty() => Ok(data.claims.into()),
            Ok(_) => {
                tracing::debug!("rejecting token without user id");
                Err(RelayError::Unauthorized)
            }
            Err(err) => {
                tracing::debug!(error = %err, "rejecting token");
                Err(RelayError::Unauthorized)
            }
        }
    }

    /// Mints a token with the shared secret. Real tokens come from the
    /// authenticator; this exists for local tooling and tests.
    pub fn issue(&self, identity: &Identity, ttl: Duration) -> anyhow::Result<String> {
        let claims = Claims {
            id: identity.user_id.clone(),
            email: identity.email.clone(),
            role: identity.role.clone(),
            exp: get_current_timestamp() + ttl.as_secs(),
        };

        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?)
    }
}
