//! Agent credential verification
//!
//! Credentials are HS256 JWTs issued by the agent login service. The bridge
//! only needs the `agent_id` claim and a valid signature and expiry.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{CallEngineError, Result};
use crate::types::AgentId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentClaims {
    pub agent_id: String,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
}

#[derive(Clone)]
pub struct CredentialVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl CredentialVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Check signature and expiry, returning the agent the token was issued to
    pub fn verify(&self, token: &str) -> Result<AgentId> {
        let data = decode::<AgentClaims>(token, &self.key, &self.validation)
            .map_err(|e| CallEngineError::authentication(format!("invalid token: {}", e)))?;

        let agent_id = data.claims.agent_id.trim();
        if agent_id.is_empty() {
            return Err(CallEngineError::authentication("token has no agent_id"));
        }
        Ok(AgentId::from(agent_id))
    }

    /// Verify a raw `Authorization` header value of the form `Bearer <token>`
    pub fn verify_bearer(&self, header: &str) -> Result<AgentId> {
        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .ok_or_else(|| CallEngineError::authentication("expected a Bearer token"))?;
        self.verify(token.trim())
    }
}
