//! Identity gateway: bearer credential to agent identity.

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Who is calling. Role and permissions are loaded from the record store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub name: String,
}

#[async_trait]
pub trait IdentityGateway: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<AgentIdentity>;
}

/// JWT claims.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,  // Agent ID
    pub name: String, // Display name
    pub exp: usize,
    pub iat: usize,
}

/// HS256 JWT verification and issuance.
pub struct JwtGateway {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl_secs: u64,
}

impl JwtGateway {
    pub fn new(secret: &str, ttl_secs: u64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            ttl_secs,
        }
    }

    /// Issue a token for an agent, valid for the configured lifetime.
    pub fn issue(&self, agent_id: &str, name: &str) -> Result<String> {
        let now = Utc::now().timestamp().max(0) as usize;
        self.issue_with(agent_id, name, now, now + self.ttl_secs as usize)
    }

    fn issue_with(&self, agent_id: &str, name: &str, iat: usize, exp: usize) -> Result<String> {
        let claims = Claims {
            sub: agent_id.to_string(),
            name: name.to_string(),
            exp,
            iat,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("token encoding failed: {}", e)))
    }
}

#[async_trait]
impl IdentityGateway for JwtGateway {
    async fn authenticate(&self, credential: &str) -> Result<AgentIdentity> {
        let data = decode::<Claims>(credential, &self.decoding, &self.validation)
            .map_err(|e| Error::Authentication(format!("invalid token: {}", e)))?;

        if data.claims.sub.trim().is_empty() {
            return Err(Error::Authentication("token has no subject".to_string()));
        }
        Ok(AgentIdentity {
            agent_id: data.claims.sub,
            name: data.claims.name,
        })
    }
}

/// Extract the token from an `Authorization` header value.
pub fn extract_bearer(header: Option<&str>) -> Result<&str> {
    let header = header
        .ok_or_else(|| Error::Authentication("missing Authorization header".to_string()))?;

    match header.strip_prefix("Bearer ") {
        Some(token) if !token.trim().is_empty() => Ok(token.trim()),
        _ => Err(Error::Authentication(
            "invalid Authorization header format".to_string(),
        )),
    }
}
