//! Agent identity from API Gateway's Cognito authorizer.
//!
//! Tokens are validated by the authorizer before a request reaches the
//! Lambda; handlers only read the forwarded claims.

use lambda_http::{Request, RequestExt};

use crate::{Error, Result};

/// The support agent making an API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedAgent {
    /// Cognito subject
    pub user_id: String,
    pub email: Option<String>,
}

/// Extract the agent from `requestContext.authorizer.claims`.
pub fn extract_agent(event: &Request) -> Result<AuthenticatedAgent> {
    let context = event
        .request_context_ref()
        .ok_or_else(|| Error::Auth("Missing request context".to_string()))?;

    let claims = context
        .authorizer()
        .and_then(|a| a.fields.get("claims"))
        .ok_or_else(|| Error::Auth("Missing claims".to_string()))?;

    agent_from_claims(claims)
}

pub fn agent_from_claims(claims: &serde_json::Value) -> Result<AuthenticatedAgent> {
    let sub = claims
        .get("sub")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Auth("Missing sub claim".to_string()))?;

    let email = claims
        .get("email")
        .or_else(|| claims.get("cognito:username"))
        .and_then(|v| v.as_str())
        .map(String::from);

    Ok(AuthenticatedAgent {
        user_id: sub.to_string(),
        email,
    })
}
