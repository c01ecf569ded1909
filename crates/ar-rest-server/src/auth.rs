// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Credential classification: shared secret vs signed bearer tokens.

use crate::error::ServerError;
use crate::tokens::{Claims, TokenError, TokenService, TokenType};
use ar_local_db::TaskAccess;
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// How the caller authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    SharedSecret,
    AccessToken,
    EphemeralToken,
    Anonymous,
}

/// Per-request authentication context derived from the credential.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub kind: AuthKind,
    pub client_name: String,
    /// Literal agent names, or `*` for everything.
    pub scopes: Vec<String>,
    pub budget_override: Option<f64>,
    pub rate_override: Option<u32>,
    pub token_id: Option<String>,
}

impl AuthContext {
    pub fn is_admin(&self) -> bool {
        self.kind == AuthKind::SharedSecret
    }

    /// Wildcard or any literal match satisfies a scope requirement.
    pub fn satisfies_scopes(&self, required: &[String]) -> bool {
        if required.is_empty() {
            return true;
        }
        self.scopes.iter().any(|scope| scope == "*" || required.iter().any(|r| r == scope))
    }

    /// Tenant view for the task store.
    pub fn task_access(&self) -> TaskAccess {
        match self.kind {
            AuthKind::SharedSecret => TaskAccess::Admin(self.client_name.clone()),
            AuthKind::Anonymous => TaskAccess::Client("anonymous".to_string()),
            AuthKind::AccessToken | AuthKind::EphemeralToken => {
                TaskAccess::Client(self.client_name.clone())
            }
        }
    }

    fn shared_secret() -> Self {
        Self {
            kind: AuthKind::SharedSecret,
            client_name: "master".to_string(),
            scopes: vec!["*".to_string()],
            budget_override: None,
            rate_override: None,
            token_id: None,
        }
    }

    fn anonymous() -> Self {
        Self {
            kind: AuthKind::Anonymous,
            client_name: "anonymous".to_string(),
            scopes: vec!["*".to_string()],
            budget_override: None,
            rate_override: None,
            token_id: None,
        }
    }

    fn from_claims(claims: Claims) -> Self {
        Self {
            kind: if claims.ephemeral { AuthKind::EphemeralToken } else { AuthKind::AccessToken },
            client_name: claims.sub,
            scopes: claims.scopes,
            budget_override: claims.budget_daily_usd,
            rate_override: claims.rate_limit_rpm,
            token_id: Some(claims.jti),
        }
    }
}

/// Classifies the bearer credential of an incoming request.
pub struct AuthGate {
    master_key: Option<String>,
    tokens: Option<Arc<TokenService>>,
    token_debug: bool,
}

impl AuthGate {
    pub fn new(
        master_key: Option<String>,
        tokens: Option<Arc<TokenService>>,
        token_debug: bool,
    ) -> Self {
        Self { master_key, tokens, token_debug }
    }

    fn configured(&self) -> bool {
        self.master_key.is_some() || self.tokens.is_some()
    }

    /// Authenticate the `Authorization` header value.
    pub fn authenticate(&self, header: Option<&str>) -> Result<AuthContext, ServerError> {
        if !self.configured() {
            // No auth configured; the bind guard has already confined
            // us to loopback.
            return Ok(AuthContext::anonymous());
        }

        let Some(header) = header else {
            return Err(ServerError::AuthMissing);
        };
        let Some(credential) = header.strip_prefix("Bearer ") else {
            return Err(ServerError::AuthInvalid { detail: None });
        };

        if let Some(master) = &self.master_key {
            if master.as_bytes().ct_eq(credential.as_bytes()).into() {
                return Ok(AuthContext::shared_secret());
            }
        }

        if let Some(tokens) = &self.tokens {
            return match tokens.verify(credential, TokenType::Access) {
                Ok(claims) => Ok(AuthContext::from_claims(claims)),
                Err(TokenError::Revoked) => Err(ServerError::AuthRevoked),
                Err(TokenError::WrongType) => Err(ServerError::RefreshUsedAsAccess),
                Err(e) => Err(ServerError::AuthInvalid {
                    detail: self.token_debug.then(|| e.to_string()),
                }),
            };
        }

        Err(ServerError::AuthInvalid { detail: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revocation::RevocationCache;
    use crate::tokens::IssueRequest;
    use ar_local_db::Database;

    fn token_service() -> Arc<TokenService> {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let revocations = Arc::new(RevocationCache::load(db).unwrap());
        Arc::new(TokenService::new("jwt-secret", "HS256", 3600, 86400, revocations).unwrap())
    }

    #[test]
    fn no_auth_configured_yields_anonymous_wildcard() {
        let gate = AuthGate::new(None, None, false);
        let ctx = gate.authenticate(None).unwrap();
        assert_eq!(ctx.kind, AuthKind::Anonymous);
        assert!(ctx.satisfies_scopes(&["anything".to_string()]));
    }

    #[test]
    fn missing_header_is_401_when_configured() {
        let gate = AuthGate::new(Some("master-key".into()), None, false);
        assert!(matches!(gate.authenticate(None), Err(ServerError::AuthMissing)));
        assert!(matches!(
            gate.authenticate(Some("Basic abc")),
            Err(ServerError::AuthInvalid { .. })
        ));
    }

    #[test]
    fn shared_secret_grants_admin() {
        let gate = AuthGate::new(Some("master-key".into()), None, false);
        let ctx = gate.authenticate(Some("Bearer master-key")).unwrap();
        assert!(ctx.is_admin());
        assert_eq!(ctx.client_name, "master");
        assert_eq!(ctx.task_access(), ar_local_db::TaskAccess::Admin("master".into()));

        assert!(matches!(
            gate.authenticate(Some("Bearer wrong-key")),
            Err(ServerError::AuthInvalid { .. })
        ));
    }

    #[test]
    fn token_tier_carries_claims() {
        let tokens = token_service();
        let (token, _) = tokens
            .issue_access(&IssueRequest {
                client_name: "alice".into(),
                scopes: vec!["general".into()],
                budget_daily_usd: Some(1.0),
                rate_limit_rpm: Some(5),
                allowed_models: None,
                ephemeral: false,
                ttl_secs: None,
            })
            .unwrap();

        let gate = AuthGate::new(Some("master-key".into()), Some(tokens), false);
        let ctx = gate.authenticate(Some(&format!("Bearer {token}"))).unwrap();
        assert_eq!(ctx.kind, AuthKind::AccessToken);
        assert_eq!(ctx.client_name, "alice");
        assert!(!ctx.is_admin());
        assert_eq!(ctx.budget_override, Some(1.0));
        assert_eq!(ctx.rate_override, Some(5));
        assert!(ctx.satisfies_scopes(&["general".to_string()]));
        assert!(!ctx.satisfies_scopes(&["code".to_string()]));
        assert!(ctx.token_id.is_some());
    }

    #[test]
    fn refresh_token_at_api_is_distinct_401() {
        let tokens = token_service();
        let (refresh, _) = tokens
            .issue_refresh(&IssueRequest {
                client_name: "alice".into(),
                scopes: vec![],
                budget_daily_usd: None,
                rate_limit_rpm: None,
                allowed_models: None,
                ephemeral: false,
                ttl_secs: None,
            })
            .unwrap();

        let gate = AuthGate::new(None, Some(tokens), false);
        assert!(matches!(
            gate.authenticate(Some(&format!("Bearer {refresh}"))),
            Err(ServerError::RefreshUsedAsAccess)
        ));
    }

    #[test]
    fn debug_mode_includes_failure_detail() {
        let tokens = token_service();
        let gate = AuthGate::new(None, Some(tokens), true);
        match gate.authenticate(Some("Bearer not-a-jwt")) {
            Err(ServerError::AuthInvalid { detail: Some(detail) }) => {
                assert!(!detail.is_empty());
            }
            other => panic!("expected detailed 401, got {other:?}"),
        }
    }

    #[test]
    fn wildcard_scope_satisfies_everything() {
        let ctx = AuthContext {
            kind: AuthKind::AccessToken,
            client_name: "alice".into(),
            scopes: vec!["*".into()],
            budget_override: None,
            rate_override: None,
            token_id: None,
        };
        assert!(ctx.satisfies_scopes(&["code".to_string(), "general".to_string()]));
        assert!(ctx.satisfies_scopes(&[]));
    }
}
