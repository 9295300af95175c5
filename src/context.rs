//! `RequestContext`: identity and access scoping carried through every
//! pipeline and retrieval call, bound into structured logs (§3.3, §A.1).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: String,
    pub owner_id: Option<String>,
    pub is_authenticated: bool,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl RequestContext {
    pub fn anonymous() -> Self {
        Self {
            request_id: crate::models::new_id(),
            owner_id: None,
            is_authenticated: false,
            roles: Vec::new(),
        }
    }

    pub fn authenticated(owner_id: impl Into<String>) -> Self {
        Self {
            request_id: crate::models::new_id(),
            owner_id: Some(owner_id.into()),
            is_authenticated: true,
            roles: Vec::new(),
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_owner(&self, owner_id: Option<&str>) -> bool {
        self.is_authenticated && self.owner_id.as_deref() == owner_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_context_is_unauthenticated() {
        let ctx = RequestContext::anonymous();
        assert!(!ctx.is_authenticated);
        assert!(ctx.owner_id.is_none());
    }

    #[test]
    fn owner_match_requires_auth() {
        let ctx = RequestContext::anonymous();
        assert!(!ctx.is_owner(Some("u1")));

        let ctx = RequestContext::authenticated("u1");
        assert!(ctx.is_owner(Some("u1")));
        assert!(!ctx.is_owner(Some("u2")));
    }
}
