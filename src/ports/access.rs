//! Ports for the collaborators that own per-route policy.
//!
//! Rule evaluation and header templating are owned by the embedding application; the
//! dispatcher only asks for a decision and for a map of literal header values.
use std::collections::HashMap;

use http::HeaderMap;
use thiserror::Error;

/// Authenticated caller, placed into request extensions by the embedding server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthIdentity {
    pub id: String,
}

impl AuthIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    /// Caller must authenticate first (401).
    Unauthenticated,
    /// Caller is authenticated but not permitted (403).
    Forbidden,
}

impl AccessDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Decides whether a caller may use a route, given the route's opaque rule expression.
pub trait AccessEvaluator: Send + Sync + 'static {
    fn evaluate(&self, rule: &str, identity: Option<&AuthIdentity>) -> AccessDecision;
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HeaderBuildError {
    #[error("Invalid header name '{0}'")]
    InvalidName(String),

    #[error("Invalid value for header '{0}'")]
    InvalidValue(String),
}

/// Resolves a route's header templates into literal values.
pub trait HeaderBuilder: Send + Sync + 'static {
    /// Entries resolving to an empty value must be left out of the returned map.
    fn build(
        &self,
        templates: &HashMap<String, String>,
        identity: Option<&AuthIdentity>,
    ) -> Result<HeaderMap, HeaderBuildError>;
}
