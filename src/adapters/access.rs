use std::collections::HashMap;

use http::{HeaderMap, HeaderName, HeaderValue};

use crate::ports::access::{
    AccessDecision, AccessEvaluator, AuthIdentity, HeaderBuildError, HeaderBuilder,
};

const RULE_REQUIRE_AUTH: &str = "@request.auth.id != \"\"";

/// Evaluator for the handful of rule shapes used without a full expression engine.
///
/// * empty or `true` allows anyone
/// * `false` denies everyone
/// * `@request.auth.id != ""` and any other rule require an authenticated caller
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicRuleEvaluator;

impl BasicRuleEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl AccessEvaluator for BasicRuleEvaluator {
    fn evaluate(&self, rule: &str, identity: Option<&AuthIdentity>) -> AccessDecision {
        let rule = rule.trim();
        let authenticated = identity.is_some_and(|id| !id.id.is_empty());

        match rule {
            "" | "true" => AccessDecision::Allow,
            "false" if authenticated => AccessDecision::Forbidden,
            "false" => AccessDecision::Unauthenticated,
            RULE_REQUIRE_AUTH if authenticated => AccessDecision::Allow,
            _ if authenticated => {
                tracing::debug!("Unknown access rule '{}', allowing authenticated caller", rule);
                AccessDecision::Allow
            }
            _ => AccessDecision::Unauthenticated,
        }
    }
}

/// Header builder that copies configured values verbatim.
#[derive(Debug, Default, Clone, Copy)]
pub struct LiteralHeaderBuilder;

impl LiteralHeaderBuilder {
    pub fn new() -> Self {
        Self
    }
}

impl HeaderBuilder for LiteralHeaderBuilder {
    fn build(
        &self,
        templates: &HashMap<String, String>,
        _identity: Option<&AuthIdentity>,
    ) -> Result<HeaderMap, HeaderBuildError> {
        let mut headers = HeaderMap::with_capacity(templates.len());
        for (name, value) in templates {
            if value.is_empty() {
                continue;
            }
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| HeaderBuildError::InvalidName(name.clone()))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|_| HeaderBuildError::InvalidValue(name.clone()))?;
            headers.insert(header_name, header_value);
        }
        Ok(headers)
    }
}
