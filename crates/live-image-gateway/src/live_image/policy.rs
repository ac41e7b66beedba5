//! Rule-based policy engine
//!
//! Rules map an action name to a rule string such as
//! `is_admin:True or project_id:%(project_id)s`. Alternatives are separated by
//! `or`, conjunctions by `and` (which binds tighter). Unknown actions use the
//! `default` rule; with no default the action is denied.

use async_trait::async_trait;
use live_image_common::{ComputeError, PolicyEnforcer, PolicyTarget, RequestContext};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

const DEFAULT_RULE: &str = "default";
const MAX_RULE_DEPTH: usize = 16;

pub const DEFAULT_RULES: &[(&str, &str)] = &[
    ("context_is_admin", "role:admin"),
    ("admin_or_owner", "is_admin:True or project_id:%(project_id)s"),
    ("default", "rule:admin_or_owner"),
    ("compute_extension:create-live-image", "rule:admin_or_owner"),
    ("compute:live_snapshot", "rule:admin_or_owner"),
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Failed to read policy file {path}: {message}")]
    Io { path: String, message: String },
    #[error("Invalid policy document: {0}")]
    Document(String),
    #[error("Invalid rule for {action}: {message}")]
    Parse { action: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Check {
    Always,
    Never,
    Role(String),
    IsAdmin(bool),
    Rule(String),
    /// Credential attribute must equal a target attribute.
    Target { credential: String, key: String },
    /// Credential attribute must equal a literal.
    Literal { credential: String, value: String },
    And(Vec<Check>),
    Or(Vec<Check>),
}

fn parse_rule(rule: &str) -> Result<Check, String> {
    let tokens: Vec<&str> = rule.split_whitespace().collect();
    if tokens.is_empty() {
        return Ok(Check::Always);
    }

    let mut alternatives = Vec::new();
    for alternative in tokens.split(|token| token.eq_ignore_ascii_case("or")) {
        let mut conjuncts = Vec::new();
        for conjunct in alternative.split(|token| token.eq_ignore_ascii_case("and")) {
            match conjunct {
                [atom] => conjuncts.push(parse_check(atom)?),
                [] => return Err("dangling operator".to_string()),
                _ => return Err(format!("unexpected tokens: {}", conjunct.join(" "))),
            }
        }
        alternatives.push(collapse(conjuncts, Check::And));
    }

    Ok(collapse(alternatives, Check::Or))
}

fn collapse(mut checks: Vec<Check>, combine: fn(Vec<Check>) -> Check) -> Check {
    if checks.len() == 1 {
        checks.remove(0)
    } else {
        combine(checks)
    }
}

fn parse_check(atom: &str) -> Result<Check, String> {
    match atom {
        "@" => return Ok(Check::Always),
        "!" => return Ok(Check::Never),
        _ => {}
    }

    let (kind, value) = atom
        .split_once(':')
        .ok_or_else(|| format!("unrecognised check: {atom}"))?;

    let check = match kind {
        "role" => Check::Role(value.to_string()),
        "rule" => Check::Rule(value.to_string()),
        "is_admin" => Check::IsAdmin(value.eq_ignore_ascii_case("true")),
        credential => match value
            .strip_prefix("%(")
            .and_then(|rest| rest.strip_suffix(")s"))
        {
            Some(key) => Check::Target {
                credential: credential.to_string(),
                key: key.to_string(),
            },
            None => Check::Literal {
                credential: credential.to_string(),
                value: value.to_string(),
            },
        },
    };

    Ok(check)
}

fn credential<'a>(ctx: &'a RequestContext, name: &str) -> Option<&'a str> {
    match name {
        "user_id" => Some(&ctx.user_id),
        "project_id" | "tenant_id" => Some(&ctx.project_id),
        _ => None,
    }
}

#[derive(Debug, Clone, Default)]
pub struct RulePolicy {
    rules: HashMap<String, Check>,
}

impl RulePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut policy = Self::new();
        for (action, rule) in DEFAULT_RULES {
            if let Ok(check) = parse_rule(rule) {
                policy.rules.insert(action.to_string(), check);
            }
        }
        policy
    }

    pub fn from_rules<I, K, V>(rules: I) -> Result<Self, PolicyError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let mut policy = Self::new();
        for (action, rule) in rules {
            policy.set_rule(action, rule.as_ref())?;
        }
        Ok(policy)
    }

    /// Parse a JSON object of `action -> rule`.
    pub fn from_json_str(document: &str) -> Result<Self, PolicyError> {
        let rules: HashMap<String, String> =
            serde_json::from_str(document).map_err(|e| PolicyError::Document(e.to_string()))?;
        Self::from_rules(rules)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let document = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PolicyError::Io {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        Self::from_json_str(&document)
    }

    /// Overlay rules on top of the built-in defaults.
    pub fn merged_with_defaults(mut self) -> Self {
        for (action, check) in Self::with_defaults().rules {
            self.rules.entry(action).or_insert(check);
        }
        self
    }

    pub fn set_rule(&mut self, action: impl Into<String>, rule: &str) -> Result<(), PolicyError> {
        let action = action.into();
        let check = parse_rule(rule).map_err(|message| PolicyError::Parse {
            action: action.clone(),
            message,
        })?;
        self.rules.insert(action, check);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn enforce(&self, ctx: &RequestContext, action: &str, target: &PolicyTarget) -> bool {
        let rule = self
            .rules
            .get(action)
            .or_else(|| self.rules.get(DEFAULT_RULE));

        match rule {
            Some(check) => self.evaluate(check, ctx, target, 0),
            None => {
                warn!("No rule for {} and no default rule; denying", action);
                false
            }
        }
    }

    fn evaluate(
        &self,
        check: &Check,
        ctx: &RequestContext,
        target: &PolicyTarget,
        depth: usize,
    ) -> bool {
        if depth > MAX_RULE_DEPTH {
            warn!("Policy rule nesting exceeds {} levels; denying", MAX_RULE_DEPTH);
            return false;
        }

        match check {
            Check::Always => true,
            Check::Never => false,
            Check::Role(role) => ctx.has_role(role),
            Check::IsAdmin(expected) => ctx.is_admin == *expected,
            Check::Rule(name) => self
                .rules
                .get(name)
                .is_some_and(|inner| self.evaluate(inner, ctx, target, depth + 1)),
            Check::Target { credential: cred, key } => {
                match (credential(ctx, cred), target.get(key)) {
                    (Some(have), Some(want)) => have == want.as_str(),
                    _ => false,
                }
            }
            Check::Literal {
                credential: cred,
                value,
            } => credential(ctx, cred) == Some(value.as_str()),
            Check::And(checks) => checks
                .iter()
                .all(|c| self.evaluate(c, ctx, target, depth + 1)),
            Check::Or(checks) => checks
                .iter()
                .any(|c| self.evaluate(c, ctx, target, depth + 1)),
        }
    }
}

#[async_trait]
impl PolicyEnforcer for RulePolicy {
    async fn authorize(
        &self,
        ctx: &RequestContext,
        action: &str,
        target: &PolicyTarget,
    ) -> live_image_common::Result<()> {
        if self.enforce(ctx, action, target) {
            debug!("Policy allows {} for {}", action, ctx);
            Ok(())
        } else {
            Err(ComputeError::PolicyNotAuthorized {
                action: action.to_string(),
            })
        }
    }
}
