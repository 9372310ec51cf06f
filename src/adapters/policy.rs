//! Run admission policy.

use std::path::{Component, Path};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::domain::{AgentProfile, RunMode, Task};

#[derive(Debug, Clone)]
pub struct PolicyRequest {
    pub task: Task,
    pub profile: AgentProfile,
    pub requested_mode: Option<RunMode>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub policy_id: String,
    pub policy_name: String,
    pub rule: String,
    pub reason: String,
    pub recommended_mode: Option<RunMode>,
    pub requires_review: bool,
}

impl PolicyDecision {
    pub fn allow(recommended_mode: Option<RunMode>, requires_review: bool) -> Self {
        Self {
            allowed: true,
            policy_id: String::new(),
            policy_name: String::new(),
            rule: String::new(),
            reason: String::new(),
            recommended_mode,
            requires_review,
        }
    }

    pub fn deny(
        policy_id: impl Into<String>,
        policy_name: impl Into<String>,
        rule: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            allowed: false,
            policy_id: policy_id.into(),
            policy_name: policy_name.into(),
            rule: rule.into(),
            reason: reason.into(),
            recommended_mode: None,
            requires_review: false,
        }
    }
}

#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn evaluate(&self, request: &PolicyRequest) -> Result<PolicyDecision>;
}

/// Built-in policy: task scopes must stay inside their project, profiles
/// that need a sandbox get one, and sandboxed work is reviewed before it
/// lands.
#[derive(Debug, Clone)]
pub struct ScopePolicy {
    pub review_sandboxed: bool,
}

impl Default for ScopePolicy {
    fn default() -> Self {
        Self {
            review_sandboxed: true,
        }
    }
}

pub const SCOPE_POLICY_ID: &str = "builtin.scope";

#[async_trait]
impl PolicyEvaluator for ScopePolicy {
    async fn evaluate(&self, request: &PolicyRequest) -> Result<PolicyDecision> {
        let scope = Path::new(&request.task.scope_path);
        if scope.is_absolute() {
            return Ok(PolicyDecision::deny(
                SCOPE_POLICY_ID,
                "Scope containment",
                "scope_relative",
                format!("scope path {} must be relative to the project root", scope.display()),
            ));
        }
        if scope.components().any(|c| matches!(c, Component::ParentDir)) {
            return Ok(PolicyDecision::deny(
                SCOPE_POLICY_ID,
                "Scope containment",
                "scope_inside_project",
                format!("scope path {} escapes the project root", scope.display()),
            ));
        }

        let recommended = if request.profile.requires_sandbox {
            Some(RunMode::Sandboxed)
        } else {
            None
        };
        let effective = request.requested_mode.or(recommended);
        let requires_review = self.review_sandboxed && effective != Some(RunMode::InPlace);
        Ok(PolicyDecision::allow(recommended, requires_review))
    }
}

/// Allows everything with no opinion on mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllPolicy;

#[async_trait]
impl PolicyEvaluator for AllowAllPolicy {
    async fn evaluate(&self, _request: &PolicyRequest) -> Result<PolicyDecision> {
        Ok(PolicyDecision::allow(None, true))
    }
}
