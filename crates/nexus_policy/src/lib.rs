//! nexus_policy
//!
//! Per-plan model allow-list, token cap, and topic block-list. Loaded once
//! from a static configuration; `enforce` is a pure function of that
//! configuration plus the call's plan/model/prompt/tokens.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub allowed_models_per_tenant: HashMap<String, Vec<String>>,
    pub max_tokens_per_call: u64,
    pub disallowed_topics: Vec<String>,
    pub required_pii_scan: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl Decision {
    fn allow() -> Self {
        Self { allowed: true, reason: None }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self { allowed: false, reason: Some(reason.into()) }
    }
}

impl PolicyConfig {
    /// Reject order: model not on the plan's allow-list, then token cap,
    /// then blocked topic; otherwise allow.
    pub fn enforce(&self, plan: &str, model: &str, prompt: &str, tokens: u64) -> Decision {
        let allowed_models = self.allowed_models_per_tenant.get(plan);
        let model_allowed = allowed_models.is_some_and(|models| models.iter().any(|m| m == model));
        if !model_allowed {
            return Decision::deny("model_not_allowed");
        }

        if tokens > self.max_tokens_per_call {
            return Decision::deny(format!("token_limit_exceeded:{}>{}", tokens, self.max_tokens_per_call));
        }

        let lowered_prompt = prompt.to_lowercase();
        for topic in &self.disallowed_topics {
            let lowered_topic = topic.to_lowercase();
            let spaced = lowered_topic.replace('_', " ");
            if lowered_prompt.contains(&lowered_topic) || lowered_prompt.contains(&spaced) {
                return Decision::deny(format!("blocked_topic:{}", topic));
            }
        }

        Decision::allow()
    }
}
