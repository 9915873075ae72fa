//! nexus_orchestrator
//!
//! Composes the PII detector, policy engine, model router, provider
//! adapters, cost tracker, and audit log into the single `orchestrate`/
//! `stream` entry points. Owns exactly one instance of each collaborator;
//! they share no mutable state across requests except the audit log's
//! `last_hash` (single-writer, see `nexus_audit_log`) and the cost
//! tracker's counters (atomic per key, see `nexus_cost`).

pub mod config;

use futures_util::stream::StreamExt;
use nexus_audit_log::AuditAppender;
use nexus_audit_spec::{events, AuditEntryInput};
use nexus_cost::{compute_cost, CostTracker};
use nexus_pii::PiiEntity;
use nexus_policy::PolicyConfig;
use nexus_providers::{CallRequest, ChatMessage as ProviderMessage, CredentialStore, ProviderRegistry};
pub use nexus_router::{Mode, Task};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

pub use config::NexusConfig;

#[derive(Debug, Error)]
pub enum NexusError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("policy denied: {0}")]
    PolicyDenied(String),
    #[error("all providers failed")]
    AllProvidersFailed,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Immutable per-request input.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub prompt: String,
    pub messages: Vec<ChatMessage>,
    pub tenant_id: String,
    pub actor_id: String,
    pub plan: String,
    pub mode: Mode,
    pub temperature: f64,
    pub max_tokens: u64,
    pub override_models: Option<Vec<String>>,
    pub max_models: Option<usize>,
    pub system: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelResult {
    pub model_id: String,
    pub provider: String,
    pub response: String,
    pub latency_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct NexusResult {
    pub request_id: Uuid,
    pub mode: Mode,
    pub final_response: String,
    pub models_used: Vec<ModelResult>,
    pub consensus_score: f64,
    pub total_latency_ms: u64,
    pub total_cost_usd: f64,
    pub synthesized: bool,
    pub safety_passed: bool,
    pub pii_detected: bool,
    pub pii_entities: Vec<PiiEntity>,
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Start { request_id: Uuid, model: String },
    Token { text: String },
    Done,
}

impl StreamEvent {
    /// Render as an SSE-compatible frame: `data: {json}\n\n`.
    pub fn to_frame(&self) -> String {
        let payload = match self {
            StreamEvent::Start { request_id, model } => {
                json!({"type": "start", "request_id": request_id.to_string(), "model": model})
            }
            StreamEvent::Token { text } => json!({"type": "token", "text": text}),
            StreamEvent::Done => json!({"type": "done"}),
        };
        format!("data: {}\n\n", payload)
    }
}

pub struct Orchestrator {
    policy: PolicyConfig,
    creds: CredentialStore,
    providers: ProviderRegistry,
    cost: Arc<CostTracker>,
    audit: Arc<AuditAppender>,
    config: NexusConfig,
}

impl Orchestrator {
    pub fn new(
        policy: PolicyConfig,
        creds: CredentialStore,
        providers: ProviderRegistry,
        cost: Arc<CostTracker>,
        audit: Arc<AuditAppender>,
        config: NexusConfig,
    ) -> Self {
        Self { policy, creds, providers, cost, audit, config }
    }

    fn validate(ctx: &PromptContext) -> Result<(), NexusError> {
        if !(0.0..=2.0).contains(&ctx.temperature) {
            return Err(NexusError::InvalidInput(format!("temperature {} out of range [0.0, 2.0]", ctx.temperature)));
        }
        if ctx.max_tokens < 1 || ctx.max_tokens > 32_768 {
            return Err(NexusError::InvalidInput(format!("max_tokens {} out of range [1, 32768]", ctx.max_tokens)));
        }
        Ok(())
    }

    /// 1. request id + start clock. 2. PII scan. 3. route + policy-gate the
    /// candidates. 4. parallel fan-out under a deadline. 5. synthesize.
    /// 6. aggregate cost/latency. 7. fire-and-forget cost + audit.
    /// 8. return.
    pub async fn orchestrate(&self, ctx: PromptContext) -> Result<NexusResult, NexusError> {
        Self::validate(&ctx)?;

        let request_id = Uuid::new_v4();
        let start = Instant::now();

        let pii = nexus_pii::analyze(&ctx.prompt);
        let safe_prompt = pii.redacted_text.clone();

        let max_models = ctx.max_models.unwrap_or(self.config.max_models);
        let candidates = match &ctx.override_models {
            Some(models) => models.clone(),
            None => nexus_router::select_models(&safe_prompt, ctx.mode, max_models, &[], &self.creds, self.config.environment),
        };
        if candidates.is_empty() {
            return Err(NexusError::InvalidInput("router produced no candidate models".into()));
        }

        let mut models = Vec::new();
        let mut last_denial: Option<String> = None;
        for model in &candidates {
            let decision = self.policy.enforce(&ctx.plan, model, &safe_prompt, ctx.max_tokens);
            if decision.allowed {
                models.push(model.clone());
            } else {
                last_denial = decision.reason;
            }
        }
        if models.is_empty() {
            return Err(NexusError::PolicyDenied(last_denial.unwrap_or_else(|| "model_not_allowed".into())));
        }

        let provider_messages: Vec<ProviderMessage> = ctx
            .messages
            .iter()
            .map(|m| ProviderMessage { role: m.role.clone(), content: m.content.clone() })
            .chain(std::iter::once(ProviderMessage { role: "user".into(), content: safe_prompt.clone() }))
            .collect();

        let fan_out = futures_util::future::join_all(models.iter().map(|model_id| {
            let provider_name = nexus_router::provider_of(model_id).to_string();
            let provider = self.providers.get(&provider_name);
            let req = CallRequest {
                model: model_id.clone(),
                messages: provider_messages.clone(),
                system: ctx.system.clone(),
                temperature: ctx.temperature,
                max_tokens: ctx.max_tokens,
            };
            let model_id = model_id.clone();
            async move { call_one(model_id, provider_name, provider, req).await }
        }));

        let models_used = match tokio::time::timeout(self.config.timeout, fan_out).await {
            Ok(results) => results,
            Err(_) => {
                self.record_failure_fire_and_forget(&ctx, request_id, "deadline_exceeded", &models, &[]);
                return Err(NexusError::AllProvidersFailed);
            }
        };

        let valid: Vec<&ModelResult> = models_used.iter().filter(|r| r.error.is_none()).collect();
        if valid.is_empty() {
            self.record_failure_fire_and_forget(&ctx, request_id, "all_providers_errored", &models, &models_used);
            return Err(NexusError::AllProvidersFailed);
        }

        let (consensus_score, synthesized, final_response) =
            synthesize(&valid, ctx.mode, self.config.consensus_threshold);

        let total_latency_ms = start.elapsed().as_millis() as u64;
        let total_cost_usd: f64 = models_used.iter().map(|r| r.cost_usd).sum();

        self.record_fire_and_forget(&ctx, request_id, &models_used, total_cost_usd);

        Ok(NexusResult {
            request_id,
            mode: ctx.mode,
            final_response,
            models_used,
            consensus_score,
            total_latency_ms,
            total_cost_usd,
            synthesized,
            safety_passed: !pii.has_critical,
            pii_detected: pii.has_pii,
            pii_entities: pii.entities,
        })
    }

    fn record_fire_and_forget(
        &self,
        ctx: &PromptContext,
        request_id: Uuid,
        models_used: &[ModelResult],
        total_cost_usd: f64,
    ) {
        let cost = self.cost.clone();
        let tenant = ctx.tenant_id.clone();
        tokio::spawn(async move {
            cost.record(&tenant, total_cost_usd).await;
        });

        let audit = self.audit.clone();
        let tenant = ctx.tenant_id.clone();
        let actor = ctx.actor_id.clone();
        let prompt_hash = nexus_common::sha256_hex(ctx.prompt.as_bytes());
        let details = json!({
            "models_used": models_used.iter().map(|m| &m.model_id).collect::<Vec<_>>(),
            "total_cost_usd": total_cost_usd,
            "prompt_hash": prompt_hash,
        });
        tokio::spawn(async move {
            let input = AuditEntryInput {
                tenant_id: tenant,
                actor_id: Some(actor),
                event: events::INFERENCE_COMPLETED.to_string(),
                resource: "inference".to_string(),
                resource_id: Some(request_id.to_string()),
                details,
                ip: None,
            };
            if let Err(e) = audit.append(input).await {
                tracing::error!(error = %e, "audit.append.failed");
            }
        });
    }

    /// Records an `inference.failed` entry for an `AllProvidersFailed`
    /// return, so a fully-failed request still leaves a tamper-evident
    /// trail. `candidates` are the models that were routed/policy-allowed;
    /// `attempted` are per-model results when the fan-out actually
    /// completed (empty when the whole-request deadline tripped first).
    fn record_failure_fire_and_forget(
        &self,
        ctx: &PromptContext,
        request_id: Uuid,
        reason: &str,
        candidates: &[String],
        attempted: &[ModelResult],
    ) {
        let audit = self.audit.clone();
        let tenant = ctx.tenant_id.clone();
        let actor = ctx.actor_id.clone();
        let prompt_hash = nexus_common::sha256_hex(ctx.prompt.as_bytes());
        let details = json!({
            "reason": reason,
            "models_attempted": candidates,
            "errors": attempted.iter().map(|m| json!({"model_id": m.model_id, "error": m.error})).collect::<Vec<_>>(),
            "prompt_hash": prompt_hash,
        });
        let reason = reason.to_string();
        tokio::spawn(async move {
            let input = AuditEntryInput {
                tenant_id: tenant,
                actor_id: Some(actor),
                event: events::INFERENCE_FAILED.to_string(),
                resource: "inference".to_string(),
                resource_id: Some(request_id.to_string()),
                details,
                ip: None,
            };
            if let Err(e) = audit.append(input).await {
                tracing::error!(error = %e, reason, "audit.append.failed");
            }
        });
    }

    /// Mirrors the call path but selects exactly one model and bypasses
    /// synthesis, emitting `start`/`token`/`done` SSE frames in provider
    /// arrival order.
    pub async fn stream(&self, ctx: PromptContext) -> Result<ReceiverStream<StreamEvent>, NexusError> {
        Self::validate(&ctx)?;

        let pii = nexus_pii::analyze(&ctx.prompt);
        let safe_prompt = pii.redacted_text;

        let max_models = ctx.max_models.unwrap_or(self.config.max_models);
        let model = match &ctx.override_models {
            Some(models) if !models.is_empty() => models[0].clone(),
            _ => nexus_router::select_models(&safe_prompt, ctx.mode, max_models, &[], &self.creds, self.config.environment)
                .into_iter()
                .next()
                .ok_or_else(|| NexusError::InvalidInput("router produced no candidate models".into()))?,
        };

        let decision = self.policy.enforce(&ctx.plan, &model, &safe_prompt, ctx.max_tokens);
        if !decision.allowed {
            return Err(NexusError::PolicyDenied(decision.reason.unwrap_or_else(|| "model_not_allowed".into())));
        }

        let provider_name = nexus_router::provider_of(&model).to_string();
        let provider = self
            .providers
            .get(&provider_name)
            .ok_or_else(|| NexusError::InvalidInput(format!("no provider registered for {}", provider_name)))?;

        let mut provider_messages: Vec<ProviderMessage> = ctx
            .messages
            .iter()
            .map(|m| ProviderMessage { role: m.role.clone(), content: m.content.clone() })
            .collect();
        provider_messages.push(ProviderMessage { role: "user".into(), content: safe_prompt });

        let req = CallRequest {
            model: model.clone(),
            messages: provider_messages,
            system: ctx.system.clone(),
            temperature: ctx.temperature,
            max_tokens: ctx.max_tokens,
        };

        let request_id = Uuid::new_v4();
        let (tx, rx) = tokio::sync::mpsc::channel(32);

        tokio::spawn(async move {
            let _ = tx.send(StreamEvent::Start { request_id, model: model.clone() }).await;

            match provider.stream(&req).await {
                Ok(mut chunks) => {
                    while let Some(chunk) = chunks.next().await {
                        match chunk {
                            Ok(text) => {
                                if tx.send(StreamEvent::Token { text }).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "stream.chunk.failed");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "stream.dispatch.failed");
                }
            }

            let _ = tx.send(StreamEvent::Done).await;
        });

        Ok(ReceiverStream::new(rx))
    }
}

async fn call_one(
    model_id: String,
    provider_name: String,
    provider: Option<Arc<dyn nexus_providers::Provider>>,
    req: CallRequest,
) -> ModelResult {
    let start = Instant::now();

    let Some(provider) = provider else {
        return ModelResult {
            model_id,
            provider: provider_name,
            response: String::new(),
            latency_ms: start.elapsed().as_millis() as u64,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            error: Some("no provider registered".to_string()),
        };
    };

    match provider.call(&req).await {
        Ok(resp) => {
            let cost_usd = compute_cost(&model_id, resp.input_tokens, resp.output_tokens);
            ModelResult {
                model_id,
                provider: provider_name,
                response: resp.text,
                latency_ms: start.elapsed().as_millis() as u64,
                input_tokens: resp.input_tokens,
                output_tokens: resp.output_tokens,
                cost_usd,
                error: None,
            }
        }
        Err(e) => ModelResult {
            model_id,
            provider: provider_name,
            response: String::new(),
            latency_ms: start.elapsed().as_millis() as u64,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            error: Some(e.to_string()),
        },
    }
}

/// Jaccard similarity over the word-sets of all valid responses at once
/// (`|intersection of all| / |union of all|`), not a pairwise average —
/// the two agree for exactly two responses but diverge for three or more,
/// where this is the more direct reading of "agreement across the set".
fn consensus_score(responses: &[&str]) -> f64 {
    if responses.len() <= 1 {
        return 1.0;
    }
    use std::collections::HashSet;
    let word_sets: Vec<HashSet<String>> = responses
        .iter()
        .map(|r| r.to_lowercase().split_whitespace().map(str::to_string).collect())
        .collect();

    let mut intersection = word_sets[0].clone();
    let mut union = word_sets[0].clone();
    for set in &word_sets[1..] {
        intersection = intersection.intersection(set).cloned().collect();
        union = union.union(set).cloned().collect();
    }

    let jaccard = if union.is_empty() { 0.0 } else { intersection.len() as f64 / union.len() as f64 };
    (0.5 + 0.5 * jaccard).min(1.0)
}

fn select_primary<'a>(valid: &'a [&'a ModelResult], mode: Mode) -> &'a ModelResult {
    match mode {
        Mode::Code | Mode::Reasoning => valid
            .iter()
            .max_by_key(|r| r.input_tokens + r.output_tokens)
            .expect("valid is non-empty"),
        _ => valid.iter().min_by_key(|r| r.latency_ms).expect("valid is non-empty"),
    }
}

fn synthesize(valid: &[&ModelResult], mode: Mode, threshold: f64) -> (f64, bool, String) {
    let responses: Vec<&str> = valid.iter().map(|r| r.response.as_str()).collect();
    let consensus = consensus_score(&responses);
    let primary = select_primary(valid, mode);
    let synthesized = consensus < threshold && valid.len() >= 2;

    let final_response = if synthesized {
        format!(
            "[NEXUS Synthesized — {} models, consensus {}%]\n\n{}",
            valid.len(),
            (consensus * 100.0).round() as i64,
            primary.response
        )
    } else {
        primary.response.clone()
    };

    (consensus, synthesized, final_response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_result(id: &str, response: &str, latency_ms: u64) -> ModelResult {
        ModelResult {
            model_id: id.to_string(),
            provider: "openai".to_string(),
            response: response.to_string(),
            latency_ms,
            input_tokens: 10,
            output_tokens: 20,
            cost_usd: 0.01,
            error: None,
        }
    }

    #[test]
    fn consensus_is_one_when_single_response() {
        assert_eq!(consensus_score(&["hello world"]), 1.0);
    }

    #[test]
    fn consensus_is_in_half_to_one_range_for_two_responses() {
        let score = consensus_score(&["the cat sat", "a dog ran"]);
        assert!((0.5..=1.0).contains(&score));
    }

    #[test]
    fn consensus_for_three_responses_uses_the_full_intersection_not_pairwise_average() {
        // two identical responses plus one fully disjoint one: the
        // intersection across all three is empty, so consensus should
        // bottom out at 0.5 rather than land near 0.667 (what a pairwise
        // average of {1.0, 0.0, 0.0} would produce).
        let score = consensus_score(&["x y z", "x y z", "p q r"]);
        assert_eq!(score, 0.5);
    }

    #[test]
    fn low_jaccard_triggers_synthesis_with_expected_header() {
        let a = model_result("a", "the quick brown fox jumps", 100);
        let b = model_result("b", "completely different words here today", 50);
        let valid = vec![&a, &b];
        let (consensus, synthesized, final_text) = synthesize(&valid, Mode::Chat, 0.75);
        assert!(synthesized);
        assert!(consensus < 0.75);
        assert!(final_text.starts_with("[NEXUS Synthesized"));
    }

    #[test]
    fn high_agreement_does_not_synthesize() {
        let a = model_result("a", "the answer is forty two", 100);
        let b = model_result("b", "the answer is forty two", 50);
        let valid = vec![&a, &b];
        let (_, synthesized, final_text) = synthesize(&valid, Mode::Chat, 0.75);
        assert!(!synthesized);
        assert_eq!(final_text, "the answer is forty two");
    }

    #[test]
    fn primary_selection_prefers_lowest_latency_for_chat() {
        let a = model_result("a", "slow response", 500);
        let b = model_result("b", "fast response", 10);
        let valid = vec![&a, &b];
        let primary = select_primary(&valid, Mode::Chat);
        assert_eq!(primary.model_id, "b");
    }

    #[test]
    fn primary_selection_prefers_highest_token_count_for_code_mode() {
        let mut a = model_result("a", "short", 10);
        a.input_tokens = 5;
        a.output_tokens = 5;
        let mut b = model_result("b", "long", 100);
        b.input_tokens = 50;
        b.output_tokens = 50;
        let valid = vec![&a, &b];
        let primary = select_primary(&valid, Mode::Code);
        assert_eq!(primary.model_id, "b");
    }

    #[test]
    fn stream_event_renders_sse_compatible_frame() {
        let event = StreamEvent::Token { text: "hi".into() };
        let frame = event.to_frame();
        assert!(frame.starts_with("data: "));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("\"type\":\"token\""));
    }

    #[test]
    fn validate_rejects_out_of_range_temperature() {
        let ctx = PromptContext {
            prompt: "hi".into(),
            messages: vec![],
            tenant_id: "t1".into(),
            actor_id: "a1".into(),
            plan: "enterprise".into(),
            mode: Mode::Chat,
            temperature: 2.01,
            max_tokens: 100,
            override_models: None,
            max_models: None,
            system: None,
        };
        assert!(Orchestrator::validate(&ctx).is_err());
    }

    #[test]
    fn validate_accepts_boundary_values() {
        let mut ctx = PromptContext {
            prompt: "hi".into(),
            messages: vec![],
            tenant_id: "t1".into(),
            actor_id: "a1".into(),
            plan: "enterprise".into(),
            mode: Mode::Chat,
            temperature: 0.0,
            max_tokens: 1,
            override_models: None,
            max_models: None,
            system: None,
        };
        assert!(Orchestrator::validate(&ctx).is_ok());
        ctx.temperature = 2.0;
        ctx.max_tokens = 32_768;
        assert!(Orchestrator::validate(&ctx).is_ok());
    }

    #[test]
    fn validate_rejects_max_tokens_boundaries() {
        let mut ctx = PromptContext {
            prompt: "hi".into(),
            messages: vec![],
            tenant_id: "t1".into(),
            actor_id: "a1".into(),
            plan: "enterprise".into(),
            mode: Mode::Chat,
            temperature: 1.0,
            max_tokens: 0,
            override_models: None,
            max_models: None,
            system: None,
        };
        assert!(Orchestrator::validate(&ctx).is_err());
        ctx.max_tokens = 32_769;
        assert!(Orchestrator::validate(&ctx).is_err());
    }

    #[tokio::test]
    async fn all_providers_failed_leaves_an_audit_trail() {
        use nexus_cost::InMemoryCounterStore;
        use std::collections::HashMap;

        let tmp = tempfile::NamedTempFile::new().unwrap();

        let policy = PolicyConfig {
            allowed_models_per_tenant: HashMap::from([("enterprise".to_string(), vec!["gpt-4o".to_string()])]),
            max_tokens_per_call: 4096,
            disallowed_topics: vec![],
            required_pii_scan: true,
        };
        let creds = CredentialStore::new(HashMap::new());
        // Empty registry: every routed model has no provider registered, so
        // the fan-out comes back all-errored rather than all-timed-out.
        let providers = ProviderRegistry::new();
        let cost = Arc::new(CostTracker::new(Arc::new(InMemoryCounterStore::new())));
        let audit = Arc::new(AuditAppender::open(tmp.path()).unwrap());
        let orchestrator = Orchestrator::new(policy, creds, providers, cost, audit, NexusConfig::default());

        let ctx = PromptContext {
            prompt: "hello there".into(),
            messages: vec![],
            tenant_id: "t1".into(),
            actor_id: "a1".into(),
            plan: "enterprise".into(),
            mode: Mode::Chat,
            temperature: 0.7,
            max_tokens: 100,
            override_models: Some(vec!["gpt-4o".to_string()]),
            max_models: None,
            system: None,
        };

        let err = orchestrator.orchestrate(ctx).await.unwrap_err();
        assert!(matches!(err, NexusError::AllProvidersFailed));

        // the audit write is fire-and-forget; give the spawned task a chance
        // to run before reading the file back.
        let mut contents = String::new();
        for _ in 0..20 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            contents = std::fs::read_to_string(tmp.path()).unwrap_or_default();
            if !contents.trim().is_empty() {
                break;
            }
        }

        assert!(!contents.trim().is_empty(), "expected a failure audit entry to be written");
        assert!(contents.contains("\"event\":\"inference.failed\""));
        assert!(contents.contains("\"reason\":\"all_providers_errored\""));
    }
}
