//! nexus_router
//!
//! Task detection + mode lookup -> ordered candidate model list, filtered
//! by provider exclusion and credential availability. The registry and
//! task/mode tables are static and read-only after startup.

use nexus_providers::CredentialStore;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Chat,
    Code,
    Reasoning,
    SearchRag,
    MultiModel,
    Fast,
    Creative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Math,
    Code,
    Reasoning,
    Creative,
    Translation,
    Summarization,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub provider: &'static str,
    pub strengths: &'static [&'static str],
    pub latency_tier: &'static str,
    pub cost_tier: &'static str,
}

/// Static model table. Order is insertion order and is also the order used
/// for the degenerate "first registered model" fallback.
pub static MODEL_REGISTRY: Lazy<Vec<(&'static str, ModelDescriptor)>> = Lazy::new(|| {
    vec![
        ("gpt-4o", ModelDescriptor { provider: "openai", strengths: &["general", "code", "reasoning"], latency_tier: "medium", cost_tier: "premium" }),
        ("gpt-4o-mini", ModelDescriptor { provider: "openai", strengths: &["general", "fast"], latency_tier: "fast", cost_tier: "cheap" }),
        ("o1-preview", ModelDescriptor { provider: "openai", strengths: &["reasoning", "math"], latency_tier: "slow", cost_tier: "expensive" }),
        ("claude-3-5-sonnet-20241022", ModelDescriptor { provider: "anthropic", strengths: &["general", "code", "creative", "reasoning"], latency_tier: "medium", cost_tier: "premium" }),
        ("claude-3-haiku-20240307", ModelDescriptor { provider: "anthropic", strengths: &["fast", "summarization"], latency_tier: "fast", cost_tier: "cheap" }),
        ("deepseek-reasoner", ModelDescriptor { provider: "deepseek", strengths: &["reasoning", "math", "code"], latency_tier: "medium", cost_tier: "cheap" }),
        ("deepseek-chat", ModelDescriptor { provider: "deepseek", strengths: &["general", "code"], latency_tier: "fast", cost_tier: "cheap" }),
        ("gemini-1.5-pro", ModelDescriptor { provider: "google", strengths: &["general", "search", "creative"], latency_tier: "slow", cost_tier: "expensive" }),
        ("llama-3.3-70b", ModelDescriptor { provider: "groq", strengths: &["general", "fast"], latency_tier: "fast", cost_tier: "cheap" }),
        ("mistral-large-latest", ModelDescriptor { provider: "mistral", strengths: &["general", "code"], latency_tier: "medium", cost_tier: "medium" }),
    ]
});

fn registry_lookup(model_id: &str) -> Option<&'static ModelDescriptor> {
    MODEL_REGISTRY.iter().find(|(id, _)| *id == model_id).map(|(_, d)| d)
}

pub fn provider_of(model_id: &str) -> &'static str {
    registry_lookup(model_id).map(|d| d.provider).unwrap_or("openai")
}

static MODE_MODELS: Lazy<Vec<(Mode, Vec<&'static str>)>> = Lazy::new(|| {
    vec![
        (Mode::Chat, vec!["claude-3-5-sonnet-20241022", "gpt-4o", "deepseek-chat"]),
        (Mode::Code, vec!["claude-3-5-sonnet-20241022", "deepseek-reasoner", "gpt-4o"]),
        (Mode::Reasoning, vec!["deepseek-reasoner", "o1-preview", "claude-3-5-sonnet-20241022"]),
        (Mode::SearchRag, vec!["gpt-4o", "claude-3-5-sonnet-20241022"]),
        (Mode::MultiModel, vec!["gpt-4o", "claude-3-5-sonnet-20241022", "deepseek-reasoner"]),
        (Mode::Fast, vec!["gpt-4o-mini", "claude-3-haiku-20240307", "llama-3.3-70b"]),
        (Mode::Creative, vec!["claude-3-5-sonnet-20241022", "gpt-4o", "gemini-1.5-pro"]),
    ]
});

fn mode_models(mode: Mode) -> Vec<&'static str> {
    MODE_MODELS
        .iter()
        .find(|(m, _)| *m == mode)
        .map(|(_, models)| models.clone())
        .unwrap_or_else(|| mode_models(Mode::Chat))
}

static TASK_MODELS: Lazy<Vec<(Task, Vec<&'static str>)>> = Lazy::new(|| {
    vec![
        (Task::Math, vec!["deepseek-reasoner", "o1-preview", "gpt-4o"]),
        (Task::Code, vec!["claude-3-5-sonnet-20241022", "deepseek-reasoner", "gpt-4o"]),
        (Task::Reasoning, vec!["deepseek-reasoner", "o1-preview", "claude-3-5-sonnet-20241022"]),
        (Task::Creative, vec!["claude-3-5-sonnet-20241022", "gpt-4o", "gemini-1.5-pro"]),
        (Task::Translation, vec!["gpt-4o", "claude-3-5-sonnet-20241022"]),
        (Task::Summarization, vec!["claude-3-haiku-20240307", "gpt-4o-mini"]),
        (Task::General, vec!["gpt-4o", "claude-3-5-sonnet-20241022"]),
    ]
});

fn task_models(task: Task) -> Vec<&'static str> {
    TASK_MODELS.iter().find(|(t, _)| *t == task).map(|(_, m)| m.clone()).unwrap_or_default()
}

/// Ordered keyword/regex rules. The first rule to match the lowercased
/// prompt wins; order is the tie-break.
static TASK_KEYWORDS: Lazy<Vec<(Task, Regex)>> = Lazy::new(|| {
    vec![
        (Task::Math, Regex::new(r"(?i)\b(calcul|integral|deriv|equation|matrix|solve|polynomial|theorem|proof|algebra|geometry|statistic|probabili)\b").unwrap()),
        (Task::Code, Regex::new(r"(?i)\b(code|function|class|debug|refactor|implement|script|python|javascript|typescript|rust|golang|sql|api|algorithm)\b").unwrap()),
        (Task::Reasoning, Regex::new(r"(?i)\b(reason|analyze|think|logic|deduce|infer|argument|evaluate|critique|compare|contrast|explain why)\b").unwrap()),
        (Task::Creative, Regex::new(r"(?i)\b(write|story|poem|creative|fiction|narrative|character|plot|metaphor|imagine|invent)\b").unwrap()),
        (Task::Translation, Regex::new(r"(?i)\b(translat|convert to|in (spanish|french|portuguese|german|japanese|chinese|arabic|italian))\b").unwrap()),
        (Task::Summarization, Regex::new(r"(?i)\b(summar|tldr|brief|overview|key points|main points|condense|abstract)\b").unwrap()),
    ]
});

fn detect_task(prompt: &str) -> Task {
    let lower = prompt.to_lowercase();
    for (task, pattern) in TASK_KEYWORDS.iter() {
        if pattern.is_match(&lower) {
            return *task;
        }
    }
    Task::General
}

fn is_available(model_id: &str, creds: &CredentialStore, environment: Environment) -> bool {
    if environment == Environment::Development {
        return true;
    }
    creds.has(provider_of(model_id))
}

/// Select up to `max_models` model ids for `prompt` under `mode`, honoring
/// provider exclusions and credential availability. Deterministic for a
/// fixed registry and credential set.
pub fn select_models(
    prompt: &str,
    mode: Mode,
    max_models: usize,
    exclude_providers: &[String],
    creds: &CredentialStore,
    environment: Environment,
) -> Vec<String> {
    let task = detect_task(prompt);

    let candidates: Vec<&'static str> =
        if matches!(task, Task::Math | Task::Code | Task::Reasoning) && mode != Mode::Fast {
            task_models(task)
        } else {
            mode_models(mode)
        };

    let candidates: Vec<&'static str> = candidates
        .into_iter()
        .filter(|m| !exclude_providers.iter().any(|p| p == provider_of(m)))
        .collect();

    let mut available: Vec<&'static str> =
        candidates.into_iter().filter(|m| is_available(m, creds, environment)).collect();

    if available.is_empty() {
        available = if is_available("gpt-4o", creds, environment) {
            vec!["gpt-4o"]
        } else {
            MODEL_REGISTRY.first().map(|(id, _)| vec![*id]).unwrap_or_default()
        };
    }

    available.truncate(max_models);
    let selected: Vec<String> = available.into_iter().map(|s| s.to_string()).collect();

    tracing::info!(task = ?task, mode = ?mode, models = ?selected, "router.selected");
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn store_with(providers: &[&str]) -> CredentialStore {
        let mut keys = HashMap::new();
        for p in providers {
            keys.insert(p.to_string(), "key".to_string());
        }
        CredentialStore::new(keys)
    }

    #[test]
    fn code_prompt_with_chat_mode_routes_via_task_table() {
        let creds = store_with(&["openai", "anthropic", "deepseek"]);
        let selected = select_models("please refactor this python function", Mode::Chat, 5, &[], &creds, Environment::Production);
        assert_eq!(selected[0], "claude-3-5-sonnet-20241022");
    }

    #[test]
    fn fast_mode_ignores_task_routing_even_for_code_prompts() {
        let creds = store_with(&["openai", "anthropic", "groq"]);
        let selected = select_models("debug this function", Mode::Fast, 5, &[], &creds, Environment::Production);
        assert_eq!(selected, vec!["gpt-4o-mini", "claude-3-haiku-20240307", "llama-3.3-70b"]);
    }

    #[test]
    fn excluded_providers_are_filtered_out() {
        let creds = store_with(&["openai", "anthropic", "deepseek"]);
        let selected = select_models("hello", Mode::Chat, 5, &["anthropic".to_string()], &creds, Environment::Production);
        assert!(!selected.iter().any(|m| provider_of(m) == "anthropic"));
    }

    #[test]
    fn result_is_truncated_to_max_models() {
        let creds = store_with(&["openai", "anthropic", "deepseek"]);
        let selected = select_models("hello", Mode::MultiModel, 2, &[], &creds, Environment::Production);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn no_credentials_falls_back_to_gpt4o_in_development() {
        let creds = store_with(&[]);
        let selected = select_models("hello", Mode::Chat, 5, &[], &creds, Environment::Development);
        assert!(!selected.is_empty());
    }

    #[test]
    fn no_credentials_in_production_degenerates_to_gpt4o_or_first_model() {
        let creds = store_with(&[]);
        let selected = select_models("hello", Mode::Chat, 5, &[], &creds, Environment::Production);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0], "gpt-4o");
    }

    #[test]
    fn selection_is_non_empty_and_bounded_when_any_provider_is_available() {
        let creds = store_with(&["openai"]);
        for mode in [Mode::Chat, Mode::Code, Mode::Reasoning, Mode::SearchRag, Mode::MultiModel, Mode::Fast, Mode::Creative] {
            let selected = select_models("generic prompt", mode, 5, &[], &creds, Environment::Production);
            assert!(!selected.is_empty());
            assert!(selected.len() <= 5);
        }
    }
}
