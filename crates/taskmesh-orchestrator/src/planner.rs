//! Task planning.
//!
//! A planner decomposes a natural-language task into an ordered pipeline
//! of capability-tagged subtasks.  The production implementation asks an
//! LLM and parses its `<tasks>` envelope; a keyword planner covers
//! offline runs.  Callers must tolerate failure: when a planner errors
//! or returns nothing, the orchestrator falls back to a single
//! text-generation stage carrying the whole task.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};

use crate::capability::{
    ANALYSIS_SUMMARY, FALLBACK_CAPABILITY, GRAMMAR_POLISH, MATH_REASONING,
};
use crate::error::{OrchestratorError, Result};
use crate::tracker::Subtask;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Splits a task into an ordered subtask pipeline.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Decompose `task_text` using the given capability vocabulary.
    ///
    /// An `Ok(vec![])` is treated by callers the same as an error: fall
    /// back to [`fallback_pipeline`].
    async fn plan(&self, task_text: &str, vocabulary: &[&str]) -> Result<Vec<Subtask>>;
}

/// The single-stage pipeline used when planning fails.
pub fn fallback_pipeline(task_text: &str) -> Vec<Subtask> {
    vec![Subtask {
        prompt: task_text.to_string(),
        required_capability: FALLBACK_CAPABILITY.to_string(),
    }]
}

// ---------------------------------------------------------------------------
// Prompt + parse
// ---------------------------------------------------------------------------

/// Build the decomposition prompt listing the capability vocabulary.
pub fn build_split_prompt(task_text: &str, vocabulary: &[&str]) -> String {
    let ability_tags: String = vocabulary.iter().map(|c| format!("<{c}>")).collect();
    let ability_names = vocabulary.join(", ");
    format!(
        r#"You need to split the given task into subtasks according to the workers available in the group.
The content of the task is:
==============================
{task_text}
==============================
Following are the available workers, given in the format <ability>
==============================
{ability_tags}
==============================
You must return the subtasks in the format of a numbered list within <tasks> tags, as shown below:
<tasks>
<task>Subtask 1</task><ability>one of {ability_names}</ability>
<task>Subtask 2</task><ability>one of {ability_names}</ability>
</tasks>
"#
    )
}

fn tasks_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<tasks>(.*?)</tasks>").unwrap())
}

fn task_item_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<task>(.*?)</task>\s*<ability>(.*?)</ability>").unwrap())
}

/// Parse a planner response's `<tasks>` envelope into subtasks.
///
/// Returns an empty vector when no envelope is present -- the caller's
/// signal to fall back.
pub fn parse_subtask_list(response: &str) -> Vec<Subtask> {
    let Some(block) = tasks_block_regex()
        .captures(response)
        .and_then(|c| c.get(1))
    else {
        return Vec::new();
    };
    task_item_regex()
        .captures_iter(block.as_str())
        .map(|item| Subtask {
            prompt: item[1].trim().to_string(),
            required_capability: item[2].trim().to_string(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// LLM planner
// ---------------------------------------------------------------------------

/// Default chat-completions endpoint.
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default planning model.
const DEFAULT_MODEL: &str = "gpt-4o-2024-08-06";

/// Configuration for the LLM-backed planner.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// API key for the chat-completions endpoint.
    pub api_key: String,
    /// Base URL of an OpenAI-compatible API.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
}

impl PlannerConfig {
    /// Configuration for the default endpoint and model.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_owned(),
            model: DEFAULT_MODEL.to_owned(),
        }
    }
}

/// Planner that delegates decomposition to a chat-completions API.
pub struct LlmPlanner {
    config: PlannerConfig,
    http: reqwest::Client,
}

impl LlmPlanner {
    /// Create a planner client.
    pub fn new(config: PlannerConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(OrchestratorError::PlanningFailed {
                reason: "planner API key is empty".into(),
            });
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| OrchestratorError::PlanningFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { config, http })
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0,
        });
        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| OrchestratorError::PlanningFailed {
                reason: format!("planner request failed: {e}"),
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| OrchestratorError::PlanningFailed {
                reason: format!("failed to read planner response: {e}"),
            })?;
        if !status.is_success() {
            return Err(OrchestratorError::PlanningFailed {
                reason: format!("planner API returned {status}: {text}"),
            });
        }

        let value: Value =
            serde_json::from_str(&text).map_err(|e| OrchestratorError::PlanningFailed {
                reason: format!("planner response is not JSON: {e}"),
            })?;
        value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| OrchestratorError::PlanningFailed {
                reason: "planner response missing choices[0].message.content".into(),
            })
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, task_text: &str, vocabulary: &[&str]) -> Result<Vec<Subtask>> {
        let prompt = build_split_prompt(task_text, vocabulary);
        let response = self.complete(&prompt).await?;
        let subtasks = parse_subtask_list(&response);
        tracing::info!(stages = subtasks.len(), "task decomposed");
        Ok(subtasks)
    }
}

// ---------------------------------------------------------------------------
// Keyword planner
// ---------------------------------------------------------------------------

/// Offline planner that derives a pipeline from keyword hints.
///
/// Every pipeline starts with a text-generation stage carrying the task;
/// mention of calculation, polishing, or analysis appends the matching
/// follow-up stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordPlanner;

#[async_trait]
impl Planner for KeywordPlanner {
    async fn plan(&self, task_text: &str, _vocabulary: &[&str]) -> Result<Vec<Subtask>> {
        let lowered = task_text.to_lowercase();
        let mut pipeline = fallback_pipeline(task_text);

        let hints: [(&[&str], &str, &str); 3] = [
            (
                &["calculate", "compute", "how many", "fibonacci"],
                MATH_REASONING,
                "Work out the calculation required by the task and show the result.",
            ),
            (
                &["polish", "grammar", "rewrite"],
                GRAMMAR_POLISH,
                "Polish the grammar and style of the draft produced so far.",
            ),
            (
                &["summar", "analys", "analyz", "explain"],
                ANALYSIS_SUMMARY,
                "Summarise the findings so far into a short conclusion.",
            ),
        ];
        for (needles, capability, prompt) in hints {
            if needles.iter().any(|n| lowered.contains(n)) {
                pipeline.push(Subtask {
                    prompt: prompt.to_string(),
                    required_capability: capability.to_string(),
                });
            }
        }
        Ok(pipeline)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::DEFAULT_VOCABULARY;

    #[test]
    fn prompt_lists_every_capability() {
        let prompt = build_split_prompt("write an essay", &DEFAULT_VOCABULARY);
        for capability in DEFAULT_VOCABULARY {
            assert!(prompt.contains(&format!("<{capability}>")));
        }
        assert!(prompt.contains("write an essay"));
    }

    #[test]
    fn parses_well_formed_envelope() {
        let response = r#"Sure, here is the split:
<tasks>
<task>Draft the essay</task><ability>text-generation</ability>
<task>Polish it</task>
<ability>grammar-polish</ability>
</tasks>"#;
        let subtasks = parse_subtask_list(response);
        assert_eq!(subtasks.len(), 2);
        assert_eq!(subtasks[0].prompt, "Draft the essay");
        assert_eq!(subtasks[0].required_capability, "text-generation");
        assert_eq!(subtasks[1].required_capability, "grammar-polish");
    }

    #[test]
    fn garbage_parses_to_empty() {
        assert!(parse_subtask_list("no envelope here").is_empty());
        assert!(parse_subtask_list("<tasks></tasks>").is_empty());
        assert!(parse_subtask_list("").is_empty());
    }

    #[test]
    fn fallback_is_single_text_generation_stage() {
        let pipeline = fallback_pipeline("just do it");
        assert_eq!(pipeline.len(), 1);
        assert_eq!(pipeline[0].prompt, "just do it");
        assert_eq!(pipeline[0].required_capability, FALLBACK_CAPABILITY);
    }

    #[tokio::test]
    async fn keyword_planner_builds_multi_stage_pipelines() {
        let planner = KeywordPlanner;
        let pipeline = planner
            .plan(
                "Calculate the 20th Fibonacci number and explain the result",
                &DEFAULT_VOCABULARY,
            )
            .await
            .unwrap();

        let capabilities: Vec<&str> = pipeline
            .iter()
            .map(|s| s.required_capability.as_str())
            .collect();
        assert_eq!(
            capabilities,
            vec![FALLBACK_CAPABILITY, MATH_REASONING, ANALYSIS_SUMMARY]
        );
    }

    #[test]
    fn llm_planner_rejects_empty_key() {
        assert!(LlmPlanner::new(PlannerConfig::new("")).is_err());
    }
}
