//! Agent role sum type (component I, SPEC_FULL §4.9b): role-specific prompt template, JSON
//! schema, and default timeout carried as associated data on one enum, rather than a trait-object
//! hierarchy.
//!
//! Grounded on `agent/orchestrator.rs::AgentType` (`system_prompt()` per variant) and
//! `circle.rs::Persona` (`system_prompt()`/`model_hint()` per variant) -- the same shape,
//! generalized with the schema each role expects back.

use std::time::Duration;

/// Field type a schema entry expects; used by `agent::json_repair::validate` to type-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Bool,
    Array,
    Object,
}

/// One required field in an agent's expected JSON output.
#[derive(Debug, Clone)]
pub struct SchemaField {
    pub name: String,
    pub field_type: FieldType,
}

pub type Schema = Vec<SchemaField>;

/// Escape hatch for ad hoc agent roles that don't deserve a dedicated variant (external callers,
/// CLI-defined roles -- out of scope here, but the type must exist for the general case).
#[derive(Debug, Clone)]
pub struct CustomAgentSpec {
    pub name: String,
    pub system_prompt: String,
    pub schema: Schema,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub enum AgentRole {
    Researcher,
    Critic,
    Editor,
    Storyteller,
    Custom(CustomAgentSpec),
}

fn field(name: &str, field_type: FieldType) -> SchemaField {
    SchemaField { name: name.to_string(), field_type }
}

fn researcher_schema() -> Schema {
    vec![
        field("summary", FieldType::String),
        field("key_points", FieldType::Array),
        field("context", FieldType::String),
    ]
}

fn critic_schema() -> Schema {
    vec![field("issues", FieldType::Array), field("assessment", FieldType::String)]
}

fn editor_schema() -> Schema {
    vec![field("final_output", FieldType::String)]
}

fn storyteller_schema() -> Schema {
    vec![field("story", FieldType::String)]
}

const RESEARCHER_PROMPT: &str = "You are a Research agent. Gather and synthesize information \
    thoroughly. Respond with JSON containing 'summary' (string), 'key_points' (array of strings), \
    and 'context' (string with supporting detail).";

const CRITIC_PROMPT: &str = "You are a Critic agent. Identify gaps, inaccuracies, and weak \
    reasoning in the given content. Respond with JSON containing 'issues' (array of strings) and \
    'assessment' (string summarizing overall quality).";

const EDITOR_PROMPT: &str = "You are an Editor agent. Synthesize and polish the given material \
    into a single coherent document. Respond with JSON containing 'final_output' (string).";

const STORYTELLER_PROMPT: &str = "You are a Storyteller agent. Write vivid, original narrative \
    prose. Respond with JSON containing 'story' (string) with the actual narrative text.";

impl AgentRole {
    pub fn name(&self) -> &str {
        match self {
            AgentRole::Researcher => "Researcher",
            AgentRole::Critic => "Critic",
            AgentRole::Editor => "Editor",
            AgentRole::Storyteller => "Storyteller",
            AgentRole::Custom(spec) => &spec.name,
        }
    }

    pub fn system_prompt(&self) -> &str {
        match self {
            AgentRole::Researcher => RESEARCHER_PROMPT,
            AgentRole::Critic => CRITIC_PROMPT,
            AgentRole::Editor => EDITOR_PROMPT,
            AgentRole::Storyteller => STORYTELLER_PROMPT,
            AgentRole::Custom(spec) => &spec.system_prompt,
        }
    }

    pub fn schema(&self) -> Schema {
        match self {
            AgentRole::Researcher => researcher_schema(),
            AgentRole::Critic => critic_schema(),
            AgentRole::Editor => editor_schema(),
            AgentRole::Storyteller => storyteller_schema(),
            AgentRole::Custom(spec) => spec.schema.clone(),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        match self {
            AgentRole::Editor => Duration::from_secs(600),
            AgentRole::Custom(spec) => spec.timeout,
            _ => Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn editor_has_longer_default_timeout_than_researcher() {
        assert!(AgentRole::Editor.default_timeout() > AgentRole::Researcher.default_timeout());
    }

    #[test]
    fn custom_role_carries_its_own_schema() {
        let custom = AgentRole::Custom(CustomAgentSpec {
            name: "Summarizer".to_string(),
            system_prompt: "Summarize the input".to_string(),
            schema: vec![field("summary", FieldType::String)],
            timeout: Duration::from_secs(120),
        });
        assert_eq!(custom.name(), "Summarizer");
        assert_eq!(custom.schema().len(), 1);
    }

    #[test]
    fn built_in_roles_expose_non_empty_schemas() {
        for role in [AgentRole::Researcher, AgentRole::Critic, AgentRole::Editor, AgentRole::Storyteller] {
            assert!(!role.schema().is_empty());
            assert!(!role.system_prompt().is_empty());
        }
    }
}
