//! Prompt text lookup.
//!
//! The dialogue core only needs `PromptCatalog::get`; where the text lives is
//! up to the implementation. `StaticPromptCatalog` is the built-in one.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

pub type PromptArgs = BTreeMap<String, String>;

/// Well-known prompt identifiers.
pub mod ids {
    pub const FIELD_PROMPT: &str = "elicitation.field";
    pub const SEARCH_CRITERION_PROMPT: &str = "elicitation.search_criterion";
    pub const RETRY_PROMPT: &str = "elicitation.retry";
    pub const FIELD_INSTRUCTIONS: &str = "elicitation.instructions";
    pub const DISAMBIGUATION_PROMPT: &str = "disambiguation.prompt";
    pub const DISAMBIGUATION_INSTRUCTIONS: &str = "disambiguation.instructions";
    pub const NO_MATCHES: &str = "search.no_matches";
    pub const GUIDED_CREATE: &str = "guided_create";
    pub const IDENTIFY_PATIENT: &str = "identify_patient";
}

/// A prompt the catalog advertises to clients (MCP `prompts/list`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptDefinition {
    pub id: &'static str,
    pub description: &'static str,
    pub arguments: &'static [&'static str],
}

/// Read-only text lookup keyed by an identifier and interpolation context.
pub trait PromptCatalog: Send + Sync {
    fn get(&self, id: &str, context: &PromptArgs) -> Option<String>;

    /// Prompts meant to be listed to clients. Internal templates are not listed.
    fn definitions(&self) -> Vec<PromptDefinition> {
        Vec::new()
    }
}

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("valid placeholder regex")
});

/// Replace `{{key}}` placeholders with values from `args`.
/// Placeholders without a value are dropped.
pub fn interpolate(template: &str, args: &PromptArgs) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            args.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Build prompt args from string pairs.
pub fn prompt_args<const N: usize>(pairs: [(&str, String); N]) -> PromptArgs {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

const TEMPLATES: &[(&str, &str)] = &[
    (
        ids::FIELD_PROMPT,
        "Please provide {{field}} for the new {{resourceType}}: {{description}}.",
    ),
    (
        ids::SEARCH_CRITERION_PROMPT,
        "Provide a {{field}} to search {{resourceType}} records: {{description}}.",
    ),
    (ids::RETRY_PROMPT, "{{error}} {{prompt}}"),
    (
        ids::FIELD_INSTRUCTIONS,
        "Ask the user for {{field}} and call {{tool}} again with the same resourceType, the accumulated {{container}}, and elicitation = { context: <the context above>, answer: <the user's reply> }. Example answers: {{examples}}.",
    ),
    (
        ids::DISAMBIGUATION_PROMPT,
        "Found {{count}} {{resourceType}} records matching the search. Select one by number:\n{{list}}",
    ),
    (
        ids::DISAMBIGUATION_INSTRUCTIONS,
        "Show the numbered list to the user and call {{tool}} again with resourceType {{resourceType}} and elicitation = { context: <the context above>, answer: <number between 1 and {{count}}> }.",
    ),
    (
        ids::NO_MATCHES,
        "No {{resourceType}} records matched the search criteria.",
    ),
    (
        ids::GUIDED_CREATE,
        "Create a FHIR {{resourceType}} with fhir_create. Start with whatever fields the user already gave {{details}}; when the tool answers with requiresInput, ask the user exactly the elicitation prompt, then resend the accumulated resource together with elicitation.context and the answer. Stop when the tool returns a completed create.",
    ),
    (
        ids::IDENTIFY_PATIENT,
        "Identify a single Patient with fhir_identify using the details {{details}}. If several patients match, show the numbered list and send back the chosen number with the elicitation context. If none match, say so instead of guessing.",
    ),
];

/// Built-in catalog backed by a static table.
#[derive(Debug, Clone)]
pub struct StaticPromptCatalog {
    templates: BTreeMap<&'static str, &'static str>,
}

impl Default for StaticPromptCatalog {
    fn default() -> Self {
        Self {
            templates: TEMPLATES.iter().copied().collect(),
        }
    }
}

impl PromptCatalog for StaticPromptCatalog {
    fn get(&self, id: &str, context: &PromptArgs) -> Option<String> {
        self.templates
            .get(id)
            .map(|template| interpolate(template, context))
    }

    fn definitions(&self) -> Vec<PromptDefinition> {
        vec![
            PromptDefinition {
                id: ids::GUIDED_CREATE,
                description: "Walk the user through creating a FHIR resource one field at a time",
                arguments: &["resourceType", "details"],
            },
            PromptDefinition {
                id: ids::IDENTIFY_PATIENT,
                description: "Find exactly one Patient, asking the user to pick when several match",
                arguments: &["details"],
            },
        ]
    }
}
