use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::disambiguation::DisambiguationCandidate;
use crate::error::DialogueError;
use crate::schema::{ConstraintSet, FieldSpec, Shape};

const CONTEXT_PREFIX: &str = "elicit.v1.";

/// Which tool flow a dialogue belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Workflow {
    Create,
    Search,
    Identify,
}

impl Workflow {
    /// Tool the caller resubmits to.
    pub fn tool_name(self) -> &'static str {
        match self {
            Workflow::Create => "fhir_create",
            Workflow::Search => "fhir_search",
            Workflow::Identify => "fhir_identify",
        }
    }

    /// Argument holding the accumulated partial input.
    pub fn container_key(self) -> &'static str {
        match self {
            Workflow::Create => "resource",
            Workflow::Search | Workflow::Identify => "searchParams",
        }
    }
}

/// `validation` block of an elicitation: the shape plus its constraints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldValidation {
    #[serde(rename = "type")]
    pub shape: Shape,
    #[serde(flatten)]
    pub constraints: ConstraintSet,
}

impl FieldValidation {
    pub fn of(spec: &FieldSpec) -> Self {
        Self {
            shape: spec.shape,
            constraints: spec.constraints.clone(),
        }
    }
}

/// A request for exactly one missing piece of information.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElicitationRequest {
    pub prompt: String,
    pub context: String,
    pub required: bool,
    pub validation: FieldValidation,
    pub examples: Vec<String>,
}

/// An elicitation as handed to the client, with instructions for the next turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Elicitation {
    pub request: ElicitationRequest,
    pub instructions: String,
    /// Set only for disambiguation: the answer must be an ordinal.
    pub multiple_matches: Option<usize>,
}

impl Elicitation {
    pub fn to_value(&self) -> Value {
        let mut payload = json!({
            "requiresInput": true,
            "elicitation": self.request,
            "instructions": self.instructions,
        });
        if let Some(count) = self.multiple_matches {
            payload["multipleMatches"] = json!(count);
        }
        payload
    }
}

/// The caller's reply to an earlier elicitation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElicitationAnswer {
    pub context: String,
    pub answer: String,
}

/// Where a dialogue stands, encoded into the `context` string the caller echoes.
///
/// This is the only state that crosses turns. Selection contexts carry the
/// numbered candidates so an answer maps to the same records that were shown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ElicitationContext {
    Field {
        workflow: Workflow,
        resource_type: String,
        field: String,
    },
    Selection {
        resource_type: String,
        candidates: Vec<DisambiguationCandidate>,
    },
}

impl ElicitationContext {
    pub fn resource_type(&self) -> &str {
        match self {
            ElicitationContext::Field { resource_type, .. }
            | ElicitationContext::Selection { resource_type, .. } => resource_type,
        }
    }

    pub fn encode(&self) -> Result<String, DialogueError> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| DialogueError::InvalidContext(format!("cannot encode context: {e}")))?;
        Ok(format!("{CONTEXT_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes)))
    }

    pub fn decode(token: &str) -> Result<Self, DialogueError> {
        let encoded = token.trim().strip_prefix(CONTEXT_PREFIX).ok_or_else(|| {
            DialogueError::InvalidContext(format!(
                "context must start with '{CONTEXT_PREFIX}'; echo the context string exactly as issued"
            ))
        })?;
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| DialogueError::InvalidContext(format!("context is not valid base64: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| DialogueError::InvalidContext(format!("context payload is malformed: {e}")))
    }
}
