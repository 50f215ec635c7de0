use std::sync::Arc;

use serde_json::Value;

use crate::completeness::CompletenessResolver;
use crate::disambiguation::{
    self, Disambiguation, DisambiguationCandidate, render_list, selection_spec,
};
use crate::elicitation::{
    Elicitation, ElicitationAnswer, ElicitationContext, ElicitationRequest, FieldValidation,
    Workflow,
};
use crate::error::DialogueError;
use crate::prompts::{PromptArgs, PromptCatalog, ids, prompt_args};
use crate::resource::PartialResource;
use crate::schema::{FieldSpec, GENERIC_RESOURCE_FIELD, SchemaRegistry};
use crate::validate::{ValidationFailure, validate};

/// One tool invocation as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct DialogueRequest {
    pub workflow: Workflow,
    pub resource_type: String,
    /// Accumulated resource (create) or search criteria (search, identify).
    pub partial: PartialResource,
    pub answer: Option<ElicitationAnswer>,
}

impl DialogueRequest {
    pub fn new(workflow: Workflow, partial: PartialResource) -> Self {
        Self {
            workflow,
            resource_type: partial.resource_type.clone(),
            partial,
            answer: None,
        }
    }

    pub fn with_answer(mut self, context: impl Into<String>, answer: impl Into<String>) -> Self {
        self.answer = Some(ElicitationAnswer {
            context: context.into(),
            answer: answer.into(),
        });
        self
    }
}

/// How a call relates to earlier elicitations.
#[derive(Debug, Clone, PartialEq)]
pub enum CallKind {
    Fresh,
    FieldAnswer { field: String },
    SelectionAnswer { candidates: Vec<DisambiguationCandidate> },
}

/// Exactly one of: ask the caller something, or proceed.
#[derive(Debug, Clone, PartialEq)]
pub enum DialogueOutcome {
    NeedsInput(Elicitation),
    Ready(PartialResource),
}

/// Identification adds a terminal "nothing matched" outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentifyOutcome {
    NoMatches { resource_type: String, message: String },
    Dialogue(DialogueOutcome),
}

/// Internal result flags. Only two combinations are meaningful; see `into_outcome`.
#[derive(Debug, Default)]
struct ResolutionState {
    needs_input: bool,
    processed_args: Option<PartialResource>,
    elicitation_request: Option<Elicitation>,
}

impl ResolutionState {
    fn needs_input(elicitation: Elicitation) -> Self {
        Self {
            needs_input: true,
            processed_args: None,
            elicitation_request: Some(elicitation),
        }
    }

    fn ready(partial: PartialResource) -> Self {
        Self {
            needs_input: false,
            processed_args: Some(partial),
            elicitation_request: None,
        }
    }

    fn into_outcome(self) -> Result<DialogueOutcome, DialogueError> {
        match self {
            ResolutionState {
                needs_input: true,
                processed_args: None,
                elicitation_request: Some(elicitation),
            } => Ok(DialogueOutcome::NeedsInput(elicitation)),
            ResolutionState {
                needs_input: false,
                processed_args: Some(partial),
                elicitation_request: None,
            } => Ok(DialogueOutcome::Ready(partial)),
            ResolutionState {
                needs_input,
                processed_args,
                elicitation_request,
            } => Err(DialogueError::InvariantViolation {
                needs_input,
                processed_args: processed_args.is_some(),
                elicitation_request: elicitation_request.is_some(),
            }),
        }
    }
}

/// Per-call entry point of the guided dialogue.
///
/// Holds only immutable collaborators, so one instance can serve concurrent
/// calls. Every decision is a function of the request.
#[derive(Clone)]
pub struct DialogueOrchestrator {
    registry: Arc<SchemaRegistry>,
    catalog: Arc<dyn PromptCatalog>,
}

impl DialogueOrchestrator {
    pub fn new(registry: Arc<SchemaRegistry>, catalog: Arc<dyn PromptCatalog>) -> Self {
        Self { registry, catalog }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &dyn PromptCatalog {
        self.catalog.as_ref()
    }

    pub fn missing_required_fields(&self, partial: &PartialResource) -> Vec<&FieldSpec> {
        CompletenessResolver::new(&self.registry)
            .missing_required_fields(&partial.resource_type, partial)
    }

    /// Classify the call by the context echoed with its answer, if any.
    pub fn analyze(&self, request: &DialogueRequest) -> Result<CallKind, DialogueError> {
        let Some(answer) = &request.answer else {
            return Ok(CallKind::Fresh);
        };
        let context = ElicitationContext::decode(&answer.context)?;
        if context.resource_type() != request.resource_type {
            return Err(DialogueError::ContextMismatch {
                expected: context.resource_type().to_string(),
                actual: request.resource_type.clone(),
            });
        }

        match context {
            ElicitationContext::Field {
                workflow, field, ..
            } => {
                if workflow != request.workflow {
                    return Err(DialogueError::ContextMismatch {
                        expected: workflow.tool_name().to_string(),
                        actual: request.workflow.tool_name().to_string(),
                    });
                }
                Ok(CallKind::FieldAnswer { field })
            }
            ElicitationContext::Selection { candidates, .. } => {
                if request.workflow != Workflow::Identify {
                    return Err(DialogueError::ContextMismatch {
                        expected: Workflow::Identify.tool_name().to_string(),
                        actual: request.workflow.tool_name().to_string(),
                    });
                }
                if candidates.is_empty() {
                    return Err(DialogueError::InvalidContext(
                        "selection context carries no candidates".to_string(),
                    ));
                }
                Ok(CallKind::SelectionAnswer { candidates })
            }
        }
    }

    /// Apply a pending answer, then check completeness.
    ///
    /// A pending selection is resolved first and never falls through to the
    /// completeness check.
    pub fn resolve(&self, request: DialogueRequest) -> Result<DialogueOutcome, DialogueError> {
        let kind = self.analyze(&request)?;
        let DialogueRequest {
            workflow,
            resource_type,
            mut partial,
            answer,
        } = request;
        let raw_answer = answer.map(|a| a.answer).unwrap_or_default();

        match kind {
            CallKind::SelectionAnswer { candidates } => {
                return self.resolve_selection(&resource_type, &candidates, &raw_answer);
            }
            CallKind::FieldAnswer { field } => {
                let spec = self.answer_spec(workflow, &resource_type, &field)?;
                match validate(&raw_answer, &spec) {
                    Err(failure) => {
                        let elicitation =
                            self.field_elicitation(workflow, &resource_type, &spec, Some(&failure))?;
                        return ResolutionState::needs_input(elicitation).into_outcome();
                    }
                    Ok(Value::Null) => {}
                    Ok(value) => self.merge_answer(&mut partial, &spec, value),
                }
            }
            CallKind::Fresh => {}
        }

        let state = match workflow {
            Workflow::Create => {
                match CompletenessResolver::new(&self.registry)
                    .next_missing_field(&resource_type, &partial)
                {
                    Some(spec) => ResolutionState::needs_input(self.field_elicitation(
                        workflow,
                        &resource_type,
                        spec,
                        None,
                    )?),
                    None => ResolutionState::ready(partial),
                }
            }
            Workflow::Search | Workflow::Identify => {
                match self.registry.search_fields_for(&resource_type).first() {
                    Some(first) if partial.is_empty() => {
                        let spec = first.clone().required();
                        ResolutionState::needs_input(self.field_elicitation(
                            workflow,
                            &resource_type,
                            &spec,
                            None,
                        )?)
                    }
                    _ => ResolutionState::ready(partial),
                }
            }
        };
        state.into_outcome()
    }

    /// Turn identification search results into no-match, a single record, or
    /// a numbered choice.
    pub fn resolve_candidates(
        &self,
        resource_type: &str,
        records: &[Value],
    ) -> Result<IdentifyOutcome, DialogueError> {
        let state = match disambiguation::build_disambiguation(resource_type, records) {
            Disambiguation::NoMatches => {
                let message = self.text(
                    ids::NO_MATCHES,
                    &prompt_args([("resourceType", resource_type.to_string())]),
                )?;
                return Ok(IdentifyOutcome::NoMatches {
                    resource_type: resource_type.to_string(),
                    message,
                });
            }
            Disambiguation::Single { record, .. } => {
                let kind = record
                    .get("resourceType")
                    .and_then(Value::as_str)
                    .unwrap_or(resource_type)
                    .to_string();
                ResolutionState::ready(PartialResource::from_value(kind, Some(&record)))
            }
            Disambiguation::Multiple { candidates } => ResolutionState::needs_input(
                self.selection_elicitation(resource_type, &candidates, None)?,
            ),
        };
        state.into_outcome().map(IdentifyOutcome::Dialogue)
    }

    /// Validate a numbered answer against the candidates carried in its context.
    /// `Ready` holds only the chosen record's id.
    pub fn resolve_selection(
        &self,
        resource_type: &str,
        candidates: &[DisambiguationCandidate],
        raw: &str,
    ) -> Result<DialogueOutcome, DialogueError> {
        let state = match disambiguation::resolve_selection(candidates, raw) {
            Ok(candidate) => {
                let mut selected = PartialResource::new(resource_type);
                selected.set("id", Value::String(candidate.record_id.clone()));
                ResolutionState::ready(selected)
            }
            Err(failure) => ResolutionState::needs_input(self.selection_elicitation(
                resource_type,
                candidates,
                Some(&failure),
            )?),
        };
        state.into_outcome()
    }

    fn answer_spec(
        &self,
        workflow: Workflow,
        resource_type: &str,
        field: &str,
    ) -> Result<FieldSpec, DialogueError> {
        let spec = match workflow {
            Workflow::Create => self.registry.field(resource_type, field).cloned(),
            // A criterion is only asked for when none was given, so it must be answered.
            Workflow::Search | Workflow::Identify => self
                .registry
                .search_field(resource_type, field)
                .map(|spec| spec.clone().required()),
        };
        spec.ok_or_else(|| DialogueError::UnknownField {
            resource_type: resource_type.to_string(),
            field: field.to_string(),
        })
    }

    fn merge_answer(&self, partial: &mut PartialResource, spec: &FieldSpec, value: Value) {
        let generic = !self.registry.is_registered(&partial.resource_type)
            && spec.name == GENERIC_RESOURCE_FIELD;
        match value {
            // The generic field stands for the whole resource.
            Value::Object(map) if generic => {
                for (key, value) in map {
                    if key != "resourceType" {
                        partial.set(key, value);
                    }
                }
            }
            value => partial.set(spec.name.clone(), value),
        }
    }

    fn field_elicitation(
        &self,
        workflow: Workflow,
        resource_type: &str,
        spec: &FieldSpec,
        failure: Option<&ValidationFailure>,
    ) -> Result<Elicitation, DialogueError> {
        let prompt_id = match workflow {
            Workflow::Create => ids::FIELD_PROMPT,
            Workflow::Search | Workflow::Identify => ids::SEARCH_CRITERION_PROMPT,
        };
        let prompt = self.text(
            prompt_id,
            &prompt_args([
                ("field", spec.name.clone()),
                ("resourceType", resource_type.to_string()),
                ("description", spec.description.clone()),
            ]),
        )?;
        let prompt = self.with_failure(prompt, failure)?;
        let context = ElicitationContext::Field {
            workflow,
            resource_type: resource_type.to_string(),
            field: spec.name.clone(),
        }
        .encode()?;
        let instructions = self.text(
            ids::FIELD_INSTRUCTIONS,
            &prompt_args([
                ("field", spec.name.clone()),
                ("tool", workflow.tool_name().to_string()),
                ("container", workflow.container_key().to_string()),
                ("examples", spec.examples.join(" | ")),
            ]),
        )?;

        Ok(Elicitation {
            request: ElicitationRequest {
                prompt,
                context,
                required: spec.is_required(),
                validation: FieldValidation::of(spec),
                examples: spec.examples.clone(),
            },
            instructions,
            multiple_matches: None,
        })
    }

    fn selection_elicitation(
        &self,
        resource_type: &str,
        candidates: &[DisambiguationCandidate],
        failure: Option<&ValidationFailure>,
    ) -> Result<Elicitation, DialogueError> {
        let count = candidates.len();
        let spec = selection_spec(count);
        let prompt = self.text(
            ids::DISAMBIGUATION_PROMPT,
            &prompt_args([
                ("count", count.to_string()),
                ("resourceType", resource_type.to_string()),
                ("list", render_list(candidates)),
            ]),
        )?;
        let prompt = self.with_failure(prompt, failure)?;
        let context = ElicitationContext::Selection {
            resource_type: resource_type.to_string(),
            candidates: candidates.to_vec(),
        }
        .encode()?;
        let instructions = self.text(
            ids::DISAMBIGUATION_INSTRUCTIONS,
            &prompt_args([
                ("tool", Workflow::Identify.tool_name().to_string()),
                ("resourceType", resource_type.to_string()),
                ("count", count.to_string()),
            ]),
        )?;

        Ok(Elicitation {
            request: ElicitationRequest {
                prompt,
                context,
                required: true,
                validation: FieldValidation::of(&spec),
                examples: spec.examples.clone(),
            },
            instructions,
            multiple_matches: Some(count),
        })
    }

    fn with_failure(
        &self,
        prompt: String,
        failure: Option<&ValidationFailure>,
    ) -> Result<String, DialogueError> {
        match failure {
            None => Ok(prompt),
            Some(failure) => self.text(
                ids::RETRY_PROMPT,
                &prompt_args([("error", failure.message.clone()), ("prompt", prompt)]),
            ),
        }
    }

    fn text(&self, id: &str, args: &PromptArgs) -> Result<String, DialogueError> {
        self.catalog
            .get(id, args)
            .ok_or_else(|| DialogueError::MissingPrompt(id.to_string()))
    }
}
