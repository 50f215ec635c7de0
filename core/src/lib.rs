pub mod completeness;
pub mod dialogue;
pub mod disambiguation;
pub mod elicitation;
pub mod error;
pub mod prompts;
pub mod resource;
pub mod schema;
pub mod validate;

pub use completeness::CompletenessResolver;
pub use dialogue::{CallKind, DialogueOrchestrator, DialogueOutcome, DialogueRequest, IdentifyOutcome};
pub use disambiguation::DisambiguationCandidate;
pub use elicitation::{Elicitation, ElicitationAnswer, ElicitationContext, ElicitationRequest, Workflow};
pub use error::DialogueError;
pub use prompts::{PromptCatalog, PromptDefinition, StaticPromptCatalog};
pub use resource::PartialResource;
pub use schema::{FieldSpec, SchemaRegistry, Shape};
pub use validate::{FailureKind, ValidationFailure, validate};
