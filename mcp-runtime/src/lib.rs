use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use fhir_elicit_core::dialogue::{CallKind, DialogueOutcome, DialogueRequest, IdentifyOutcome};
use fhir_elicit_core::disambiguation::{Disambiguation, build_disambiguation};
use fhir_elicit_core::elicitation::{Elicitation, ElicitationAnswer, FieldValidation, Workflow};
use fhir_elicit_core::error::{DialogueError, codes};
use fhir_elicit_core::prompts::{PromptArgs, PromptCatalog, StaticPromptCatalog};
use fhir_elicit_core::{DialogueOrchestrator, FieldSpec, PartialResource, SchemaRegistry};
use serde_json::{Map, Value, json};
use tokio::io::{
    self, AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

pub mod fhir;
mod util;

use fhir::{
    FhirClient, Operation, RemoteError, ResourceExecutor, bundle_resources, validate_logical_id,
    validate_resource_type,
};
pub use util::FileConfig;
use util::load_file_config;

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const MCP_SERVER_NAME: &str = "fhir-elicit-mcp";
const DEFAULT_FHIR_BASE_URL: &str = "http://localhost:8080/fhir";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Subcommand)]
pub enum McpCommands {
    /// Run the guided FHIR MCP server over stdio
    Serve,
    /// Print the built-in field schemas as JSON (no network access)
    Schema(SchemaArgs),
}

#[derive(Args, Clone, Debug)]
pub struct SchemaArgs {
    /// Resource type to print; all registered types when omitted
    pub resource_type: Option<String>,
}

/// Settings given on the command line or through the environment.
/// Unset values fall back to the config file, then to built-in defaults.
#[derive(Args, Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// FHIR server base URL
    #[arg(long, env = "FHIR_BASE_URL")]
    pub fhir_base_url: Option<String>,
    /// Static bearer token for the FHIR server
    #[arg(long, env = "FHIR_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,
    /// FHIR request timeout in seconds
    #[arg(long, env = "FHIR_TIMEOUT_SECS")]
    pub timeout_secs: Option<u64>,
    /// Default for the `interactive` tool argument
    #[arg(long, env = "FHIR_ELICIT_INTERACTIVE", value_parser = clap::builder::BoolishValueParser::new())]
    pub interactive: Option<bool>,
}

pub async fn run(overrides: ConfigOverrides, command: McpCommands) -> i32 {
    match command {
        McpCommands::Schema(args) => {
            let registry = SchemaRegistry::fhir_r4();
            let payload = schema_payload(&registry, args.resource_type.as_deref());
            println!("{}", to_pretty_json(&payload));
            0
        }
        McpCommands::Serve => {
            let file = match load_file_config() {
                Ok(file) => file,
                Err(message) => {
                    tracing::error!(%message, "config file rejected");
                    return 1;
                }
            };
            let config = McpRuntimeConfig::resolve(overrides, file);
            let executor = match FhirClient::new(
                config.fhir_base_url.clone(),
                config.access_token.clone(),
                config.timeout,
            ) {
                Ok(executor) => executor,
                Err(err) => {
                    tracing::error!(error = %err, "cannot create FHIR client");
                    return 1;
                }
            };
            tracing::info!(
                server = MCP_SERVER_NAME,
                version = env!("CARGO_PKG_VERSION"),
                fhir_base_url = %config.fhir_base_url,
                timeout_secs = config.timeout.as_secs(),
                interactive_default = config.interactive_default,
                authenticated = config.access_token.is_some(),
                "starting MCP server over stdio"
            );
            let server = McpServer::new(config, executor);
            match server.serve_stdio().await {
                Ok(()) => 0,
                Err(err) => {
                    tracing::error!(error = %err, "MCP server stopped");
                    1
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct McpRuntimeConfig {
    pub fhir_base_url: String,
    pub access_token: Option<String>,
    pub timeout: Duration,
    pub interactive_default: bool,
}

impl McpRuntimeConfig {
    /// Command line and environment win over the config file.
    pub fn resolve(overrides: ConfigOverrides, file: Option<FileConfig>) -> Self {
        let file = file.unwrap_or_default();
        Self {
            fhir_base_url: overrides
                .fhir_base_url
                .or(file.fhir_base_url)
                .unwrap_or_else(|| DEFAULT_FHIR_BASE_URL.to_string()),
            access_token: overrides
                .access_token
                .or(file.access_token)
                .filter(|token| !token.trim().is_empty()),
            timeout: Duration::from_secs(
                overrides
                    .timeout_secs
                    .or(file.timeout_secs)
                    .filter(|secs| *secs > 0)
                    .unwrap_or(DEFAULT_TIMEOUT_SECS),
            ),
            interactive_default: overrides
                .interactive
                .or(file.interactive_default)
                .unwrap_or(true),
        }
    }
}

impl Default for McpRuntimeConfig {
    fn default() -> Self {
        Self::resolve(ConfigOverrides::default(), None)
    }
}

pub struct McpServer<E> {
    config: McpRuntimeConfig,
    executor: E,
    orchestrator: DialogueOrchestrator,
}

/// Result of a tool before it is wrapped for the client.
#[derive(Debug)]
enum ToolReply {
    NeedsInput(Elicitation),
    Final { status: &'static str, data: Value },
}

impl ToolReply {
    fn complete(data: Value) -> Self {
        ToolReply::Final {
            status: "complete",
            data,
        }
    }
}

impl<E: ResourceExecutor> McpServer<E> {
    pub fn new(config: McpRuntimeConfig, executor: E) -> Self {
        Self::with_catalog(config, executor, Arc::new(StaticPromptCatalog::default()))
    }

    pub fn with_catalog(
        config: McpRuntimeConfig,
        executor: E,
        catalog: Arc<dyn PromptCatalog>,
    ) -> Self {
        Self {
            config,
            executor,
            orchestrator: DialogueOrchestrator::new(Arc::new(SchemaRegistry::fhir_r4()), catalog),
        }
    }

    pub async fn serve_stdio(&self) -> Result<(), String> {
        let mut reader = BufReader::new(io::stdin());
        let mut stdout = io::stdout();
        self.serve(&mut reader, &mut stdout).await
    }

    async fn serve<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<(), String>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let incoming = read_framed_json(reader)
                .await
                .map_err(|e| format!("Failed to read MCP message: {e}"))?;
            let Some((payload, framing)) = incoming else {
                break;
            };

            let responses = match payload {
                Ok(incoming) => self.handle_incoming_message(incoming).await,
                Err(message) => {
                    tracing::debug!(%message, "unparseable MCP message");
                    vec![error_response(Value::Null, RpcError::parse_error(message))]
                }
            };
            for response in responses {
                write_framed_json(writer, &response, framing)
                    .await
                    .map_err(|e| format!("Failed to write MCP response: {e}"))?;
            }
        }

        Ok(())
    }

    async fn handle_incoming_message(&self, incoming: Value) -> Vec<Value> {
        let mut responses = Vec::new();

        if let Some(batch) = incoming.as_array() {
            if batch.is_empty() {
                responses.push(error_response(
                    Value::Null,
                    RpcError::invalid_request("Batch request must not be empty"),
                ));
                return responses;
            }
            for item in batch {
                if let Some(response) = self.handle_single_message(item.clone()).await {
                    responses.push(response);
                }
            }
            return responses;
        }

        if let Some(response) = self.handle_single_message(incoming).await {
            responses.push(response);
        }
        responses
    }

    async fn handle_single_message(&self, incoming: Value) -> Option<Value> {
        let Some(obj) = incoming.as_object() else {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            return Some(error_response(
                id,
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            // A client response; this server never sends requests.
            return None;
        };

        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        if let Some(id) = obj.get("id").cloned() {
            let result = self.handle_request(method, params).await;
            Some(match result {
                Ok(payload) => success_response(id, payload),
                Err(err) => error_response(id, err),
            })
        } else {
            tracing::trace!(method, "notification ignored");
            None
        }
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize_payload()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(tools_list_payload()),
            "tools/call" => self.handle_tools_call(params).await,
            "resources/list" => Ok(resources_list_payload()),
            "resources/read" => self.handle_resources_read(params).await,
            "prompts/list" => Ok(self.prompts_list_payload()),
            "prompts/get" => self.handle_prompts_get(params),
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    fn initialize_payload(&self) -> Value {
        let instructions = format!(
            "Use fhir_create, fhir_search and fhir_identify for guided FHIR workflows. When a result has requiresInput=true, ask the user exactly elicitation.prompt, then call the same tool again with the accumulated resource or searchParams plus elicitation = {{ context, answer }}. Never invent answers on the user's behalf. Use fhir_schema to see which fields each resource type needs. Interactive elicitation default: {}.",
            self.config.interactive_default
        );
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": { "listChanged": false },
                "prompts": { "listChanged": false }
            },
            "serverInfo": {
                "name": MCP_SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "instructions": instructions
        })
    }

    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;

        let args = match params.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call 'arguments' must be an object",
                ));
            }
        };

        tracing::debug!(tool = name, "tool call");
        Ok(match self.execute_tool(name, &args).await {
            Ok(ToolReply::NeedsInput(elicitation)) => {
                tracing::debug!(tool = name, outcome = "needs_input", "tool call resolved");
                build_tool_call_response(elicitation.to_value(), false)
            }
            Ok(ToolReply::Final { status, data }) => {
                tracing::debug!(tool = name, outcome = status, "tool call resolved");
                let envelope = json!({
                    "status": status,
                    "phase": "final",
                    "tool": name,
                    "data": data
                });
                build_tool_call_response(envelope, false)
            }
            Err(err) => {
                tracing::debug!(tool = name, outcome = "error", code = %err.code, "tool call failed");
                let envelope = json!({
                    "status": "error",
                    "phase": "final",
                    "tool": name,
                    "error": err.to_value()
                });
                build_tool_call_response(envelope, true)
            }
        })
    }

    async fn execute_tool(
        &self,
        tool_name: &str,
        args: &Map<String, Value>,
    ) -> Result<ToolReply, ToolError> {
        match tool_name {
            "fhir_create" => self.tool_create(args).await,
            "fhir_search" => self.tool_search(args).await,
            "fhir_identify" => self.tool_identify(args).await,
            "fhir_read" => self.tool_read(args).await,
            "fhir_update" => self.tool_update(args).await,
            "fhir_delete" => self.tool_delete(args).await,
            "fhir_schema" => self.tool_schema(args),
            _ => Err(ToolError::new(
                "unknown_tool",
                format!("Unknown tool '{tool_name}'"),
            )
            .with_docs_hint("Call tools/list for the available tools.")),
        }
    }

    async fn tool_create(&self, args: &Map<String, Value>) -> Result<ToolReply, ToolError> {
        let resource_type = arg_resource_type(args)?;
        let resource = arg_optional_object(args, "resource")?;
        let interactive = arg_bool(args, "interactive", self.config.interactive_default)?;
        let answer = arg_elicitation(args)?;
        let partial = PartialResource::from_value(resource_type.as_str(), resource.as_ref());

        let resolved = if interactive || answer.is_some() {
            let request = DialogueRequest {
                workflow: Workflow::Create,
                resource_type: resource_type.clone(),
                partial,
                answer,
            };
            match self.orchestrator.resolve(request)? {
                DialogueOutcome::NeedsInput(elicitation) => {
                    return Ok(ToolReply::NeedsInput(elicitation));
                }
                DialogueOutcome::Ready(resolved) => resolved,
            }
        } else {
            let missing = self.orchestrator.missing_required_fields(&partial);
            if !missing.is_empty() {
                return Err(missing_fields_error(&resource_type, &missing));
            }
            partial
        };

        let body = resolved.to_value();
        let response = self
            .forward(Operation::Create, &resource_type, &body)
            .await?;
        Ok(ToolReply::complete(json!({
            "request": body,
            "response": response
        })))
    }

    async fn tool_search(&self, args: &Map<String, Value>) -> Result<ToolReply, ToolError> {
        let resource_type = arg_resource_type(args)?;
        let params = arg_optional_object(args, "searchParams")?;
        let interactive = arg_bool(args, "interactive", self.config.interactive_default)?;
        let answer = arg_elicitation(args)?;
        let criteria = PartialResource::from_value(resource_type.as_str(), params.as_ref());

        let criteria = if interactive || answer.is_some() {
            let request = DialogueRequest {
                workflow: Workflow::Search,
                resource_type: resource_type.clone(),
                partial: criteria,
                answer,
            };
            match self.orchestrator.resolve(request)? {
                DialogueOutcome::NeedsInput(elicitation) => {
                    return Ok(ToolReply::NeedsInput(elicitation));
                }
                DialogueOutcome::Ready(criteria) => criteria,
            }
        } else {
            criteria
        };

        let query = criteria.fields_value();
        let bundle = self
            .forward(Operation::Search, &resource_type, &query)
            .await?;
        let matches = bundle_resources(&bundle).len();
        Ok(ToolReply::complete(json!({
            "request": { "resourceType": resource_type, "searchParams": query },
            "matches": matches,
            "response": bundle
        })))
    }

    async fn tool_identify(&self, args: &Map<String, Value>) -> Result<ToolReply, ToolError> {
        let resource_type = arg_resource_type(args)?;
        let params = arg_optional_object(args, "searchParams")?;
        let interactive = arg_bool(args, "interactive", self.config.interactive_default)?;
        let answer = arg_elicitation(args)?;
        let criteria = PartialResource::from_value(resource_type.as_str(), params.as_ref());

        if !interactive && answer.is_none() && criteria.is_empty() {
            return Err(ToolError::new(
                codes::VALIDATION_FAILED,
                "searchParams needs at least one criterion when interactive is false",
            )
            .with_field("searchParams"));
        }

        let request = DialogueRequest {
            workflow: Workflow::Identify,
            resource_type: resource_type.clone(),
            partial: criteria,
            answer,
        };
        let kind = self.orchestrator.analyze(&request)?;
        let resolved = match self.orchestrator.resolve(request)? {
            DialogueOutcome::NeedsInput(elicitation) => {
                return Ok(ToolReply::NeedsInput(elicitation));
            }
            DialogueOutcome::Ready(resolved) => resolved,
        };

        // A numbered answer already names the record; read it directly.
        if let CallKind::SelectionAnswer { .. } = kind {
            let payload = resolved.fields_value();
            let record = self
                .forward(Operation::Read, &resource_type, &payload)
                .await?;
            return Ok(ToolReply::complete(json!({
                "request": { "resourceType": resource_type, "id": payload.get("id") },
                "response": record
            })));
        }

        let query = resolved.fields_value();
        let bundle = self
            .forward(Operation::Search, &resource_type, &query)
            .await?;
        let records = bundle_resources(&bundle);

        if !interactive
            && let Disambiguation::Multiple { candidates } =
                build_disambiguation(&resource_type, &records)
        {
            return Ok(ToolReply::Final {
                status: "multiple_matches",
                data: json!({
                    "resourceType": resource_type,
                    "matches": candidates.len(),
                    "candidates": candidates
                }),
            });
        }

        match self
            .orchestrator
            .resolve_candidates(&resource_type, &records)?
        {
            IdentifyOutcome::NoMatches {
                resource_type,
                message,
            } => Ok(ToolReply::Final {
                status: "no_matches",
                data: json!({
                    "resourceType": resource_type,
                    "matches": 0,
                    "message": message
                }),
            }),
            IdentifyOutcome::Dialogue(DialogueOutcome::NeedsInput(elicitation)) => {
                Ok(ToolReply::NeedsInput(elicitation))
            }
            IdentifyOutcome::Dialogue(DialogueOutcome::Ready(record)) => {
                Ok(ToolReply::complete(json!({
                    "request": { "resourceType": resource_type, "searchParams": query },
                    "response": record.to_value()
                })))
            }
        }
    }

    async fn tool_read(&self, args: &Map<String, Value>) -> Result<ToolReply, ToolError> {
        let resource_type = arg_resource_type(args)?;
        let id = arg_logical_id(args)?;
        let response = self
            .forward(Operation::Read, &resource_type, &json!({ "id": id }))
            .await?;
        Ok(ToolReply::complete(json!({
            "request": { "resourceType": resource_type, "id": id },
            "response": response
        })))
    }

    async fn tool_update(&self, args: &Map<String, Value>) -> Result<ToolReply, ToolError> {
        let resource_type = arg_resource_type(args)?;
        let id = arg_logical_id(args)?;
        let resource = arg_optional_object(args, "resource")?.ok_or_else(|| {
            ToolError::new(
                codes::VALIDATION_FAILED,
                "Missing required field 'resource'",
            )
            .with_field("resource")
        })?;
        if let Some(body_id) = resource.get("id").and_then(Value::as_str)
            && body_id != id
        {
            return Err(ToolError::new(
                codes::VALIDATION_FAILED,
                format!("resource.id '{body_id}' does not match id '{id}'"),
            )
            .with_field("resource.id"));
        }

        let mut body = PartialResource::from_value(resource_type.as_str(), Some(&resource));
        body.set("id", Value::String(id.clone()));
        let body = body.to_value();
        let response = self
            .forward(Operation::Update, &resource_type, &body)
            .await?;
        Ok(ToolReply::complete(json!({
            "request": body,
            "response": response
        })))
    }

    async fn tool_delete(&self, args: &Map<String, Value>) -> Result<ToolReply, ToolError> {
        let resource_type = arg_resource_type(args)?;
        let id = arg_logical_id(args)?;
        let response = self
            .forward(Operation::Delete, &resource_type, &json!({ "id": id }))
            .await?;
        Ok(ToolReply::complete(json!({
            "request": { "resourceType": resource_type, "id": id },
            "response": response
        })))
    }

    fn tool_schema(&self, args: &Map<String, Value>) -> Result<ToolReply, ToolError> {
        let resource_type = arg_optional_string(args, "resourceType")?;
        Ok(ToolReply::complete(schema_payload(
            self.orchestrator.registry(),
            resource_type.as_deref(),
        )))
    }

    async fn forward(
        &self,
        operation: Operation,
        resource_type: &str,
        payload: &Value,
    ) -> Result<Value, ToolError> {
        self.executor
            .execute(operation, resource_type, payload)
            .await
            .map_err(|err| {
                tracing::warn!(
                    operation = operation.as_str(),
                    resource_type,
                    status = ?err.status(),
                    error = %err,
                    "FHIR request failed"
                );
                remote_tool_error(operation, err)
            })
    }

    fn prompts_list_payload(&self) -> Value {
        let prompts: Vec<Value> = self
            .orchestrator
            .catalog()
            .definitions()
            .into_iter()
            .map(|prompt| {
                let arguments: Vec<Value> = prompt
                    .arguments
                    .iter()
                    .map(|name| json!({ "name": name, "required": false }))
                    .collect();
                json!({
                    "name": prompt.id,
                    "description": prompt.description,
                    "arguments": arguments
                })
            })
            .collect();
        json!({ "prompts": prompts })
    }

    fn handle_prompts_get(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("prompts/get params must be an object"))?;
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("prompts/get requires string field 'name'"))?;

        let catalog = self.orchestrator.catalog();
        let definition = catalog
            .definitions()
            .into_iter()
            .find(|prompt| prompt.id == name)
            .ok_or_else(|| RpcError::invalid_params(format!("Unknown prompt '{name}'")))?;

        let mut prompt_args = PromptArgs::new();
        if let Some(Value::Object(arguments)) = params.get("arguments") {
            for (key, value) in arguments {
                let text = match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                prompt_args.insert(key.clone(), text);
            }
        }
        let text = catalog
            .get(definition.id, &prompt_args)
            .ok_or_else(|| RpcError::internal(format!("Prompt '{name}' has no template")))?;

        Ok(json!({
            "description": definition.description,
            "messages": [{
                "role": "user",
                "content": { "type": "text", "text": text }
            }]
        }))
    }

    async fn handle_resources_read(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("resources/read params must be an object"))?;
        let uri = params.get("uri").and_then(Value::as_str).ok_or_else(|| {
            RpcError::invalid_params("resources/read requires string field 'uri'")
        })?;

        let content_payload = match uri {
            "fhir://schemas" => schema_payload(self.orchestrator.registry(), None),
            "fhir://server/metadata" => self.executor.metadata().await.map_err(|err| {
                tracing::warn!(error = %err, "FHIR metadata request failed");
                RpcError::internal(err.to_string())
            })?,
            _ => {
                return Err(RpcError::invalid_params(format!(
                    "Unknown resource uri '{uri}'"
                )));
            }
        };

        Ok(json!({
            "contents": [{
                "uri": uri,
                "mimeType": "application/json",
                "text": to_pretty_json(&content_payload)
            }]
        }))
    }
}

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn parse_error(message: impl Into<String>) -> Self {
        Self {
            code: -32700,
            message: message.into(),
        }
    }

    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            code: -32603,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct ToolError {
    code: String,
    message: String,
    field: Option<String>,
    docs_hint: Option<String>,
    details: Option<Value>,
}

impl ToolError {
    fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: None,
            docs_hint: None,
            details: None,
        }
    }

    fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    fn with_docs_hint(mut self, docs_hint: impl Into<String>) -> Self {
        self.docs_hint = Some(docs_hint.into());
        self
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    fn to_value(&self) -> Value {
        let mut payload = json!({
            "error": self.code,
            "message": self.message
        });
        if let Some(field) = &self.field {
            payload["field"] = Value::String(field.clone());
        }
        if let Some(docs_hint) = &self.docs_hint {
            payload["docs_hint"] = Value::String(docs_hint.clone());
        }
        if let Some(details) = &self.details {
            payload["details"] = details.clone();
        }
        payload
    }
}

impl From<DialogueError> for ToolError {
    fn from(err: DialogueError) -> Self {
        if !err.is_caller_error() {
            tracing::error!(code = err.code(), error = %err, "dialogue defect");
        }
        let tool_error = ToolError::new(err.code(), err.to_string());
        match err {
            DialogueError::InvariantViolation {
                needs_input,
                processed_args,
                elicitation_request,
            } => tool_error
                .with_details(json!({
                    "needs_input": needs_input,
                    "processed_args": processed_args,
                    "elicitation_request": elicitation_request
                }))
                .with_docs_hint("Server defect: resending the same input reproduces it."),
            DialogueError::InvalidContext(_) | DialogueError::ContextMismatch { .. } => tool_error
                .with_field("elicitation.context")
                .with_docs_hint(
                    "Echo the context of the latest elicitation unchanged, with the same tool and resourceType.",
                ),
            DialogueError::UnknownField { .. } => tool_error.with_field("elicitation.context"),
            DialogueError::MissingPrompt(_) => tool_error,
        }
    }
}

fn remote_tool_error(operation: Operation, err: RemoteError) -> ToolError {
    let message = err.to_string();
    match err {
        RemoteError::InvalidRequest(_) => ToolError::new(codes::VALIDATION_FAILED, message),
        RemoteError::Status { status, body } => {
            ToolError::new(codes::DOWNSTREAM_EXECUTION_ERROR, message)
                .with_details(json!({
                    "operation": operation.as_str(),
                    "status": status,
                    "body": body
                }))
                .with_docs_hint("details.body holds the server's OperationOutcome.")
        }
        RemoteError::Connection { .. } | RemoteError::Decode(_) => {
            ToolError::new(codes::DOWNSTREAM_EXECUTION_ERROR, message)
                .with_details(json!({ "operation": operation.as_str() }))
                .with_docs_hint("Ensure the FHIR server is running and FHIR_BASE_URL points to it.")
        }
    }
}

fn missing_fields_error(resource_type: &str, missing: &[&FieldSpec]) -> ToolError {
    let names: Vec<&str> = missing.iter().map(|spec| spec.name.as_str()).collect();
    let fields: Vec<Value> = missing.iter().map(|spec| field_spec_value(spec)).collect();
    ToolError::new(
        codes::MISSING_REQUIRED_FIELDS,
        format!(
            "{resource_type} is missing required fields: {}",
            names.join(", ")
        ),
    )
    .with_field("resource")
    .with_docs_hint("Supply every listed field, or call again with interactive=true to be asked one at a time.")
    .with_details(json!({
        "resourceType": resource_type,
        "missing": fields
    }))
}

#[derive(Debug)]
struct ToolDefinition {
    name: &'static str,
    description: &'static str,
    input_schema: Value,
}

#[derive(Debug)]
struct ResourceDefinition {
    uri: &'static str,
    name: &'static str,
    description: &'static str,
}

fn elicitation_schema() -> Value {
    json!({
        "type": "object",
        "description": "Answer to the previous elicitation: its context string unchanged plus the user's reply",
        "properties": {
            "context": { "type": "string" },
            "answer": { "type": "string" }
        },
        "required": ["context", "answer"]
    })
}

fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "fhir_create",
            description: "Create a FHIR resource. Missing required fields are asked for one at a time (requiresInput) until the resource is complete.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "resourceType": { "type": "string", "description": "FHIR resource type, e.g. Patient" },
                    "resource": { "type": "object", "description": "Fields known so far, accumulated across turns" },
                    "interactive": { "type": "boolean", "description": "false reports all missing fields at once instead of asking" },
                    "elicitation": elicitation_schema()
                },
                "required": ["resourceType"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "fhir_search",
            description: "Search FHIR resources and return the searchset Bundle. Asks for a first criterion when none is given.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "resourceType": { "type": "string" },
                    "searchParams": { "type": "object", "description": "FHIR search parameters, e.g. { \"family\": \"Smith\" }" },
                    "interactive": { "type": "boolean" },
                    "elicitation": elicitation_schema()
                },
                "required": ["resourceType"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "fhir_identify",
            description: "Find exactly one FHIR resource. Several matches yield a numbered list to choose from; the chosen record is then read.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "resourceType": { "type": "string" },
                    "searchParams": { "type": "object" },
                    "interactive": { "type": "boolean" },
                    "elicitation": elicitation_schema()
                },
                "required": ["resourceType"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "fhir_read",
            description: "Read one FHIR resource by type and logical id.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "resourceType": { "type": "string" },
                    "id": { "type": "string" }
                },
                "required": ["resourceType", "id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "fhir_update",
            description: "Replace a FHIR resource (PUT). resourceType and id are filled into the body.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "resourceType": { "type": "string" },
                    "id": { "type": "string" },
                    "resource": { "type": "object" }
                },
                "required": ["resourceType", "id", "resource"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "fhir_delete",
            description: "Delete a FHIR resource by type and logical id.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "resourceType": { "type": "string" },
                    "id": { "type": "string" }
                },
                "required": ["resourceType", "id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "fhir_schema",
            description: "Required fields, constraints, examples and search criteria per resource type.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "resourceType": { "type": "string", "description": "Omit to list every registered type" }
                },
                "additionalProperties": false
            }),
        },
    ]
}

fn resource_definitions() -> Vec<ResourceDefinition> {
    vec![
        ResourceDefinition {
            uri: "fhir://schemas",
            name: "FHIR Field Schemas",
            description: "Registered resource types with their ordered fields and search criteria",
        },
        ResourceDefinition {
            uri: "fhir://server/metadata",
            name: "FHIR Server CapabilityStatement",
            description: "Live CapabilityStatement from the configured FHIR server",
        },
    ]
}

fn tools_list_payload() -> Value {
    let tools: Vec<Value> = tool_definitions()
        .into_iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "inputSchema": tool.input_schema,
            })
        })
        .collect();
    json!({ "tools": tools })
}

fn resources_list_payload() -> Value {
    let resources: Vec<Value> = resource_definitions()
        .into_iter()
        .map(|res| {
            json!({
                "uri": res.uri,
                "name": res.name,
                "description": res.description,
                "mimeType": "application/json"
            })
        })
        .collect();
    json!({ "resources": resources })
}

fn schema_payload(registry: &SchemaRegistry, resource_type: Option<&str>) -> Value {
    match resource_type {
        Some(resource_type) => resource_schema_value(registry, resource_type),
        None => {
            let schemas: Vec<Value> = registry
                .resource_types()
                .map(|resource_type| resource_schema_value(registry, resource_type))
                .collect();
            json!({ "resourceTypes": schemas })
        }
    }
}

fn resource_schema_value(registry: &SchemaRegistry, resource_type: &str) -> Value {
    let fields: Vec<Value> = registry
        .fields_for(resource_type)
        .iter()
        .map(field_spec_value)
        .collect();
    let search: Vec<Value> = registry
        .search_fields_for(resource_type)
        .iter()
        .map(field_spec_value)
        .collect();
    json!({
        "resourceType": resource_type,
        "registered": registry.is_registered(resource_type),
        "fields": fields,
        "searchParams": search
    })
}

fn field_spec_value(spec: &FieldSpec) -> Value {
    json!({
        "name": spec.name,
        "description": spec.description,
        "required": spec.is_required(),
        "validation": FieldValidation::of(spec),
        "examples": spec.examples
    })
}

fn build_tool_call_response(envelope: Value, is_error: bool) -> Value {
    // Clients often read only the text block, so it carries the full envelope.
    let text = to_pretty_json(&envelope);
    if is_error {
        json!({
            "isError": true,
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    } else {
        json!({
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    }
}

fn arg_bool(args: &Map<String, Value>, key: &str, default: bool) -> Result<bool, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(v)) => Ok(*v),
        Some(_) => Err(
            ToolError::new(codes::VALIDATION_FAILED, format!("'{key}' must be a boolean"))
                .with_field(key),
        ),
    }
}

fn required_string(args: &Map<String, Value>, key: &str) -> Result<String, ToolError> {
    let value = args.get(key).ok_or_else(|| {
        ToolError::new(
            codes::VALIDATION_FAILED,
            format!("Missing required field '{key}'"),
        )
        .with_field(key)
    })?;
    match value {
        Value::String(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        Value::String(_) => Err(ToolError::new(
            codes::VALIDATION_FAILED,
            format!("'{key}' must not be empty"),
        )
        .with_field(key)),
        _ => Err(
            ToolError::new(codes::VALIDATION_FAILED, format!("'{key}' must be a string"))
                .with_field(key),
        ),
    }
}

fn arg_optional_string(args: &Map<String, Value>, key: &str) -> Result<Option<String>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(v)) if v.trim().is_empty() => Ok(None),
        Some(Value::String(v)) => Ok(Some(v.trim().to_string())),
        Some(_) => Err(
            ToolError::new(codes::VALIDATION_FAILED, format!("'{key}' must be a string"))
                .with_field(key),
        ),
    }
}

fn arg_optional_object(args: &Map<String, Value>, key: &str) -> Result<Option<Value>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value @ Value::Object(_)) => Ok(Some(value.clone())),
        Some(_) => Err(
            ToolError::new(codes::VALIDATION_FAILED, format!("'{key}' must be an object"))
                .with_field(key),
        ),
    }
}

fn arg_resource_type(args: &Map<String, Value>) -> Result<String, ToolError> {
    let resource_type = required_string(args, "resourceType")?;
    validate_resource_type(&resource_type).map_err(|err| {
        ToolError::new(codes::VALIDATION_FAILED, err.to_string())
            .with_field("resourceType")
            .with_docs_hint("Use the FHIR type name, e.g. Patient or Observation.")
    })?;
    Ok(resource_type)
}

fn arg_logical_id(args: &Map<String, Value>) -> Result<String, ToolError> {
    let id = required_string(args, "id")?;
    validate_logical_id(&id)
        .map_err(|err| ToolError::new(codes::VALIDATION_FAILED, err.to_string()).with_field("id"))?;
    Ok(id)
}

/// `elicitation: { context, answer }`. Non-string answers are passed on as JSON text.
fn arg_elicitation(args: &Map<String, Value>) -> Result<Option<ElicitationAnswer>, ToolError> {
    let map = match args.get("elicitation") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(ToolError::new(
                codes::VALIDATION_FAILED,
                "'elicitation' must be an object with 'context' and 'answer'",
            )
            .with_field("elicitation"));
        }
    };
    let context = required_string(map, "context").map_err(|e| e.with_field("elicitation.context"))?;
    let answer = match map.get("answer") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(answer)) => answer.clone(),
        Some(other) => other.to_string(),
    };
    Ok(Some(ElicitationAnswer { context, answer }))
}

fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn error_response(id: Value, error: RpcError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error.code,
            "message": error.message
        }
    })
}

/// How a message arrived; the reply goes out the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    ContentLength,
    Line,
}

/// A framed message whose body may not be valid JSON. The frame itself was
/// consumed either way, so the stream stays usable.
type FramedPayload = (Result<Value, String>, Framing);

async fn read_framed_json<R>(reader: &mut R) -> Result<Option<FramedPayload>, std::io::Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            if !saw_header {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Unexpected EOF while reading MCP headers",
            ));
        }

        let line = line.trim();
        if line.is_empty() {
            if saw_header {
                break;
            }
            continue;
        }

        if !saw_header && (line.starts_with('{') || line.starts_with('[')) {
            return Ok(Some((parse_json_payload(line.as_bytes()), Framing::Line)));
        }

        saw_header = true;
        if line.to_ascii_lowercase().starts_with("content-length:") {
            let raw_len = line
                .split_once(':')
                .map(|(_, right)| right.trim())
                .unwrap_or_default();
            let parsed = raw_len.parse::<usize>().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "Invalid Content-Length header",
                )
            })?;
            content_length = Some(parsed);
        }
    }

    let content_length = content_length.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Missing Content-Length header",
        )
    })?;
    let mut payload = vec![0_u8; content_length];
    reader.read_exact(&mut payload).await?;

    Ok(Some((parse_json_payload(&payload), Framing::ContentLength)))
}

fn parse_json_payload(bytes: &[u8]) -> Result<Value, String> {
    serde_json::from_slice(bytes).map_err(|e| format!("Invalid JSON payload: {e}"))
}

async fn write_framed_json<W>(
    writer: &mut W,
    value: &Value,
    framing: Framing,
) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(value).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to serialize JSON: {e}"),
        )
    })?;
    match framing {
        Framing::ContentLength => {
            let header = format!(
                "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n",
                body.len()
            );
            writer.write_all(header.as_bytes()).await?;
            writer.write_all(&body).await?;
        }
        Framing::Line => {
            writer.write_all(&body).await?;
            writer.write_all(b"\n").await?;
        }
    }
    writer.flush().await?;
    Ok(())
}

fn to_pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use fhir_elicit_core::ElicitationContext;
    use serde_json::{Value, json};

    #[derive(Default)]
    struct FakeFhir {
        calls: Mutex<Vec<(Operation, String, Value)>>,
        search_results: Vec<Value>,
        fail_with: Option<u16>,
    }

    impl FakeFhir {
        fn with_results(search_results: Vec<Value>) -> Self {
            Self {
                search_results,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<(Operation, String, Value)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ResourceExecutor for FakeFhir {
        async fn execute(
            &self,
            operation: Operation,
            resource_type: &str,
            payload: &Value,
        ) -> Result<Value, RemoteError> {
            self.calls.lock().unwrap().push((
                operation,
                resource_type.to_string(),
                payload.clone(),
            ));
            if let Some(status) = self.fail_with {
                return Err(RemoteError::Status {
                    status,
                    body: json!({
                        "resourceType": "OperationOutcome",
                        "issue": [{ "severity": "error", "code": "invalid" }]
                    }),
                });
            }
            Ok(match operation {
                Operation::Search => {
                    let entries: Vec<Value> = self
                        .search_results
                        .iter()
                        .map(|resource| json!({ "resource": resource }))
                        .collect();
                    json!({ "resourceType": "Bundle", "type": "searchset", "entry": entries })
                }
                Operation::Create => {
                    let mut created = payload.clone();
                    created["id"] = json!("new-1");
                    created
                }
                Operation::Read => json!({ "resourceType": resource_type, "id": payload["id"] }),
                Operation::Update => payload.clone(),
                Operation::Delete => Value::Null,
            })
        }

        async fn metadata(&self) -> Result<Value, RemoteError> {
            Ok(json!({ "resourceType": "CapabilityStatement", "fhirVersion": "4.0.1" }))
        }
    }

    fn server(fake: FakeFhir) -> McpServer<FakeFhir> {
        McpServer::new(McpRuntimeConfig::default(), fake)
    }

    async fn call_tool(server: &McpServer<FakeFhir>, name: &str, arguments: Value) -> Value {
        server
            .handle_request(
                "tools/call",
                json!({ "name": name, "arguments": arguments }),
            )
            .await
            .expect("tools/call should not be a protocol error")
    }

    fn patients(count: usize) -> Vec<Value> {
        (1..=count)
            .map(|n| {
                json!({
                    "resourceType": "Patient",
                    "id": format!("p{n}"),
                    "birthDate": "1980-01-01",
                    "name": [{ "family": "Smith", "given": [format!("Pat{n}")] }]
                })
            })
            .collect()
    }

    #[test]
    fn config_precedence_is_cli_then_file_then_defaults() {
        let file = FileConfig {
            fhir_base_url: Some("https://file.example/fhir".to_string()),
            access_token: Some("file-token".to_string()),
            timeout_secs: Some(5),
            interactive_default: Some(false),
        };
        let overrides = ConfigOverrides {
            fhir_base_url: Some("https://cli.example/fhir".to_string()),
            ..ConfigOverrides::default()
        };
        let config = McpRuntimeConfig::resolve(overrides, Some(file));
        assert_eq!(config.fhir_base_url, "https://cli.example/fhir");
        assert_eq!(config.access_token.as_deref(), Some("file-token"));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert!(!config.interactive_default);

        let defaults = McpRuntimeConfig::default();
        assert_eq!(defaults.fhir_base_url, DEFAULT_FHIR_BASE_URL);
        assert_eq!(defaults.access_token, None);
        assert_eq!(defaults.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert!(defaults.interactive_default);
    }

    #[tokio::test]
    async fn initialize_and_tool_listing() {
        let server = server(FakeFhir::default());
        let init = server.handle_request("initialize", json!({})).await.unwrap();
        assert_eq!(init["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert!(init["instructions"].as_str().unwrap().contains("requiresInput"));

        let tools = server.handle_request("tools/list", Value::Null).await.unwrap();
        let names: Vec<&str> = tools["tools"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|tool| tool["name"].as_str())
            .collect();
        for expected in [
            "fhir_create",
            "fhir_search",
            "fhir_identify",
            "fhir_read",
            "fhir_update",
            "fhir_delete",
            "fhir_schema",
        ] {
            assert!(names.contains(&expected), "{expected}");
        }
    }

    #[tokio::test]
    async fn protocol_errors_use_jsonrpc_codes() {
        let server = server(FakeFhir::default());
        let responses = server
            .handle_incoming_message(json!({ "jsonrpc": "1.0", "id": 1, "method": "ping" }))
            .await;
        assert_eq!(responses[0]["error"]["code"], -32600);

        let responses = server
            .handle_incoming_message(json!({ "jsonrpc": "2.0", "id": 2, "method": "nope" }))
            .await;
        assert_eq!(responses[0]["error"]["code"], -32601);

        let responses = server
            .handle_incoming_message(json!({
                "jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": { "arguments": {} }
            }))
            .await;
        assert_eq!(responses[0]["error"]["code"], -32602);

        let responses = server
            .handle_incoming_message(json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
            .await;
        assert!(responses.is_empty());
    }

    #[tokio::test]
    async fn batch_requests_get_one_response_per_request() {
        let server = server(FakeFhir::default());
        let responses = server
            .handle_incoming_message(json!([
                { "jsonrpc": "2.0", "id": 1, "method": "ping" },
                { "jsonrpc": "2.0", "method": "notifications/initialized" },
                { "jsonrpc": "2.0", "id": 2, "method": "ping" }
            ]))
            .await;
        assert_eq!(responses.len(), 2);
        let responses = server.handle_incoming_message(json!([])).await;
        assert_eq!(responses[0]["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn needs_input_never_contacts_server() {
        let server = server(FakeFhir::default());
        let result = call_tool(
            &server,
            "fhir_create",
            json!({ "resourceType": "Patient", "resource": {} }),
        )
        .await;
        assert!(result.get("isError").is_none());
        let content = &result["structuredContent"];
        assert_eq!(content["requiresInput"], true);
        assert_eq!(content["elicitation"]["validation"]["type"], "array");
        assert!(content["instructions"].as_str().unwrap().contains("fhir_create"));
        assert!(server.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn answered_create_posts_resolved_resource_once() {
        let server = server(FakeFhir::default());
        let resource = json!({
            "code": { "text": "Heart rate" },
            "subject": { "reference": "Patient/p1" }
        });
        let first = call_tool(
            &server,
            "fhir_create",
            json!({ "resourceType": "Observation", "resource": resource }),
        )
        .await;
        let context = first["structuredContent"]["elicitation"]["context"]
            .as_str()
            .unwrap()
            .to_string();

        let second = call_tool(
            &server,
            "fhir_create",
            json!({
                "resourceType": "Observation",
                "resource": resource,
                "elicitation": { "context": context, "answer": "final" }
            }),
        )
        .await;
        let envelope = &second["structuredContent"];
        assert_eq!(envelope["status"], "complete");
        assert_eq!(envelope["phase"], "final");
        assert_eq!(envelope["tool"], "fhir_create");
        assert_eq!(envelope["data"]["response"]["id"], "new-1");

        let calls = server.executor.calls();
        assert_eq!(calls.len(), 1);
        let (operation, resource_type, body) = &calls[0];
        assert_eq!(*operation, Operation::Create);
        assert_eq!(resource_type, "Observation");
        assert_eq!(body["resourceType"], "Observation");
        assert_eq!(body["status"], "final");
    }

    #[tokio::test]
    async fn invalid_answer_reprompts_without_network() {
        let server = server(FakeFhir::default());
        let first = call_tool(
            &server,
            "fhir_create",
            json!({ "resourceType": "Observation", "resource": {} }),
        )
        .await;
        let context = first["structuredContent"]["elicitation"]["context"].clone();
        let retry = call_tool(
            &server,
            "fhir_create",
            json!({
                "resourceType": "Observation",
                "elicitation": { "context": context, "answer": "done" }
            }),
        )
        .await;
        let content = &retry["structuredContent"];
        assert_eq!(content["requiresInput"], true);
        assert!(
            content["elicitation"]["prompt"]
                .as_str()
                .unwrap()
                .starts_with("Value must be one of:")
        );
        assert_eq!(content["elicitation"]["context"], context);
        assert!(server.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn non_interactive_create_lists_every_missing_field() {
        let server = server(FakeFhir::default());
        let result = call_tool(
            &server,
            "fhir_create",
            json!({ "resourceType": "Patient", "resource": { "gender": "female" }, "interactive": false }),
        )
        .await;
        assert_eq!(result["isError"], true);
        let error = &result["structuredContent"]["error"];
        assert_eq!(error["error"], "missing_required_fields");
        let missing: Vec<&str> = error["details"]["missing"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|field| field["name"].as_str())
            .collect();
        assert_eq!(missing, vec!["name", "birthDate"]);
        assert!(server.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn identify_with_no_single_or_many_matches() {
        let none = server(FakeFhir::with_results(Vec::new()));
        let result = call_tool(
            &none,
            "fhir_identify",
            json!({ "resourceType": "Patient", "searchParams": { "family": "Nobody" } }),
        )
        .await;
        let envelope = &result["structuredContent"];
        assert_eq!(envelope["status"], "no_matches");
        assert_eq!(envelope["data"]["matches"], 0);
        assert!(result.get("isError").is_none());

        let one = server(FakeFhir::with_results(patients(1)));
        let result = call_tool(
            &one,
            "fhir_identify",
            json!({ "resourceType": "Patient", "searchParams": { "family": "Smith" } }),
        )
        .await;
        assert_eq!(result["structuredContent"]["status"], "complete");
        assert_eq!(result["structuredContent"]["data"]["response"]["id"], "p1");

        let many = server(FakeFhir::with_results(patients(3)));
        let result = call_tool(
            &many,
            "fhir_identify",
            json!({ "resourceType": "Patient", "searchParams": { "family": "Smith" } }),
        )
        .await;
        let content = &result["structuredContent"];
        assert_eq!(content["requiresInput"], true);
        assert_eq!(content["multipleMatches"], 3);
        assert_eq!(content["elicitation"]["validation"]["minimum"], 1);
        assert_eq!(content["elicitation"]["validation"]["maximum"], 3);
        assert!(
            content["elicitation"]["prompt"]
                .as_str()
                .unwrap()
                .contains("2. Smith, Pat2 (birthDate: 1980-01-01, id: p2)")
        );
    }

    #[tokio::test]
    async fn selection_answer_reads_chosen_record_without_searching_again() {
        let server = server(FakeFhir::with_results(patients(3)));
        let first = call_tool(
            &server,
            "fhir_identify",
            json!({ "resourceType": "Patient", "searchParams": { "family": "Smith" } }),
        )
        .await;
        let context = first["structuredContent"]["elicitation"]["context"].clone();

        let chosen = call_tool(
            &server,
            "fhir_identify",
            json!({
                "resourceType": "Patient",
                "searchParams": { "family": "Smith" },
                "elicitation": { "context": context, "answer": 2 }
            }),
        )
        .await;
        assert_eq!(chosen["structuredContent"]["status"], "complete");
        assert_eq!(chosen["structuredContent"]["data"]["response"]["id"], "p2");

        let operations: Vec<Operation> = server
            .executor
            .calls()
            .into_iter()
            .map(|(operation, _, _)| operation)
            .collect();
        assert_eq!(operations, vec![Operation::Search, Operation::Read]);
    }

    #[tokio::test]
    async fn non_interactive_identify_returns_candidate_list() {
        let server = server(FakeFhir::with_results(patients(2)));
        let result = call_tool(
            &server,
            "fhir_identify",
            json!({
                "resourceType": "Patient",
                "searchParams": { "family": "Smith" },
                "interactive": false
            }),
        )
        .await;
        let envelope = &result["structuredContent"];
        assert_eq!(envelope["status"], "multiple_matches");
        assert_eq!(envelope["data"]["candidates"][1]["recordId"], "p2");
        assert!(envelope["data"]["candidates"][0].get("displayLabel").is_some());
    }

    #[tokio::test]
    async fn search_without_criteria_elicits_first_criterion() {
        let server = server(FakeFhir::default());
        let result = call_tool(&server, "fhir_search", json!({ "resourceType": "Patient" })).await;
        let content = &result["structuredContent"];
        assert_eq!(content["requiresInput"], true);
        assert_eq!(content["elicitation"]["required"], true);
        let context = ElicitationContext::decode(content["elicitation"]["context"].as_str().unwrap())
            .unwrap();
        assert!(matches!(context, ElicitationContext::Field { workflow: Workflow::Search, .. }));

        let result = call_tool(
            &server,
            "fhir_search",
            json!({ "resourceType": "Patient", "interactive": false }),
        )
        .await;
        assert_eq!(result["structuredContent"]["status"], "complete");
        assert_eq!(server.executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn downstream_failure_is_a_tool_error() {
        let server = server(FakeFhir {
            fail_with: Some(422),
            ..FakeFhir::default()
        });
        let result = call_tool(
            &server,
            "fhir_read",
            json!({ "resourceType": "Patient", "id": "p1" }),
        )
        .await;
        assert_eq!(result["isError"], true);
        let error = &result["structuredContent"]["error"];
        assert_eq!(error["error"], "downstream_execution_error");
        assert_eq!(error["details"]["status"], 422);
        assert_eq!(error["details"]["body"]["resourceType"], "OperationOutcome");
        assert_eq!(server.executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn foreign_context_is_rejected() {
        let server = server(FakeFhir::default());
        let result = call_tool(
            &server,
            "fhir_create",
            json!({
                "resourceType": "Patient",
                "elicitation": { "context": "not-a-context", "answer": "x" }
            }),
        )
        .await;
        assert_eq!(result["isError"], true);
        assert_eq!(result["structuredContent"]["error"]["error"], "invalid_context");
        assert_eq!(
            result["structuredContent"]["error"]["field"],
            "elicitation.context"
        );
    }

    #[tokio::test]
    async fn update_fills_type_and_id_and_rejects_mismatch() {
        let server = server(FakeFhir::default());
        let result = call_tool(
            &server,
            "fhir_update",
            json!({ "resourceType": "Patient", "id": "p1", "resource": { "gender": "male" } }),
        )
        .await;
        assert_eq!(result["structuredContent"]["status"], "complete");
        let calls = server.executor.calls();
        assert_eq!(
            calls[0].2,
            json!({ "resourceType": "Patient", "gender": "male", "id": "p1" })
        );

        let result = call_tool(
            &server,
            "fhir_update",
            json!({ "resourceType": "Patient", "id": "p1", "resource": { "id": "p2" } }),
        )
        .await;
        assert_eq!(result["structuredContent"]["error"]["field"], "resource.id");
        assert_eq!(server.executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn bad_arguments_are_validation_failures() {
        let server = server(FakeFhir::default());
        for (tool, arguments) in [
            ("fhir_create", json!({})),
            ("fhir_create", json!({ "resourceType": "patient" })),
            ("fhir_create", json!({ "resourceType": "Patient", "resource": [] })),
            ("fhir_read", json!({ "resourceType": "Patient", "id": "a/b" })),
            ("fhir_search", json!({ "resourceType": "Patient", "interactive": "yes" })),
        ] {
            let result = call_tool(&server, tool, arguments).await;
            assert_eq!(result["isError"], true, "{tool}");
            assert_eq!(
                result["structuredContent"]["error"]["error"],
                "validation_failed",
                "{tool}"
            );
        }
        let result = call_tool(&server, "fhir_nope", json!({})).await;
        assert_eq!(result["structuredContent"]["error"]["error"], "unknown_tool");
        assert!(server.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn schema_tool_and_resource_describe_registry() {
        let server = server(FakeFhir::default());
        let result = call_tool(&server, "fhir_schema", json!({ "resourceType": "Patient" })).await;
        let data = &result["structuredContent"]["data"];
        assert_eq!(data["registered"], true);
        assert_eq!(data["fields"][0]["name"], "name");
        assert_eq!(data["fields"][0]["required"], true);
        assert_eq!(data["fields"][0]["validation"]["type"], "array");

        let read = server
            .handle_request("resources/read", json!({ "uri": "fhir://schemas" }))
            .await
            .unwrap();
        let text = read["contents"][0]["text"].as_str().unwrap();
        let parsed: Value = serde_json::from_str(text).unwrap();
        assert!(!parsed["resourceTypes"].as_array().unwrap().is_empty());

        let metadata = server
            .handle_request("resources/read", json!({ "uri": "fhir://server/metadata" }))
            .await
            .unwrap();
        assert!(
            metadata["contents"][0]["text"]
                .as_str()
                .unwrap()
                .contains("CapabilityStatement")
        );
    }

    #[tokio::test]
    async fn prompts_are_listed_and_rendered() {
        let server = server(FakeFhir::default());
        let list = server.handle_request("prompts/list", Value::Null).await.unwrap();
        let names: Vec<&str> = list["prompts"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|prompt| prompt["name"].as_str())
            .collect();
        assert_eq!(names, vec!["guided_create", "identify_patient"]);

        let prompt = server
            .handle_request(
                "prompts/get",
                json!({ "name": "guided_create", "arguments": { "resourceType": "Observation" } }),
            )
            .await
            .unwrap();
        let text = prompt["messages"][0]["content"]["text"].as_str().unwrap();
        assert!(text.contains("FHIR Observation"));
        assert!(!text.contains("{{"));

        let err = server
            .handle_request("prompts/get", json!({ "name": "elicitation.field" }))
            .await
            .unwrap_err();
        assert_eq!(err.code, -32602);
    }

    #[tokio::test]
    async fn serve_answers_in_the_framing_it_was_asked_in() {
        let server = server(FakeFhir::default());

        let input = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n".to_vec();
        let mut reader = BufReader::new(&input[..]);
        let mut output: Vec<u8> = Vec::new();
        server.serve(&mut reader, &mut output).await.unwrap();
        let text = String::from_utf8(output).unwrap();
        assert!(text.ends_with('\n'));
        let reply: Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(reply["id"], 1);

        let body = r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#;
        let input = format!("Content-Length: {}\r\n\r\n{body}", body.len()).into_bytes();
        let mut reader = BufReader::new(&input[..]);
        let mut output: Vec<u8> = Vec::new();
        server.serve(&mut reader, &mut output).await.unwrap();
        let text = String::from_utf8(output).unwrap();
        assert!(text.starts_with("Content-Length: "));
        let (_, payload) = text.split_once("\r\n\r\n").unwrap();
        let reply: Value = serde_json::from_str(payload).unwrap();
        assert_eq!(reply["id"], 2);
    }

    #[tokio::test]
    async fn malformed_line_gets_parse_error_and_session_continues() {
        let server = server(FakeFhir::default());

        let input = b"{not json}\n{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n".to_vec();
        let mut reader = BufReader::new(&input[..]);
        let mut output: Vec<u8> = Vec::new();
        server.serve(&mut reader, &mut output).await.unwrap();

        let text = String::from_utf8(output).unwrap();
        let replies: Vec<Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["id"], Value::Null);
        assert_eq!(replies[0]["error"]["code"], -32700);
        assert_eq!(replies[1]["id"], 1);
        assert!(replies[1]["result"].is_object());
    }

    #[tokio::test]
    async fn malformed_content_length_body_gets_parse_error() {
        let server = server(FakeFhir::default());

        let body = "{oops}";
        let ping = r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#;
        let input = format!(
            "Content-Length: {}\r\n\r\n{body}Content-Length: {}\r\n\r\n{ping}",
            body.len(),
            ping.len()
        )
        .into_bytes();
        let mut reader = BufReader::new(&input[..]);
        let mut output: Vec<u8> = Vec::new();
        server.serve(&mut reader, &mut output).await.unwrap();

        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("-32700"));
        assert!(text.contains(r#""id":7"#));
    }

    #[tokio::test]
    async fn truncated_headers_are_an_error() {
        let input = b"Content-Length: 10\r\n".to_vec();
        let mut reader = BufReader::new(&input[..]);
        let err = read_framed_json(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
