use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionTool, ChatCompletionToolArgs, ChatCompletionToolType,
        CreateChatCompletionRequestArgs, CreateChatCompletionResponse, FunctionCall,
        FunctionObjectArgs, ResponseFormat, ResponseFormatJsonSchema,
    },
};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::AgentError;

/// A function the model may ask to call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One entry of the conversation sent to the model.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatTurn {
    User(String),
    AssistantToolCalls(Vec<ToolCall>),
    ToolResult { call_id: String, content: String },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct InferenceRequest {
    pub system_prompt: String,
    pub turns: Vec<ChatTurn>,
    pub tools: Vec<ToolSpec>,
    /// When set, the answer must be JSON matching this schema.
    pub schema: Option<Value>,
}

/// Either a final answer or a request to run tools first.
#[derive(Debug, Clone, PartialEq)]
pub enum Inference {
    Answer(String),
    ToolCalls(Vec<ToolCall>),
}

/// The model collaborator. Errors are already classified so the orchestrator
/// knows whether a retry makes sense.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn infer(&self, request: InferenceRequest) -> Result<Inference, AgentError>;
}

/// An implementation of `InferenceClient` for any OpenAI-compatible API.
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAICompatibleClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - API key and base URL of the service.
    /// * `model` - The model identifier to use for chat completions (e.g., "gpt-4o").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }

    fn messages(request: &InferenceRequest) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        let mut messages = Vec::with_capacity(request.turns.len() + 1);
        if !request.system_prompt.is_empty() {
            messages.push(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(request.system_prompt.clone())
                    .build()?
                    .into(),
            );
        }
        for turn in &request.turns {
            let message: ChatCompletionRequestMessage = match turn {
                ChatTurn::User(text) => ChatCompletionRequestUserMessageArgs::default()
                    .content(text.clone())
                    .build()?
                    .into(),
                ChatTurn::AssistantToolCalls(calls) => {
                    let tool_calls = calls
                        .iter()
                        .map(|call| ChatCompletionMessageToolCall {
                            id: call.id.clone(),
                            r#type: ChatCompletionToolType::Function,
                            function: FunctionCall {
                                name: call.name.clone(),
                                arguments: call.arguments.to_string(),
                            },
                        })
                        .collect::<Vec<_>>();
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .tool_calls(tool_calls)
                        .build()?
                        .into()
                }
                ChatTurn::ToolResult { call_id, content } => {
                    ChatCompletionRequestToolMessageArgs::default()
                        .tool_call_id(call_id.clone())
                        .content(content.clone())
                        .build()?
                        .into()
                }
            };
            messages.push(message);
        }
        Ok(messages)
    }

    fn tools(specs: &[ToolSpec]) -> Result<Vec<ChatCompletionTool>, OpenAIError> {
        specs
            .iter()
            .map(|spec| {
                ChatCompletionToolArgs::default()
                    .function(
                        FunctionObjectArgs::default()
                            .name(spec.name.clone())
                            .description(spec.description.clone())
                            .parameters(spec.parameters.clone())
                            .build()?,
                    )
                    .build()
            })
            .collect()
    }
}

#[async_trait]
impl InferenceClient for OpenAICompatibleClient {
    async fn infer(&self, request: InferenceRequest) -> Result<Inference, AgentError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model).messages(Self::messages(&request)?);
        if !request.tools.is_empty() {
            args.tools(Self::tools(&request.tools)?).tool_choice("auto");
        }
        if let Some(schema) = &request.schema {
            args.response_format(ResponseFormat::JsonSchema {
                json_schema: ResponseFormatJsonSchema {
                    description: None,
                    name: "answer".to_string(),
                    schema: Some(schema.clone()),
                    strict: Some(true),
                },
            });
        }
        let chat_request = args.build()?;

        let response: CreateChatCompletionResponse = self.client.chat().create(chat_request).await?;
        let choice = response
            .choices
            .first()
            .ok_or_else(|| AgentError::Permanent("model returned no choices".into()))?;

        if let Some(tool_calls) = choice.message.tool_calls.as_ref().filter(|c| !c.is_empty()) {
            debug!(count = tool_calls.len(), "Model requested tool calls");
            let calls = tool_calls
                .iter()
                .map(|call| {
                    let arguments: Value = serde_json::from_str(&call.function.arguments)?;
                    Ok(ToolCall {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        arguments,
                    })
                })
                .collect::<Result<Vec<_>, AgentError>>()?;
            Ok(Inference::ToolCalls(calls))
        } else if let Some(content) = &choice.message.content {
            Ok(Inference::Answer(content.clone()))
        } else {
            Err(AgentError::Permanent(
                "model response had neither text content nor tool calls".into(),
            ))
        }
    }
}

/// Sorts OpenAI client failures into retryable and final ones.
impl From<OpenAIError> for AgentError {
    fn from(err: OpenAIError) -> Self {
        match &err {
            OpenAIError::Reqwest(_) | OpenAIError::StreamError(_) => {
                AgentError::Transient(err.to_string())
            }
            OpenAIError::ApiError(api) => {
                let code = api.code.as_deref().unwrap_or_default();
                let kind = api.r#type.as_deref().unwrap_or_default();
                let retryable = matches!(code, "rate_limit_exceeded")
                    || matches!(kind, "server_error" | "rate_limit_error" | "overloaded_error");
                if retryable {
                    AgentError::Transient(err.to_string())
                } else {
                    AgentError::Permanent(err.to_string())
                }
            }
            OpenAIError::InvalidArgument(_) => AgentError::InvalidInput(err.to_string()),
            _ => AgentError::Permanent(err.to_string()),
        }
    }
}
