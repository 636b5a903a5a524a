use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::{Agent, AgentContext, AgentOutput};
use crate::error::AgentError;
use crate::llm_client::{ChatTurn, Inference, InferenceClient, InferenceRequest};
use crate::tools::ToolRegistry;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful voice assistant. Answer in a few short, \
spoken-style sentences. Use the available tools when the user asks for live information.";

/// Answers anything no specialist covers, with one optional tool round trip.
pub struct GeneralAgent {
    llm: Arc<dyn InferenceClient>,
    tools: Arc<ToolRegistry>,
    system_prompt: String,
}

impl GeneralAgent {
    pub fn new(llm: Arc<dyn InferenceClient>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            llm,
            tools,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// The user turn, including the previous chain step's result if any.
    fn user_turn(ctx: &AgentContext) -> String {
        match ctx.context.get("previous_summary").and_then(Value::as_str) {
            Some(previous) => format!(
                "{}\n\nContext from the previous step: {}",
                ctx.text, previous
            ),
            None => ctx.text.clone(),
        }
    }
}

#[async_trait]
impl Agent for GeneralAgent {
    fn name(&self) -> &str {
        "planner"
    }

    fn capability(&self) -> &str {
        "General conversation, planning and anything no specialist covers"
    }

    fn matches(&self, _text: &str) -> bool {
        true
    }

    async fn run(&self, ctx: &AgentContext) -> Result<AgentOutput, AgentError> {
        let emitter = ctx.emitter();
        emitter.status("Thinking...");

        let mut request = InferenceRequest {
            system_prompt: self.system_prompt.clone(),
            turns: vec![ChatTurn::User(Self::user_turn(ctx))],
            tools: self.tools.specs(),
            schema: None,
        };

        let mut used_tools = Vec::new();
        let answer = match self.llm.infer(request.clone()).await? {
            Inference::Answer(text) => text,
            Inference::ToolCalls(calls) => {
                request.turns.push(ChatTurn::AssistantToolCalls(calls.clone()));
                for call in &calls {
                    emitter.progress(format!("Using {} to get the information...", call.name), None);
                    let result = self.tools.execute(&call.name, call.arguments.clone()).await?;
                    request.turns.push(ChatTurn::ToolResult {
                        call_id: call.id.clone(),
                        content: result.to_string(),
                    });
                    used_tools.push(call.name.clone());
                }
                debug!(tools = ?used_tools, "Tool round trip complete");
                request.tools.clear();
                match self.llm.infer(request).await? {
                    Inference::Answer(text) => text,
                    Inference::ToolCalls(_) => {
                        return Err(AgentError::Permanent(
                            "model asked for a second tool round trip".into(),
                        ));
                    }
                }
            }
        };

        let answer = answer.trim().to_string();
        if answer.is_empty() {
            return Err(AgentError::Permanent("model returned an empty answer".into()));
        }

        for (i, word) in answer.split_whitespace().enumerate() {
            if i == 0 {
                emitter.token(word);
            } else {
                emitter.token(format!(" {word}"));
            }
        }
        emitter.speak(&answer).await;

        Ok(AgentOutput {
            data: json!({ "response": answer, "tools_used": used_tools }),
            summary: answer,
        })
    }
}
