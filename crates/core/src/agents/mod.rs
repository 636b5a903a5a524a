//! Agents: independently running units of work dispatched by the
//! orchestrator.
//!
//! An agent only computes. Publishing `agent_start` and the single terminal
//! event of an invocation is done by the orchestrator's invocation runner, so
//! an agent cannot break that contract; it reports intermediate output through
//! the [`AgentEmitter`] in its context.

mod calendar;
mod emitter;
mod general;
mod weather;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use calendar::CalendarAgent;
pub use emitter::{AgentEmitter, Invocation};
pub use general::GeneralAgent;
pub use weather::{WeatherAgent, extract_location};

use crate::error::{AgentError, ChorusError, ChorusResult};
use crate::task::Context;

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutput {
    /// Human-readable answer, used for the task's final response.
    pub summary: String,
    pub data: serde_json::Value,
}

/// Everything an invocation gets to work with.
pub struct AgentContext {
    pub task_id: Uuid,
    pub text: String,
    pub context: Context,
    emitter: AgentEmitter,
}

impl AgentContext {
    pub fn new(task_id: Uuid, text: String, context: Context, emitter: AgentEmitter) -> Self {
        Self {
            task_id,
            text,
            context,
            emitter,
        }
    }

    pub fn emitter(&self) -> &AgentEmitter {
        &self.emitter
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    /// Unique name; also the `source` of the agent's events.
    fn name(&self) -> &str;

    /// Free text describing what the agent handles.
    fn capability(&self) -> &str;

    /// Whether this agent is eligible for `text`.
    fn matches(&self, text: &str) -> bool;

    /// Does the work. May be called again after a transient error.
    async fn run(&self, ctx: &AgentContext) -> Result<AgentOutput, AgentError>;
}

/// Case-insensitive keyword check against the words of `text`. A keyword
/// matches any word it prefixes, so "meeting" also covers "meetings".
pub fn mentions_any(text: &str, keywords: &[&str]) -> bool {
    let lower = text.to_lowercase();
    lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .any(|word| keywords.iter().any(|kw| word.starts_with(kw)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Active,
    Done,
    Error,
}

/// Orchestrator-owned view of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub name: String,
    pub capability_description: String,
    pub status: AgentStatus,
    pub current_task_id: Option<Uuid>,
}

/// Immutable set of agents known at startup: one general agent plus any
/// number of specialists, in routing priority order.
#[derive(Clone)]
pub struct AgentRegistry {
    general: Arc<dyn Agent>,
    specialists: Vec<Arc<dyn Agent>>,
    by_name: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn builder(general: Arc<dyn Agent>) -> AgentRegistryBuilder {
        AgentRegistryBuilder {
            general,
            specialists: Vec::new(),
        }
    }

    pub fn general(&self) -> &Arc<dyn Agent> {
        &self.general
    }

    pub fn specialists(&self) -> &[Arc<dyn Agent>] {
        &self.specialists
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.by_name.get(name).cloned()
    }

    /// General agent first, then specialists in priority order.
    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn Agent>> {
        std::iter::once(&self.general).chain(self.specialists.iter())
    }

    pub fn descriptors(&self) -> Vec<AgentDescriptor> {
        self.all()
            .map(|agent| AgentDescriptor {
                name: agent.name().to_string(),
                capability_description: agent.capability().to_string(),
                status: AgentStatus::Idle,
                current_task_id: None,
            })
            .collect()
    }
}

pub struct AgentRegistryBuilder {
    general: Arc<dyn Agent>,
    specialists: Vec<Arc<dyn Agent>>,
}

impl AgentRegistryBuilder {
    pub fn specialist(mut self, agent: Arc<dyn Agent>) -> Self {
        self.specialists.push(agent);
        self
    }

    pub fn build(self) -> ChorusResult<AgentRegistry> {
        let mut by_name: HashMap<String, Arc<dyn Agent>> = HashMap::new();
        for agent in std::iter::once(&self.general).chain(self.specialists.iter()) {
            let name = agent.name().to_string();
            if by_name.insert(name.clone(), Arc::clone(agent)).is_some() {
                return Err(ChorusError::DuplicateAgent(name));
            }
        }
        Ok(AgentRegistry {
            general: self.general,
            specialists: self.specialists,
            by_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::MockInferenceClient;
    use crate::tools::demo_registry;

    fn general() -> Arc<dyn Agent> {
        Arc::new(GeneralAgent::new(
            Arc::new(MockInferenceClient::new()),
            Arc::new(demo_registry()),
        ))
    }

    #[test]
    fn test_keyword_matching_uses_word_prefixes() {
        assert!(mentions_any("Any MEETINGS today?", &["meeting"]));
        assert!(mentions_any("weather, please", &["weather"]));
        assert!(!mentions_any("tell me a joke", &["weather", "calendar"]));
    }

    #[test]
    fn test_registry_lookup_and_order() {
        let tools = Arc::new(demo_registry());
        let registry = AgentRegistry::builder(general())
            .specialist(Arc::new(WeatherAgent::new(tools.clone())))
            .specialist(Arc::new(CalendarAgent::new(tools)))
            .build()
            .unwrap();

        let names: Vec<&str> = registry.all().map(|a| a.name()).collect();
        assert_eq!(names, vec!["planner", "weather", "calendar"]);
        assert!(registry.get("weather").is_some());
        assert!(registry.get("stocks").is_none());
        assert!(
            registry
                .descriptors()
                .iter()
                .all(|d| d.status == AgentStatus::Idle)
        );
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let tools = Arc::new(demo_registry());
        let result = AgentRegistry::builder(general())
            .specialist(Arc::new(WeatherAgent::new(tools.clone())))
            .specialist(Arc::new(WeatherAgent::new(tools)))
            .build();
        assert!(matches!(result, Err(ChorusError::DuplicateAgent(name)) if name == "weather"));
    }
}
