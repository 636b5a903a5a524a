//! Named tool functions the model (or an agent) may call, and the demo
//! implementations wired in by the api binary.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveTime, Timelike, Utc};
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::llm_client::ToolSpec;

pub const WEATHER_TOOL: &str = "get_current_weather";
pub const CALENDAR_TOOL: &str = "list_calendar_events";

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn execute(&self, args: Value) -> Result<Value, AgentError>;
}

/// Immutable name -> tool lookup table, built once at startup.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    /// Specs of every registered tool, sorted by name.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|t| t.spec()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub async fn execute(&self, name: &str, args: Value) -> Result<Value, AgentError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| AgentError::InvalidInput(format!("unknown tool '{name}'")))?;
        debug!(tool = name, %args, "Executing tool");
        let result = tool.execute(args).await;
        if let Err(e) = &result {
            warn!(tool = name, error = %e, "Tool execution failed");
        }
        result
    }
}

#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistryBuilder {
    /// Adds a tool. A later registration under the same name replaces the
    /// earlier one.
    pub fn register(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.insert(tool.spec().name, tool);
        self
    }

    pub fn build(self) -> ToolRegistry {
        ToolRegistry { tools: self.tools }
    }
}

fn schema_value<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| json!({"type": "object"}))
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WeatherArgs {
    /// City or place name, e.g. "Tokyo".
    pub location: String,
}

/// Canned weather data; stands in for a real provider.
pub struct CurrentWeatherTool;

#[async_trait]
impl Tool for CurrentWeatherTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: WEATHER_TOOL.to_string(),
            description: "Get the current weather for a location".to_string(),
            parameters: schema_value::<WeatherArgs>(),
        }
    }

    async fn execute(&self, args: Value) -> Result<Value, AgentError> {
        let args: WeatherArgs = serde_json::from_value(args)?;
        let location = args.location.trim();
        if location.is_empty() {
            return Err(AgentError::InvalidInput("location is empty".into()));
        }
        Ok(json!({
            "location": location,
            "temperature_c": 23,
            "condition": "partly cloudy",
            "humidity": 65,
        }))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CalendarRange {
    #[default]
    Today,
    Next,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CalendarArgs {
    /// `today` for the full day, `next` for the next upcoming event.
    #[serde(default)]
    pub range: CalendarRange,
}

#[derive(Debug, Clone, PartialEq)]
struct CalendarEntry {
    title: &'static str,
    start: NaiveTime,
    duration_minutes: u32,
}

/// A fixed daily agenda.
pub struct CalendarEventsTool {
    entries: Vec<CalendarEntry>,
}

impl Default for CalendarEventsTool {
    fn default() -> Self {
        let at = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap_or_default();
        Self {
            entries: vec![
                CalendarEntry {
                    title: "Team Standup",
                    start: at(9, 0),
                    duration_minutes: 15,
                },
                CalendarEntry {
                    title: "Code Review",
                    start: at(14, 30),
                    duration_minutes: 45,
                },
            ],
        }
    }
}

fn entry_json(entry: &CalendarEntry) -> Value {
    json!({
        "title": entry.title,
        "start": format!("{:02}:{:02}", entry.start.hour(), entry.start.minute()),
        "duration_minutes": entry.duration_minutes,
    })
}

#[async_trait]
impl Tool for CalendarEventsTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: CALENDAR_TOOL.to_string(),
            description: "List today's calendar events or the next upcoming one".to_string(),
            parameters: schema_value::<CalendarArgs>(),
        }
    }

    async fn execute(&self, args: Value) -> Result<Value, AgentError> {
        let args: CalendarArgs = if args.is_null() {
            CalendarArgs {
                range: CalendarRange::Today,
            }
        } else {
            serde_json::from_value(args)?
        };
        let events: Vec<Value> = match args.range {
            CalendarRange::Today => self.entries.iter().map(entry_json).collect(),
            CalendarRange::Next => {
                let now = Utc::now().time();
                self.entries
                    .iter()
                    .find(|e| e.start > now)
                    .map(entry_json)
                    .into_iter()
                    .collect()
            }
        };
        Ok(json!({ "range": args.range, "events": events }))
    }
}

/// Registry holding the demo weather and calendar tools.
pub fn demo_registry() -> ToolRegistry {
    ToolRegistry::builder()
        .register(Arc::new(CurrentWeatherTool))
        .register(Arc::new(CalendarEventsTool::default()))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_executes_by_name() {
        let registry = demo_registry();
        let out = registry
            .execute(WEATHER_TOOL, json!({"location": "Tokyo"}))
            .await
            .unwrap();
        assert_eq!(out["location"], "Tokyo");
        assert_eq!(out["temperature_c"], 23);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_invalid_input() {
        let registry = demo_registry();
        let err = registry.execute("launch_rockets", json!({})).await.unwrap_err();
        assert_eq!(
            err,
            AgentError::InvalidInput("unknown tool 'launch_rockets'".into())
        );
    }

    #[tokio::test]
    async fn test_bad_arguments_are_rejected() {
        let registry = demo_registry();
        let err = registry.execute(WEATHER_TOOL, json!({"city": 1})).await;
        assert!(matches!(err, Err(AgentError::InvalidInput(_))));
    }

    #[test]
    fn test_specs_carry_generated_schemas() {
        let specs = demo_registry().specs();
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec![WEATHER_TOOL, CALENDAR_TOOL]);

        let weather = &specs[0];
        assert_eq!(weather.parameters["type"], "object");
        assert!(weather.parameters["properties"]["location"].is_object());
    }

    #[tokio::test]
    async fn test_calendar_lists_the_day() {
        let out = CalendarEventsTool::default()
            .execute(json!({"range": "today"}))
            .await
            .unwrap();
        let events = out["events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["title"], "Team Standup");
        assert_eq!(events[1]["start"], "14:30");
    }
}
