use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{Agent, AgentContext, AgentOutput, mentions_any};
use crate::error::AgentError;
use crate::task::Context;
use crate::tools::{ToolRegistry, WEATHER_TOOL};

const KEYWORDS: &[&str] = &["weather", "temperature", "forecast", "climate"];
const PREPOSITIONS: &[&str] = &["in", "for", "at"];

pub struct WeatherAgent {
    tools: Arc<ToolRegistry>,
}

impl WeatherAgent {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self { tools }
    }
}

fn trim_word(word: &str) -> &str {
    word.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'' && c != '-')
}

fn is_capitalized(word: &str) -> bool {
    word.chars().next().is_some_and(char::is_uppercase)
}

/// Location for a weather query: `context.location`, then the capitalized
/// words after "in", "for" or "at", then the whole text if it is nothing but
/// a place name.
pub fn extract_location(text: &str, context: &Context) -> Option<String> {
    if let Some(Value::String(location)) = context.get("location") {
        if !location.trim().is_empty() {
            return Some(location.trim().to_string());
        }
    }

    let words: Vec<&str> = text.split_whitespace().collect();
    for (i, word) in words.iter().enumerate() {
        if !PREPOSITIONS.contains(&trim_word(word).to_lowercase().as_str()) {
            continue;
        }
        let place: Vec<&str> = words[i + 1..]
            .iter()
            .map(|w| trim_word(w))
            .take_while(|w| is_capitalized(w))
            .collect();
        if !place.is_empty() {
            return Some(place.join(" "));
        }
    }

    let bare: Vec<&str> = words.iter().map(|w| trim_word(w)).filter(|w| !w.is_empty()).collect();
    if !bare.is_empty() && bare.len() <= 3 && bare.iter().all(|w| is_capitalized(w)) {
        return Some(bare.join(" "));
    }
    None
}

fn describe(location: &str, data: &Value) -> String {
    let condition = data["condition"].as_str().unwrap_or("unknown conditions");
    match data["temperature_c"].as_f64() {
        Some(temp) => format!("The weather in {location} is currently {condition} and {temp}°C."),
        None => format!("The weather in {location} is currently {condition}."),
    }
}

#[async_trait]
impl Agent for WeatherAgent {
    fn name(&self) -> &str {
        "weather"
    }

    fn capability(&self) -> &str {
        "Current weather conditions and temperature for a named location"
    }

    fn matches(&self, text: &str) -> bool {
        mentions_any(text, KEYWORDS)
    }

    async fn run(&self, ctx: &AgentContext) -> Result<AgentOutput, AgentError> {
        let emitter = ctx.emitter();
        let location = extract_location(&ctx.text, &ctx.context).ok_or_else(|| {
            AgentError::InvalidInput("no location specified for weather query".into())
        })?;

        emitter.progress(format!("Fetching weather data for {location}"), Some(25.0));
        let data = self
            .tools
            .execute(WEATHER_TOOL, json!({ "location": location }))
            .await?;
        emitter.progress("Weather data received", Some(75.0));

        let summary = describe(&location, &data);
        emitter.speak(&summary).await;
        emitter.progress("Weather report ready", Some(100.0));

        Ok(AgentOutput {
            summary,
            data,
        })
    }
}
