use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{Agent, AgentContext, AgentOutput, mentions_any};
use crate::error::AgentError;
use crate::tools::{CALENDAR_TOOL, ToolRegistry};

const KEYWORDS: &[&str] = &["calendar", "schedule", "meeting", "appointment", "event", "agenda"];

pub struct CalendarAgent {
    tools: Arc<ToolRegistry>,
}

impl CalendarAgent {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self { tools }
    }
}

fn format_schedule(range: &str, events: &[Value]) -> String {
    let entries: Vec<String> = events
        .iter()
        .map(|e| {
            format!(
                "{} at {}",
                e["title"].as_str().unwrap_or("Untitled"),
                e["start"].as_str().unwrap_or("an unknown time")
            )
        })
        .collect();

    match (range, entries.as_slice()) {
        ("next", []) => "You have no more events scheduled today.".to_string(),
        ("next", [first, ..]) => format!("Your next event is {first}."),
        (_, []) => "You have no events scheduled for today.".to_string(),
        (_, [only]) => format!("You have one event today: {only}."),
        (_, all) => format!("You have {} events today: {}.", all.len(), all.join(", ")),
    }
}

#[async_trait]
impl Agent for CalendarAgent {
    fn name(&self) -> &str {
        "calendar"
    }

    fn capability(&self) -> &str {
        "Today's schedule, meetings and the next upcoming appointment"
    }

    fn matches(&self, text: &str) -> bool {
        mentions_any(text, KEYWORDS)
    }

    async fn run(&self, ctx: &AgentContext) -> Result<AgentOutput, AgentError> {
        let emitter = ctx.emitter();
        let range = if mentions_any(&ctx.text, &["next", "upcoming"]) {
            "next"
        } else {
            "today"
        };

        emitter.progress("Checking your calendar", Some(30.0));
        let data = self
            .tools
            .execute(CALENDAR_TOOL, json!({ "range": range }))
            .await?;
        let events = data["events"].as_array().cloned().unwrap_or_default();
        emitter.progress(format!("Found {} event(s)", events.len()), Some(80.0));

        let summary = format_schedule(range, &events);
        emitter.speak(&summary).await;

        Ok(AgentOutput { summary, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_wording() {
        let standup = json!({"title": "Team Standup", "start": "09:00"});
        let review = json!({"title": "Code Review", "start": "14:30"});

        assert_eq!(
            format_schedule("today", &[standup.clone(), review]),
            "You have 2 events today: Team Standup at 09:00, Code Review at 14:30."
        );
        assert_eq!(
            format_schedule("today", &[standup.clone()]),
            "You have one event today: Team Standup at 09:00."
        );
        assert_eq!(
            format_schedule("next", &[standup]),
            "Your next event is Team Standup at 09:00."
        );
        assert_eq!(
            format_schedule("today", &[]),
            "You have no events scheduled for today."
        );
    }

    #[test]
    fn test_matches_calendar_words() {
        let agent = CalendarAgent::new(Arc::new(ToolRegistry::default()));
        assert!(agent.matches("what's on my calendar today?"));
        assert!(agent.matches("Any meetings this afternoon"));
        assert!(!agent.matches("what's the weather in Paris"));
    }
}
