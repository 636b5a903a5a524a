//! Topology selection. The orchestrator only depends on [`RoutingPolicy`];
//! [`KeywordRoutingPolicy`] is the default heuristic.

use crate::agents::AgentRegistry;
use crate::task::Topology;

/// One agent invocation in a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteStep {
    pub agent: String,
    /// The part of the task this step handles.
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePlan {
    pub topology: Topology,
    pub steps: Vec<RouteStep>,
}

impl RoutePlan {
    pub fn single(agent: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            topology: Topology::Single,
            steps: vec![RouteStep {
                agent: agent.into(),
                text: text.into(),
            }],
        }
    }
}

pub trait RoutingPolicy: Send + Sync {
    /// Always returns at least one step.
    fn plan(&self, text: &str, agents: &AgentRegistry) -> RoutePlan;
}

const CHAR_DELIMITERS: &[char] = &[',', ';'];
const WORD_DELIMITERS: &[&str] = &[" - ", " and ", " also ", " plus ", " then "];
const LEADING_CONNECTORS: &[&str] = &["and", "also", "plus", "then"];
const SEQUENTIAL_MARKERS: &[&str] = &[" then ", "after that", "afterwards", "and use"];

/// Splits free text into sub-queries and assigns each to the first
/// specialist that claims it.
#[derive(Debug, Clone, Copy)]
pub struct KeywordRoutingPolicy {
    pub chain_enabled: bool,
}

impl Default for KeywordRoutingPolicy {
    fn default() -> Self {
        Self {
            chain_enabled: true,
        }
    }
}

fn strip_connectors(mut part: &str) -> &str {
    loop {
        let trimmed = part.trim();
        let next = LEADING_CONNECTORS.iter().find_map(|c| {
            trimmed
                .strip_prefix(c)
                .filter(|rest| rest.starts_with(char::is_whitespace))
        });
        match next {
            Some(rest) => part = rest,
            None => return trimmed,
        }
    }
}

/// Cuts `text` at delimiters; pieces shorter than three characters are
/// dropped.
pub fn split_parts(text: &str) -> Vec<String> {
    // ASCII lowering keeps byte offsets identical to `text`.
    let lower = text.to_ascii_lowercase();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < text.len() {
        if !text.is_char_boundary(i) {
            i += 1;
            continue;
        }
        let rest = &lower[i..];
        let cut = if rest.starts_with(CHAR_DELIMITERS) {
            Some(1)
        } else {
            WORD_DELIMITERS
                .iter()
                .find(|d| rest.starts_with(**d))
                .map(|d| d.len())
        };
        match cut {
            Some(len) => {
                parts.push(&text[start..i]);
                i += len;
                start = i;
            }
            None => i += 1,
        }
    }
    parts.push(&text[start..]);

    parts
        .into_iter()
        .map(strip_connectors)
        .filter(|p| p.chars().count() >= 3)
        .map(str::to_string)
        .collect()
}

/// A part that is nothing but a short capitalized name, e.g. "London" in
/// "weather in Paris, London and Tokyo".
fn is_bare_name(part: &str) -> bool {
    let words: Vec<&str> = part
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .collect();
    !words.is_empty()
        && words.len() <= 3
        && words
            .iter()
            .all(|w| w.chars().next().is_some_and(char::is_uppercase))
}

impl RoutingPolicy for KeywordRoutingPolicy {
    fn plan(&self, text: &str, agents: &AgentRegistry) -> RoutePlan {
        let general = agents.general().name().to_string();
        let parts = split_parts(text);

        let mut steps: Vec<RouteStep> = Vec::new();
        let mut leftovers: Vec<String> = Vec::new();
        for part in parts {
            let specialist = agents.specialists().iter().find(|a| a.matches(&part));
            match specialist {
                Some(agent) => steps.push(RouteStep {
                    agent: agent.name().to_string(),
                    text: part,
                }),
                // A bare name continues the previous specialist's query.
                None if is_bare_name(&part) && !steps.is_empty() => {
                    let agent = steps[steps.len() - 1].agent.clone();
                    steps.push(RouteStep { agent, text: part });
                }
                None => leftovers.push(part),
            }
        }

        if steps.is_empty() {
            return RoutePlan::single(general, text.trim());
        }
        let substantive = leftovers
            .iter()
            .filter(|p| p.split_whitespace().count() > 1)
            .cloned()
            .collect::<Vec<_>>();
        if !substantive.is_empty() {
            steps.push(RouteStep {
                agent: general,
                text: substantive.join(", "),
            });
        }
        steps.dedup();

        if steps.len() == 1 {
            return RoutePlan {
                topology: Topology::Single,
                steps,
            };
        }

        let lower = format!(" {} ", text.to_lowercase());
        let sequential = SEQUENTIAL_MARKERS.iter().any(|m| lower.contains(m));
        let topology = if self.chain_enabled && sequential {
            Topology::Chain
        } else {
            Topology::Parallel
        };
        RoutePlan { topology, steps }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{CalendarAgent, GeneralAgent, WeatherAgent};
    use crate::llm_client::MockInferenceClient;
    use crate::tools::demo_registry;
    use std::sync::Arc;

    fn registry() -> AgentRegistry {
        let tools = Arc::new(demo_registry());
        AgentRegistry::builder(Arc::new(GeneralAgent::new(
            Arc::new(MockInferenceClient::new()),
            tools.clone(),
        )))
        .specialist(Arc::new(WeatherAgent::new(tools.clone())))
        .specialist(Arc::new(CalendarAgent::new(tools)))
        .build()
        .unwrap()
    }

    fn agents(plan: &RoutePlan) -> Vec<&str> {
        plan.steps.iter().map(|s| s.agent.as_str()).collect()
    }

    #[test]
    fn test_independent_queries_fan_out() {
        let policy = KeywordRoutingPolicy {
            chain_enabled: false,
        };
        let plan = policy.plan(
            "What's the weather in Tokyo and what's on my calendar today?",
            &registry(),
        );
        assert_eq!(plan.topology, Topology::Parallel);
        assert_eq!(agents(&plan), vec!["weather", "calendar"]);
        assert_eq!(plan.steps[0].text, "What's the weather in Tokyo");
    }

    #[test]
    fn test_sequential_phrasing_chains_when_enabled() {
        let text = "Check the weather in Paris, then put it on my calendar";
        let chained = KeywordRoutingPolicy::default().plan(text, &registry());
        assert_eq!(chained.topology, Topology::Chain);
        assert_eq!(agents(&chained), vec!["weather", "calendar"]);

        let flat = KeywordRoutingPolicy {
            chain_enabled: false,
        }
        .plan(text, &registry());
        assert_eq!(flat.topology, Topology::Parallel);
    }

    #[test]
    fn test_unmatched_text_goes_to_the_general_agent() {
        let plan = KeywordRoutingPolicy::default().plan("Tell me a joke", &registry());
        assert_eq!(plan, RoutePlan::single("planner", "Tell me a joke"));
    }

    #[test]
    fn test_single_specialist() {
        let plan = KeywordRoutingPolicy::default().plan("weather in Oslo?", &registry());
        assert_eq!(plan.topology, Topology::Single);
        assert_eq!(agents(&plan), vec!["weather"]);
    }

    #[test]
    fn test_multi_location_weather_fans_out_per_location() {
        let plan = KeywordRoutingPolicy::default()
            .plan("What's the weather in Paris, London and Tokyo?", &registry());
        assert_eq!(plan.topology, Topology::Parallel);
        assert_eq!(agents(&plan), vec!["weather", "weather", "weather"]);
        assert_eq!(plan.steps[2].text, "Tokyo?");
    }

    #[test]
    fn test_leftover_request_is_kept_for_the_general_agent() {
        let plan = KeywordRoutingPolicy::default()
            .plan("weather in Rome and write me a haiku", &registry());
        assert_eq!(agents(&plan), vec!["weather", "planner"]);
        assert_eq!(plan.steps[1].text, "write me a haiku");
    }

    #[test]
    fn test_split_handles_connectors_and_unicode() {
        assert_eq!(
            split_parts("Météo à Zürich; and then my agenda"),
            vec!["Météo à Zürich", "my agenda"]
        );
    }
}
