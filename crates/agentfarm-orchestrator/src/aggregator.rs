//! Combining fan-out outputs into one result.
//!
//! Only members that completed are aggregated. Failed or cancelled members are
//! reported alongside in [`Aggregation::failures`]. Every ranking breaks ties in
//! favour of the agent registered first, so callers hand members over in
//! registration order or with [`MemberOutcome::registration_order`] set.

use crate::types::{AgentId, TaskId};
use agentfarm_core::FarmError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::LazyLock;

/// Confidence assumed for outputs that do not state one.
pub const DEFAULT_CONFIDENCE: f64 = 5.0;

static CONFIDENCE_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)confidence[:\s]*(\d+)").ok());

/// How fan-out outputs are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationStrategy {
    /// Every successful output, unranked.
    Merge,
    /// Highest stated confidence wins.
    Vote,
    /// Fastest successful output.
    Best,
    /// Every successful output with a count.
    #[default]
    Collect,
}

impl FromStr for AggregationStrategy {
    type Err = FarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merge" => Ok(Self::Merge),
            "vote" => Ok(Self::Vote),
            "best" => Ok(Self::Best),
            "collect" => Ok(Self::Collect),
            other => Err(FarmError::Config(format!(
                "unknown aggregation strategy '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for AggregationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Merge => "merge",
            Self::Vote => "vote",
            Self::Best => "best",
            Self::Collect => "collect",
        };
        f.write_str(name)
    }
}

/// One fan-out member as seen by the aggregator.
#[derive(Debug, Clone)]
pub struct MemberOutcome {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub registration_order: u64,
    /// `Ok((output, duration_ms))` for completed members, the failure reason
    /// otherwise.
    pub result: Result<(serde_json::Value, u64), String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub agent: AgentId,
    pub response: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub agent: AgentId,
    pub confidence: f64,
    pub response: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selected {
    pub agent: AgentId,
    pub response: serde_json::Value,
    pub duration_ms: u64,
}

/// Aggregated fan-out output, tagged by strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregatedResult {
    Merged {
        responses: Vec<AgentResponse>,
        summary: String,
    },
    Voted {
        /// `None` when no member succeeded.
        winner: Option<Vote>,
        all_votes: Vec<Vote>,
    },
    Best {
        selected: Option<Selected>,
    },
    Collected {
        count: usize,
        responses: Vec<AgentResponse>,
    },
}

/// A member that did not contribute to the aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberFailure {
    pub agent: AgentId,
    pub task_id: TaskId,
    pub reason: String,
}

/// Final product of a fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub strategy: AggregationStrategy,
    pub result: AggregatedResult,
    pub failures: Vec<MemberFailure>,
}

impl Aggregation {
    /// Number of members that contributed.
    pub fn success_count(&self) -> usize {
        match &self.result {
            AggregatedResult::Merged { responses, .. } => responses.len(),
            AggregatedResult::Voted { all_votes, .. } => all_votes.len(),
            AggregatedResult::Best { selected } => usize::from(selected.is_some()),
            AggregatedResult::Collected { count, .. } => *count,
        }
    }
}

/// Confidence stated by an output.
///
/// A JSON object's numeric `confidence` field wins; otherwise the first
/// `confidence: <digits>` in the output text, case-insensitive; otherwise
/// [`DEFAULT_CONFIDENCE`].
pub fn extract_confidence(output: &serde_json::Value) -> f64 {
    if let Some(value) = output.get("confidence").and_then(serde_json::Value::as_f64) {
        return value;
    }
    let text = match output {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    CONFIDENCE_PATTERN
        .as_ref()
        .and_then(|re| re.captures(&text))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or(DEFAULT_CONFIDENCE)
}

/// Combine member outcomes with `strategy`.
pub fn aggregate(strategy: AggregationStrategy, members: &[MemberOutcome]) -> Aggregation {
    let mut ordered: Vec<&MemberOutcome> = members.iter().collect();
    ordered.sort_by_key(|m| m.registration_order);

    let mut successes = Vec::new();
    let mut failures = Vec::new();
    for member in ordered {
        match &member.result {
            Ok((output, duration_ms)) => successes.push((member, output, *duration_ms)),
            Err(reason) => failures.push(MemberFailure {
                agent: member.agent_id.clone(),
                task_id: member.task_id,
                reason: reason.clone(),
            }),
        }
    }

    let responses = || -> Vec<AgentResponse> {
        successes
            .iter()
            .map(|(m, output, _)| AgentResponse {
                agent: m.agent_id.clone(),
                response: (*output).clone(),
            })
            .collect()
    };

    let result = match strategy {
        AggregationStrategy::Merge => {
            let responses = responses();
            let summary = format!(
                "Collected {} responses from different AI agents.",
                responses.len()
            );
            AggregatedResult::Merged { responses, summary }
        }
        AggregationStrategy::Vote => {
            let all_votes: Vec<Vote> = successes
                .iter()
                .map(|(m, output, _)| Vote {
                    agent: m.agent_id.clone(),
                    confidence: extract_confidence(output),
                    response: (*output).clone(),
                })
                .collect();
            let mut winner: Option<&Vote> = None;
            for vote in &all_votes {
                // strictly greater, so the earlier agent keeps a tie
                if winner.map_or(true, |w| vote.confidence > w.confidence) {
                    winner = Some(vote);
                }
            }
            AggregatedResult::Voted {
                winner: winner.cloned(),
                all_votes,
            }
        }
        AggregationStrategy::Best => {
            let mut selected: Option<&(&MemberOutcome, &serde_json::Value, u64)> = None;
            for candidate in &successes {
                if selected.map_or(true, |s| candidate.2 < s.2) {
                    selected = Some(candidate);
                }
            }
            AggregatedResult::Best {
                selected: selected.map(|(m, output, duration_ms)| Selected {
                    agent: m.agent_id.clone(),
                    response: (*output).clone(),
                    duration_ms: *duration_ms,
                }),
            }
        }
        AggregationStrategy::Collect => {
            let responses = responses();
            AggregatedResult::Collected {
                count: responses.len(),
                responses,
            }
        }
    };

    Aggregation {
        strategy,
        result,
        failures,
    }
}
