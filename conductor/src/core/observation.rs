//! Observation blocks emitted by the analysis agent.
//!
//! Grammar: a fenced block tagged `observation` whose body is one JSON object
//! with a `type` discriminant and a fixed field set.
//!
//! ````text
//! ```observation
//! {"type":"blocker","title":"Missing API key","description":"...","file":"src/api.rs"}
//! ```
//! ````
//!
//! Blocks that do not decode are reported back to the caller instead of being
//! silently dropped.

use serde::{Deserialize, Serialize};

const FENCE_OPEN: &str = "```observation";
const FENCE_CLOSE: &str = "```";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Observation {
    Blocker(ObservationBody),
    Finding(ObservationBody),
    Completion(ObservationBody),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservationBody {
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Observation {
    pub fn body(&self) -> &ObservationBody {
        match self {
            Observation::Blocker(body)
            | Observation::Finding(body)
            | Observation::Completion(body) => body,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Observation::Blocker(_) => "blocker",
            Observation::Finding(_) => "finding",
            Observation::Completion(_) => "completion",
        }
    }
}

/// A block that matched the fence but not the grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedBlock {
    pub body: String,
    pub reason: String,
}

/// Result of decoding every observation block in a text fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedObservations {
    pub observations: Vec<Observation>,
    pub rejected: Vec<RejectedBlock>,
}

/// Decode all fenced observation blocks in `text`.
///
/// An unterminated trailing block is rejected rather than ignored.
pub fn decode_observations(text: &str) -> DecodedObservations {
    let mut decoded = DecodedObservations::default();
    let mut rest = text;

    while let Some(start) = rest.find(FENCE_OPEN) {
        let after_open = &rest[start + FENCE_OPEN.len()..];
        let Some(close) = after_open.find(FENCE_CLOSE) else {
            decoded.rejected.push(RejectedBlock {
                body: after_open.trim().to_string(),
                reason: "unterminated observation block".to_string(),
            });
            break;
        };
        let body = after_open[..close].trim();
        match serde_json::from_str::<Observation>(body) {
            Ok(observation) if observation.body().title.trim().is_empty() => {
                decoded.rejected.push(RejectedBlock {
                    body: body.to_string(),
                    reason: "empty title".to_string(),
                });
            }
            Ok(observation) => decoded.observations.push(observation),
            Err(err) => decoded.rejected.push(RejectedBlock {
                body: body.to_string(),
                reason: err.to_string(),
            }),
        }
        rest = &after_open[close + FENCE_CLOSE.len()..];
    }

    decoded
}

/// Blockers with no later completion observation carrying the same title.
pub fn open_blockers<'a, I>(observations: I) -> Vec<&'a ObservationBody>
where
    I: IntoIterator<Item = &'a Observation>,
{
    let mut open: Vec<&ObservationBody> = Vec::new();
    for observation in observations {
        match observation {
            Observation::Blocker(body) => {
                if !open.iter().any(|existing| existing.title == body.title) {
                    open.push(body);
                }
            }
            Observation::Completion(body) => open.retain(|blocker| blocker.title != body.title),
            Observation::Finding(_) => {}
        }
    }
    open
}
