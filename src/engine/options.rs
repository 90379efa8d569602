//! Engine-facing generation options and stop reasons.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::InferenceError;

/// Sampling and stopping parameters handed to a backend for one generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub penalties: Penalties,
    pub grammar: Option<OutputGrammar>,
}

impl GenerationOptions {
    /// Reject values no backend can honor.
    pub fn validate(&self) -> Result<(), InferenceError> {
        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(InferenceError::InvalidOptions(format!(
                    "temperature must be within 0.0..=2.0, got {temperature}"
                )));
            }
        }
        if let Some(top_p) = self.top_p {
            if !(top_p > 0.0 && top_p <= 1.0) {
                return Err(InferenceError::InvalidOptions(format!(
                    "top_p must be within (0.0, 1.0], got {top_p}"
                )));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(InferenceError::InvalidOptions("max_tokens must be > 0".into()));
        }
        if self.stop.iter().any(String::is_empty) {
            return Err(InferenceError::InvalidOptions("stop sequences must not be empty".into()));
        }
        Ok(())
    }
}

/// Repetition penalty terms, OpenAI-style.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Penalties {
    pub frequency: Option<f32>,
    pub presence: Option<f32>,
}

impl Penalties {
    pub fn is_neutral(&self) -> bool {
        self.frequency.unwrap_or(0.0) == 0.0 && self.presence.unwrap_or(0.0) == 0.0
    }
}

/// Constraint on the shape of generated output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "schema", rename_all = "snake_case")]
pub enum OutputGrammar {
    /// Output must validate against this JSON schema.
    JsonSchema(Value),
}

impl OutputGrammar {
    /// Any JSON object.
    pub fn json_object() -> Self {
        Self::JsonSchema(serde_json::json!({
            "type": "object",
            "additionalProperties": true,
        }))
    }

    /// A caller-provided schema. Only JSON objects are schemas.
    pub fn json_schema(schema: Value) -> Result<Self, InferenceError> {
        if !schema.is_object() {
            return Err(InferenceError::InvalidOptions(
                "json_schema.schema must be a JSON object".into(),
            ));
        }
        Ok(Self::JsonSchema(schema))
    }

    pub fn schema(&self) -> &Value {
        match self {
            Self::JsonSchema(schema) => schema,
        }
    }
}

/// Why a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The model produced an end-of-generation token.
    EndOfGeneration,
    /// A caller-supplied stop sequence was produced.
    StopSequence,
    /// The token limit was reached.
    MaxTokens,
    /// The cancellation token fired.
    Cancelled,
}

impl StopReason {
    /// Wire-level `finish_reason`.
    pub fn finish_reason(self) -> &'static str {
        match self {
            Self::EndOfGeneration | Self::StopSequence => "stop",
            Self::MaxTokens => "length",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Full result of one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub stop_reason: StopReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid() {
        assert!(GenerationOptions::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_sampling() {
        let options = GenerationOptions {
            top_p: Some(0.0),
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = GenerationOptions {
            temperature: Some(-0.5),
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = GenerationOptions {
            max_tokens: Some(0),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn json_object_grammar_allows_any_properties() {
        let grammar = OutputGrammar::json_object();
        assert_eq!(grammar.schema()["type"], "object");
        assert_eq!(grammar.schema()["additionalProperties"], true);
    }

    #[test]
    fn json_schema_grammar_requires_object() {
        assert!(OutputGrammar::json_schema(serde_json::json!("string")).is_err());
        assert!(OutputGrammar::json_schema(serde_json::json!({"type": "array"})).is_ok());
    }

    #[test]
    fn finish_reasons_use_wire_names() {
        assert_eq!(StopReason::EndOfGeneration.finish_reason(), "stop");
        assert_eq!(StopReason::StopSequence.finish_reason(), "stop");
        assert_eq!(StopReason::MaxTokens.finish_reason(), "length");
        assert_eq!(StopReason::Cancelled.finish_reason(), "cancelled");
    }
}
