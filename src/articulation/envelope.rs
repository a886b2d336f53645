//! The piggyback envelope: control packet plus surface response.
//!
//! The LLM emits one JSON object, control packet first. The control packet
//! is machine-consumed (asserted as atoms); the surface response is the
//! only channel the user ever sees. Sanitization caps every list, rejects
//! shell metacharacters in logic updates, and drops updates whose head is
//! a forbidden learned predicate.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::datalog::is_forbidden_learned_head;

/// One memory operation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryOperation {
    /// `store`, `evolve`, or `forget`
    pub op: String,
    /// Memory key
    pub key: String,
    /// Value for store/evolve
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// One tool request surfaced through the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Correlation id
    pub id: String,
    /// Tool name
    pub tool_name: String,
    /// Tool arguments
    #[serde(default)]
    pub tool_args: Value,
    /// Whether the turn cannot complete without this tool
    #[serde(default)]
    pub required: bool,
}

/// Self-correction signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SelfCorrection {
    /// Whether the model wants a correction pass
    #[serde(default)]
    pub triggered: bool,
    /// Why
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypothesis: Option<String>,
}

/// The machine-consumed half of the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ControlPacket {
    /// Model's own classification of the user intent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_classification: Option<Value>,
    /// Logic updates: facts or rules in schema-text syntax
    #[serde(default)]
    pub mangle_updates: Vec<String>,
    /// Memory operations
    #[serde(default)]
    pub memory_operations: Vec<MemoryOperation>,
    /// Tool requests
    #[serde(default)]
    pub tool_requests: Vec<ToolRequest>,
    /// Self-correction signal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_correction: Option<SelfCorrection>,
    /// Knowledge-store requests
    #[serde(default)]
    pub knowledge_requests: Vec<Value>,
    /// Feedback on injected context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_feedback: Option<Value>,
    /// Free-form reasoning trace (capped)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_trace: Option<String>,
}

/// The full dual-channel envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiggybackEnvelope {
    /// Machine channel, emitted first
    pub control_packet: ControlPacket,
    /// User channel; must be non-empty
    pub surface_response: String,
}

/// Known top-level envelope fields; anything else is ignored with a warning.
const ENVELOPE_FIELDS: &[&str] = &["control_packet", "surface_response"];

impl PiggybackEnvelope {
    /// Deserialize and validate one candidate. `None` when the candidate is
    /// not a plausible envelope (missing packet or empty surface response).
    pub fn from_candidate(candidate: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(candidate).ok()?;
        let object = value.as_object()?;
        if !object.contains_key("control_packet") || !object.contains_key("surface_response") {
            return None;
        }
        for key in object.keys() {
            if !ENVELOPE_FIELDS.contains(&key.as_str()) {
                warn!(field = %key, "unknown envelope field ignored");
            }
        }
        let envelope: PiggybackEnvelope = serde_json::from_value(value).ok()?;
        if envelope.surface_response.trim().is_empty() {
            return None;
        }
        Some(envelope)
    }
}

/// Caps applied to a parsed envelope.
#[derive(Debug, Clone)]
pub struct ParseCaps {
    /// Maximum logic updates retained
    pub max_mangle_updates: usize,
    /// Maximum length of one update
    pub max_update_len: usize,
    /// Maximum reasoning-trace length
    pub max_reasoning_trace: usize,
    /// Maximum surface-response length
    pub max_surface_response: usize,
}

impl Default for ParseCaps {
    fn default() -> Self {
        Self {
            max_mangle_updates: 2000,
            max_update_len: 1000,
            max_reasoning_trace: 50_000,
            max_surface_response: 65_536,
        }
    }
}

/// Shell metacharacters never allowed inside a logic update.
const SHELL_METACHARACTERS: &[char] = &['`', '$', ';', '|'];

/// Head predicate of an update: the identifier before the first `(`.
fn head_predicate(update: &str) -> &str {
    let head = update.split('(').next().unwrap_or(update);
    head.trim()
}

/// Result of sanitizing an envelope.
#[derive(Debug, Clone, Default)]
pub struct SanitizeReport {
    /// Updates dropped by the constitutional filter (forbidden heads)
    pub forbidden_dropped: Vec<String>,
    /// Updates dropped for shape violations (metacharacters, length,
    /// missing terminal period)
    pub malformed_dropped: Vec<String>,
    /// Human-readable warnings for the log
    pub warnings: Vec<String>,
}

/// Apply caps and the constitutional filter in place.
pub fn sanitize_envelope(envelope: &mut PiggybackEnvelope, caps: &ParseCaps) -> SanitizeReport {
    let mut report = SanitizeReport::default();
    let packet = &mut envelope.control_packet;

    if packet.mangle_updates.len() > caps.max_mangle_updates {
        report.warnings.push(format!(
            "mangle_updates truncated from {} to {}",
            packet.mangle_updates.len(),
            caps.max_mangle_updates
        ));
        packet.mangle_updates.truncate(caps.max_mangle_updates);
    }

    let mut kept = Vec::with_capacity(packet.mangle_updates.len());
    for update in packet.mangle_updates.drain(..) {
        let trimmed = update.trim();
        if trimmed.len() > caps.max_update_len
            || !trimmed.ends_with('.')
            || trimmed.chars().any(|c| SHELL_METACHARACTERS.contains(&c))
        {
            warn!(update = %truncate_for_log(trimmed), "malformed logic update dropped");
            report.malformed_dropped.push(trimmed.to_string());
            continue;
        }
        if is_forbidden_learned_head(head_predicate(trimmed)) {
            warn!(update = %truncate_for_log(trimmed), "forbidden-head update dropped");
            report.forbidden_dropped.push(trimmed.to_string());
            continue;
        }
        kept.push(trimmed.to_string());
    }
    packet.mangle_updates = kept;

    if let Some(trace) = &mut packet.reasoning_trace {
        if trace.len() > caps.max_reasoning_trace {
            report.warnings.push(format!(
                "reasoning_trace truncated from {} to {} chars",
                trace.len(),
                caps.max_reasoning_trace
            ));
            truncate_on_boundary(trace, caps.max_reasoning_trace);
        }
    }

    if envelope.surface_response.len() > caps.max_surface_response {
        report.warnings.push(format!(
            "surface_response truncated from {} to {} chars",
            envelope.surface_response.len(),
            caps.max_surface_response
        ));
        truncate_on_boundary(&mut envelope.surface_response, caps.max_surface_response);
    }

    report
}

fn truncate_on_boundary(s: &mut String, max: usize) {
    let mut end = max.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

fn truncate_for_log(s: &str) -> String {
    let mut out: String = s.chars().take(80).collect();
    if out.len() < s.len() {
        out.push('…');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope_with_updates(updates: &[&str]) -> PiggybackEnvelope {
        PiggybackEnvelope {
            control_packet: ControlPacket {
                mangle_updates: updates.iter().map(|s| s.to_string()).collect(),
                ..ControlPacket::default()
            },
            surface_response: "done".to_string(),
        }
    }

    #[test]
    fn test_candidate_requires_both_channels() {
        assert!(PiggybackEnvelope::from_candidate(r#"{"surface_response": "x"}"#).is_none());
        assert!(PiggybackEnvelope::from_candidate(
            r#"{"control_packet": {}, "surface_response": ""}"#
        )
        .is_none());
        assert!(PiggybackEnvelope::from_candidate(
            r#"{"control_packet": {}, "surface_response": "hi"}"#
        )
        .is_some());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let env = PiggybackEnvelope::from_candidate(
            r#"{"control_packet": {}, "surface_response": "hi", "extra": 1}"#,
        );
        assert!(env.is_some());
    }

    #[test]
    fn test_forbidden_head_dropped() {
        let mut env = envelope_with_updates(&[
            "permitted(/delete_all).",
            "focus_resolution(\"x\", \"/a.rs\", \"f\", 0.9).",
        ]);
        let report = sanitize_envelope(&mut env, &ParseCaps::default());
        assert_eq!(report.forbidden_dropped.len(), 1);
        assert_eq!(env.control_packet.mangle_updates.len(), 1);
    }

    #[test]
    fn test_shell_metacharacters_rejected() {
        let mut env = envelope_with_updates(&[
            "note(\"a; rm -rf /\").",
            "note(\"$HOME\").",
            "note(\"fine\").",
            "note(\"no period\")",
        ]);
        let report = sanitize_envelope(&mut env, &ParseCaps::default());
        assert_eq!(report.malformed_dropped.len(), 3);
        assert_eq!(env.control_packet.mangle_updates, vec!["note(\"fine\").".to_string()]);
    }

    #[test]
    fn test_caps_truncate() {
        let updates: Vec<String> = (0..2100).map(|i| format!("n({}).", i)).collect();
        let refs: Vec<&str> = updates.iter().map(String::as_str).collect();
        let mut env = envelope_with_updates(&refs);
        env.control_packet.reasoning_trace = Some("r".repeat(60_000));
        env.surface_response = "s".repeat(100_000);

        let caps = ParseCaps::default();
        let report = sanitize_envelope(&mut env, &caps);
        assert!(env.control_packet.mangle_updates.len() <= caps.max_mangle_updates);
        assert_eq!(
            env.control_packet.reasoning_trace.as_ref().unwrap().len(),
            caps.max_reasoning_trace
        );
        assert_eq!(env.surface_response.len(), caps.max_surface_response);
        assert_eq!(report.warnings.len(), 3);
    }

    #[test]
    fn test_rule_head_filtered_too() {
        let mut env = envelope_with_updates(&["safe_action(X) :- wanted(X)."]);
        let report = sanitize_envelope(&mut env, &ParseCaps::default());
        assert_eq!(report.forbidden_dropped.len(), 1);
        assert!(env.control_packet.mangle_updates.is_empty());
    }
}
