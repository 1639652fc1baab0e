//! Adapter stack resolution.
//!
//! A stack is the user-facing description of which adapters to apply and how
//! strongly. It arrives as JSON in one of two shapes:
//!
//! ```text
//! [ {"name": "a.safetensors", "strength": 0.8, "enabled": true, "tag": "style"}, ... ]
//!
//! { "folders": [ {"name": "chars", "loras": [ ... ]}, ... ],
//!   "loras":   [ ... ] }
//! ```
//!
//! Resolution flattens either shape into the ordered list of enabled entries.
//! It never fails: anything it cannot understand contributes nothing, so a
//! broken stack composes as the identity.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One enabled adapter reference from a stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterEntry {
    /// Adapter name as understood by an [`AdapterStore`](crate::store::AdapterStore).
    pub name: String,
    /// Multiplier applied to the adapter's contribution.
    pub strength: f32,
    /// Whether the entry is active. Always `true` for resolved entries.
    pub enabled: bool,
    /// Free-form tag text (trigger words) carried through to the output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl AdapterEntry {
    /// Create an enabled entry without a tag.
    #[must_use]
    pub fn new(name: impl Into<String>, strength: f32) -> Self {
        Self {
            name: name.into(),
            strength,
            enabled: true,
            tag: None,
        }
    }

    /// Attach a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// Resolve a JSON stack string into its ordered, enabled entries.
///
/// Empty, unparseable, or wrongly-shaped input yields an empty list.
#[must_use]
pub fn resolve_stack(json: &str) -> Vec<AdapterEntry> {
    if json.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Value>(json) {
        Ok(value) => resolve_value(&value),
        Err(e) => {
            tracing::debug!(error = %e, "unparseable adapter stack, treating as empty");
            Vec::new()
        }
    }
}

/// Resolve an already-parsed stack value.
///
/// Folder entries come first (in folder order), followed by top-level `loras`.
#[must_use]
pub fn resolve_value(value: &Value) -> Vec<AdapterEntry> {
    let mut items: Vec<&Value> = Vec::new();
    match value {
        Value::Array(list) => items.extend(list),
        Value::Object(map) => {
            if let Some(Value::Array(folders)) = map.get("folders") {
                for folder in folders {
                    if let Some(Value::Array(loras)) = folder.get("loras") {
                        items.extend(loras);
                    }
                }
            }
            if let Some(Value::Array(loras)) = map.get("loras") {
                items.extend(loras);
            }
        }
        other => {
            tracing::debug!(kind = value_kind(other), "adapter stack has wrong shape");
        }
    }

    let entries: Vec<AdapterEntry> = items.into_iter().filter_map(parse_entry).collect();
    tracing::debug!(count = entries.len(), "resolved adapter stack");
    entries
}

/// Join the tags of `entries` with `", "` in stack order.
#[must_use]
pub fn join_tags(entries: &[AdapterEntry]) -> String {
    entries
        .iter()
        .filter_map(|e| e.tag.as_deref())
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_entry(item: &Value) -> Option<AdapterEntry> {
    let map = item.as_object()?;

    let enabled = map.get("enabled").map_or(true, is_truthy);
    if !enabled {
        return None;
    }

    let name = map.get("name").and_then(Value::as_str).map(str::trim)?;
    if name.is_empty() {
        return None;
    }

    // `weight` takes precedence over `strength`
    let strength = match present(map, "weight").or_else(|| present(map, "strength")) {
        None => 1.0,
        Some(v) => parse_strength(v)?,
    };

    let tag = map
        .get("tag")
        .or_else(|| map.get("tags"))
        .and_then(tag_text);

    Some(AdapterEntry {
        name: name.to_string(),
        strength,
        enabled: true,
        tag,
    })
}

#[allow(clippy::cast_possible_truncation)]
fn parse_strength(value: &Value) -> Option<f32> {
    let parsed = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    let strength = parsed as f32;
    strength.is_finite().then_some(strength)
}

fn present<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.get(key).filter(|v| !v.is_null())
}

fn tag_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(tag_text)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Number(n) => n.to_string(),
        Value::Bool(true) => "true".to_string(),
        _ => String::new(),
    };
    (!text.is_empty()).then_some(text)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_list() {
        let stack = r#"[
            {"name": "a.safetensors", "strength": 0.5, "enabled": true},
            {"name": "b.safetensors", "strength": 1.5}
        ]"#;
        let entries = resolve_stack(stack);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.safetensors");
        assert!((entries[0].strength - 0.5).abs() < 1e-6);
        assert!((entries[1].strength - 1.5).abs() < 1e-6);
        assert!(entries.iter().all(|e| e.enabled));
    }

    #[test]
    fn test_disabled_entries_dropped() {
        let stack = r#"[
            {"name": "a", "enabled": false},
            {"name": "b", "enabled": 0},
            {"name": "c", "enabled": null},
            {"name": "d", "enabled": true}
        ]"#;
        let entries = resolve_stack(stack);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "d");
    }

    #[test]
    fn test_folders_then_top_level() {
        let stack = r#"{
            "folders": [
                {"name": "chars", "loras": [{"name": "f1"}, {"name": "f2", "enabled": false}]},
                {"name": "empty"},
                {"name": "styles", "loras": [{"name": "f3"}]}
            ],
            "loras": [{"name": "top"}]
        }"#;
        let names: Vec<String> = resolve_stack(stack).into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["f1", "f3", "top"]);
    }

    #[test]
    fn test_weight_and_tags_aliases() {
        let stack = r#"[{"name": "a", "weight": "0.75", "tags": "blue hair"}]"#;
        let entries = resolve_stack(stack);
        assert_eq!(entries.len(), 1);
        assert!((entries[0].strength - 0.75).abs() < 1e-6);
        assert_eq!(entries[0].tag.as_deref(), Some("blue hair"));
    }

    #[test]
    fn test_weight_wins_over_strength() {
        let entries = resolve_stack(r#"[{"name": "a", "strength": 0.2, "weight": 0.9}]"#);
        assert!((entries[0].strength - 0.9).abs() < 1e-6);

        let entries = resolve_stack(r#"[{"name": "a", "strength": 0.2, "weight": null}]"#);
        assert!((entries[0].strength - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_missing_name_dropped() {
        let stack = r#"[{"strength": 1.0}, {"name": ""}, {"name": 3}, "bare", {"name": "ok"}]"#;
        let entries = resolve_stack(stack);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "ok");
    }

    #[test]
    fn test_default_strength() {
        let entries = resolve_stack(r#"[{"name": "a"}]"#);
        assert!((entries[0].strength - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_bad_strength_drops_entry() {
        let entries = resolve_stack(r#"[{"name": "a", "strength": "lots"}, {"name": "b"}]"#);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b");
    }

    #[test]
    fn test_malformed_input_is_empty() {
        assert!(resolve_stack("").is_empty());
        assert!(resolve_stack("   ").is_empty());
        assert!(resolve_stack("not json").is_empty());
        assert!(resolve_stack("42").is_empty());
        assert!(resolve_stack(r#"{"unrelated": true}"#).is_empty());
        assert!(resolve_stack(r#"{"loras": "nope"}"#).is_empty());
    }

    #[test]
    fn test_join_tags_in_order() {
        let entries = vec![
            AdapterEntry::new("a", 1.0).with_tag("first"),
            AdapterEntry::new("b", 1.0),
            AdapterEntry::new("c", 1.0).with_tag("third"),
        ];
        assert_eq!(join_tags(&entries), "first, third");
        assert_eq!(join_tags(&[]), "");
    }

    #[test]
    fn test_tag_array_joined() {
        let entries = resolve_stack(r#"[{"name": "a", "tag": ["x", "", "y"]}]"#);
        assert_eq!(entries[0].tag.as_deref(), Some("x, y"));
    }
}
