//! Schema normalization — provider-native tool definitions to capability
//! descriptors.
//!
//! Providers are not trusted to send complete schemas. Normalization fills
//! the gaps with fixed defaults:
//! - missing description → `""`
//! - array without an item type → items of type `"string"`
//! - object with nested fields but no `required` list → `required: []`
//! - missing `type` → inferred from `properties` / `items`, else `"string"`
//!
//! The mapping is pure. Property maps are ordered, so identical input always
//! serializes to identical bytes.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::backend::ProviderToolDefinition;

/// Item type used when a provider declares an array without one.
pub const DEFAULT_ITEM_TYPE: &str = "string";

/// Fallback when no type is declared or inferable.
const DEFAULT_FIELD_TYPE: &str = "string";

// ─── Types ──────────────────────────────────────────────────────────────────

/// `(provider, local name)` — the addressing key of a capability.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct QualifiedName {
    pub provider: String,
    pub name: String,
}

impl QualifiedName {
    pub fn new(provider: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.provider, self.name)
    }
}

/// A normalized capability, as served to front-end clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityDescriptor {
    pub provider: String,
    pub name: String,
    pub description: String,
    pub input_schema: InputShape,
}

impl CapabilityDescriptor {
    pub fn qualified_name(&self) -> QualifiedName {
        QualifiedName::new(&self.provider, &self.name)
    }

    /// Top-level required fields missing from `arguments`.
    pub fn missing_required<'a>(&'a self, arguments: &Value) -> Vec<&'a str> {
        let present = arguments.as_object();
        self.input_schema
            .required
            .iter()
            .filter(|field| !present.is_some_and(|obj| obj.contains_key(field.as_str())))
            .map(String::as_str)
            .collect()
    }
}

/// Top-level input shape: always an object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputShape {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub properties: BTreeMap<String, FieldShape>,
    pub required: Vec<String>,
}

impl Default for InputShape {
    fn default() -> Self {
        Self {
            kind: "object",
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

/// One field of an input shape. Recursive through `items` and `properties`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldShape {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<FieldShape>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, FieldShape>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<Value>>,
}

impl FieldShape {
    fn scalar(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            description: String::new(),
            items: None,
            properties: None,
            required: None,
            allowed_values: None,
        }
    }
}

// ─── Normalization ──────────────────────────────────────────────────────────

/// Normalize one provider tool definition.
pub fn normalize(provider: &str, tool: &ProviderToolDefinition) -> CapabilityDescriptor {
    CapabilityDescriptor {
        provider: provider.to_string(),
        name: tool.name.clone(),
        description: tool.description.clone().unwrap_or_default(),
        input_schema: normalize_input(&tool.input_schema),
    }
}

/// Normalize a tool's top-level input schema.
pub fn normalize_input(schema: &Value) -> InputShape {
    InputShape {
        kind: "object",
        properties: schema
            .get("properties")
            .and_then(Value::as_object)
            .map(normalize_properties)
            .unwrap_or_default(),
        required: string_list(schema.get("required")),
    }
}

fn normalize_properties(properties: &serde_json::Map<String, Value>) -> BTreeMap<String, FieldShape> {
    properties
        .iter()
        .map(|(name, field)| (name.clone(), normalize_field(field)))
        .collect()
}

fn normalize_field(field: &Value) -> FieldShape {
    let kind = resolve_type(field);

    let items = (kind == "array").then(|| {
        let declared = match field.get("items") {
            Some(Value::Array(tuple)) => tuple.first(),
            other => other,
        };
        Box::new(match declared {
            Some(item) if item.is_object() => normalize_field(item),
            _ => FieldShape::scalar(DEFAULT_ITEM_TYPE),
        })
    });

    let nested = if kind == "object" {
        field.get("properties").and_then(Value::as_object)
    } else {
        None
    };
    let properties = nested.map(normalize_properties);
    let required = nested.map(|_| string_list(field.get("required")));

    FieldShape {
        description: field
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        allowed_values: field.get("enum").and_then(Value::as_array).cloned(),
        kind,
        items,
        properties,
        required,
    }
}

/// Resolve a field's type, tolerating union lists and omissions.
fn resolve_type(field: &Value) -> String {
    match field.get("type") {
        Some(Value::String(kind)) => return kind.clone(),
        Some(Value::Array(kinds)) => {
            let mut names = kinds.iter().filter_map(Value::as_str);
            if let Some(kind) = names.clone().find(|k| *k != "null") {
                return kind.to_string();
            }
            if names.next().is_some() {
                return "null".to_string();
            }
        }
        _ => {}
    }

    if field.get("properties").is_some() {
        "object".to_string()
    } else if field.get("items").is_some() {
        "array".to_string()
    } else {
        DEFAULT_FIELD_TYPE.to_string()
    }
}

/// String entries of a JSON array, in order; anything else is dropped.
fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(schema: Value) -> ProviderToolDefinition {
        ProviderToolDefinition {
            name: "read_file".into(),
            description: None,
            input_schema: schema,
        }
    }

    #[test]
    fn test_missing_description_is_empty_string() {
        let desc = normalize("files", &tool(json!({"type": "object"})));
        assert_eq!(desc.description, "");

        let rendered = serde_json::to_value(&desc).unwrap();
        assert_eq!(rendered["description"], "");
    }

    #[test]
    fn test_array_without_item_type_defaults_to_string() {
        let desc = normalize(
            "files",
            &tool(json!({
                "type": "object",
                "properties": {"paths": {"type": "array", "description": "files to read"}}
            })),
        );

        let paths = &desc.input_schema.properties["paths"];
        assert_eq!(paths.kind, "array");
        assert_eq!(paths.description, "files to read");
        assert_eq!(paths.items.as_ref().unwrap().kind, "string");
    }

    #[test]
    fn test_array_items_without_type_default_to_string() {
        let shape = normalize_input(&json!({
            "properties": {"tags": {"type": "array", "items": {"description": "a tag"}}}
        }));
        let items = shape.properties["tags"].items.as_ref().unwrap();
        assert_eq!(items.kind, "string");
        assert_eq!(items.description, "a tag");
    }

    #[test]
    fn test_object_items_always_carry_required_list() {
        let shape = normalize_input(&json!({
            "type": "object",
            "properties": {
                "edits": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {"old": {"type": "string"}, "new": {"type": "string"}}
                    }
                }
            },
            "required": ["edits"]
        }));

        let items = shape.properties["edits"].items.as_ref().unwrap();
        assert_eq!(items.kind, "object");
        assert_eq!(items.required, Some(vec![]));
        assert_eq!(items.properties.as_ref().unwrap().len(), 2);

        let rendered = serde_json::to_value(&shape).unwrap();
        assert_eq!(rendered["properties"]["edits"]["items"]["required"], json!([]));
        assert_eq!(rendered["required"], json!(["edits"]));
    }

    #[test]
    fn test_object_items_keep_declared_required() {
        let shape = normalize_input(&json!({
            "properties": {
                "rows": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {"id": {"type": "integer"}},
                        "required": ["id", 3]
                    }
                }
            }
        }));
        let items = shape.properties["rows"].items.as_ref().unwrap();
        assert_eq!(items.required, Some(vec!["id".to_string()]));
    }

    #[test]
    fn test_type_inference_and_unions() {
        let shape = normalize_input(&json!({
            "properties": {
                "maybe": {"type": ["null", "integer"]},
                "nested": {"properties": {"x": {}}},
                "list": {"items": {"type": "number"}},
                "bare": {}
            }
        }));

        assert_eq!(shape.properties["maybe"].kind, "integer");
        assert_eq!(shape.properties["nested"].kind, "object");
        assert_eq!(shape.properties["nested"].required, Some(vec![]));
        assert_eq!(shape.properties["list"].kind, "array");
        assert_eq!(shape.properties["list"].items.as_ref().unwrap().kind, "number");
        assert_eq!(shape.properties["bare"].kind, "string");
    }

    #[test]
    fn test_non_object_schema_yields_empty_shape() {
        let shape = normalize_input(&Value::Null);
        assert!(shape.properties.is_empty());
        assert!(shape.required.is_empty());
        assert_eq!(shape.kind, "object");
    }

    #[test]
    fn test_normalization_is_deterministic() {
        let def = tool(json!({
            "type": "object",
            "properties": {
                "zeta": {"type": "array"},
                "alpha": {"type": "string", "enum": ["a", "b"]},
                "mid": {"type": "object", "properties": {"k": {"type": "boolean"}}}
            },
            "required": ["zeta", "alpha"]
        }));

        let first = serde_json::to_string(&normalize("files", &def)).unwrap();
        let second = serde_json::to_string(&normalize("files", &def)).unwrap();
        assert_eq!(first, second);

        // Properties render in sorted order regardless of input order.
        let alpha = first.find("\"alpha\"").unwrap();
        let zeta = first.find("\"zeta\"").unwrap();
        assert!(alpha < zeta);
    }

    #[test]
    fn test_missing_required() {
        let desc = normalize(
            "files",
            &tool(json!({
                "properties": {"path": {"type": "string"}, "mode": {"type": "string"}},
                "required": ["path", "mode"]
            })),
        );

        assert_eq!(desc.missing_required(&json!({"path": "/tmp"})), vec!["mode"]);
        assert!(desc
            .missing_required(&json!({"path": "/tmp", "mode": "r"}))
            .is_empty());
        assert_eq!(desc.missing_required(&Value::Null), vec!["path", "mode"]);
    }

    #[test]
    fn test_qualified_name_display() {
        assert_eq!(QualifiedName::new("a", "read_file").to_string(), "a.read_file");
    }
}
