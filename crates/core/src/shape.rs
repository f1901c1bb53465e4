//! Tool input shapes.
//!
//! An [`InputShape`] is an explicit structural descriptor of a tool's input
//! object: field names, kinds, required flags, and defaults. It is checked at
//! the boundary where the model's textual input is parsed into a structured
//! payload, and rendered as JSON Schema for the tool declarations sent to
//! the model.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::ToolError;

/// The kind of value a field accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Any,
    /// One of a fixed set of strings.
    Enum(Vec<String>),
}

impl FieldKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
            Self::Enum(values) => value
                .as_str()
                .is_some_and(|s| values.iter().any(|v| v == s)),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::String => "string".into(),
            Self::Number => "number".into(),
            Self::Integer => "integer".into(),
            Self::Boolean => "boolean".into(),
            Self::Array => "array".into(),
            Self::Object => "object".into(),
            Self::Any => "any".into(),
            Self::Enum(values) => format!("one of [{}]", values.join(", ")),
        }
    }

    fn json_schema(&self) -> Value {
        match self {
            Self::String => json!({ "type": "string" }),
            Self::Number => json!({ "type": "number" }),
            Self::Integer => json!({ "type": "integer" }),
            Self::Boolean => json!({ "type": "boolean" }),
            Self::Array => json!({ "type": "array" }),
            Self::Object => json!({ "type": "object" }),
            Self::Any => json!({}),
            Self::Enum(values) => json!({ "type": "string", "enum": values }),
        }
    }
}

/// One field of an input shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Structural descriptor of a tool's input object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputShape {
    pub fields: Vec<FieldSpec>,
    /// Reject fields that are not declared.
    #[serde(default)]
    pub strict: bool,
}

impl InputShape {
    /// An object shape with no fields yet.
    pub fn object() -> Self {
        Self::default()
    }

    /// Add a required field.
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: true,
            default: None,
            description: None,
        });
        self
    }

    /// Add an optional field.
    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: false,
            default: None,
            description: None,
        });
        self
    }

    /// Add a field that takes `default` when absent.
    pub fn with_default(
        mut self,
        name: impl Into<String>,
        kind: FieldKind,
        default: Value,
    ) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: false,
            default: Some(default),
            description: None,
        });
        self
    }

    /// Attach a description to the most recently added field.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        if let Some(last) = self.fields.last_mut() {
            last.description = Some(description.into());
        }
        self
    }

    /// Reject undeclared fields.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Parse a raw textual payload and validate it against the shape.
    pub fn parse(&self, tool_name: &str, raw: &str) -> Result<Value, ToolError> {
        // Models send an empty string for tools without parameters.
        let text = if raw.trim().is_empty() { "{}" } else { raw };

        let value: Value = serde_json::from_str(text).map_err(|e| ToolError::InvalidInput {
            tool_name: tool_name.to_string(),
            raw_input: raw.to_string(),
            diagnostics: vec![format!("input is not valid JSON: {e}")],
        })?;

        self.validate(value).map_err(|diagnostics| ToolError::InvalidInput {
            tool_name: tool_name.to_string(),
            raw_input: raw.to_string(),
            diagnostics,
        })
    }

    /// Validate a structured value, filling defaults. Returns every diagnostic
    /// found rather than stopping at the first.
    pub fn validate(&self, value: Value) -> Result<Value, Vec<String>> {
        let Value::Object(mut map) = value else {
            return Err(vec![format!(
                "expected an object, got {}",
                json_type_name(&value)
            )]);
        };

        let mut diagnostics = Vec::new();

        for spec in &self.fields {
            match map.get(&spec.name) {
                Some(Value::Null) | None => {
                    if let Some(default) = &spec.default {
                        map.insert(spec.name.clone(), default.clone());
                    } else if spec.required {
                        diagnostics.push(format!("missing required field `{}`", spec.name));
                    }
                }
                Some(v) if !spec.kind.accepts(v) => diagnostics.push(format!(
                    "field `{}` expected {}, got {}",
                    spec.name,
                    spec.kind.describe(),
                    json_type_name(v)
                )),
                Some(_) => {}
            }
        }

        if self.strict {
            for key in map.keys() {
                if !self.fields.iter().any(|f| &f.name == key) {
                    diagnostics.push(format!("unknown field `{key}`"));
                }
            }
        }

        if diagnostics.is_empty() {
            Ok(Value::Object(map))
        } else {
            Err(diagnostics)
        }
    }

    /// Render the shape as a JSON Schema object.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();

        for spec in &self.fields {
            let mut schema = spec.kind.json_schema();
            if let Value::Object(obj) = &mut schema {
                if let Some(d) = &spec.description {
                    obj.insert("description".into(), Value::String(d.clone()));
                }
                if let Some(d) = &spec.default {
                    obj.insert("default".into(), d.clone());
                }
            }
            properties.insert(spec.name.clone(), schema);
            if spec.required {
                required.push(Value::String(spec.name.clone()));
            }
        }

        let mut schema = json!({
            "type": "object",
            "properties": properties,
            "required": required,
        });
        if self.strict {
            schema["additionalProperties"] = Value::Bool(false);
        }
        schema
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
