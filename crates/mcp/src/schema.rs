//! Typed tool schemas and their function-calling declarations.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::protocol::Tool;

/// Separator between provider and tool in an aggregated function name.
pub const NAME_SEPARATOR: &str = "__";

/// JSON type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    /// Map a JSON Schema type name; anything unrecognized is treated as a string.
    pub fn from_schema_name(name: &str) -> Self {
        match name {
            "integer" => ParamType::Integer,
            "number" => ParamType::Number,
            "boolean" => ParamType::Boolean,
            "array" => ParamType::Array,
            "object" => ParamType::Object,
            _ => ParamType::String,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }
}

/// Rust types that map onto a [`ParamType`].
pub trait JsonType {
    const PARAM_TYPE: ParamType;
}

macro_rules! json_type {
    ($param:ident => $($ty:ty),+) => {
        $(impl JsonType for $ty {
            const PARAM_TYPE: ParamType = ParamType::$param;
        })+
    };
}

json_type!(String => String, &str);
json_type!(Integer => i8, i16, i32, i64, u8, u16, u32, u64, usize);
json_type!(Number => f32, f64);
json_type!(Boolean => bool);
json_type!(Object => Map<String, Value>);

impl<T> JsonType for Vec<T> {
    const PARAM_TYPE: ParamType = ParamType::Array;
}

/// A single named parameter of a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolParameter {
    pub name: String,
    pub param_type: ParamType,
    pub description: String,
    pub required: bool,
}

/// Immutable description of a callable tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolSchema {
    pub fn builder(name: impl Into<String>) -> ToolSchemaBuilder {
        ToolSchemaBuilder {
            schema: ToolSchema {
                name: name.into(),
                description: String::new(),
                parameters: Vec::new(),
            },
        }
    }

    /// Build a schema from a tool advertised over the wire.
    ///
    /// Parameter order follows the order of `inputSchema.properties`.
    pub fn from_tool(tool: &Tool) -> Self {
        let required: Vec<&str> = tool
            .input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let parameters = tool
            .input_schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .map(|(name, prop)| ToolParameter {
                        name: name.clone(),
                        param_type: ParamType::from_schema_name(
                            prop.get("type").and_then(Value::as_str).unwrap_or("string"),
                        ),
                        description: prop
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        required: required.contains(&name.as_str()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            name: tool.name.clone(),
            description: tool.description.clone().unwrap_or_default(),
            parameters,
        }
    }

    /// Wire form advertised in a `tools/list` result.
    pub fn to_tool(&self) -> Tool {
        Tool {
            name: self.name.clone(),
            description: Some(self.description.clone()),
            input_schema: self.input_schema(),
        }
    }

    /// `{type: "object", properties, required}` for this tool.
    pub fn input_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .parameters
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    json!({"type": p.param_type.as_str(), "description": p.description}),
                )
            })
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": self.required_names(),
        })
    }

    pub fn required_names(&self) -> Vec<&str> {
        self.parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect()
    }

    pub fn parameter(&self, name: &str) -> Option<&ToolParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Function-calling declaration, optionally named `<provider>__<tool>`.
    pub fn to_function_declaration(&self, provider: Option<&str>) -> Value {
        let name = match provider {
            Some(provider) => function_name(provider, &self.name),
            None => self.name.clone(),
        };
        json!({
            "type": "function",
            "function": {
                "name": name,
                "description": self.description,
                "parameters": self.input_schema(),
            }
        })
    }

    /// Convert string-encoded scalars to the declared parameter types.
    ///
    /// Models frequently send `"5"` for integers or `"true"` for booleans.
    /// Values that do not convert cleanly, and arguments with no declared
    /// parameter, are passed through unchanged.
    pub fn coerce_arguments(&self, arguments: Map<String, Value>) -> Map<String, Value> {
        arguments
            .into_iter()
            .map(|(name, value)| {
                let coerced = match (self.parameter(&name), &value) {
                    (Some(param), Value::String(s)) => coerce_str(param.param_type, s),
                    _ => None,
                };
                (name, coerced.unwrap_or(value))
            })
            .collect()
    }
}

fn coerce_str(param_type: ParamType, s: &str) -> Option<Value> {
    let s = s.trim();
    match param_type {
        ParamType::Integer => s.parse::<i64>().ok().map(Value::from),
        ParamType::Number => s
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        ParamType::Boolean => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(Value::Bool(true)),
            "false" | "0" | "no" => Some(Value::Bool(false)),
            _ => None,
        },
        ParamType::String | ParamType::Array | ParamType::Object => None,
    }
}

/// Provider name as it appears in aggregated function names.
///
/// Distinct provider names can share a prefix (`a-b` and `a_b`).
pub fn provider_prefix(provider: &str) -> String {
    provider.replace(['-', ':'], "_")
}

/// Aggregated function name for a provider's tool.
pub fn function_name(provider: &str, tool: &str) -> String {
    format!("{}{NAME_SEPARATOR}{tool}", provider_prefix(provider))
}

/// Incremental construction of a [`ToolSchema`].
#[derive(Debug, Clone)]
pub struct ToolSchemaBuilder {
    schema: ToolSchema,
}

impl ToolSchemaBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.schema.description = description.into();
        self
    }

    /// Add a required parameter whose JSON type follows `T`.
    pub fn required<T: JsonType + ?Sized>(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.param(name, T::PARAM_TYPE, description, true)
    }

    /// Add an optional parameter whose JSON type follows `T`.
    pub fn optional<T: JsonType + ?Sized>(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.param(name, T::PARAM_TYPE, description, false)
    }

    pub fn param(
        mut self,
        name: impl Into<String>,
        param_type: ParamType,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        self.schema.parameters.push(ToolParameter {
            name: name.into(),
            param_type,
            description: description.into(),
            required,
        });
        self
    }

    pub fn build(self) -> ToolSchema {
        self.schema
    }
}
