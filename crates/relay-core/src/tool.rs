//! Tool descriptors, parameter schemas and usage metrics (spec §3).
//!
//! `ParametersSchema`/`ParameterProperty` are the concrete typed record called
//! for by the REDESIGN FLAGS, replacing a raw `serde_json::Value` parameter
//! bag. Schemas discovered from a tool server that don't fit the record carry
//! their original JSON Schema in `ToolDescriptor::raw_schema` so adapters can
//! still forward exactly what the tool server advertised.

use serde::{de, Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One property inside a tool's parameter schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterProperty {
    #[serde(rename = "type")]
    pub property_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ParameterProperty>>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "enum")]
    pub enum_list: Option<Vec<String>>,
}

/// Concrete schema for a tool's parameters object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParametersSchema {
    #[serde(rename = "type", default = "object_type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: HashMap<String, ParameterProperty>,
    #[serde(default)]
    pub required: Vec<String>,
}

fn object_type() -> String {
    "object".to_string()
}

impl Default for ParametersSchema {
    fn default() -> Self {
        Self {
            schema_type: object_type(),
            properties: HashMap::new(),
            required: Vec::new(),
        }
    }
}

/// A tool exposed to the LLM: real (backed by a tool server), custom
/// (registered by the embedder), or virtual (implemented by the dispatcher
/// itself — spec §4.6/§4.7/glossary).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: ParametersSchema,
    /// The JSON Schema as discovered, verbatim. Present whenever the source
    /// schema couldn't be losslessly represented by `ParametersSchema`
    /// (e.g. nested `oneOf`/`$ref`); adapters prefer this over `parameters`
    /// when serializing the tool envelope to the wire (spec §6).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_schema: Option<serde_json::Value>,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: ParametersSchema,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            raw_schema: None,
        }
    }

    /// The JSON Schema the wire envelope should carry: `raw_schema` if
    /// present, otherwise the typed schema re-serialized.
    pub fn wire_schema(&self) -> serde_json::Value {
        self.raw_schema
            .clone()
            .unwrap_or_else(|| serde_json::to_value(&self.parameters).unwrap_or_default())
    }
}

/// Converts an arbitrary discovered JSON Schema object into the typed record,
/// falling back to `raw_schema` for anything that doesn't fit cleanly.
pub fn schema_from_json(value: &serde_json::Value) -> (ParametersSchema, Option<serde_json::Value>) {
    match serde_json::from_value::<ParametersSchema>(value.clone()) {
        Ok(schema) => (schema, None),
        Err(_) => (ParametersSchema::default(), Some(value.clone())),
    }
}

/// How the model is allowed to use the available tools (spec §4.4).
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ToolChoice {
    /// Must use at least one tool.
    Any,
    #[default]
    Auto,
    /// Must call exactly this tool.
    Tool(String),
    /// Tools are not offered for this call.
    None,
}

impl Serialize for ToolChoice {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            ToolChoice::Any => serializer.serialize_str("required"),
            ToolChoice::Auto => serializer.serialize_str("auto"),
            ToolChoice::None => serializer.serialize_str("none"),
            ToolChoice::Tool(name) => {
                use serde::ser::SerializeMap;
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "function")?;
                let mut function = HashMap::new();
                function.insert("name", name.as_str());
                map.serialize_entry("function", &function)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for ToolChoice {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;
        impl<'de> de::Visitor<'de> for Visitor {
            type Value = ToolChoice;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("\"required\" | \"auto\" | \"none\" | {type, function: {name}}")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ToolChoice, E> {
                match v {
                    "required" => Ok(ToolChoice::Any),
                    "auto" => Ok(ToolChoice::Auto),
                    "none" => Ok(ToolChoice::None),
                    other => Err(de::Error::unknown_variant(other, &["required", "auto", "none"])),
                }
            }

            fn visit_map<M: de::MapAccess<'de>>(self, mut map: M) -> Result<ToolChoice, M::Error> {
                let mut name = None;
                while let Some(key) = map.next_key::<String>()? {
                    if key == "function" {
                        let obj: serde_json::Map<String, serde_json::Value> = map.next_value()?;
                        name = obj.get("name").and_then(|v| v.as_str()).map(str::to_string);
                    } else {
                        let _: serde_json::Value = map.next_value()?;
                    }
                }
                name.map(ToolChoice::Tool)
                    .ok_or_else(|| de::Error::missing_field("function.name"))
            }
        }
        deserializer.deserialize_any(Visitor)
    }
}

/// Why the LLM stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Error,
    Other,
}

/// Token accounting for one LLM call (spec §3).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct UsageMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_content_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_discount: Option<f64>,
}

impl UsageMetrics {
    /// Fills `total_tokens` from `input + output` when the provider didn't
    /// report a total directly (spec §3).
    pub fn with_total_filled(mut self) -> Self {
        if self.total_tokens == 0 {
            self.total_tokens = self.input_tokens + self.output_tokens;
        }
        self
    }
}
