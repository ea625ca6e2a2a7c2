//! Structured-output schemas and callable-function declarations.
//!
//! [`Schema`] is the subset of JSON Schema every backend understands.  It is
//! rendered two ways: standard lowercase JSON Schema for the chat-completion
//! style backends, and the uppercase `type` form the genai API expects.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// JSON value type of a schema node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    #[default]
    Object,
}

impl SchemaType {
    fn json_name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    fn genai_name(self) -> &'static str {
        match self {
            Self::String => "STRING",
            Self::Number => "NUMBER",
            Self::Integer => "INTEGER",
            Self::Boolean => "BOOLEAN",
            Self::Array => "ARRAY",
            Self::Object => "OBJECT",
        }
    }
}

/// A schema node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Schema {
    #[serde(rename = "type")]
    pub kind: SchemaType,
    pub format: String,
    pub title: String,
    pub description: String,
    pub nullable: bool,
    pub items: Option<Box<Schema>>,
    pub min_items: u64,
    pub max_items: u64,
    #[serde(rename = "enum")]
    pub enum_values: Vec<String>,
    pub properties: BTreeMap<String, Schema>,
    pub required: Vec<String>,
    pub min_properties: u64,
    pub max_properties: u64,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub min_length: u64,
    pub max_length: u64,
    pub pattern: String,
}

impl Schema {
    fn of(kind: SchemaType) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn string() -> Self {
        Self::of(SchemaType::String)
    }

    pub fn number() -> Self {
        Self::of(SchemaType::Number)
    }

    pub fn integer() -> Self {
        Self::of(SchemaType::Integer)
    }

    pub fn boolean() -> Self {
        Self::of(SchemaType::Boolean)
    }

    pub fn array(items: Schema) -> Self {
        Self {
            items: Some(Box::new(items)),
            ..Self::of(SchemaType::Array)
        }
    }

    /// An object schema with the given properties and required keys.
    pub fn object<'a>(
        properties: impl IntoIterator<Item = (&'a str, Schema)>,
        required: &[&str],
    ) -> Self {
        Self {
            properties: properties
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v))
                .collect(),
            required: required.iter().map(|s| (*s).to_owned()).collect(),
            ..Self::of(SchemaType::Object)
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Standard JSON Schema rendering.
    pub fn to_json_schema(&self) -> Value {
        self.render(SchemaType::json_name)
    }

    /// genai rendering (uppercase type names).
    pub fn to_genai(&self) -> Value {
        self.render(SchemaType::genai_name)
    }

    /// Indented JSON Schema text, used in schema instructions.
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(&self.to_json_schema()).unwrap_or_default()
    }

    fn render(&self, type_name: fn(SchemaType) -> &'static str) -> Value {
        let mut out = Map::new();
        out.insert("type".into(), json!(type_name(self.kind)));

        let strings = [
            ("format", &self.format),
            ("title", &self.title),
            ("description", &self.description),
            ("pattern", &self.pattern),
        ];
        for (key, value) in strings {
            if !value.is_empty() {
                out.insert(key.into(), json!(value));
            }
        }

        let counts = [
            ("minItems", self.min_items),
            ("maxItems", self.max_items),
            ("minProperties", self.min_properties),
            ("maxProperties", self.max_properties),
            ("minLength", self.min_length),
            ("maxLength", self.max_length),
        ];
        for (key, value) in counts {
            if value > 0 {
                out.insert(key.into(), json!(value));
            }
        }

        if self.nullable {
            out.insert("nullable".into(), json!(true));
        }
        if let Some(min) = self.minimum {
            out.insert("minimum".into(), json!(min));
        }
        if let Some(max) = self.maximum {
            out.insert("maximum".into(), json!(max));
        }
        if !self.enum_values.is_empty() {
            out.insert("enum".into(), json!(self.enum_values));
        }
        if !self.required.is_empty() {
            out.insert("required".into(), json!(self.required));
        }
        if let Some(items) = &self.items {
            out.insert("items".into(), items.render(type_name));
        }
        if !self.properties.is_empty() {
            let props: Map<String, Value> = self
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.render(type_name)))
                .collect();
            out.insert("properties".into(), Value::Object(props));
        }

        Value::Object(out)
    }
}

/// A function the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Option<Schema>,
    #[serde(default)]
    pub response: Option<Schema>,
}

impl FunctionDeclaration {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: None,
            response: None,
        }
    }

    pub fn with_parameters(mut self, schema: Schema) -> Self {
        self.parameters = Some(schema);
        self
    }

    /// Parameter schema as JSON Schema; an empty object when unset.
    pub fn parameters_json_schema(&self) -> Value {
        self.parameters
            .as_ref()
            .map(Schema::to_json_schema)
            .unwrap_or_else(|| json!({"type": "object", "properties": {}}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Schema {
        Schema::object(
            [
                ("path", Schema::string().with_description("file path")),
                ("lines", Schema::array(Schema::integer())),
            ],
            &["path"],
        )
    }

    #[test]
    fn json_schema_uses_lowercase_types() {
        let v = sample().to_json_schema();
        assert_eq!(v["type"], "object");
        assert_eq!(v["properties"]["path"]["type"], "string");
        assert_eq!(v["properties"]["path"]["description"], "file path");
        assert_eq!(v["properties"]["lines"]["items"]["type"], "integer");
        assert_eq!(v["required"], json!(["path"]));
        assert!(v.get("nullable").is_none());
    }

    #[test]
    fn genai_rendering_uses_uppercase_types() {
        let v = sample().to_genai();
        assert_eq!(v["type"], "OBJECT");
        assert_eq!(v["properties"]["lines"]["type"], "ARRAY");
        assert_eq!(v["properties"]["lines"]["items"]["type"], "INTEGER");
    }

    #[test]
    fn bounds_are_emitted_only_when_set() {
        let mut schema = Schema::string();
        schema.max_length = 10;
        schema.minimum = Some(0.0);
        let v = schema.to_json_schema();
        assert_eq!(v["maxLength"], 10);
        assert_eq!(v["minimum"], 0.0);
        assert!(v.get("minLength").is_none());
    }

    #[test]
    fn missing_parameters_render_as_empty_object() {
        let decl = FunctionDeclaration::new("listFiles", "List files");
        assert_eq!(decl.parameters_json_schema()["type"], "object");
    }
}
