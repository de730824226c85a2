use serde::Serialize;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    /// Array of strings.
    Array,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub description: &'static str,
    pub required: bool,
    pub default: Option<Value>,
    pub enum_values: Vec<&'static str>,
    /// Nested properties for `Object` parameters.
    pub properties: Vec<ParamSpec>,
}

impl ParamSpec {
    pub fn required(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            description,
            required: true,
            default: None,
            enum_values: Vec::new(),
            properties: Vec::new(),
        }
    }

    pub fn optional(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self { required: false, ..Self::required(name, kind, description) }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_enum(mut self, values: &[&'static str]) -> Self {
        self.enum_values = values.to_vec();
        self
    }

    pub fn with_properties(mut self, props: Vec<ParamSpec>) -> Self {
        self.properties = props;
        self
    }

    fn to_json_schema(&self) -> Value {
        let mut description = self.description.to_string();
        if let Some(d) = &self.default {
            description.push_str(&format!(" (default: {d})"));
        }
        let mut obj = Map::new();
        obj.insert("type".into(), json!(self.kind));
        obj.insert("description".into(), Value::String(description));
        if !self.enum_values.is_empty() {
            obj.insert("enum".into(), json!(self.enum_values));
        }
        if self.kind == ParamKind::Array {
            obj.insert("items".into(), json!({ "type": "string" }));
        }
        if self.kind == ParamKind::Object {
            let (props, required) = object_schema(&self.properties);
            obj.insert("properties".into(), props);
            if !required.is_empty() {
                obj.insert("required".into(), json!(required));
            }
        }
        Value::Object(obj)
    }
}

fn object_schema(params: &[ParamSpec]) -> (Value, Vec<&'static str>) {
    let mut props = Map::new();
    let mut required = Vec::new();
    for p in params {
        props.insert(p.name.to_string(), p.to_json_schema());
        if p.required {
            required.push(p.name);
        }
    }
    (Value::Object(props), required)
}

/// What the model sees of a tool. `name` is its only wire identity.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamSpec>,
}

impl ToolDescriptor {
    pub fn new(name: &'static str, description: &'static str, params: Vec<ParamSpec>) -> Self {
        Self { name, description, params }
    }

    /// JSON-schema object for the `parameters` field of a function declaration.
    pub fn parameters_schema(&self) -> Value {
        let (props, required) = object_schema(&self.params);
        let mut obj = json!({ "type": "object", "properties": props });
        if !required.is_empty() {
            obj["required"] = json!(required);
        }
        obj
    }

    pub fn to_function_declaration(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters_schema(),
        })
    }

    /// One-line usage summary for the system prompt.
    pub fn signature(&self) -> String {
        let args: Vec<String> = self
            .params
            .iter()
            .map(|p| if p.required { p.name.to_string() } else { format!("{}?", p.name) })
            .collect();
        format!("{}({}) - {}", self.name, args.join(", "), self.description)
    }
}
