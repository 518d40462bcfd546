//! Entity and Value model
//!
//! Entities are produced by an external parser and are assumed to be valid by the
//! time they reach the runtime. `Value` is a closed set: every consumer matches it
//! exhaustively, so adding a variant is a compile error until each dispatch site
//! handles it.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Kind tag of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityKind {
    File,
    Agent,
    Tool,
    Intent,
    Pipeline,
    Parallel,
    Step,
    Trigger,
    Config,
    Mcp,
    Script,
    /// A kind added through the entity registry that the engine does not dispatch.
    Other(String),
}

impl EntityKind {
    pub fn as_str(&self) -> &str {
        match self {
            EntityKind::File => "file",
            EntityKind::Agent => "agent",
            EntityKind::Tool => "tool",
            EntityKind::Intent => "intent",
            EntityKind::Pipeline => "pipeline",
            EntityKind::Parallel => "parallel",
            EntityKind::Step => "step",
            EntityKind::Trigger => "trigger",
            EntityKind::Config => "config",
            EntityKind::Mcp => "mcp",
            EntityKind::Script => "script",
            EntityKind::Other(name) => name,
        }
    }
}

impl From<&str> for EntityKind {
    fn from(s: &str) -> Self {
        match s {
            "file" => EntityKind::File,
            "agent" => EntityKind::Agent,
            "tool" => EntityKind::Tool,
            "intent" => EntityKind::Intent,
            "pipeline" => EntityKind::Pipeline,
            "parallel" => EntityKind::Parallel,
            "step" => EntityKind::Step,
            "trigger" => EntityKind::Trigger,
            "config" => EntityKind::Config,
            "mcp" => EntityKind::Mcp,
            "script" => EntityKind::Script,
            other => EntityKind::Other(other.to_string()),
        }
    }
}

impl From<String> for EntityKind {
    fn from(s: String) -> Self {
        EntityKind::from(s.as_str())
    }
}

impl From<EntityKind> for String {
    fn from(kind: EntityKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position in the source text, kept for diagnostics only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

/// A typed, named node of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: EntityKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub properties: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Ordered `step` children of `pipeline` and `parallel` entities.
    #[serde(default)]
    pub children: Vec<Entity>,
    #[serde(default)]
    pub location: SourceLocation,
}

impl Entity {
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: Some(name.into()),
            properties: HashMap::new(),
            metadata: HashMap::new(),
            children: Vec::new(),
            location: SourceLocation::default(),
        }
    }

    /// Creates an entity without a name (the `config` singleton).
    pub fn unnamed(kind: EntityKind) -> Self {
        Self {
            kind,
            name: None,
            properties: HashMap::new(),
            metadata: HashMap::new(),
            children: Vec::new(),
            location: SourceLocation::default(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_child(mut self, child: Entity) -> Self {
        self.children.push(child);
        self
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.location = SourceLocation { line, column };
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|s| s.as_str())
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    /// `kind name` for log lines and error messages.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => format!("{} '{}'", self.kind, name),
            None => self.kind.to_string(),
        }
    }

    pub fn steps(&self) -> impl Iterator<Item = &Entity> {
        self.children.iter().filter(|c| c.kind == EntityKind::Step)
    }
}

/// Comparison operators. Operands are always compared as strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

impl CompareOp {
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "==" => Some(CompareOp::Eq),
            "!=" => Some(CompareOp::Ne),
            "<" => Some(CompareOp::Lt),
            "<=" => Some(CompareOp::Le),
            ">" => Some(CompareOp::Gt),
            ">=" => Some(CompareOp::Ge),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    /// Lexicographic comparison: `"10" < "9"` holds.
    pub fn apply(&self, left: &str, right: &str) -> bool {
        match self {
            CompareOp::Eq => left == right,
            CompareOp::Ne => left != right,
            CompareOp::Lt => left < right,
            CompareOp::Le => left <= right,
            CompareOp::Gt => left > right,
            CompareOp::Ge => left >= right,
        }
    }
}

/// The closed set of value forms that may appear in entity properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    String(String),
    Number(f64),
    Bool(bool),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
    /// Lazy pointer to another entity or one of its fields.
    Reference {
        kind: String,
        name: String,
        #[serde(default)]
        path: Vec<String>,
    },
    Variable(String),
    /// Parameter declaration; never reduced to a scalar.
    TypedParameter {
        param_type: String,
        #[serde(default)]
        required: bool,
        #[serde(default)]
        default: Option<Box<Value>>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        choices: Vec<Value>,
    },
    NestedEntity(Box<Entity>),
    PropertyAccess {
        base: String,
        path: Vec<String>,
    },
    MethodCall {
        receiver: Box<Value>,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        body: Option<Box<Value>>,
    },
    FunctionCall {
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Comparison {
        left: Box<Value>,
        op: CompareOp,
        right: Box<Value>,
    },
    Branch {
        condition: Box<Value>,
        cases: HashMap<String, Entity>,
    },
    Loop {
        #[serde(default)]
        max: i64,
        #[serde(default)]
        body: Vec<Entity>,
        #[serde(default)]
        break_when: Option<Box<Value>>,
    },
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn variable(name: impl Into<String>) -> Self {
        Value::Variable(name.into())
    }

    pub fn reference(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Value::Reference {
            kind: kind.into(),
            name: name.into(),
            path: Vec::new(),
        }
    }

    pub fn reference_path(
        kind: impl Into<String>,
        name: impl Into<String>,
        path: &[&str],
    ) -> Self {
        Value::Reference {
            kind: kind.into(),
            name: name.into(),
            path: path.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn property_access(base: impl Into<String>, path: &[&str]) -> Self {
        Value::PropertyAccess {
            base: base.into(),
            path: path.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn call(name: impl Into<String>, args: Vec<Value>) -> Self {
        Value::FunctionCall {
            name: name.into(),
            args,
        }
    }

    pub fn compare(left: Value, op: CompareOp, right: Value) -> Self {
        Value::Comparison {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn entity(entity: Entity) -> Self {
        Value::NestedEntity(Box::new(entity))
    }

    pub fn object<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Value::NestedEntity(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Number(_) => "number",
            Value::Bool(_) => "bool",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Reference { .. } => "reference",
            Value::Variable(_) => "variable",
            Value::TypedParameter { .. } => "typed_parameter",
            Value::NestedEntity(_) => "entity",
            Value::PropertyAccess { .. } => "property_access",
            Value::MethodCall { .. } => "method_call",
            Value::FunctionCall { .. } => "function_call",
            Value::Comparison { .. } => "comparison",
            Value::Branch { .. } => "branch",
            Value::Loop { .. } => "loop",
        }
    }

    /// String coercion used by interpolation, comparisons and `resolve_string`.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Number(n) => format_number(*n),
            Value::Bool(b) => b.to_string(),
            Value::Array(_) | Value::Object(_) => self.to_json().to_string(),
            Value::Reference { kind, name, path } => {
                if path.is_empty() {
                    format!("{}.{}", kind, name)
                } else {
                    format!("{}.{}.{}", kind, name, path.join("."))
                }
            }
            Value::Variable(name) => format!("${}", name),
            Value::TypedParameter { param_type, .. } => format!("<{}>", param_type),
            Value::NestedEntity(entity) => entity.name().to_string(),
            Value::PropertyAccess { base, path } => {
                if path.is_empty() {
                    base.clone()
                } else {
                    format!("{}.{}", base, path.join("."))
                }
            }
            Value::MethodCall {
                receiver, method, ..
            } => format!("{}.{}()", receiver.to_display_string(), method),
            Value::FunctionCall { name, .. } => format!("{}()", name),
            Value::Comparison { left, op, right } => format!(
                "{} {} {}",
                left.to_display_string(),
                op.symbol(),
                right.to_display_string()
            ),
            Value::Branch { .. } => "<branch>".to_string(),
            Value::Loop { .. } => "<loop>".to_string(),
        }
    }

    /// Convert to JSON for provider and MCP payloads. Forms without a JSON shape are
    /// rendered through their string coercion.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Array(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => {
                let sorted: BTreeMap<&String, &Value> = map.iter().collect();
                JsonValue::Object(
                    sorted
                        .into_iter()
                        .map(|(k, v)| (k.clone(), v.to_json()))
                        .collect(),
                )
            }
            other => JsonValue::String(other.to_display_string()),
        }
    }

    /// JSON `null` maps to the empty string; there is no null form.
    pub fn from_json(json: &JsonValue) -> Value {
        match json {
            JsonValue::Null => Value::String(String::new()),
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            JsonValue::String(s) => Value::String(s.clone()),
            JsonValue::Array(items) => Value::Array(items.iter().map(Value::from_json).collect()),
            JsonValue::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}
