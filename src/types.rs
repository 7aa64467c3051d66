use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Everything the remote peer tells us about one of its objects.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ObjectSchema {
    #[serde(default)]
    pub methods: Vec<MethodSchema>,
    #[serde(default)]
    pub properties: Vec<PropertySchema>,
    #[serde(default)]
    pub signals: Vec<SignalSchema>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MethodSchema {
    pub name: String,
    #[serde(rename = "paramNames", default)]
    pub param_names: Vec<String>,
    #[serde(rename = "returnType", default)]
    pub return_type: String,
}

impl MethodSchema {
    /// Void methods are sent fire-and-forget; nobody waits for their reply.
    pub fn is_void(&self) -> bool {
        matches!(self.return_type.as_str(), "" | "void")
    }

    pub fn arity(&self) -> usize {
        self.param_names.len()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PropertySchema {
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_name: String,
    #[serde(
        rename = "notifySignal",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub notify_signal: Option<NotifySignal>,
    /// Initial value, if the peer ships one with the schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SignalSchema {
    pub name: String,
    #[serde(rename = "paramNames", default)]
    pub param_names: Vec<String>,
}

/// A property's notify signal, given either by name or as a sequence whose
/// first element is the name.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum NotifySignal {
    Name(String),
    Sequence(Vec<Value>),
}

impl NotifySignal {
    pub fn name(&self) -> Option<&str> {
        match self {
            NotifySignal::Name(name) => Some(name),
            NotifySignal::Sequence(items) => items.first().and_then(Value::as_str),
        }
    }
}

impl fmt::Display for NotifySignal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name().unwrap_or("<unnamed>"))
    }
}
