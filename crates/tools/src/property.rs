//! Typed tool parameter schemas
//!
//! A property is required exactly when it has no default. Integer properties
//! may carry an inclusive range. Validation failures map to JSON-RPC
//! `-32602 Invalid params`.

use serde_json::{json, Map, Value};
use std::collections::HashMap;

use sona_core::ToolError;

/// Parameter type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Boolean,
    Integer,
    String,
}

impl PropertyKind {
    fn as_str(&self) -> &'static str {
        match self {
            PropertyKind::Boolean => "boolean",
            PropertyKind::Integer => "integer",
            PropertyKind::String => "string",
        }
    }
}

/// A validated parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl PropertyValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// One parameter declaration
#[derive(Debug, Clone)]
pub struct Property {
    pub name: String,
    pub kind: PropertyKind,
    pub default: Option<PropertyValue>,
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl Property {
    pub fn new(name: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            min: None,
            max: None,
        }
    }

    pub fn with_default(mut self, default: PropertyValue) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_range(mut self, min: i64, max: i64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }

    /// Check a JSON value against this declaration.
    fn accept(&self, value: &Value) -> Result<PropertyValue, ToolError> {
        match (self.kind, value) {
            (PropertyKind::Boolean, Value::Bool(b)) => Ok(PropertyValue::Bool(*b)),
            (PropertyKind::Integer, Value::Number(n)) => {
                let int = n
                    .as_i64()
                    .ok_or_else(|| ToolError::InvalidParams(format!("{} not an integer", self.name)))?;
                if let Some(min) = self.min {
                    if int < min {
                        return Err(ToolError::InvalidParams(format!(
                            "{} below minimum {min}",
                            self.name
                        )));
                    }
                }
                if let Some(max) = self.max {
                    if int > max {
                        return Err(ToolError::InvalidParams(format!(
                            "{} above maximum {max}",
                            self.name
                        )));
                    }
                }
                Ok(PropertyValue::Int(int))
            }
            (PropertyKind::String, Value::String(s)) => Ok(PropertyValue::Str(s.clone())),
            _ => Err(ToolError::InvalidParams(format!(
                "invalid type for {}",
                self.name
            ))),
        }
    }

    fn schema_json(&self) -> Value {
        let mut schema = Map::new();
        schema.insert("type".into(), json!(self.kind.as_str()));
        if let Some(default) = &self.default {
            let v = match default {
                PropertyValue::Bool(b) => json!(b),
                PropertyValue::Int(i) => json!(i),
                PropertyValue::Str(s) => json!(s),
            };
            schema.insert("default".into(), v);
        }
        if let Some(min) = self.min {
            schema.insert("minimum".into(), json!(min));
        }
        if let Some(max) = self.max {
            schema.insert("maximum".into(), json!(max));
        }
        Value::Object(schema)
    }
}

/// An ordered parameter list
#[derive(Debug, Clone, Default)]
pub struct PropertyList {
    properties: Vec<Property>,
}

impl PropertyList {
    pub fn new(properties: Vec<Property>) -> Self {
        Self { properties }
    }

    pub fn required(&self) -> Vec<&str> {
        self.properties
            .iter()
            .filter(|p| p.is_required())
            .map(|p| p.name.as_str())
            .collect()
    }

    /// MCP inputSchema fragment.
    pub fn schema_json(&self) -> Value {
        let props: Map<String, Value> = self
            .properties
            .iter()
            .map(|p| (p.name.clone(), p.schema_json()))
            .collect();
        json!({
            "type": "object",
            "properties": props,
            "required": self.required(),
        })
    }

    /// Validate raw arguments: type check, bounds check, required check.
    pub fn parse_arguments(
        &self,
        arguments: Option<&Value>,
    ) -> Result<HashMap<String, PropertyValue>, ToolError> {
        let empty = Map::new();
        let args = match arguments {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(ToolError::InvalidParams("arguments must be an object".into()))
            }
        };

        let mut parsed = HashMap::new();
        for property in &self.properties {
            match args.get(&property.name) {
                Some(value) => {
                    parsed.insert(property.name.clone(), property.accept(value)?);
                }
                None => match &property.default {
                    Some(default) => {
                        parsed.insert(property.name.clone(), default.clone());
                    }
                    None => {
                        return Err(ToolError::InvalidParams(format!(
                            "missing required argument: {}",
                            property.name
                        )))
                    }
                },
            }
        }

        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> PropertyList {
        PropertyList::new(vec![
            Property::new("title", PropertyKind::String),
            Property::new("minutes", PropertyKind::Integer).with_range(1, 480),
            Property::new("all_day", PropertyKind::Boolean)
                .with_default(PropertyValue::Bool(false)),
        ])
    }

    #[test]
    fn test_required_excludes_defaults() {
        assert_eq!(list().required(), vec!["title", "minutes"]);
    }

    #[test]
    fn test_parse_happy_path() {
        let args = json!({"title": "Sync", "minutes": 30});
        let parsed = list().parse_arguments(Some(&args)).unwrap();
        assert_eq!(parsed["title"].as_str(), Some("Sync"));
        assert_eq!(parsed["minutes"].as_int(), Some(30));
        assert_eq!(parsed["all_day"].as_bool(), Some(false));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let args = json!({"title": 42, "minutes": 30});
        assert!(matches!(
            list().parse_arguments(Some(&args)),
            Err(ToolError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_missing_required_rejected() {
        let args = json!({"minutes": 30});
        let err = list().parse_arguments(Some(&args)).unwrap_err();
        assert!(err.to_string().contains("title"));
    }

    #[test]
    fn test_range_enforced() {
        let args = json!({"title": "Sync", "minutes": 9000});
        assert!(list().parse_arguments(Some(&args)).is_err());

        let args = json!({"title": "Sync", "minutes": 0});
        assert!(list().parse_arguments(Some(&args)).is_err());
    }

    #[test]
    fn test_schema_shape() {
        let schema = list().schema_json();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["minutes"]["minimum"], 1);
        assert_eq!(schema["properties"]["minutes"]["maximum"], 480);
        assert_eq!(schema["properties"]["all_day"]["default"], false);
    }
}
