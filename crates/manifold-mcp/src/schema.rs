//! Semantic schema tree for tool input validation.
//!
//! Backend tools carry loosely-typed JSON Schema documents. Before
//! dispatching a call, the schema is parsed into a small semantic tree
//! and the arguments are walked against it. Schemas using constructs the
//! tree does not model degrade to pass-through rather than rejecting
//! calls.

use serde_json::Value;
use std::collections::BTreeMap;

/// One node of the semantic schema tree.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaNode {
    /// Accepts anything (also the degradation target for unsupported
    /// constructs).
    Any,
    Null,
    Boolean,
    Integer {
        minimum: Option<f64>,
        maximum: Option<f64>,
    },
    Number {
        minimum: Option<f64>,
        maximum: Option<f64>,
    },
    String {
        min_length: Option<usize>,
        max_length: Option<usize>,
    },
    Array {
        items: Option<Box<SchemaNode>>,
        min_items: Option<usize>,
        max_items: Option<usize>,
    },
    Object {
        properties: BTreeMap<String, SchemaNode>,
        required: Vec<String>,
    },
    /// One of a fixed set of values.
    Enum(Vec<Value>),
    /// Exactly one value.
    Const(Value),
    /// Any of the listed alternatives (`anyOf`/`oneOf`).
    Union(Vec<SchemaNode>),
}

impl SchemaNode {
    /// Parse a JSON Schema document into a semantic tree.
    pub fn parse(schema: &Value) -> Self {
        let Some(obj) = schema.as_object() else {
            // `true` means "anything" in JSON Schema; anything else we
            // cannot model.
            return Self::Any;
        };

        if let Some(values) = obj.get("enum").and_then(Value::as_array) {
            return Self::Enum(values.clone());
        }
        if let Some(value) = obj.get("const") {
            return Self::Const(value.clone());
        }
        for key in ["anyOf", "oneOf"] {
            if let Some(variants) = obj.get(key).and_then(Value::as_array) {
                return Self::Union(variants.iter().map(Self::parse).collect());
            }
        }

        match obj.get("type").and_then(Value::as_str) {
            Some("null") => Self::Null,
            Some("boolean") => Self::Boolean,
            Some("integer") => Self::Integer {
                minimum: obj.get("minimum").and_then(Value::as_f64),
                maximum: obj.get("maximum").and_then(Value::as_f64),
            },
            Some("number") => Self::Number {
                minimum: obj.get("minimum").and_then(Value::as_f64),
                maximum: obj.get("maximum").and_then(Value::as_f64),
            },
            Some("string") => Self::String {
                min_length: obj
                    .get("minLength")
                    .and_then(Value::as_u64)
                    .map(|v| v as usize),
                max_length: obj
                    .get("maxLength")
                    .and_then(Value::as_u64)
                    .map(|v| v as usize),
            },
            Some("array") => Self::Array {
                items: obj.get("items").map(|i| Box::new(Self::parse(i))),
                min_items: obj
                    .get("minItems")
                    .and_then(Value::as_u64)
                    .map(|v| v as usize),
                max_items: obj
                    .get("maxItems")
                    .and_then(Value::as_u64)
                    .map(|v| v as usize),
            },
            Some("object") => {
                let properties = obj
                    .get("properties")
                    .and_then(Value::as_object)
                    .map(|props| {
                        props
                            .iter()
                            .map(|(k, v)| (k.clone(), Self::parse(v)))
                            .collect()
                    })
                    .unwrap_or_default();
                let required = obj
                    .get("required")
                    .and_then(Value::as_array)
                    .map(|names| {
                        names
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                Self::Object {
                    properties,
                    required,
                }
            }
            _ => Self::Any,
        }
    }

    /// Validate a value against this node.
    ///
    /// Returns the first violation as a human-readable path + message.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        self.validate_at(value, "$")
    }

    fn validate_at(&self, value: &Value, path: &str) -> Result<(), String> {
        match self {
            Self::Any => Ok(()),
            Self::Null => match value {
                Value::Null => Ok(()),
                _ => Err(format!("{path}: expected null")),
            },
            Self::Boolean => match value {
                Value::Bool(_) => Ok(()),
                _ => Err(format!("{path}: expected boolean")),
            },
            Self::Integer { minimum, maximum } => {
                if !value.is_i64() && !value.is_u64() {
                    return Err(format!("{path}: expected integer"));
                }
                check_range(value.as_f64(), *minimum, *maximum, path)
            }
            Self::Number { minimum, maximum } => {
                if !value.is_number() {
                    return Err(format!("{path}: expected number"));
                }
                check_range(value.as_f64(), *minimum, *maximum, path)
            }
            Self::String {
                min_length,
                max_length,
            } => {
                let Some(s) = value.as_str() else {
                    return Err(format!("{path}: expected string"));
                };
                let len = s.chars().count();
                if let Some(min) = min_length {
                    if len < *min {
                        return Err(format!("{path}: string shorter than {min}"));
                    }
                }
                if let Some(max) = max_length {
                    if len > *max {
                        return Err(format!("{path}: string longer than {max}"));
                    }
                }
                Ok(())
            }
            Self::Array {
                items,
                min_items,
                max_items,
            } => {
                let Some(array) = value.as_array() else {
                    return Err(format!("{path}: expected array"));
                };
                if let Some(min) = min_items {
                    if array.len() < *min {
                        return Err(format!("{path}: fewer than {min} items"));
                    }
                }
                if let Some(max) = max_items {
                    if array.len() > *max {
                        return Err(format!("{path}: more than {max} items"));
                    }
                }
                if let Some(item_schema) = items {
                    for (i, item) in array.iter().enumerate() {
                        item_schema.validate_at(item, &format!("{path}[{i}]"))?;
                    }
                }
                Ok(())
            }
            Self::Object {
                properties,
                required,
            } => {
                let Some(obj) = value.as_object() else {
                    return Err(format!("{path}: expected object"));
                };
                for name in required {
                    if !obj.contains_key(name) {
                        return Err(format!("{path}: missing required property '{name}'"));
                    }
                }
                for (name, schema) in properties {
                    if let Some(prop) = obj.get(name) {
                        schema.validate_at(prop, &format!("{path}.{name}"))?;
                    }
                }
                Ok(())
            }
            Self::Enum(options) => {
                if options.contains(value) {
                    Ok(())
                } else {
                    Err(format!("{path}: value not in enum"))
                }
            }
            Self::Const(expected) => {
                if value == expected {
                    Ok(())
                } else {
                    Err(format!("{path}: value does not match const"))
                }
            }
            Self::Union(variants) => {
                for variant in variants {
                    if variant.validate_at(value, path).is_ok() {
                        return Ok(());
                    }
                }
                Err(format!("{path}: no union variant matched"))
            }
        }
    }
}

fn check_range(
    value: Option<f64>,
    minimum: Option<f64>,
    maximum: Option<f64>,
    path: &str,
) -> Result<(), String> {
    let Some(value) = value else {
        return Ok(());
    };
    if let Some(min) = minimum {
        if value < min {
            return Err(format!("{path}: value below minimum {min}"));
        }
    }
    if let Some(max) = maximum {
        if value > max {
            return Err(format!("{path}: value above maximum {max}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_object_with_required() {
        let schema = json!({
            "type": "object",
            "properties": {
                "city": {"type": "string"},
                "days": {"type": "integer", "minimum": 1, "maximum": 14}
            },
            "required": ["city"]
        });
        let node = SchemaNode::parse(&schema);

        assert!(node.validate(&json!({"city": "Oslo"})).is_ok());
        assert!(node.validate(&json!({"city": "Oslo", "days": 7})).is_ok());

        let err = node.validate(&json!({"days": 3})).unwrap_err();
        assert!(err.contains("city"));

        let err = node.validate(&json!({"city": "Oslo", "days": 99})).unwrap_err();
        assert!(err.contains("maximum"));
    }

    #[test]
    fn test_string_length_constraints() {
        let schema = json!({"type": "string", "minLength": 2, "maxLength": 4});
        let node = SchemaNode::parse(&schema);

        assert!(node.validate(&json!("ab")).is_ok());
        assert!(node.validate(&json!("a")).is_err());
        assert!(node.validate(&json!("abcde")).is_err());
        assert!(node.validate(&json!(42)).is_err());
    }

    #[test]
    fn test_array_items() {
        let schema = json!({
            "type": "array",
            "items": {"type": "number"},
            "minItems": 1
        });
        let node = SchemaNode::parse(&schema);

        assert!(node.validate(&json!([1, 2.5])).is_ok());
        assert!(node.validate(&json!([])).is_err());
        assert!(node.validate(&json!([1, "two"])).is_err());
    }

    #[test]
    fn test_enum_and_const() {
        let node = SchemaNode::parse(&json!({"enum": ["a", "b"]}));
        assert!(node.validate(&json!("a")).is_ok());
        assert!(node.validate(&json!("c")).is_err());

        let node = SchemaNode::parse(&json!({"const": 42}));
        assert!(node.validate(&json!(42)).is_ok());
        assert!(node.validate(&json!(43)).is_err());
    }

    #[test]
    fn test_union() {
        let node = SchemaNode::parse(&json!({
            "anyOf": [{"type": "string"}, {"type": "null"}]
        }));
        assert!(node.validate(&json!("text")).is_ok());
        assert!(node.validate(&json!(null)).is_ok());
        assert!(node.validate(&json!(5)).is_err());
    }

    #[test]
    fn test_integer_rejects_float() {
        let node = SchemaNode::parse(&json!({"type": "integer"}));
        assert!(node.validate(&json!(3)).is_ok());
        assert!(node.validate(&json!(3.5)).is_err());
    }

    #[test]
    fn test_unknown_constructs_degrade_to_any() {
        // $ref is not modeled; the schema degrades to pass-through.
        let node = SchemaNode::parse(&json!({"$ref": "#/definitions/x"}));
        assert_eq!(node, SchemaNode::Any);
        assert!(node.validate(&json!({"anything": true})).is_ok());

        // Non-object schema values also pass through.
        assert_eq!(SchemaNode::parse(&json!(true)), SchemaNode::Any);
    }

    #[test]
    fn test_nested_object_path_in_error() {
        let schema = json!({
            "type": "object",
            "properties": {
                "filter": {
                    "type": "object",
                    "properties": {"limit": {"type": "integer"}},
                    "required": ["limit"]
                }
            }
        });
        let node = SchemaNode::parse(&schema);
        let err = node.validate(&json!({"filter": {}})).unwrap_err();
        assert!(err.contains("$.filter"));
    }
}
