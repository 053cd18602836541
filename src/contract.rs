//! Structural data contracts over state-store keys.
//!
//! A [`DataContract`] maps key names to [`Schema`]s. Node types declare an
//! input contract (validated by the runtime before `prep`) and an output
//! contract (advertised to the UI through the node-type registry). Schemas
//! are portable: they serialize to the same JSON shape the flow-config
//! document embeds under `inputs` / `outputs`.
//!
//! Validation is aggregate by design. `safe_parse` walks the whole value
//! and returns every issue it finds, each carrying the dotted path of the
//! failing location, so a caller sees all problems at once instead of the
//! first.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One problem found while checking a value against a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaIssue {
    /// Dotted location of the failure within the value; empty for the
    /// value itself.
    pub path: String,
    /// Human-readable description of the failure.
    pub message: String,
}

/// The shape a schema requires, tagged for portable JSON encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SchemaKind {
    /// Any JSON string.
    String,
    /// Any JSON number.
    Number,
    /// A JSON boolean.
    Boolean,
    /// A JSON object with declared fields. Undeclared fields are allowed.
    Object {
        /// Declared fields, in declaration order.
        fields: IndexMap<String, Schema>,
    },
    /// A JSON array whose elements all match the item schema.
    Array {
        /// Schema every element must satisfy.
        items: Box<Schema>,
    },
    /// A value that may be absent or null; when present, the inner schema
    /// applies.
    Optional {
        /// Schema applied when a value is present.
        inner: Box<Schema>,
    },
    /// Anything, including null.
    Any,
}

/// A structural schema with an optional documentation string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// The required shape.
    #[serde(flatten)]
    pub kind: SchemaKind,
    /// Documentation shown by UIs; not consulted during validation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Schema {
    /// A string schema.
    pub fn string() -> Self {
        Self {
            kind: SchemaKind::String,
            description: None,
        }
    }

    /// A number schema.
    pub fn number() -> Self {
        Self {
            kind: SchemaKind::Number,
            description: None,
        }
    }

    /// A boolean schema.
    pub fn boolean() -> Self {
        Self {
            kind: SchemaKind::Boolean,
            description: None,
        }
    }

    /// An object schema with the given declared fields.
    pub fn object<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, Schema)>,
        S: Into<String>,
    {
        Self {
            kind: SchemaKind::Object {
                fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            },
            description: None,
        }
    }

    /// An array schema over the given element schema.
    pub fn array(items: Schema) -> Self {
        Self {
            kind: SchemaKind::Array {
                items: Box::new(items),
            },
            description: None,
        }
    }

    /// An optional wrapper over the given schema.
    pub fn optional(inner: Schema) -> Self {
        Self {
            kind: SchemaKind::Optional {
                inner: Box::new(inner),
            },
            description: None,
        }
    }

    /// A schema that accepts anything.
    pub fn any() -> Self {
        Self {
            kind: SchemaKind::Any,
            description: None,
        }
    }

    /// Attach a documentation string.
    pub fn describe(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    /// Whether a missing value satisfies this schema.
    pub fn accepts_absent(&self) -> bool {
        matches!(self.kind, SchemaKind::Optional { .. } | SchemaKind::Any)
    }

    /// Check a value against this schema.
    ///
    /// Returns `Ok(())` on success, or every issue found. Never stops at
    /// the first failure.
    pub fn safe_parse(&self, value: &JsonValue) -> Result<(), Vec<SchemaIssue>> {
        let mut issues = Vec::new();
        self.check(value, "", &mut issues);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }

    fn check(&self, value: &JsonValue, path: &str, issues: &mut Vec<SchemaIssue>) {
        match &self.kind {
            SchemaKind::Any => {}
            SchemaKind::String => {
                if !value.is_string() {
                    issues.push(type_issue(path, "string", value));
                }
            }
            SchemaKind::Number => {
                if !value.is_number() {
                    issues.push(type_issue(path, "number", value));
                }
            }
            SchemaKind::Boolean => {
                if !value.is_boolean() {
                    issues.push(type_issue(path, "boolean", value));
                }
            }
            SchemaKind::Optional { inner } => {
                if !value.is_null() {
                    inner.check(value, path, issues);
                }
            }
            SchemaKind::Array { items } => match value.as_array() {
                Some(elements) => {
                    for (index, element) in elements.iter().enumerate() {
                        items.check(element, &join_path(path, &index.to_string()), issues);
                    }
                }
                None => issues.push(type_issue(path, "array", value)),
            },
            SchemaKind::Object { fields } => match value.as_object() {
                Some(map) => {
                    for (field, schema) in fields {
                        let field_path = join_path(path, field);
                        match map.get(field) {
                            Some(field_value) => schema.check(field_value, &field_path, issues),
                            None if schema.accepts_absent() => {}
                            None => issues.push(SchemaIssue {
                                path: field_path,
                                message: "required field missing".to_string(),
                            }),
                        }
                    }
                }
                None => issues.push(type_issue(path, "object", value)),
            },
        }
    }
}

fn join_path(parent: &str, segment: &str) -> String {
    if parent.is_empty() {
        segment.to_string()
    } else {
        format!("{parent}.{segment}")
    }
}

fn type_issue(path: &str, expected: &str, found: &JsonValue) -> SchemaIssue {
    SchemaIssue {
        path: path.to_string(),
        message: format!("expected {expected}, found {}", json_type_name(found)),
    }
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// A mapping from store key to the schema its value must satisfy.
///
/// Serializes transparently as a JSON object of key → schema, the encoding
/// the flow-config document embeds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataContract {
    /// Declared keys, in declaration order.
    pub keys: IndexMap<String, Schema>,
}

impl DataContract {
    /// An empty contract.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a key.
    pub fn with_key(mut self, key: impl Into<String>, schema: Schema) -> Self {
        self.keys.insert(key.into(), schema);
        self
    }

    /// Iterate declared (key, schema) pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Schema)> {
        self.keys.iter()
    }

    /// Number of declared keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the contract declares no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_primitive_schemas() {
        assert!(Schema::string().safe_parse(&json!("hi")).is_ok());
        assert!(Schema::number().safe_parse(&json!(3.5)).is_ok());
        assert!(Schema::boolean().safe_parse(&json!(true)).is_ok());
        assert!(Schema::string().safe_parse(&json!(1)).is_err());
    }

    #[test]
    fn test_issue_carries_dotted_path() {
        let schema = Schema::object([(
            "address",
            Schema::object([("city", Schema::string())]),
        )]);
        let issues = schema
            .safe_parse(&json!({"address": {"city": 42}}))
            .unwrap_err();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "address.city");
        assert_eq!(issues[0].message, "expected string, found number");
    }

    #[test]
    fn test_all_issues_reported() {
        let schema = Schema::object([
            ("name", Schema::string()),
            ("age", Schema::number()),
            ("active", Schema::boolean()),
        ]);
        let issues = schema
            .safe_parse(&json!({"name": 1, "active": "yes"}))
            .unwrap_err();
        // One per bad field plus the missing one; never first-failure only.
        assert_eq!(issues.len(), 3);
        let paths: Vec<&str> = issues.iter().map(|i| i.path.as_str()).collect();
        assert!(paths.contains(&"name"));
        assert!(paths.contains(&"age"));
        assert!(paths.contains(&"active"));
    }

    #[test]
    fn test_array_issue_path_uses_index() {
        let schema = Schema::array(Schema::string());
        let issues = schema.safe_parse(&json!(["ok", 2, "fine"])).unwrap_err();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "1");
    }

    #[test]
    fn test_optional_accepts_null_and_absent_field() {
        let schema = Schema::object([("nickname", Schema::optional(Schema::string()))]);
        assert!(schema.safe_parse(&json!({})).is_ok());
        assert!(schema.safe_parse(&json!({"nickname": null})).is_ok());
        assert!(schema.safe_parse(&json!({"nickname": "Al"})).is_ok());
        assert!(schema.safe_parse(&json!({"nickname": 7})).is_err());
    }

    #[test]
    fn test_schema_round_trips_through_json() {
        let schema = Schema::object([
            ("query", Schema::string().describe("Search query")),
            ("hits", Schema::array(Schema::number())),
            ("cursor", Schema::optional(Schema::string())),
        ]);
        let doc = serde_json::to_value(&schema).unwrap();
        assert_eq!(doc["type"], "object");
        assert_eq!(doc["fields"]["query"]["type"], "string");
        assert_eq!(doc["fields"]["query"]["description"], "Search query");
        let back: Schema = serde_json::from_value(doc).unwrap();
        assert_eq!(back, schema);
    }

    #[test]
    fn test_contract_is_transparent_json_object() {
        let contract = DataContract::new()
            .with_key("question", Schema::string())
            .with_key("attempts", Schema::number());
        let doc = serde_json::to_value(&contract).unwrap();
        assert_eq!(doc["question"]["type"], "string");
        let back: DataContract = serde_json::from_value(doc).unwrap();
        assert_eq!(back, contract);
    }
}
