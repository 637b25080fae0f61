use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::error;

/// Discriminant of a configuration error, serialized as `SCREAMING_SNAKE_CASE`
/// in failure responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CfgErrorKind {
    Exception,
    MissingFile,
    BadFileContent,
    MissingNodes,
    BadReference,
    ExpectedList,
    DuplicateUniqueKey,
    EmptyList,
    BadValue,
    CircularRef,
    MissingValue,
    ReferencedNode,
}

impl CfgErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exception => "EXCEPTION",
            Self::MissingFile => "MISSING_FILE",
            Self::BadFileContent => "BAD_FILE_CONTENT",
            Self::MissingNodes => "MISSING_NODES",
            Self::BadReference => "BAD_REFERENCE",
            Self::ExpectedList => "EXPECTED_LIST",
            Self::DuplicateUniqueKey => "DUPLICATE_UNIQUE_KEY",
            Self::EmptyList => "EMPTY_LIST",
            Self::BadValue => "BAD_VALUE",
            Self::CircularRef => "CIRCULAR_REF",
            Self::MissingValue => "MISSING_VALUE",
            Self::ReferencedNode => "REFERENCED_NODE",
        }
    }
}

/// A configuration error: what went wrong, where in the document, and the
/// kind-specific parameters needed to explain it to a remote client.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{description}")]
pub struct CfgError {
    pub kind: CfgErrorKind,
    pub node_path: String,
    pub node_key: Option<String>,
    pub params: Map<String, Value>,
    description: String,
}

pub type CfgResult<T> = Result<T, CfgError>;

impl CfgError {
    fn new(
        kind: CfgErrorKind,
        node_path: impl Into<String>,
        node_key: Option<&str>,
        params: Value,
    ) -> Self {
        let node_path = node_path.into();
        let node_key = node_key.map(str::to_string);
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let description = describe(kind, &node_path, node_key.as_deref(), &params);
        error!(kind = kind.as_str(), path = %node_path, "{description}");
        Self {
            kind,
            node_path,
            node_key,
            params,
            description,
        }
    }

    pub fn exception(node_path: impl Into<String>, exception: impl ToString) -> Self {
        Self::new(
            CfgErrorKind::Exception,
            node_path,
            None,
            json!({ "exception": exception.to_string() }),
        )
    }

    pub fn missing_file(filename: impl ToString) -> Self {
        Self::new(
            CfgErrorKind::MissingFile,
            "",
            None,
            json!({ "filename": filename.to_string() }),
        )
    }

    pub fn bad_file_content(error: impl ToString) -> Self {
        Self::new(
            CfgErrorKind::BadFileContent,
            "",
            None,
            json!({ "error": error.to_string() }),
        )
    }

    pub fn missing_nodes(
        node_path: impl Into<String>,
        node_key: Option<&str>,
        missing: &[&str],
    ) -> Self {
        Self::new(
            CfgErrorKind::MissingNodes,
            node_path,
            node_key,
            json!({ "missing_children": missing }),
        )
    }

    pub fn bad_reference(node_path: impl Into<String>, reference: &str) -> Self {
        Self::bad_reference_at(node_path, None, reference)
    }

    pub fn bad_reference_at(
        node_path: impl Into<String>,
        node_key: Option<&str>,
        reference: &str,
    ) -> Self {
        Self::new(
            CfgErrorKind::BadReference,
            node_path,
            node_key,
            json!({ "reference": reference }),
        )
    }

    pub fn expected_list(node_path: impl Into<String>) -> Self {
        Self::new(CfgErrorKind::ExpectedList, node_path, None, json!({}))
    }

    pub fn duplicate_key(node_path: impl Into<String>, node_key: Option<&str>, key: &str) -> Self {
        Self::new(
            CfgErrorKind::DuplicateUniqueKey,
            node_path,
            node_key,
            json!({ "key": key }),
        )
    }

    pub fn empty_list(node_path: impl Into<String>, node_key: Option<&str>, child: &str) -> Self {
        Self::new(
            CfgErrorKind::EmptyList,
            node_path,
            node_key,
            json!({ "child_node": child }),
        )
    }

    pub fn bad_value(node_path: impl Into<String>, node_key: Option<&str>, value: Value) -> Self {
        Self::new(
            CfgErrorKind::BadValue,
            node_path,
            node_key,
            json!({ "value": value }),
        )
    }

    pub fn circular_ref(node_path: impl Into<String>, aliases: &[String]) -> Self {
        Self::new(
            CfgErrorKind::CircularRef,
            node_path,
            None,
            json!({ "aliases": aliases }),
        )
    }

    pub fn missing_value(node_path: impl Into<String>, value: &str) -> Self {
        Self::new(
            CfgErrorKind::MissingValue,
            node_path,
            None,
            json!({ "value": value }),
        )
    }

    pub fn referenced_node(node_path: impl Into<String>, node_key: Option<&str>) -> Self {
        Self::new(CfgErrorKind::ReferencedNode, node_path, node_key, json!({}))
    }

    /// Last segment of the node path.
    pub fn node(&self) -> &str {
        self.node_path.rsplit('/').next().unwrap_or_default()
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// Dictionary form echoed back to remote clients in failure responses.
    pub fn to_value(&self) -> Value {
        let mut map = self.params.clone();
        map.insert("id".into(), Value::from(self.kind.as_str()));
        map.insert("node".into(), Value::from(self.node()));
        map.insert("node_path".into(), Value::from(self.node_path.clone()));
        map.insert("generic_desc".into(), Value::from(self.description.clone()));
        if let Some(key) = &self.node_key {
            map.insert("node_key".into(), Value::from(key.clone()));
        }
        Value::Object(map)
    }
}

fn describe(
    kind: CfgErrorKind,
    node_path: &str,
    node_key: Option<&str>,
    params: &Map<String, Value>,
) -> String {
    let nodes = match node_key {
        Some(key) => format!("{node_path}['{key}']"),
        None => node_path.to_string(),
    };
    let param = |name: &str| match params.get(name) {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };

    match kind {
        CfgErrorKind::Exception => format!("An exception has occurred : {}", param("exception")),
        CfgErrorKind::MissingFile => {
            format!("Configuration file is missing : {}", param("filename"))
        }
        CfgErrorKind::BadFileContent => {
            format!("Configuration file content is invalid : {}", param("error"))
        }
        CfgErrorKind::MissingNodes => format!(
            "Missing mandatory node(s) in <{nodes}> : {}",
            param("missing_children")
        ),
        CfgErrorKind::BadReference => format!(
            "Reference to a node in <{nodes}> that does not exist : {}",
            param("reference")
        ),
        CfgErrorKind::ExpectedList => format!("A list was expected for node <{nodes}>"),
        CfgErrorKind::DuplicateUniqueKey => format!(
            "The unique key '{}' in node '{nodes}' was already declared",
            param("key")
        ),
        CfgErrorKind::EmptyList => format!(
            "The child node '{}' in '{nodes}' must contain a non empty list",
            param("child_node")
        ),
        CfgErrorKind::BadValue => {
            format!("Invalid value for node <{nodes}> : {}", param("value"))
        }
        CfgErrorKind::CircularRef => format!(
            "Circular dependency detected between items {} in <{nodes}>",
            param("aliases")
        ),
        CfgErrorKind::MissingValue => format!(
            "A value was expected in list for node <{nodes}> : {}",
            param("value")
        ),
        CfgErrorKind::ReferencedNode => {
            format!("The node <{nodes}> is still referenced and can not be removed")
        }
    }
}
