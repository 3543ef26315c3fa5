//! Procedure signatures and structured results
//!
//! A [`SigSpec`] declares the named, typed inputs and outputs of a procedure.
//! Native V2 procedures publish one through `GetSignature`; interpreted
//! procedures may publish one when their module is loaded. Both travel as
//! JSON:
//!
//! ```text
//! {"proc_name":"shortest_path",
//!  "input_list":[{"name":"src","index":0,"type":"NODE"}],
//!  "result_list":[{"name":"length","index":0,"type":"INTEGER"}]}
//! ```

use crate::error::{ProcedureError, ProcedureResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Type of a declared parameter or result column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    /// Null
    Nul,
    /// 64-bit integer
    Integer,
    /// 32-bit float
    Float,
    /// 64-bit float
    Double,
    /// Boolean
    Boolean,
    /// UTF-8 string
    String,
    /// Graph vertex
    Node,
    /// Graph edge
    Relationship,
    /// Graph path
    Path,
    /// List of values
    List,
    /// String-keyed map
    Map,
    /// Any value
    Any,
}

impl FieldType {
    /// Whether this is a scalar field type
    pub fn is_field(self) -> bool {
        matches!(
            self,
            FieldType::Integer
                | FieldType::Float
                | FieldType::Double
                | FieldType::Boolean
                | FieldType::String
        )
    }

    /// Whether this is a graph element type
    pub fn is_graph_element(self) -> bool {
        matches!(self, FieldType::Node | FieldType::Relationship | FieldType::Path)
    }
}

/// One declared input parameter or output column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter name
    pub name: String,
    /// Position within its list
    pub index: usize,
    /// Declared type
    #[serde(rename = "type")]
    pub ty: FieldType,
}

impl Parameter {
    /// Create a parameter
    pub fn new(name: impl Into<String>, index: usize, ty: FieldType) -> Self {
        Parameter {
            name: name.into(),
            index,
            ty,
        }
    }
}

/// Declared signature of a procedure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigSpec {
    /// Procedure name as declared by the procedure itself
    #[serde(default)]
    pub proc_name: String,
    /// Input parameters, in call order
    #[serde(default)]
    pub input_list: Vec<Parameter>,
    /// Result columns, in output order
    #[serde(default)]
    pub result_list: Vec<Parameter>,
}

impl SigSpec {
    /// Parse and validate a signature from its JSON form
    pub fn from_json(bytes: &[u8]) -> ProcedureResult<Self> {
        let spec: SigSpec = serde_json::from_slice(bytes).map_err(|e| {
            ProcedureError::load(format!("Failed to parse procedure signature: {}", e))
        })?;
        spec.validate()?;
        Ok(spec)
    }

    /// JSON form of the signature
    pub fn to_json(&self) -> String {
        // Serializing plain structs of strings and integers cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Check parameter indexes and names
    ///
    /// Every parameter's index must equal its position and names must be
    /// non-empty and unique within their list.
    pub fn validate(&self) -> ProcedureResult<()> {
        Self::validate_list("input", &self.input_list)?;
        Self::validate_list("result", &self.result_list)
    }

    fn validate_list(which: &str, list: &[Parameter]) -> ProcedureResult<()> {
        let mut seen = HashSet::new();
        for (position, p) in list.iter().enumerate() {
            if p.index != position {
                return Err(ProcedureError::load(format!(
                    "Invalid signature: {} parameter [{}] has index {} at position {}",
                    which, p.name, p.index, position
                )));
            }
            if p.name.is_empty() {
                return Err(ProcedureError::load(format!(
                    "Invalid signature: {} parameter at position {} has no name",
                    which, position
                )));
            }
            if !seen.insert(p.name.as_str()) {
                return Err(ProcedureError::load(format!(
                    "Invalid signature: duplicate {} parameter [{}]",
                    which, p.name
                )));
            }
        }
        Ok(())
    }
}

/// Structured output of a transaction-scoped (V2) procedure
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StructuredResult {
    /// Output columns
    pub header: Vec<Parameter>,
    /// Rows; each row has one value per header column
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl StructuredResult {
    /// Parse a result from its JSON form, checking row widths
    pub fn from_json(bytes: &[u8]) -> ProcedureResult<Self> {
        let result: StructuredResult = serde_json::from_slice(bytes).map_err(|e| {
            ProcedureError::internal(format!("Failed to parse procedure result: {}", e))
        })?;
        let width = result.header.len();
        if let Some(i) = result.rows.iter().position(|r| r.len() != width) {
            return Err(ProcedureError::internal(format!(
                "Procedure result row {} has {} values, header declares {}",
                i,
                result.rows[i].len(),
                width
            )));
        }
        Ok(result)
    }

    /// JSON form of the result
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SigSpec {
        SigSpec {
            proc_name: "shortest_path".into(),
            input_list: vec![
                Parameter::new("src", 0, FieldType::Node),
                Parameter::new("dst", 1, FieldType::Node),
            ],
            result_list: vec![Parameter::new("length", 0, FieldType::Integer)],
        }
    }

    #[test]
    fn test_json_type_names() {
        let json = sample().to_json();
        assert!(json.contains("\"type\":\"NODE\""));
        assert!(json.contains("\"type\":\"INTEGER\""));
        assert_eq!(SigSpec::from_json(json.as_bytes()).unwrap(), sample());
    }

    #[test]
    fn test_relationship_spelling() {
        let json = br#"{"proc_name":"p","input_list":[{"name":"e","index":0,"type":"RELATIONSHIP"}],"result_list":[]}"#;
        let spec = SigSpec::from_json(json).unwrap();
        assert_eq!(spec.input_list[0].ty, FieldType::Relationship);
    }

    #[test]
    fn test_missing_lists_default_to_empty() {
        let spec = SigSpec::from_json(br#"{"proc_name":"p"}"#).unwrap();
        assert!(spec.input_list.is_empty());
        assert!(spec.result_list.is_empty());
    }

    #[test]
    fn test_bad_index_rejected() {
        let mut spec = sample();
        spec.input_list[1].index = 5;
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("index 5"));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut spec = sample();
        spec.input_list[1].name = "src".into();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_garbage_is_load_error() {
        let err = SigSpec::from_json(b"not json").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Load);
    }

    #[test]
    fn test_type_classes() {
        assert!(FieldType::Integer.is_field());
        assert!(!FieldType::Node.is_field());
        assert!(FieldType::Path.is_graph_element());
        assert!(!FieldType::Map.is_graph_element());
    }

    #[test]
    fn test_structured_result_row_width() {
        let ok = br#"{"header":[{"name":"n","index":0,"type":"INTEGER"}],"rows":[[1],[2]]}"#;
        let result = StructuredResult::from_json(ok).unwrap();
        assert_eq!(result.rows.len(), 2);

        let bad = br#"{"header":[{"name":"n","index":0,"type":"INTEGER"}],"rows":[[1,2]]}"#;
        assert!(StructuredResult::from_json(bad).is_err());
    }
}
