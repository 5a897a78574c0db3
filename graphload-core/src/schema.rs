//! Graph schema as seen through introspection
//!
//! The loader only needs element type names, their attributes and each
//! attribute's data kind, which decides how wire values are decoded.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ConfigError;

/// Vertices or edges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Vertex,
    Edge,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Vertex => "vertex",
            ElementKind::Edge => "edge",
        }
    }
}

/// How an attribute's wire values are decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrKind {
    /// Signed or unsigned integer scalar
    Int,
    /// Floating point scalar
    Float,
    /// true/false
    Bool,
    /// Free-form or categorical string
    Categorical,
    /// Fixed-length numeric sequence, usually space-separated on the wire
    Vector,
}

impl AttrKind {
    /// Map a database type name (`INT`, `LIST<DOUBLE>`, ...) to a decode kind
    pub fn from_type_name(name: &str, value_type: Option<&str>) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "INT" | "UINT" | "INT64" | "UINT64" => AttrKind::Int,
            "FLOAT" | "DOUBLE" => AttrKind::Float,
            "BOOL" | "BOOLEAN" => AttrKind::Bool,
            "LIST" | "SET" => match value_type.map(|v| v.to_ascii_uppercase()) {
                Some(v) if matches!(v.as_str(), "INT" | "UINT" | "FLOAT" | "DOUBLE") => {
                    AttrKind::Vector
                }
                _ => AttrKind::Categorical,
            },
            _ => AttrKind::Categorical,
        }
    }
}

/// One attribute of an element type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub kind: AttrKind,
}

/// A vertex type and its attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VertexType {
    pub name: String,
    pub attributes: Vec<Attribute>,
}

/// An edge type, its endpoint types and its attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeType {
    pub name: String,
    pub from_type: String,
    pub to_type: String,
    pub directed: bool,
    pub attributes: Vec<Attribute>,
}

/// Introspected graph schema
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSchema {
    pub graph: String,
    pub vertex_types: BTreeMap<String, VertexType>,
    pub edge_types: BTreeMap<String, EdgeType>,
}

impl GraphSchema {
    pub fn new(graph: impl Into<String>) -> Self {
        Self {
            graph: graph.into(),
            ..Default::default()
        }
    }

    /// Add a vertex type
    pub fn with_vertex(mut self, name: &str, attributes: &[(&str, AttrKind)]) -> Self {
        self.vertex_types.insert(
            name.to_string(),
            VertexType {
                name: name.to_string(),
                attributes: to_attributes(attributes),
            },
        );
        self
    }

    /// Add a directed edge type
    pub fn with_edge(
        mut self,
        name: &str,
        from_type: &str,
        to_type: &str,
        attributes: &[(&str, AttrKind)],
    ) -> Self {
        self.edge_types.insert(
            name.to_string(),
            EdgeType {
                name: name.to_string(),
                from_type: from_type.to_string(),
                to_type: to_type.to_string(),
                directed: true,
                attributes: to_attributes(attributes),
            },
        );
        self
    }

    /// All type names of one element kind, sorted
    pub fn type_names(&self, kind: ElementKind) -> Vec<String> {
        match kind {
            ElementKind::Vertex => self.vertex_types.keys().cloned().collect(),
            ElementKind::Edge => self.edge_types.keys().cloned().collect(),
        }
    }

    /// Attributes of a type, or `UnknownElementType`
    pub fn attributes(&self, kind: ElementKind, type_name: &str) -> Result<&[Attribute], ConfigError> {
        let attributes = match kind {
            ElementKind::Vertex => self.vertex_types.get(type_name).map(|t| &t.attributes),
            ElementKind::Edge => self.edge_types.get(type_name).map(|t| &t.attributes),
        };
        attributes
            .map(Vec::as_slice)
            .ok_or_else(|| ConfigError::UnknownElementType {
                name: type_name.to_string(),
            })
    }

    /// Kind of one attribute on one type
    pub fn attribute_kind(
        &self,
        kind: ElementKind,
        type_name: &str,
        attribute: &str,
    ) -> Result<AttrKind, ConfigError> {
        self.attributes(kind, type_name)?
            .iter()
            .find(|a| a.name == attribute)
            .map(|a| a.kind)
            .ok_or_else(|| ConfigError::UnknownAttribute {
                element_type: type_name.to_string(),
                attribute: attribute.to_string(),
            })
    }

    /// Edge type lookup
    pub fn edge_type(&self, name: &str) -> Option<&EdgeType> {
        self.edge_types.get(name)
    }
}

fn to_attributes(attributes: &[(&str, AttrKind)]) -> Vec<Attribute> {
    attributes
        .iter()
        .map(|(name, kind)| Attribute {
            name: name.to_string(),
            kind: *kind,
        })
        .collect()
}
