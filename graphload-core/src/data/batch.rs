//! Wire batches and assembled batches
//!
//! `RawBatch` is what a transport yields for one partition: loosely typed
//! JSON columns. `Batch` is what the consumer sees after assembly, typed per
//! attribute kind and keyed by element type in heterogeneous mode.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Identifier column of vertex tables
pub const VERTEX_ID: &str = "vid";
/// Source identifier column of edge tables
pub const EDGE_SOURCE: &str = "source";
/// Target identifier column of edge tables
pub const EDGE_TARGET: &str = "target";
/// Seed marker column of sampled subgraphs
pub const IS_SEED: &str = "is_seed";

/// One wire table: column name to column values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawTable {
    pub columns: BTreeMap<String, Vec<Value>>,
}

impl RawTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Row count, taken from the identifier column when present
    pub fn num_rows(&self) -> usize {
        [VERTEX_ID, EDGE_SOURCE]
            .iter()
            .find_map(|id| self.columns.get(*id))
            .or_else(|| self.columns.values().next())
            .map_or(0, Vec::len)
    }

    pub fn push_column(&mut self, name: impl Into<String>, values: Vec<Value>) {
        self.columns.insert(name.into(), values);
    }
}

/// A flat table or one table per element type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawSection {
    Flat(RawTable),
    Typed(BTreeMap<String, RawTable>),
}

/// Wire payload of one partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBatch {
    pub partition: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertices: Option<RawSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edges: Option<RawSection>,
}

/// A typed column
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Int(Vec<i64>),
    Float(Vec<f64>),
    Bool(Vec<bool>),
    Str(Vec<String>),
    /// Row-major fixed-length vectors: `values.len() == rows * dim`
    Vector { dim: usize, values: Vec<f64> },
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Int(v) => v.len(),
            Column::Float(v) => v.len(),
            Column::Bool(v) => v.len(),
            Column::Str(v) => v.len(),
            Column::Vector { dim, values } => {
                if *dim == 0 {
                    0
                } else {
                    values.len() / dim
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_str(&self) -> Option<&[String]> {
        match self {
            Column::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<&[bool]> {
        match self {
            Column::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<&[i64]> {
        match self {
            Column::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<&[f64]> {
        match self {
            Column::Float(v) => Some(v),
            _ => None,
        }
    }

    /// Vector row `row`, if this is a vector column
    pub fn vector_row(&self, row: usize) -> Option<&[f64]> {
        match self {
            Column::Vector { dim, values } if row * dim < values.len() => {
                Some(&values[row * dim..(row + 1) * dim])
            }
            _ => None,
        }
    }

    /// Append `count` neutral values (zero, false, empty string)
    pub(crate) fn pad(&mut self, count: usize) {
        match self {
            Column::Int(v) => v.extend(std::iter::repeat(0).take(count)),
            Column::Float(v) => v.extend(std::iter::repeat(0.0).take(count)),
            Column::Bool(v) => v.extend(std::iter::repeat(false).take(count)),
            Column::Str(v) => v.extend(std::iter::repeat(String::new()).take(count)),
            Column::Vector { dim, values } => {
                values.extend(std::iter::repeat(0.0).take(count * *dim))
            }
        }
    }
}

/// A typed table with uniform row count
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: BTreeMap<String, Column>,
    pub num_rows: usize,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.keys().map(String::as_str).collect()
    }

    /// String identifiers in `column`, empty when absent
    pub fn ids(&self, column: &str) -> &[String] {
        self.columns
            .get(column)
            .and_then(Column::as_str)
            .unwrap_or(&[])
    }
}

/// Tables of one element kind
#[derive(Debug, Clone, PartialEq)]
pub enum Frames {
    /// Homogeneous mode: one flattened table
    Single(Table),
    /// Heterogeneous mode: one table per element type
    ByType(BTreeMap<String, Table>),
}

impl Frames {
    pub fn num_rows(&self) -> usize {
        match self {
            Frames::Single(table) => table.num_rows,
            Frames::ByType(tables) => tables.values().map(|t| t.num_rows).sum(),
        }
    }

    /// The flattened table in homogeneous mode
    pub fn single(&self) -> Option<&Table> {
        match self {
            Frames::Single(table) => Some(table),
            Frames::ByType(_) => None,
        }
    }

    /// The table of one type in heterogeneous mode
    pub fn by_type(&self, type_name: &str) -> Option<&Table> {
        match self {
            Frames::Single(_) => None,
            Frames::ByType(tables) => tables.get(type_name),
        }
    }

    /// Iterate `(type name, table)`; the single table reports an empty name
    pub fn tables(&self) -> Box<dyn Iterator<Item = (&str, &Table)> + '_> {
        match self {
            Frames::Single(table) => Box::new(std::iter::once(("", table))),
            Frames::ByType(tables) => Box::new(tables.iter().map(|(k, v)| (k.as_str(), v))),
        }
    }
}

/// Graph structure over batch-local vertex indices
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    pub num_nodes: usize,
    /// Edge sources, parallel to `targets`
    pub sources: Vec<usize>,
    pub targets: Vec<usize>,
    /// Row offsets (`num_nodes + 1` entries) when laid out as CSR; edges are
    /// then sorted by source
    pub row_offsets: Option<Vec<usize>>,
}

/// The unit handed to the consumer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    /// Partition this batch was produced from
    pub partition: Option<u32>,
    pub vertices: Option<Frames>,
    pub edges: Option<Frames>,
    pub topology: Option<Topology>,
}

impl Batch {
    /// Vertex row count
    pub fn num_vertices(&self) -> usize {
        self.vertices.as_ref().map_or(0, Frames::num_rows)
    }

    /// Edge row count
    pub fn num_edges(&self) -> usize {
        self.edges.as_ref().map_or(0, Frames::num_rows)
    }

    /// All vertex identifiers across types
    pub fn vertex_ids(&self) -> Vec<&str> {
        self.vertices
            .iter()
            .flat_map(Frames::tables)
            .flat_map(|(_, t)| t.ids(VERTEX_ID).iter().map(String::as_str))
            .collect()
    }

    /// `(source, target)` pairs across edge types
    pub fn edge_ids(&self) -> Vec<(&str, &str)> {
        self.edges
            .iter()
            .flat_map(Frames::tables)
            .flat_map(|(_, t)| {
                t.ids(EDGE_SOURCE)
                    .iter()
                    .zip(t.ids(EDGE_TARGET))
                    .map(|(s, d)| (s.as_str(), d.as_str()))
            })
            .collect()
    }

    /// Keep only the vertex and edge tables of the given types
    pub fn select_types(mut self, types: &[&str]) -> Self {
        for frames in [&mut self.vertices, &mut self.edges].into_iter().flatten() {
            if let Frames::ByType(tables) = frames {
                tables.retain(|name, _| types.contains(&name.as_str()));
            }
        }
        self
    }
}
