//! Batch assembly
//!
//! Turns a wire batch into typed tables. Every selected attribute is decoded
//! according to its schema kind; vector attributes must keep one length
//! across all rows of a batch.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::batch::{
    Batch, Column, Frames, RawBatch, RawSection, RawTable, Table, Topology, EDGE_SOURCE,
    EDGE_TARGET, IS_SEED, VERTEX_ID,
};
use super::config::{AttributeSelection, LoaderConfig, LoaderKind, OutputFormat};
use crate::error::DataError;
use crate::schema::{AttrKind, ElementKind, GraphSchema};

/// Edge type name used for synthesized self loops in heterogeneous batches
pub const SELF_LOOP_TYPE: &str = "self_loop";

/// Assembles wire batches for one loader configuration
#[derive(Debug, Clone)]
pub struct Assembler {
    schema: Arc<GraphSchema>,
    kind: LoaderKind,
    vertex_selection: AttributeSelection,
    edge_selection: AttributeSelection,
    add_self_loop: bool,
    output_format: OutputFormat,
}

impl Assembler {
    pub fn new(schema: Arc<GraphSchema>, config: &LoaderConfig) -> Self {
        Self {
            schema,
            kind: config.kind,
            vertex_selection: config.vertex_attributes.clone(),
            edge_selection: config.edge_attributes.clone(),
            add_self_loop: config.add_self_loop,
            output_format: config.output_format,
        }
    }

    /// Assemble one partition
    pub fn assemble(&self, raw: RawBatch) -> Result<Batch, DataError> {
        let mut batch = Batch {
            partition: Some(raw.partition),
            ..Default::default()
        };

        if self.kind.includes(ElementKind::Vertex) {
            if let Some(section) = raw.vertices {
                batch.vertices = Some(self.assemble_section(ElementKind::Vertex, section)?);
            }
        }
        if self.kind.includes(ElementKind::Edge) {
            if let Some(section) = raw.edges {
                batch.edges = Some(self.assemble_section(ElementKind::Edge, section)?);
            }
        }

        if self.kind.is_subgraph() {
            if self.add_self_loop {
                add_self_loops(&mut batch);
            }
            batch.topology = match self.output_format {
                OutputFormat::Table => None,
                OutputFormat::EdgeIndex => Some(self.topology(&batch, false)?),
                OutputFormat::Csr => Some(self.topology(&batch, true)?),
            };
        }

        Ok(batch)
    }

    fn selection(&self, element: ElementKind) -> &AttributeSelection {
        match element {
            ElementKind::Vertex => &self.vertex_selection,
            ElementKind::Edge => &self.edge_selection,
        }
    }

    fn assemble_section(&self, element: ElementKind, section: RawSection) -> Result<Frames, DataError> {
        let selection = self.selection(element);
        match section {
            RawSection::Flat(table) => {
                let attrs = match selection {
                    AttributeSelection::Uniform(attrs) => attrs.clone(),
                    AttributeSelection::ByType(map) => {
                        let mut all: Vec<String> = map.values().flatten().cloned().collect();
                        all.sort();
                        all.dedup();
                        all
                    }
                };
                let types = selection.types(&self.schema, element);
                Ok(Frames::Single(self.decode_table(element, &types, table, &attrs)?))
            }
            RawSection::Typed(tables) => {
                let mut frames = BTreeMap::new();
                for (type_name, table) in tables {
                    // Types left out of a per-type mapping are not delivered
                    let Some(attrs) = selection.attributes_for(&type_name) else {
                        continue;
                    };
                    let decoded =
                        self.decode_table(element, std::slice::from_ref(&type_name), table, attrs)?;
                    frames.insert(type_name, decoded);
                }
                Ok(Frames::ByType(frames))
            }
        }
    }

    /// Decode one wire table. `types` are the element types whose schema
    /// describes the table's attributes.
    fn decode_table(
        &self,
        element: ElementKind,
        types: &[String],
        mut raw: RawTable,
        attributes: &[String],
    ) -> Result<Table, DataError> {
        let element_type = types.join("|");
        let id_columns: &[&'static str] = match element {
            ElementKind::Vertex => &[VERTEX_ID],
            ElementKind::Edge => &[EDGE_SOURCE, EDGE_TARGET],
        };

        let mut table = Table::default();
        let mut num_rows = None;

        for &id in id_columns {
            let values = raw.columns.remove(id).ok_or_else(|| DataError::MissingIdentifier {
                element_type: element_type.clone(),
                column: id,
            })?;
            check_rows(id, &values, &mut num_rows)?;
            table.columns.insert(id.to_string(), Column::Str(decode_ids(values)));
        }

        if element == ElementKind::Vertex && matches!(self.kind, LoaderKind::Neighbor { .. }) {
            if let Some(values) = raw.columns.remove(IS_SEED) {
                check_rows(IS_SEED, &values, &mut num_rows)?;
                table
                    .columns
                    .insert(IS_SEED.to_string(), decode_column(IS_SEED, AttrKind::Bool, values)?);
            }
        }

        for attribute in attributes {
            let kind = types
                .iter()
                .find_map(|t| self.schema.attribute_kind(element, t, attribute).ok())
                .ok_or_else(|| DataError::UnknownAttribute {
                    element_type: element_type.clone(),
                    attribute: attribute.clone(),
                })?;
            let values = raw.columns.remove(attribute).ok_or_else(|| DataError::UnknownAttribute {
                element_type: element_type.clone(),
                attribute: attribute.clone(),
            })?;
            check_rows(attribute, &values, &mut num_rows)?;
            table
                .columns
                .insert(attribute.clone(), decode_column(attribute, kind, values)?);
        }

        table.num_rows = num_rows.unwrap_or(0);
        Ok(table)
    }

    fn topology(&self, batch: &Batch, csr: bool) -> Result<Topology, DataError> {
        let mut by_type: HashMap<(&str, &str), usize> = HashMap::new();
        let mut by_id: HashMap<&str, usize> = HashMap::new();
        let mut num_nodes = 0;

        if let Some(vertices) = &batch.vertices {
            for (type_name, table) in vertices.tables() {
                for vid in table.ids(VERTEX_ID) {
                    by_type.insert((type_name, vid.as_str()), num_nodes);
                    by_id.entry(vid.as_str()).or_insert(num_nodes);
                    num_nodes += 1;
                }
            }
        }

        let lookup = |type_name: Option<&str>, vid: &str| -> Result<usize, DataError> {
            type_name
                .and_then(|t| by_type.get(&(t, vid)))
                .or_else(|| by_id.get(vid))
                .copied()
                .ok_or_else(|| DataError::UnknownEndpoint {
                    vertex: vid.to_string(),
                })
        };

        let mut edges: Vec<(usize, usize)> = Vec::new();
        if let Some(frames) = &batch.edges {
            let typed = matches!(batch.vertices, Some(Frames::ByType(_)));
            for (edge_type, table) in frames.tables() {
                let endpoint_types = match looped_vertex_type(edge_type) {
                    Some(vertex_type) => Some((vertex_type, vertex_type)),
                    None => self
                        .schema
                        .edge_type(edge_type)
                        .map(|e| (e.from_type.as_str(), e.to_type.as_str())),
                }
                .filter(|_| typed);
                for (source, target) in table.ids(EDGE_SOURCE).iter().zip(table.ids(EDGE_TARGET)) {
                    let s = lookup(endpoint_types.map(|t| t.0), source)?;
                    let d = lookup(endpoint_types.map(|t| t.1), target)?;
                    edges.push((s, d));
                }
            }
        }

        let row_offsets = if csr {
            edges.sort_by_key(|&(s, _)| s);
            let mut offsets = vec![0usize; num_nodes + 1];
            for &(s, _) in &edges {
                offsets[s + 1] += 1;
            }
            for i in 0..num_nodes {
                offsets[i + 1] += offsets[i];
            }
            Some(offsets)
        } else {
            None
        };

        let (sources, targets) = edges.into_iter().unzip();
        Ok(Topology {
            num_nodes,
            sources,
            targets,
            row_offsets,
        })
    }
}

fn check_rows(column: &str, values: &[Value], num_rows: &mut Option<usize>) -> Result<(), DataError> {
    match *num_rows {
        None => {
            *num_rows = Some(values.len());
            Ok(())
        }
        Some(expected) if expected == values.len() => Ok(()),
        Some(expected) => Err(DataError::RaggedTable {
            column: column.to_string(),
            expected,
            found: values.len(),
        }),
    }
}

fn decode_ids(values: Vec<Value>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| match v {
            Value::String(s) => s,
            other => other.to_string(),
        })
        .collect()
}

fn invalid(attribute: &str, row: usize, value: &Value) -> DataError {
    DataError::InvalidValue {
        attribute: attribute.to_string(),
        row,
        value: value.to_string(),
    }
}

/// Decode one column of wire values by attribute kind
pub fn decode_column(attribute: &str, kind: AttrKind, values: Vec<Value>) -> Result<Column, DataError> {
    match kind {
        AttrKind::Int => values
            .iter()
            .enumerate()
            .map(|(row, v)| match v {
                Value::Number(n) => n
                    .as_i64()
                    .ok_or_else(|| invalid(attribute, row, v)),
                Value::String(s) => s.trim().parse().map_err(|_| invalid(attribute, row, v)),
                _ => Err(invalid(attribute, row, v)),
            })
            .collect::<Result<_, _>>()
            .map(Column::Int),
        AttrKind::Float => values
            .iter()
            .enumerate()
            .map(|(row, v)| match v {
                Value::Number(n) => n.as_f64().ok_or_else(|| invalid(attribute, row, v)),
                Value::String(s) => s.trim().parse().map_err(|_| invalid(attribute, row, v)),
                _ => Err(invalid(attribute, row, v)),
            })
            .collect::<Result<_, _>>()
            .map(Column::Float),
        AttrKind::Bool => values
            .iter()
            .enumerate()
            .map(|(row, v)| match v {
                Value::Bool(b) => Ok(*b),
                Value::Number(n) => Ok(n.as_f64().map_or(false, |f| f != 0.0)),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" => Ok(true),
                    "false" | "0" => Ok(false),
                    _ => Err(invalid(attribute, row, v)),
                },
                _ => Err(invalid(attribute, row, v)),
            })
            .collect::<Result<_, _>>()
            .map(Column::Bool),
        AttrKind::Categorical => Ok(Column::Str(
            values
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => s,
                    Value::Null => String::new(),
                    other => other.to_string(),
                })
                .collect(),
        )),
        AttrKind::Vector => decode_vectors(attribute, &values),
    }
}

fn decode_vectors(attribute: &str, values: &[Value]) -> Result<Column, DataError> {
    let mut dim = None;
    let mut flat = Vec::new();

    for (row, value) in values.iter().enumerate() {
        let start = flat.len();
        match value {
            Value::String(s) => {
                for token in s
                    .trim_matches(|c| c == '[' || c == ']')
                    .split(|c: char| c.is_whitespace() || c == ',')
                    .filter(|t| !t.is_empty())
                {
                    flat.push(token.parse::<f64>().map_err(|_| invalid(attribute, row, value))?);
                }
            }
            Value::Array(items) => {
                for item in items {
                    flat.push(item.as_f64().ok_or_else(|| invalid(attribute, row, value))?);
                }
            }
            _ => return Err(invalid(attribute, row, value)),
        }

        let found = flat.len() - start;
        match dim {
            None => dim = Some(found),
            Some(expected) if expected != found => {
                return Err(DataError::InconsistentVectorLength {
                    attribute: attribute.to_string(),
                    expected,
                    found,
                    row,
                })
            }
            Some(_) => {}
        }
    }

    Ok(Column::Vector {
        dim: dim.unwrap_or(0),
        values: flat,
    })
}

/// Edge type of the self loops over vertices of `vertex_type`
pub fn self_loop_type(vertex_type: &str) -> String {
    format!("{}:{}", SELF_LOOP_TYPE, vertex_type)
}

/// Vertex type looped over by a synthesized edge type
fn looped_vertex_type(edge_type: &str) -> Option<&str> {
    edge_type
        .strip_prefix(SELF_LOOP_TYPE)
        .and_then(|rest| rest.strip_prefix(':'))
}

fn loop_table(vids: &[String]) -> Table {
    let mut table = Table::default();
    table.columns.insert(EDGE_SOURCE.to_string(), Column::Str(vids.to_vec()));
    table.columns.insert(EDGE_TARGET.to_string(), Column::Str(vids.to_vec()));
    table.num_rows = vids.len();
    table
}

/// Append one `(v, v)` edge per vertex.
///
/// Typed vertices get one loop table per vertex type so that ids shared
/// between types stay distinct.
fn add_self_loops(batch: &mut Batch) {
    let Some(vertices) = &batch.vertices else {
        return;
    };

    match vertices {
        Frames::ByType(vertex_tables) => {
            let loops: Vec<(String, Table)> = vertex_tables
                .iter()
                .map(|(type_name, table)| (self_loop_type(type_name), loop_table(table.ids(VERTEX_ID))))
                .collect();
            match batch.edges.get_or_insert_with(|| Frames::ByType(BTreeMap::new())) {
                Frames::ByType(tables) => tables.extend(loops),
                Frames::Single(table) => {
                    for (_, loops) in loops {
                        append_loops(table, loops.ids(EDGE_SOURCE));
                    }
                }
            }
        }
        Frames::Single(vertex_table) => {
            let vids = vertex_table.ids(VERTEX_ID).to_vec();
            match batch.edges.as_mut() {
                Some(Frames::Single(table)) => append_loops(table, &vids),
                Some(Frames::ByType(tables)) => {
                    tables.insert(SELF_LOOP_TYPE.to_string(), loop_table(&vids));
                }
                None => {}
            }
            if batch.edges.is_none() {
                batch.edges = Some(Frames::Single(loop_table(&vids)));
            }
        }
    }
}

/// Extend a flat edge table with `(v, v)` rows, padding the other columns
fn append_loops(table: &mut Table, vids: &[String]) {
    for (name, column) in table.columns.iter_mut() {
        match (name.as_str(), column) {
            (EDGE_SOURCE | EDGE_TARGET, Column::Str(ids)) => ids.extend(vids.iter().cloned()),
            (_, column) => column.pad(vids.len()),
        }
    }
    table.num_rows += vids.len();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Arc<GraphSchema> {
        Arc::new(
            GraphSchema::new("g")
                .with_vertex(
                    "v0",
                    &[
                        ("x", AttrKind::Vector),
                        ("y", AttrKind::Int),
                        ("label", AttrKind::Categorical),
                        ("is_train", AttrKind::Bool),
                    ],
                )
                .with_vertex("v1", &[("x", AttrKind::Vector)])
                .with_edge("e0", "v0", "v1", &[("w", AttrKind::Float)]),
        )
    }

    fn raw(value: serde_json::Value) -> RawBatch {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_decodes_by_kind() {
        let config = LoaderConfig::builder()
            .vertex_attributes(["x", "y", "label", "is_train"])
            .build()
            .unwrap();
        let assembler = Assembler::new(schema(), &config);

        let batch = assembler
            .assemble(raw(json!({
                "partition": 0,
                "vertices": {"flat": {
                    "vid": ["a", 7],
                    "x": ["0.5 1 2", [3, 4, 5]],
                    "y": [1, "2"],
                    "label": ["cat", 3],
                    "is_train": [true, "0"]
                }}
            })))
            .unwrap();

        let table = batch.vertices.as_ref().unwrap().single().unwrap();
        assert_eq!(table.num_rows, 2);
        assert_eq!(table.ids(VERTEX_ID), &["a".to_string(), "7".to_string()]);
        assert_eq!(table.column("x").unwrap().vector_row(1), Some(&[3.0, 4.0, 5.0][..]));
        assert_eq!(table.column("y").unwrap().as_int(), Some(&[1, 2][..]));
        assert_eq!(table.column("is_train").unwrap().as_bool(), Some(&[true, false][..]));
        assert_eq!(table.column("label").unwrap().as_str().unwrap()[1], "3");
    }

    #[test]
    fn test_inconsistent_vector_length() {
        let config = LoaderConfig::builder().vertex_attributes(["x"]).build().unwrap();
        let assembler = Assembler::new(schema(), &config);

        let err = assembler
            .assemble(raw(json!({
                "partition": 0,
                "vertices": {"flat": {"vid": ["a", "b", "c"], "x": ["1 2", "3 4", "5"]}}
            })))
            .unwrap_err();
        assert_eq!(
            err,
            DataError::InconsistentVectorLength {
                attribute: "x".into(),
                expected: 2,
                found: 1,
                row: 2
            }
        );
    }

    #[test]
    fn test_missing_and_ragged_columns() {
        let config = LoaderConfig::builder().vertex_attributes(["y"]).build().unwrap();
        let assembler = Assembler::new(schema(), &config);

        let missing = assembler.assemble(raw(json!({
            "partition": 0,
            "vertices": {"flat": {"vid": ["a"]}}
        })));
        assert!(matches!(missing, Err(DataError::UnknownAttribute { .. })));

        let ragged = assembler.assemble(raw(json!({
            "partition": 0,
            "vertices": {"flat": {"vid": ["a", "b"], "y": [1]}}
        })));
        assert!(matches!(ragged, Err(DataError::RaggedTable { .. })));

        let no_id = assembler.assemble(raw(json!({
            "partition": 0,
            "vertices": {"flat": {"y": [1]}}
        })));
        assert!(matches!(no_id, Err(DataError::MissingIdentifier { .. })));
    }

    #[test]
    fn test_heterogeneous_selection() {
        let mut map = BTreeMap::new();
        map.insert("v0".to_string(), vec!["x".to_string(), "y".to_string()]);
        let config = LoaderConfig::builder()
            .vertex_selection(AttributeSelection::ByType(map))
            .build()
            .unwrap();
        let assembler = Assembler::new(schema(), &config);

        let batch = assembler
            .assemble(raw(json!({
                "partition": 1,
                "vertices": {"typed": {
                    "v0": {"vid": ["a"], "x": ["1 2"], "y": [3], "label": ["z"]},
                    "v1": {"vid": ["b"], "x": ["4 5"]}
                }}
            })))
            .unwrap();

        let frames = batch.vertices.unwrap();
        let v0 = frames.by_type("v0").unwrap();
        assert_eq!(v0.column_names(), vec!["vid", "x", "y"]);
        assert!(frames.by_type("v1").is_none());
    }

    #[test]
    fn test_self_loops_and_edge_index() {
        let config = LoaderConfig::builder()
            .kind(LoaderKind::Graph)
            .vertex_attributes(Vec::<String>::new())
            .edge_attributes(["w"])
            .add_self_loop(true)
            .output_format(OutputFormat::Csr)
            .build()
            .unwrap();
        let assembler = Assembler::new(schema(), &config);

        let batch = assembler
            .assemble(raw(json!({
                "partition": 0,
                "vertices": {"flat": {"vid": ["a", "b", "c"]}},
                "edges": {"flat": {"source": ["c"], "target": ["a"], "w": [0.5]}}
            })))
            .unwrap();

        assert_eq!(batch.num_edges(), 4);
        let edges = batch.edges.as_ref().unwrap().single().unwrap();
        assert_eq!(edges.column("w").unwrap().as_float(), Some(&[0.5, 0.0, 0.0, 0.0][..]));

        let topology = batch.topology.unwrap();
        assert_eq!(topology.num_nodes, 3);
        assert_eq!(topology.sources, vec![0, 1, 2, 2]);
        assert_eq!(topology.row_offsets, Some(vec![0, 1, 2, 4]));
    }

    #[test]
    fn test_self_loops_keep_shared_ids_apart() {
        let by_type = |types: &[&str]| {
            AttributeSelection::ByType(types.iter().map(|t| (t.to_string(), Vec::new())).collect())
        };
        let config = LoaderConfig::builder()
            .kind(LoaderKind::Graph)
            .vertex_selection(by_type(&["v0", "v1"]))
            .edge_selection(by_type(&["e0"]))
            .add_self_loop(true)
            .output_format(OutputFormat::EdgeIndex)
            .build()
            .unwrap();
        let assembler = Assembler::new(schema(), &config);

        let batch = assembler
            .assemble(raw(json!({
                "partition": 0,
                "vertices": {"typed": {
                    "v0": {"vid": ["0", "1"]},
                    "v1": {"vid": ["0"]}
                }},
                "edges": {"typed": {"e0": {"source": ["0"], "target": ["0"]}}}
            })))
            .unwrap();

        let edges = batch.edges.as_ref().unwrap();
        assert_eq!(edges.by_type(&self_loop_type("v0")).unwrap().num_rows, 2);
        assert_eq!(edges.by_type(&self_loop_type("v1")).unwrap().num_rows, 1);

        // v0:0 -> 0, v0:1 -> 1, v1:0 -> 2
        let topology = batch.topology.unwrap();
        assert_eq!(topology.num_nodes, 3);
        assert_eq!(topology.sources, vec![0, 0, 1, 2]);
        assert_eq!(topology.targets, vec![2, 0, 1, 2]);
    }

    #[test]
    fn test_integer_overflow_rejected() {
        let column = decode_column("y", AttrKind::Int, vec![json!(u64::MAX)]);
        assert!(matches!(column, Err(DataError::InvalidValue { row: 0, .. })));
    }

    #[test]
    fn test_unknown_endpoint() {
        let config = LoaderConfig::builder()
            .kind(LoaderKind::Graph)
            .output_format(OutputFormat::EdgeIndex)
            .build()
            .unwrap();
        let assembler = Assembler::new(schema(), &config);

        let err = assembler
            .assemble(raw(json!({
                "partition": 0,
                "vertices": {"flat": {"vid": ["a"]}},
                "edges": {"flat": {"source": ["a"], "target": ["zz"]}}
            })))
            .unwrap_err();
        assert_eq!(err, DataError::UnknownEndpoint { vertex: "zz".into() });
    }
}
