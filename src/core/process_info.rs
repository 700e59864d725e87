// src/core/process_info.rs

//! Per-operation parameter records read from `MosaicDataset/Processes`.
//!
//! Every child of `Processes` names an operation; each occurrence of that
//! child becomes one more record, addressed by the step index of the command
//! token (`BF0`, `BF1`, ...). Two operations hold repeated sub-records instead
//! of flat fields: `AddIndex/Index` and `CalculateValues/CalculateValue`.

use crate::constants::DEFAULT_MARKER;
use crate::core::document::{Document, NodeId};
use std::collections::HashMap;
use thiserror::Error;

/// Aggregate operations and the tag of their repeated child records.
const AGGREGATES: &[(&str, &str)] = &[("addindex", "index"), ("calculatevalues", "calculatevalue")];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProcessInfoError {
    #[error("Error: <MosaicDataset> node is not found! Invalid schema.")]
    MissingMosaicDataset,
    #[error(
        "Parameter index ({index}) for ({operation}) is out of range, only {available} occurrence(s) are defined."
    )]
    IndexOutOfRange {
        operation: String,
        index: usize,
        available: usize,
    },
    #[error("Sub-record ({sub_index}) of ({operation}) at index ({index}) does not exist.")]
    SubIndexOutOfRange {
        operation: String,
        index: usize,
        sub_index: usize,
    },
}

pub type Record = HashMap<String, String>;

/// One occurrence of an operation under `Processes`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Occurrence {
    /// Flat fields, lower-cased keys.
    pub fields: Record,
    /// Sub-records for aggregate operations.
    pub items: Vec<Record>,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessInfo {
    operations: HashMap<String, Vec<Occurrence>>,
}

impl ProcessInfo {
    /// Builds the table from the first `MosaicDataset` element of the document.
    pub fn build(doc: &Document) -> Result<Self, ProcessInfoError> {
        let md = doc
            .elements_by_name("MosaicDataset")
            .next()
            .ok_or(ProcessInfoError::MissingMosaicDataset)?;

        let mut operations: HashMap<String, Vec<Occurrence>> = HashMap::new();
        for &section in doc.children(md) {
            if doc.name(section) != "Processes" {
                continue;
            }
            for &process in doc.children(section) {
                let key = doc.name(process).to_lowercase();
                let occurrence = read_occurrence(doc, process, &key);
                operations.entry(key).or_default().push(occurrence);
            }
        }
        log::debug!("Process table built with {} operation(s).", operations.len());
        Ok(Self { operations })
    }

    pub fn has_entries(&self) -> bool {
        !self.operations.is_empty()
    }

    pub fn occurrences(&self, operation: &str) -> &[Occurrence] {
        self.operations
            .get(&operation.to_lowercase())
            .map_or(&[], Vec::as_slice)
    }

    /// Returns the stored value, or `#` when the key is absent.
    ///
    /// An `index` beyond the recorded occurrences is an error; an operation
    /// that never appears in the document only answers index 0, with `#`.
    pub fn value_of(
        &self,
        operation: &str,
        key: &str,
        index: usize,
        sub_index: Option<usize>,
    ) -> Result<String, ProcessInfoError> {
        let op = operation.to_lowercase();
        let key = key.to_lowercase();
        let occurrences = self.occurrences(&op);

        if occurrences.is_empty() && index == 0 {
            return Ok(DEFAULT_MARKER.to_string());
        }
        let occurrence = occurrences
            .get(index)
            .ok_or_else(|| ProcessInfoError::IndexOutOfRange {
                operation: op.clone(),
                index,
                available: occurrences.len(),
            })?;

        let record = match sub_index {
            None => &occurrence.fields,
            Some(sub) => occurrence
                .items
                .get(sub)
                .ok_or(ProcessInfoError::SubIndexOutOfRange {
                    operation: op,
                    index,
                    sub_index: sub,
                })?,
        };
        Ok(record
            .get(&key)
            .cloned()
            .unwrap_or_else(|| DEFAULT_MARKER.to_string()))
    }

    /// Sub-records of one occurrence of an aggregate operation.
    pub fn items(&self, operation: &str, index: usize) -> Result<&[Record], ProcessInfoError> {
        let occurrences = self.occurrences(operation);
        if occurrences.is_empty() && index == 0 {
            return Ok(&[]);
        }
        occurrences
            .get(index)
            .map(|o| o.items.as_slice())
            .ok_or_else(|| ProcessInfoError::IndexOutOfRange {
                operation: operation.to_lowercase(),
                index,
                available: occurrences.len(),
            })
    }

    /// Writes `values` (operation -> key -> value) into the text nodes of the
    /// document and rebuilds the table from it. A `#` value clears the node.
    pub fn apply_updates(
        doc: &mut Document,
        values: &HashMap<String, HashMap<String, String>>,
    ) -> Result<Self, ProcessInfoError> {
        let md = doc
            .elements_by_name("MosaicDataset")
            .next()
            .ok_or(ProcessInfoError::MissingMosaicDataset)?;

        let mut writes: Vec<(NodeId, Option<String>)> = Vec::new();
        for &section in doc.children(md) {
            if doc.name(section) != "Processes" {
                continue;
            }
            for &process in doc.children(section) {
                let op = doc.name(process).to_lowercase();
                let Some(updates) = values
                    .iter()
                    .find(|(k, _)| k.to_lowercase() == op)
                    .map(|(_, v)| v)
                else {
                    continue;
                };
                for &field in doc.children(process) {
                    let key = doc.name(field).to_lowercase();
                    if let Some((_, value)) = updates.iter().find(|(k, _)| k.to_lowercase() == key) {
                        let text = (value != DEFAULT_MARKER).then(|| value.clone());
                        writes.push((field, text));
                    }
                }
            }
        }
        for (node, text) in writes {
            doc.set_text(node, text);
        }
        Self::build(doc)
    }
}

fn read_occurrence(doc: &Document, process: NodeId, key: &str) -> Occurrence {
    let item_tag = AGGREGATES
        .iter()
        .find(|(op, _)| *op == key)
        .map(|(_, tag)| *tag);

    let mut occurrence = Occurrence::default();
    for &child in doc.children(process) {
        let name = doc.name(child).to_lowercase();
        if item_tag == Some(name.as_str()) {
            let record = doc
                .children(child)
                .iter()
                .map(|&f| (doc.name(f).to_lowercase(), node_value(doc, f)))
                .collect();
            occurrence.items.push(record);
        } else {
            occurrence.fields.insert(name, node_value(doc, child));
        }
    }
    occurrence
}

fn node_value(doc: &Document, id: NodeId) -> String {
    doc.text(id)
        .map_or_else(|| DEFAULT_MARKER.to_string(), str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"<Application><Workspace><MosaicDataset>
  <Name>md</Name>
  <Processes>
    <BuildFootprint>
      <where_clause>Year &gt; 2000</where_clause>
      <reset_footprint>RADIOMETRY</reset_footprint>
      <min_data_value/>
    </BuildFootprint>
    <BuildFootprint>
      <where_clause>#</where_clause>
    </BuildFootprint>
    <AddIndex>
      <Index><fields>Name</fields><index_name>ix_name</index_name></Index>
      <Index><fields>Year</fields></Index>
    </AddIndex>
    <AddIndex>
      <Index><fields>Tag</fields></Index>
    </AddIndex>
  </Processes>
</MosaicDataset></Workspace></Application>"#;

    #[test]
    fn test_values_round_trip_exactly() {
        let doc = Document::parse(CONFIG).unwrap();
        let table = ProcessInfo::build(&doc).unwrap();
        assert_eq!(
            table.value_of("buildfootprint", "where_clause", 0, None).unwrap(),
            "Year > 2000"
        );
        assert_eq!(
            table.value_of("BuildFootprint", "reset_footprint", 0, None).unwrap(),
            "RADIOMETRY"
        );
        assert_eq!(
            table.value_of("buildfootprint", "min_data_value", 0, None).unwrap(),
            "#"
        );
        assert_eq!(
            table.value_of("buildfootprint", "not_there", 1, None).unwrap(),
            "#"
        );
    }

    #[test]
    fn test_index_out_of_range_is_an_error() {
        let doc = Document::parse(CONFIG).unwrap();
        let table = ProcessInfo::build(&doc).unwrap();
        assert_eq!(table.occurrences("addindex").len(), 2);
        let err = table.value_of("addindex", "fields", 5, Some(0)).unwrap_err();
        assert_eq!(
            err,
            ProcessInfoError::IndexOutOfRange {
                operation: "addindex".to_string(),
                index: 5,
                available: 2
            }
        );
    }

    #[test]
    fn test_aggregate_sub_records() {
        let doc = Document::parse(CONFIG).unwrap();
        let table = ProcessInfo::build(&doc).unwrap();
        assert_eq!(table.items("addindex", 0).unwrap().len(), 2);
        assert_eq!(
            table.value_of("addindex", "index_name", 0, Some(0)).unwrap(),
            "ix_name"
        );
        assert_eq!(table.value_of("addindex", "fields", 1, Some(0)).unwrap(), "Tag");
        assert!(table.value_of("addindex", "fields", 1, Some(3)).is_err());
    }

    #[test]
    fn test_absent_operation_answers_defaults_at_index_zero() {
        let doc = Document::parse(CONFIG).unwrap();
        let table = ProcessInfo::build(&doc).unwrap();
        assert_eq!(table.value_of("buildseamlines", "sort_method", 0, None).unwrap(), "#");
        assert!(table.value_of("buildseamlines", "sort_method", 1, None).is_err());
    }

    #[test]
    fn test_missing_mosaic_dataset_is_a_schema_error() {
        let doc = Document::parse("<Application><Workspace/></Application>").unwrap();
        assert_eq!(
            ProcessInfo::build(&doc).unwrap_err(),
            ProcessInfoError::MissingMosaicDataset
        );
    }

    #[test]
    fn test_updates_rewrite_document_and_table() {
        let mut doc = Document::parse(CONFIG).unwrap();
        let mut values = HashMap::new();
        values.insert(
            "BuildFootprint".to_string(),
            HashMap::from([
                ("WHERE_CLAUSE".to_string(), "Year > 2010".to_string()),
                ("reset_footprint".to_string(), "#".to_string()),
            ]),
        );
        let table = ProcessInfo::apply_updates(&mut doc, &values).unwrap();
        assert_eq!(
            table.value_of("buildfootprint", "where_clause", 0, None).unwrap(),
            "Year > 2010"
        );
        assert_eq!(
            table.value_of("buildfootprint", "reset_footprint", 0, None).unwrap(),
            "#"
        );
        assert_eq!(doc.value_of("reset_footprint"), "");
    }
}
