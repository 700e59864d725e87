// src/core/document.rs

//! In-memory XML configuration tree.
//!
//! Elements are stored in an arena in document order, so "all elements named
//! X" is a linear scan that yields them in the order they appear in the file.
//! Only element names, attributes and text are kept; comments, processing
//! instructions and whitespace-only text are dropped.

use crate::core::variables::{self, DynamicParams};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Could not read configuration file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed XML: {0}")]
    Parse(String),
    #[error("Could not serialize configuration: {0}")]
    Serialize(String),
}

/// Index of an element inside a [`Document`].
pub type NodeId = usize;

#[derive(Debug, Clone)]
struct Node {
    name: String,
    text: Option<String>,
    attributes: Vec<(String, String)>,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
}

#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
    source_path: Option<PathBuf>,
}

impl Document {
    /// Loads either a literal XML string (anything starting with `<`) or a file path.
    pub fn load(input: &str) -> Result<Self, DocumentError> {
        if input.trim_start().starts_with('<') {
            Self::parse(input)
        } else {
            Self::from_file(Path::new(input))
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, DocumentError> {
        let content = fs::read_to_string(path).map_err(|source| DocumentError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut doc = Self::parse(&content)?;
        doc.source_path = Some(path.to_path_buf());
        Ok(doc)
    }

    pub fn parse(xml: &str) -> Result<Self, DocumentError> {
        let mut reader = Reader::from_str(xml);
        let mut nodes: Vec<Node> = Vec::new();
        let mut stack: Vec<NodeId> = Vec::new();

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    ensure_single_root(&nodes, &stack)?;
                    let id = push_element(&mut nodes, &stack, &e)?;
                    stack.push(id);
                }
                Ok(Event::Empty(e)) => {
                    ensure_single_root(&nodes, &stack)?;
                    push_element(&mut nodes, &stack, &e)?;
                }
                Ok(Event::End(_)) => {
                    stack.pop();
                }
                Ok(Event::Text(t)) => {
                    let text = t
                        .unescape()
                        .map_err(|e| DocumentError::Parse(e.to_string()))?;
                    append_text(&mut nodes, &stack, &text);
                }
                Ok(Event::CData(c)) => {
                    let raw = c.into_inner();
                    append_text(&mut nodes, &stack, &String::from_utf8_lossy(&raw));
                }
                Ok(Event::Eof) => {
                    if let Some(&open) = stack.last() {
                        let name = nodes.get(open).map_or("", |n| n.name.as_str());
                        return Err(DocumentError::Parse(format!(
                            "unexpected end of document, <{name}> is not closed"
                        )));
                    }
                    break;
                }
                Ok(_) => {}
                Err(e) => return Err(DocumentError::Parse(e.to_string())),
            }
        }

        if nodes.is_empty() {
            return Err(DocumentError::Parse("no root element".to_string()));
        }
        Ok(Self {
            nodes,
            source_path: None,
        })
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    // --- Tree navigation ---

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn name(&self, id: NodeId) -> &str {
        self.nodes.get(id).map_or("", |n| n.name.as_str())
    }

    /// Text content of an element, untrimmed.
    pub fn text(&self, id: NodeId) -> Option<&str> {
        self.nodes.get(id).and_then(|n| n.text.as_deref())
    }

    pub fn set_text(&mut self, id: NodeId, text: Option<String>) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.text = text.filter(|t| !t.is_empty());
        }
    }

    pub fn attribute(&self, id: NodeId, key: &str) -> Option<&str> {
        self.nodes.get(id).and_then(|n| {
            n.attributes
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        })
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes.get(id).map_or(&[], |n| n.children.as_slice())
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id).and_then(|n| n.parent)
    }

    /// First direct child with the given name.
    pub fn child(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.children(id)
            .iter()
            .copied()
            .find(|&c| self.name(c) == name)
    }

    /// Text of the first direct child with the given name, trimmed.
    pub fn child_text(&self, id: NodeId, name: &str) -> Option<String> {
        self.child(id, name)
            .and_then(|c| self.text(c))
            .map(|t| t.trim().to_string())
    }

    /// Element following `id` under the same parent.
    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.parent(id)?;
        let siblings = self.children(parent);
        let pos = siblings.iter().position(|&c| c == id)?;
        siblings.get(pos + 1).copied()
    }

    /// Every element with the given name, in document order.
    pub fn elements_by_name<'a>(&'a self, name: &'a str) -> impl Iterator<Item = NodeId> + 'a {
        self.nodes
            .iter()
            .enumerate()
            .filter(move |(_, n)| n.name == name)
            .map(|(id, _)| id)
    }

    /// Slash-joined element names from the root down to `id` inclusive.
    pub fn path_of(&self, id: NodeId) -> String {
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            names.push(self.name(c));
            current = self.parent(c);
        }
        names.reverse();
        names.join("/")
    }

    // --- Value access ---

    /// Untrimmed text of the first element named `tag`, or an empty string.
    pub fn value_of(&self, tag: &str) -> String {
        self.elements_by_name(tag)
            .next()
            .and_then(|id| self.text(id))
            .unwrap_or_default()
            .to_string()
    }

    /// Trimmed text of the first element whose full path equals `path`.
    pub fn value_at_path(&self, path: &str) -> String {
        let tag = path.rsplit('/').next().unwrap_or(path);
        self.elements_by_name(tag)
            .find(|&id| self.path_of(id) == path)
            .and_then(|id| self.text(id))
            .map(|t| t.trim().to_string())
            .unwrap_or_default()
    }

    /// Sets the text of the first element named `tag` located at `path`.
    ///
    /// With `sub = Some((sub_tag, sub_value))` the element is used as a key
    /// instead: the first match at `path` whose text equals `value` has its
    /// immediately following sibling updated, provided that sibling is named
    /// `sub_tag`. Only the next sibling is examined. Returns whether a node
    /// was written.
    pub fn set_value_at_path(
        &mut self,
        path: &str,
        tag: &str,
        value: &str,
        sub: Option<(&str, &str)>,
    ) -> bool {
        let candidates: Vec<NodeId> = self
            .elements_by_name(tag)
            .filter(|&id| self.path_of(id) == path)
            .collect();

        for id in candidates {
            match sub {
                Some((sub_tag, sub_value)) => {
                    if self.text(id) != Some(value) {
                        continue;
                    }
                    return match self.next_sibling(id) {
                        Some(sibling) if self.name(sibling) == sub_tag => {
                            self.set_text(sibling, Some(sub_value.to_string()));
                            true
                        }
                        _ => false,
                    };
                }
                None => {
                    self.set_text(id, Some(value.to_string()));
                    return true;
                }
            }
        }
        false
    }

    /// Rewrites every element text that contains `$` through the variable
    /// substitution rules.
    pub fn substitute_variables(&mut self, params: &DynamicParams) {
        for node in &mut self.nodes {
            let Some(text) = node.text.as_deref() else {
                continue;
            };
            let trimmed = text.trim();
            if !trimmed.contains('$') {
                continue;
            }
            let replaced = variables::substitute(trimmed, params);
            log::debug!("Substituted <{}>: '{}' -> '{}'", node.name, trimmed, replaced);
            node.text = Some(replaced).filter(|t| !t.is_empty());
        }
    }

    // --- Serialization ---

    pub fn to_xml(&self) -> Result<String, DocumentError> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(serialize_error)?;
        self.write_node(&mut writer, self.root())?;
        String::from_utf8(writer.into_inner()).map_err(|e| DocumentError::Serialize(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), DocumentError> {
        let xml = self.to_xml()?;
        fs::write(path, xml).map_err(|source| DocumentError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn write_node(&self, writer: &mut Writer<Vec<u8>>, id: NodeId) -> Result<(), DocumentError> {
        let Some(node) = self.nodes.get(id) else {
            return Ok(());
        };
        let mut start = BytesStart::new(node.name.as_str());
        for (k, v) in &node.attributes {
            start.push_attribute((k.as_str(), v.as_str()));
        }
        if node.text.is_none() && node.children.is_empty() {
            return writer.write_event(Event::Empty(start)).map_err(serialize_error);
        }
        writer.write_event(Event::Start(start)).map_err(serialize_error)?;
        if let Some(text) = &node.text {
            writer
                .write_event(Event::Text(BytesText::new(text)))
                .map_err(serialize_error)?;
        }
        for &child in &node.children {
            self.write_node(writer, child)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(node.name.as_str())))
            .map_err(serialize_error)
    }
}

fn serialize_error<E: std::fmt::Display>(e: E) -> DocumentError {
    DocumentError::Serialize(e.to_string())
}

/// A second top-level element makes the document ill-formed.
fn ensure_single_root(nodes: &[Node], stack: &[NodeId]) -> Result<(), DocumentError> {
    if stack.is_empty() && !nodes.is_empty() {
        return Err(DocumentError::Parse("more than one root element".to_string()));
    }
    Ok(())
}

fn push_element(
    nodes: &mut Vec<Node>,
    stack: &[NodeId],
    e: &BytesStart<'_>,
) -> Result<NodeId, DocumentError> {
    let parent = stack.last().copied();
    if parent.is_none() && !nodes.is_empty() {
        return Err(DocumentError::Parse(
            "more than one root element".to_string(),
        ));
    }

    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| DocumentError::Parse(err.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| DocumentError::Parse(err.to_string()))?
            .into_owned();
        attributes.push((key, value));
    }

    let id = nodes.len();
    nodes.push(Node {
        name: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
        text: None,
        attributes,
        children: Vec::new(),
        parent,
    });
    if let Some(parent_node) = parent.and_then(|p| nodes.get_mut(p)) {
        parent_node.children.push(id);
    }
    Ok(id)
}

fn append_text(nodes: &mut [Node], stack: &[NodeId], text: &str) {
    if text.trim().is_empty() {
        return;
    }
    if let Some(node) = stack.last().and_then(|&id| nodes.get_mut(id)) {
        node.text.get_or_insert_with(String::new).push_str(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<Application>
  <Workspace>
    <WorkspacePath>C:/data</WorkspacePath>
    <Geodatabase>imagery</Geodatabase>
    <MosaicDataset>
      <Name>  elevation </Name>
      <Sources><data_path>a</data_path><data_path>b</data_path></Sources>
      <Fields>
        <Field><Name>Year</Name><Type>SHORT</Type></Field>
      </Fields>
    </MosaicDataset>
  </Workspace>
</Application>"#;

    const MALFORMED: &[&str] = &[
        "<Application><Workspace><WorkspacePath>C:/x</WorkspacePath>",
        "<a><b></c></a>",
        "",
        "just some text",
        "<Application/><Application/>",
    ];

    #[test]
    fn test_malformed_documents_are_rejected() {
        for xml in MALFORMED {
            assert!(
                matches!(Document::parse(xml), Err(DocumentError::Parse(_))),
                "accepted: {xml:?}"
            );
        }
    }

    #[test]
    fn test_malformed_files_fail_to_load() {
        let dir = tempfile::tempdir().unwrap();
        for (i, xml) in MALFORMED.iter().enumerate() {
            let path = dir.path().join(format!("config{i}.xml"));
            fs::write(&path, xml).unwrap();
            assert!(
                matches!(
                    Document::load(&path.to_string_lossy()),
                    Err(DocumentError::Parse(_))
                ),
                "loaded: {xml:?}"
            );
        }
    }

    #[test]
    fn test_unclosed_root_names_the_open_element() {
        let err = Document::parse("<Application><Workspace>").unwrap_err();
        assert!(err.to_string().contains("<Workspace>"));
    }

    #[test]
    fn test_value_of_returns_first_match_untrimmed() {
        let doc = Document::parse(SAMPLE).unwrap();
        assert_eq!(doc.value_of("Name"), "  elevation ");
        assert_eq!(doc.value_of("Missing"), "");
    }

    #[test]
    fn test_value_at_path_matches_full_path_and_trims() {
        let doc = Document::parse(SAMPLE).unwrap();
        assert_eq!(
            doc.value_at_path("Application/Workspace/MosaicDataset/Name"),
            "elevation"
        );
        assert_eq!(
            doc.value_at_path("Application/Workspace/MosaicDataset/Fields/Field/Name"),
            "Year"
        );
        assert_eq!(doc.value_at_path("Workspace/MosaicDataset/Name"), "");
    }

    #[test]
    fn test_set_value_at_path_only_touches_path_match() {
        let mut doc = Document::parse(SAMPLE).unwrap();
        assert!(doc.set_value_at_path(
            "Application/Workspace/MosaicDataset/Fields/Field/Name",
            "Name",
            "Month",
            None
        ));
        assert_eq!(doc.value_of("Name"), "  elevation ");
        assert_eq!(
            doc.value_at_path("Application/Workspace/MosaicDataset/Fields/Field/Name"),
            "Month"
        );
    }

    #[test]
    fn test_set_value_with_sub_key_updates_next_sibling_only() {
        let mut doc = Document::parse(SAMPLE).unwrap();
        let path = "Application/Workspace/MosaicDataset/Fields/Field/Name";
        assert!(doc.set_value_at_path(path, "Name", "Year", Some(("Type", "LONG"))));
        assert_eq!(doc.value_of("Type"), "LONG");
        // Value mismatch leaves everything untouched.
        assert!(!doc.set_value_at_path(path, "Name", "Day", Some(("Type", "TEXT"))));
        assert_eq!(doc.value_of("Type"), "LONG");
    }

    #[test]
    fn test_round_trips_through_serialization() {
        let doc = Document::parse(SAMPLE).unwrap();
        let again = Document::parse(&doc.to_xml().unwrap()).unwrap();
        assert_eq!(again.value_of("WorkspacePath"), "C:/data");
        assert_eq!(again.elements_by_name("data_path").count(), 2);
    }

    #[test]
    fn test_load_reads_files_and_literals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.xml");
        fs::write(&path, SAMPLE).unwrap();
        let from_file = Document::load(path.to_str().unwrap()).unwrap();
        assert_eq!(from_file.source_path(), Some(path.as_path()));
        assert!(Document::load("<a>1</a>").unwrap().source_path().is_none());
        assert!(matches!(
            Document::load(dir.path().join("nope.xml").to_str().unwrap()),
            Err(DocumentError::Io { .. })
        ));
    }
}
