//! Streaming manifest parser and writer.
//!
//! The manifest is the XML entry of a home container describing the domain
//! graph. Content attributes hold entry paths (or absolute URLs) and
//! reference attributes hold the `id` of another element.
//!
//! Before parsing, every `'` of the document is turned into `"`. Attribute
//! values quoted with apostrophes then parse like double-quoted ones, at the
//! cost of breaking documents holding a raw apostrophe inside a
//! double-quoted value. Manifests written here escape apostrophes, so they
//! are not affected.

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use std::collections::{HashMap, HashSet};

use crate::content::{ArchiveSource, ContentReference};
use crate::error::{ArchiveError, Result};
use crate::fetch::ProgressFn;
use crate::graph::{ElementId, HomeGraph, Value};
use crate::walker::TransientFields;

/// Default name of the manifest entry
pub const DEFAULT_MANIFEST_ENTRY: &str = "Home.xml";

/// Which attributes carry content and which link elements
#[derive(Debug, Clone)]
pub struct ManifestSchema {
    pub content_attributes: HashSet<String>,
    pub reference_attributes: HashSet<String>,
    pub id_attribute: String,
}

impl Default for ManifestSchema {
    fn default() -> Self {
        let set = |names: &[&str]| names.iter().map(|n| n.to_string()).collect();
        Self {
            content_attributes: set(&["icon", "planIcon", "model", "image"]),
            reference_attributes: set(&["wallAtStart", "wallAtEnd", "level"]),
            id_attribute: "id".to_string(),
        }
    }
}

fn parse_error(err: impl std::fmt::Display) -> ArchiveError {
    ArchiveError::Parse(err.to_string())
}

/// Stream parser building a [`HomeGraph`] from manifest bytes
pub struct ManifestParser<'a> {
    schema: &'a ManifestSchema,
    normalize_quotes: bool,
}

impl<'a> ManifestParser<'a> {
    pub fn new(schema: &'a ManifestSchema) -> Self {
        Self {
            schema,
            normalize_quotes: true,
        }
    }

    /// Turn the apostrophe substitution on or off
    pub fn normalize_quotes(mut self, enabled: bool) -> Self {
        self.normalize_quotes = enabled;
        self
    }

    /// Parse `data`, resolving relative content paths against `base`
    pub fn parse(
        &self,
        data: &[u8],
        base: &ArchiveSource,
        progress: ProgressFn<'_>,
    ) -> Result<HomeGraph> {
        let text = std::str::from_utf8(data).map_err(parse_error)?;
        let text = if self.normalize_quotes {
            text.replace('\'', "\"")
        } else {
            text.to_string()
        };

        let mut reader = Reader::from_str(&text);
        reader.config_mut().trim_text(true);

        let total = text.len().max(1) as f64;
        let mut reported = 0.0;
        progress(0.0);

        let mut graph: Option<HomeGraph> = None;
        let mut stack: Vec<ElementId> = Vec::new();

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let id = self.open_element(&mut graph, &stack, &e, base)?;
                    stack.push(id);
                }
                Ok(Event::Empty(e)) => {
                    self.open_element(&mut graph, &stack, &e, base)?;
                }
                Ok(Event::End(_)) => {
                    stack.pop();
                }
                Ok(Event::Text(t)) => {
                    let content = t.unescape().map_err(parse_error)?;
                    append_text(&mut graph, &stack, &content);
                }
                Ok(Event::CData(c)) => {
                    let content = String::from_utf8_lossy(&c.into_inner()).into_owned();
                    append_text(&mut graph, &stack, &content);
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(ArchiveError::Parse(format!(
                        "{e} at byte {}",
                        reader.buffer_position()
                    )));
                }
            }

            let fraction = reader.buffer_position() as f64 / total;
            if fraction - reported >= 0.01 {
                reported = fraction.min(1.0);
                progress(reported);
            }
        }

        if !stack.is_empty() {
            return Err(ArchiveError::Parse("unexpected end of document".to_string()));
        }
        let mut graph = graph.ok_or_else(|| ArchiveError::Parse("no root element".to_string()))?;
        self.resolve_references(&mut graph);
        progress(1.0);
        Ok(graph)
    }

    fn open_element(
        &self,
        graph: &mut Option<HomeGraph>,
        stack: &[ElementId],
        start: &BytesStart<'_>,
        base: &ArchiveSource,
    ) -> Result<ElementId> {
        let name = std::str::from_utf8(start.name().as_ref())
            .map_err(parse_error)?
            .to_string();

        let id = if let Some(existing) = graph.as_mut() {
            let parent = stack
                .last()
                .ok_or_else(|| ArchiveError::Parse(format!("second root element <{name}>")))?;
            existing.add_child(*parent, &name)
        } else {
            let created = HomeGraph::new(&name);
            let root = created.root();
            *graph = Some(created);
            root
        };
        let graph = graph
            .as_mut()
            .ok_or_else(|| ArchiveError::Parse("no root element".to_string()))?;

        for attribute in start.attributes() {
            let attribute = attribute.map_err(parse_error)?;
            let key = std::str::from_utf8(attribute.key.as_ref()).map_err(parse_error)?;
            let raw = attribute.unescape_value().map_err(parse_error)?;
            let value = if self.schema.content_attributes.contains(key) {
                Value::Content(ContentReference::from_manifest_value(&raw, base)?)
            } else {
                Value::Text(raw.into_owned())
            };
            graph.element_mut(id).attributes.push((key.to_string(), value));
        }
        Ok(id)
    }

    /// Turn reference attributes into element links where the target exists
    fn resolve_references(&self, graph: &mut HomeGraph) {
        let mut ids = HashMap::new();
        for id in graph.element_ids() {
            if let Some(key) = graph
                .element(id)
                .attribute(&self.schema.id_attribute)
                .and_then(Value::as_text)
            {
                ids.entry(key.to_string()).or_insert(id);
            }
        }

        for id in graph.element_ids() {
            for (key, value) in graph.element_mut(id).attributes.iter_mut() {
                if !self.schema.reference_attributes.contains(key.as_str()) {
                    continue;
                }
                if let Some(target) = value.as_text().and_then(|t| ids.get(t)) {
                    *value = Value::Element(*target);
                }
            }
        }
    }
}

fn append_text(graph: &mut Option<HomeGraph>, stack: &[ElementId], content: &str) {
    if content.trim().is_empty() {
        return;
    }
    if let (Some(graph), Some(top)) = (graph.as_mut(), stack.last()) {
        graph
            .element_mut(*top)
            .text
            .get_or_insert_with(String::new)
            .push_str(content);
    }
}

/// Serializes a [`HomeGraph`] as a manifest.
///
/// Content may only sit in the schema's content attributes and element
/// links only in its reference attributes, one value each, so that every
/// written manifest parses back to the same references. Anything else is a
/// [`ArchiveError::ResourceWrite`].
pub struct ManifestWriter<'a> {
    schema: &'a ManifestSchema,
    transient: &'a TransientFields,
}

impl<'a> ManifestWriter<'a> {
    pub fn new(schema: &'a ManifestSchema, transient: &'a TransientFields) -> Self {
        Self { schema, transient }
    }

    /// Write the graph, naming content by `paths` (URL to entry path).
    /// Content missing from `paths` is written as its URL.
    pub fn write(&self, graph: &HomeGraph, paths: &HashMap<String, String>) -> Result<Vec<u8>> {
        let ids = self.link_ids(graph);
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(write_error)?;
        let mut visited = HashSet::new();
        self.write_element(&mut writer, graph, graph.root(), paths, &ids, &mut visited)?;
        Ok(writer.into_inner())
    }

    fn existing_id(&self, graph: &HomeGraph, id: ElementId) -> Option<String> {
        match graph.element(id).attribute(&self.schema.id_attribute)? {
            Value::Text(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Id of every link target, generating one for targets without an id
    fn link_ids(&self, graph: &HomeGraph) -> HashMap<ElementId, String> {
        let mut ids = HashMap::new();
        let mut taken: HashSet<String> = graph
            .element_ids()
            .filter_map(|id| self.existing_id(graph, id))
            .collect();

        for id in graph.element_ids() {
            let element = graph.element(id);
            for (key, value) in &element.attributes {
                let Value::Element(target) = value else {
                    continue;
                };
                if self.transient.skips(&element.name, key, value) || ids.contains_key(target) {
                    continue;
                }
                let assigned = match self.existing_id(graph, *target) {
                    Some(existing) => existing,
                    None => {
                        let stem = format!("{}-{}", graph.element(*target).name, target.index());
                        let mut candidate = stem.clone();
                        let mut n = 1;
                        while taken.contains(&candidate) {
                            candidate = format!("{stem}-{n}");
                            n += 1;
                        }
                        taken.insert(candidate.clone());
                        candidate
                    }
                };
                ids.insert(*target, assigned);
            }
        }
        ids
    }

    fn write_element(
        &self,
        writer: &mut Writer<Vec<u8>>,
        graph: &HomeGraph,
        id: ElementId,
        paths: &HashMap<String, String>,
        ids: &HashMap<ElementId, String>,
        visited: &mut HashSet<ElementId>,
    ) -> Result<()> {
        if !visited.insert(id) {
            return Ok(());
        }
        let element = graph.element(id);
        let mut start = BytesStart::new(element.name.as_str());
        let generated = ids.get(&id).filter(|_| self.existing_id(graph, id).is_none());
        if let Some(generated) = generated {
            start.push_attribute((self.schema.id_attribute.as_str(), generated.as_str()));
        }
        for (key, value) in &element.attributes {
            if self.transient.skips(&element.name, key, value)
                || (generated.is_some() && *key == self.schema.id_attribute)
            {
                continue;
            }
            if let Some(rendered) = self.render(&element.name, key, value, paths, ids)? {
                start.push_attribute((key.as_str(), rendered.as_str()));
            }
        }

        if element.children.is_empty() && element.text.is_none() {
            return writer.write_event(Event::Empty(start)).map_err(write_error);
        }

        writer.write_event(Event::Start(start)).map_err(write_error)?;
        if let Some(text) = &element.text {
            writer
                .write_event(Event::Text(BytesText::new(text)))
                .map_err(write_error)?;
        }
        for child in &element.children {
            self.write_element(writer, graph, *child, paths, ids, visited)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(element.name.as_str())))
            .map_err(write_error)
    }

    fn render(
        &self,
        element: &str,
        key: &str,
        value: &Value,
        paths: &HashMap<String, String>,
        ids: &HashMap<ElementId, String>,
    ) -> Result<Option<String>> {
        let unwritable = |what: &str| {
            Err(write_error(format!(
                "attribute {key} of <{element}> holds {what}"
            )))
        };
        match value {
            Value::Null => Ok(None),
            Value::Bool(b) => Ok(Some(b.to_string())),
            Value::Number(n) => Ok(Some(n.to_string())),
            Value::Text(s) => Ok(Some(s.clone())),
            Value::Content(c) if self.schema.content_attributes.contains(key) => Ok(Some(
                paths
                    .get(c.url())
                    .cloned()
                    .unwrap_or_else(|| c.url().to_string()),
            )),
            Value::Content(_) => unwritable("content but is not a content attribute"),
            Value::Element(target) if self.schema.reference_attributes.contains(key) => {
                Ok(ids.get(target).cloned())
            }
            Value::Element(_) => unwritable("an element link but is not a reference attribute"),
            Value::List(items) => {
                let mut parts = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Content(_) => return unwritable("a list of content"),
                        Value::Element(_) => return unwritable("a list of element links"),
                        other => parts.extend(self.render(element, key, other, paths, ids)?),
                    }
                }
                Ok(Some(parts.join(" ")))
            }
        }
    }
}

fn write_error(err: impl std::fmt::Display) -> ArchiveError {
    ArchiveError::ResourceWrite {
        path: "manifest".to_string(),
        message: err.to_string(),
    }
}
