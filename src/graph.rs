//! The domain graph described by a manifest.
//!
//! Elements live in an arena and link to each other by [`ElementId`], so
//! cycles (a wall joined at both ends to another wall) need no shared
//! ownership, and a whole graph is copied with `clone` when it has to cross
//! into a worker.

use crate::content::ContentReference;

/// Index of an element in its [`HomeGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(usize);

impl ElementId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Attribute value of an element
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Content(ContentReference),
    /// Link to another element of the same graph
    Element(ElementId),
    List(Vec<Value>),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_content(&self) -> Option<&ContentReference> {
        match self {
            Value::Content(c) => Some(c),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<ContentReference> for Value {
    fn from(c: ContentReference) -> Self {
        Value::Content(c)
    }
}

impl From<ElementId> for Value {
    fn from(id: ElementId) -> Self {
        Value::Element(id)
    }
}

/// A node of the graph: an element kind, ordered attributes and children
#[derive(Debug, Clone)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, Value)>,
    pub children: Vec<ElementId>,
    pub text: Option<String>,
}

impl Element {
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| k == key) {
            Some((_, slot)) => *slot = value,
            None => self.attributes.push((key.to_string(), value)),
        }
    }
}

/// Arena-backed domain graph with a designated root element
#[derive(Debug, Clone)]
pub struct HomeGraph {
    elements: Vec<Element>,
    root: ElementId,
}

impl HomeGraph {
    /// Create a graph whose root element is called `root_name`
    pub fn new(root_name: &str) -> Self {
        let mut graph = Self {
            elements: Vec::new(),
            root: ElementId(0),
        };
        graph.root = graph.add_element(root_name);
        graph
    }

    pub fn root(&self) -> ElementId {
        self.root
    }

    /// Add a detached element; attach it with [`append_child`](Self::append_child)
    pub fn add_element(&mut self, name: &str) -> ElementId {
        self.elements.push(Element {
            name: name.to_string(),
            attributes: Vec::new(),
            children: Vec::new(),
            text: None,
        });
        ElementId(self.elements.len() - 1)
    }

    pub fn append_child(&mut self, parent: ElementId, child: ElementId) {
        self.elements[parent.0].children.push(child);
    }

    /// Add a new element under `parent`
    pub fn add_child(&mut self, parent: ElementId, name: &str) -> ElementId {
        let child = self.add_element(name);
        self.append_child(parent, child);
        child
    }

    pub fn element(&self, id: ElementId) -> &Element {
        &self.elements[id.0]
    }

    pub fn element_mut(&mut self, id: ElementId) -> &mut Element {
        &mut self.elements[id.0]
    }

    pub fn set_attribute(&mut self, id: ElementId, key: &str, value: impl Into<Value>) {
        self.elements[id.0].set_attribute(key, value);
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Ids of every element, in creation order
    pub fn element_ids(&self) -> impl Iterator<Item = ElementId> + use<> {
        (0..self.elements.len()).map(ElementId)
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Element carrying `id` as its `id` attribute
    pub fn find_by_id(&self, id: &str) -> Option<ElementId> {
        self.elements
            .iter()
            .position(|e| e.attribute("id").and_then(Value::as_text) == Some(id))
            .map(ElementId)
    }

    /// Every content value held anywhere in the graph, including unreachable
    /// elements, in arena order
    pub fn contents(&self) -> Vec<&ContentReference> {
        fn push<'a>(value: &'a Value, out: &mut Vec<&'a ContentReference>) {
            match value {
                Value::Content(c) => out.push(c),
                Value::List(items) => items.iter().for_each(|v| push(v, out)),
                _ => {}
            }
        }
        let mut out = Vec::new();
        for element in &self.elements {
            for (_, value) in &element.attributes {
                push(value, &mut out);
            }
        }
        out
    }
}
