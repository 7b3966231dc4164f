//! Graph walker collecting and substituting content references.
//!
//! The walk is synchronous and single-pass. Elements are marked visited
//! before their attributes are entered, so cyclic links terminate and every
//! element is visited at most once per `visited` set.

use std::collections::{HashMap, HashSet};

use crate::content::ContentReference;
use crate::graph::{ElementId, HomeGraph, Value};

/// Attribute caching rendering state; never walked unless it holds content.
pub const SCENE_NODE_FIELD: &str = "object3D";

/// Capability applied to every content reference met during a walk
pub trait ContentVisitor {
    /// Whether `content` is collected. Rejected references are left alone.
    fn accept(&mut self, _content: &ContentReference) -> bool {
        true
    }

    /// Value substituted for an accepted reference at its graph position
    fn replace(&mut self, _content: &ContentReference) -> Option<ContentReference> {
        None
    }
}

/// Visitor accepting everything and replacing nothing
pub struct CollectAll;

impl ContentVisitor for CollectAll {}

/// Replaces references by URL from a precomputed map
pub struct ReplaceByUrl<'a> {
    pub replacements: &'a HashMap<String, ContentReference>,
}

impl ContentVisitor for ReplaceByUrl<'_> {
    fn accept(&mut self, content: &ContentReference) -> bool {
        self.replacements.contains_key(content.url())
    }

    fn replace(&mut self, content: &ContentReference) -> Option<ContentReference> {
        self.replacements.get(content.url()).cloned()
    }
}

/// Content references in first-encounter order, deduplicated by URL
#[derive(Debug, Default, Clone)]
pub struct ContentCollection {
    items: Vec<ContentReference>,
    urls: HashSet<String>,
}

impl ContentCollection {
    pub fn push(&mut self, content: &ContentReference) -> bool {
        if self.urls.insert(content.url().to_string()) {
            self.items.push(content.clone());
            true
        } else {
            false
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        self.urls.contains(url)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ContentReference> {
        self.items.iter()
    }

    pub fn into_vec(self) -> Vec<ContentReference> {
        self.items
    }
}

/// Attributes that hold derived state for each element kind
///
/// A name listed here is skipped during walks and not written to manifests,
/// unless the attribute actually holds content.
#[derive(Debug, Clone, Default)]
pub struct TransientFields {
    by_kind: HashMap<String, HashSet<String>>,
}

impl TransientFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transient attributes of the element kinds found in home manifests
    pub fn home_defaults() -> Self {
        let mut fields = Self::new();
        for kind in ["pieceOfFurniture", "doorOrWindow", "light"] {
            fields.declare(kind, &["planIcon", "modelBounds", "modelTransformations"]);
        }
        fields.declare("furnitureGroup", &["modelBounds"]);
        fields.declare("wall", &["shapeCache", "arcExtentCache"]);
        fields.declare("room", &["areaCache", "pointsCache"]);
        fields
    }

    pub fn declare(&mut self, kind: &str, names: &[&str]) {
        let set = self.by_kind.entry(kind.to_string()).or_default();
        set.extend(names.iter().map(|n| n.to_string()));
    }

    pub fn is_transient(&self, kind: &str, name: &str) -> bool {
        self.by_kind
            .get(kind)
            .is_some_and(|names| names.contains(name))
    }

    /// Whether attribute `name` of a `kind` element is skipped when holding `value`
    pub fn skips(&self, kind: &str, name: &str, value: &Value) -> bool {
        if matches!(value, Value::Content(_)) {
            return false;
        }
        name == SCENE_NODE_FIELD || self.is_transient(kind, name)
    }
}

/// Walks a [`HomeGraph`] from a starting value
pub struct GraphWalker<'a> {
    transient: &'a TransientFields,
}

impl<'a> GraphWalker<'a> {
    pub fn new(transient: &'a TransientFields) -> Self {
        Self { transient }
    }

    /// Collect content reachable from the root element into `collected`
    pub fn collect_from_root(
        &self,
        graph: &mut HomeGraph,
        visitor: &mut dyn ContentVisitor,
    ) -> ContentCollection {
        let mut visited = HashSet::new();
        let mut collected = ContentCollection::default();
        let mut root = Value::Element(graph.root());
        self.collect(graph, &mut root, &mut visited, &mut collected, visitor);
        collected
    }

    /// Walk `value`, collecting accepted references into `collected`.
    ///
    /// Lists are walked element by element and element links are followed
    /// unless already in `visited`. Replacements returned by the visitor are
    /// written back at their position; the replacement of `value` itself is
    /// also returned.
    pub fn collect(
        &self,
        graph: &mut HomeGraph,
        value: &mut Value,
        visited: &mut HashSet<ElementId>,
        collected: &mut ContentCollection,
        visitor: &mut dyn ContentVisitor,
    ) -> Option<ContentReference> {
        match value {
            Value::Content(content) => {
                if !visitor.accept(content) {
                    return None;
                }
                collected.push(content);
                let replacement = visitor.replace(content)?;
                *content = replacement.clone();
                Some(replacement)
            }
            Value::List(items) => {
                for item in items.iter_mut() {
                    self.collect(graph, item, visited, collected, visitor);
                }
                None
            }
            Value::Element(id) => {
                self.collect_element(graph, *id, visited, collected, visitor);
                None
            }
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::Text(_) => None,
        }
    }

    fn collect_element(
        &self,
        graph: &mut HomeGraph,
        id: ElementId,
        visited: &mut HashSet<ElementId>,
        collected: &mut ContentCollection,
        visitor: &mut dyn ContentVisitor,
    ) {
        if !visited.insert(id) {
            return;
        }

        let attribute_count = graph.element(id).attributes.len();
        for index in 0..attribute_count {
            let element = graph.element_mut(id);
            let (name, slot) = &mut element.attributes[index];
            if self.transient.skips(&element.name, name, slot) {
                continue;
            }
            // Taken out while walking so the graph stays borrowable; the
            // element is already visited and cannot be re-entered.
            let mut value = std::mem::take(slot);
            self.collect(graph, &mut value, visited, collected, visitor);
            graph.element_mut(id).attributes[index].1 = value;
        }

        let children = graph.element(id).children.clone();
        for child in children {
            self.collect_element(graph, child, visited, collected, visitor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentReference;

    fn blob(tag: &str) -> ContentReference {
        ContentReference::blob(tag.as_bytes().to_vec())
    }

    #[test]
    fn cycles_terminate_and_collect_once() {
        let shared = blob("shared");
        let other = blob("other");

        let mut graph = HomeGraph::new("home");
        let a = graph.add_child(graph.root(), "wall");
        let b = graph.add_child(graph.root(), "wall");
        graph.set_attribute(a, "wallAtEnd", b);
        graph.set_attribute(a, "pattern", shared.clone());
        graph.set_attribute(b, "wallAtStart", a);
        graph.set_attribute(b, "pattern", other.clone());
        graph.set_attribute(
            b,
            "textures",
            Value::List(vec![Value::Content(shared.clone()), Value::Element(a)]),
        );

        let transient = TransientFields::home_defaults();
        let collected = GraphWalker::new(&transient).collect_from_root(&mut graph, &mut CollectAll);

        let urls: Vec<_> = collected.iter().map(|c| c.url().to_string()).collect();
        assert_eq!(urls, [shared.url(), other.url()]);
    }

    #[test]
    fn transient_fields_skipped_unless_content() {
        let icon = blob("icon");
        let cached_icon = blob("cached");

        let mut graph = HomeGraph::new("home");
        let piece = graph.add_child(graph.root(), "pieceOfFurniture");
        // Same name as a transient field, but holding content: still walked
        graph.set_attribute(piece, "planIcon", icon.clone());
        graph.set_attribute(
            piece,
            SCENE_NODE_FIELD,
            Value::List(vec![Value::Content(cached_icon.clone())]),
        );
        graph.set_attribute(
            piece,
            "modelBounds",
            Value::List(vec![Value::Content(cached_icon)]),
        );

        let transient = TransientFields::home_defaults();
        let collected = GraphWalker::new(&transient).collect_from_root(&mut graph, &mut CollectAll);
        let urls: Vec<_> = collected.iter().map(|c| c.url()).collect();
        assert_eq!(urls, [icon.url()]);
    }

    #[test]
    fn replacements_written_back_into_lists() {
        let original = blob("original");
        let substitute = blob("substitute");

        let mut graph = HomeGraph::new("home");
        let room = graph.add_child(graph.root(), "room");
        graph.set_attribute(
            room,
            "floorTextures",
            Value::List(vec![Value::Content(original.clone()), Value::Null]),
        );
        graph.set_attribute(room, "ceiling", original.clone());

        let replacements = HashMap::from([(original.url().to_string(), substitute.clone())]);
        let transient = TransientFields::new();
        let collected = GraphWalker::new(&transient)
            .collect_from_root(&mut graph, &mut ReplaceByUrl { replacements: &replacements });
        assert_eq!(collected.len(), 1);

        let element = graph.element(room);
        match element.attribute("floorTextures") {
            Some(Value::List(items)) => {
                assert_eq!(items[0].as_content(), Some(&substitute));
            }
            other => panic!("unexpected value {other:?}"),
        }
        assert_eq!(element.attribute("ceiling").and_then(Value::as_content), Some(&substitute));
    }

    #[test]
    fn rejected_content_is_left_untouched() {
        struct OnlyBlobs;
        impl ContentVisitor for OnlyBlobs {
            fn accept(&mut self, content: &ContentReference) -> bool {
                content.url().starts_with("blob:")
            }
        }

        let mut graph = HomeGraph::new("home");
        graph.set_attribute(graph.root(), "a", blob("a"));
        graph.set_attribute(graph.root(), "b", ContentReference::remote("https://x/b.png"));

        let transient = TransientFields::new();
        let collected = GraphWalker::new(&transient).collect_from_root(&mut graph, &mut OnlyBlobs);
        assert_eq!(collected.len(), 1);
    }

    #[test]
    fn bare_content_root_returns_replacement() {
        struct Swap(ContentReference);
        impl ContentVisitor for Swap {
            fn replace(&mut self, _: &ContentReference) -> Option<ContentReference> {
                Some(self.0.clone())
            }
        }

        let substitute = blob("new");
        let mut graph = HomeGraph::new("home");
        let mut value = Value::Content(blob("old"));
        let transient = TransientFields::new();
        let replaced = GraphWalker::new(&transient).collect(
            &mut graph,
            &mut value,
            &mut HashSet::new(),
            &mut ContentCollection::default(),
            &mut Swap(substitute.clone()),
        );
        assert_eq!(replaced, Some(substitute.clone()));
        assert_eq!(value.as_content(), Some(&substitute));
    }
}
