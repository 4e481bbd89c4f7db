//! Document model
//!
//! [`DomTree`] is the read-only view of a document that selector matching and
//! attribute extraction need. Selector semantics belong to the host: the tree
//! answers `matches_selector` itself.
//!
//! [`MemoryDom`] is an in-memory document. Its selector support covers
//! compound selectors (`tag`, `#id`, `.class`, `[attr]`, `[attr=value]`, `*`)
//! and comma-separated lists; combinators never match.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Node handle inside a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// Runtime element properties that attribute extraction may fall back to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ElementProperty {
    Value,
    Checked,
    TextContent,
    InnerText,
    Href,
    Name,
    Title,
    Id,
    ClassName,
    TagName,
}

impl ElementProperty {
    /// Map a DOM property name onto the allow-list
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "value" => Some(ElementProperty::Value),
            "checked" => Some(ElementProperty::Checked),
            "textContent" => Some(ElementProperty::TextContent),
            "innerText" => Some(ElementProperty::InnerText),
            "href" => Some(ElementProperty::Href),
            "name" => Some(ElementProperty::Name),
            "title" => Some(ElementProperty::Title),
            "id" => Some(ElementProperty::Id),
            "className" => Some(ElementProperty::ClassName),
            "tagName" => Some(ElementProperty::TagName),
            _ => None,
        }
    }
}

/// Read-only document access
pub trait DomTree {
    fn is_element(&self, node: NodeId) -> bool;

    fn parent_node(&self, node: NodeId) -> Option<NodeId>;

    fn parent_element(&self, node: NodeId) -> Option<NodeId> {
        self.parent_node(node).filter(|p| self.is_element(*p))
    }

    /// Selector test, provided by the host's selector engine
    fn matches_selector(&self, element: NodeId, selector: &str) -> bool;

    /// Literal attribute value; `Some("")` for a present but empty attribute
    fn attribute(&self, element: NodeId, name: &str) -> Option<String>;

    fn property(&self, element: NodeId, property: ElementProperty) -> Option<String>;

    /// Descendant elements of `root` with the given tag, in document order
    fn elements_by_tag_name(&self, root: NodeId, tag: &str) -> Vec<NodeId>;

    fn inner_text(&self, element: NodeId) -> String;
}

#[derive(Debug, Clone)]
enum NodeKind {
    Document,
    Element {
        tag: String,
        attributes: BTreeMap<String, String>,
        properties: BTreeMap<ElementProperty, String>,
    },
    Text(String),
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// In-memory document
#[derive(Debug, Clone)]
pub struct MemoryDom {
    nodes: Vec<Node>,
}

impl Default for MemoryDom {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDom {
    /// Create a document containing only the document node
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                kind: NodeKind::Document,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    /// The document node
    pub fn document(&self) -> NodeId {
        NodeId(0)
    }

    fn push(&mut self, parent: NodeId, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            kind,
            parent: Some(parent),
            children: Vec::new(),
        });
        if let Some(p) = self.nodes.get_mut(parent.0) {
            p.children.push(id);
        }
        id
    }

    /// Append an element under `parent`
    pub fn append_element(&mut self, parent: NodeId, tag: &str) -> NodeId {
        self.push(
            parent,
            NodeKind::Element {
                tag: tag.to_ascii_lowercase(),
                attributes: BTreeMap::new(),
                properties: BTreeMap::new(),
            },
        )
    }

    /// Append a text node under `parent`
    pub fn append_text(&mut self, parent: NodeId, text: &str) -> NodeId {
        self.push(parent, NodeKind::Text(text.to_string()))
    }

    pub fn set_attribute(&mut self, element: NodeId, name: &str, value: &str) {
        if let Some(NodeKind::Element { attributes, .. }) = self.nodes.get_mut(element.0).map(|n| &mut n.kind) {
            attributes.insert(name.to_string(), value.to_string());
        }
    }

    /// Set a runtime property that has no backing attribute (e.g. an input's value)
    pub fn set_property(&mut self, element: NodeId, property: ElementProperty, value: &str) {
        if let Some(NodeKind::Element { properties, .. }) = self.nodes.get_mut(element.0).map(|n| &mut n.kind) {
            properties.insert(property, value.to_string());
        }
    }

    /// First element whose `id` attribute equals `id`
    pub fn element_by_id(&self, id: &str) -> Option<NodeId> {
        (0..self.nodes.len())
            .map(NodeId)
            .find(|n| self.attribute(*n, "id").as_deref() == Some(id))
    }

    fn tag(&self, node: NodeId) -> Option<&str> {
        match self.nodes.get(node.0).map(|n| &n.kind) {
            Some(NodeKind::Element { tag, .. }) => Some(tag),
            _ => None,
        }
    }

    fn text_of(&self, node: NodeId, out: &mut String) {
        if let Some(n) = self.nodes.get(node.0) {
            if let NodeKind::Text(text) = &n.kind {
                out.push_str(text);
            }
            for child in &n.children {
                self.text_of(*child, out);
            }
        }
    }

    fn collect_by_tag(&self, node: NodeId, tag: &str, out: &mut Vec<NodeId>) {
        if let Some(n) = self.nodes.get(node.0) {
            for child in &n.children {
                if self.tag(*child) == Some(tag) {
                    out.push(*child);
                }
                self.collect_by_tag(*child, tag, out);
            }
        }
    }

    fn compound_matches(&self, element: NodeId, compound: &str) -> bool {
        if compound.is_empty() || compound.contains(char::is_whitespace) || compound.contains(['>', '+', '~']) {
            log::trace!("Unsupported selector {:?}", compound);
            return false;
        }

        let mut rest = compound;
        let tag_end = rest.find(['#', '.', '[']).unwrap_or(rest.len());
        let tag = &rest[..tag_end];
        if !tag.is_empty() && tag != "*" && self.tag(element) != Some(tag.to_ascii_lowercase().as_str()) {
            return false;
        }
        rest = &rest[tag_end..];

        while !rest.is_empty() {
            if !rest.is_char_boundary(1) {
                return false;
            }
            let (kind, body) = rest.split_at(1);
            match kind {
                "#" | "." => {
                    let end = body.find(['#', '.', '[']).unwrap_or(body.len());
                    let name = &body[..end];
                    let ok = if kind == "#" {
                        self.attribute(element, "id").as_deref() == Some(name)
                    } else {
                        self.attribute(element, "class")
                            .is_some_and(|c| c.split_whitespace().any(|cls| cls == name))
                    };
                    if !ok {
                        return false;
                    }
                    rest = &body[end..];
                }
                "[" => {
                    let Some(end) = body.find(']') else {
                        return false;
                    };
                    let condition = &body[..end];
                    let ok = match condition.split_once('=') {
                        Some((name, value)) => {
                            let value = value.trim_matches(|c| c == '"' || c == '\'');
                            self.attribute(element, name.trim()).as_deref() == Some(value)
                        }
                        None => self.attribute(element, condition.trim()).is_some(),
                    };
                    if !ok {
                        return false;
                    }
                    rest = &body[end + 1..];
                }
                _ => return false,
            }
        }
        true
    }
}

impl DomTree for MemoryDom {
    fn is_element(&self, node: NodeId) -> bool {
        self.tag(node).is_some()
    }

    fn parent_node(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node.0).and_then(|n| n.parent)
    }

    fn matches_selector(&self, element: NodeId, selector: &str) -> bool {
        self.is_element(element) && selector.split(',').any(|c| self.compound_matches(element, c.trim()))
    }

    fn attribute(&self, element: NodeId, name: &str) -> Option<String> {
        match self.nodes.get(element.0).map(|n| &n.kind) {
            Some(NodeKind::Element { attributes, .. }) => attributes.get(name).cloned(),
            _ => None,
        }
    }

    fn property(&self, element: NodeId, property: ElementProperty) -> Option<String> {
        let Some(NodeKind::Element { tag, properties, .. }) = self.nodes.get(element.0).map(|n| &n.kind) else {
            return None;
        };
        if let Some(value) = properties.get(&property) {
            return Some(value.clone());
        }
        match property {
            ElementProperty::TagName => Some(tag.to_ascii_uppercase()),
            ElementProperty::TextContent | ElementProperty::InnerText => Some(self.inner_text(element)),
            ElementProperty::Id => Some(self.attribute(element, "id").unwrap_or_default()),
            ElementProperty::ClassName => Some(self.attribute(element, "class").unwrap_or_default()),
            _ => None,
        }
    }

    fn elements_by_tag_name(&self, root: NodeId, tag: &str) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_by_tag(root, &tag.to_ascii_lowercase(), &mut out);
        out
    }

    fn inner_text(&self, element: NodeId) -> String {
        let mut out = String::new();
        self.text_of(element, &mut out);
        out.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form() -> (MemoryDom, NodeId, NodeId) {
        let mut dom = MemoryDom::new();
        let form = dom.append_element(dom.document(), "form");
        dom.set_attribute(form, "class", "checkout wide");
        let input = dom.append_element(form, "INPUT");
        dom.set_attribute(input, "id", "email");
        dom.set_attribute(input, "type", "text");
        (dom, form, input)
    }

    #[test]
    fn test_compound_selectors() {
        let (dom, form, input) = form();

        assert!(dom.matches_selector(form, "form"));
        assert!(dom.matches_selector(form, ".checkout"));
        assert!(dom.matches_selector(form, "form.wide.checkout"));
        assert!(dom.matches_selector(input, "input#email[type=text]"));
        assert!(dom.matches_selector(input, "button, [type='text']"));
        assert!(dom.matches_selector(input, "*"));
        assert!(!dom.matches_selector(input, "form input"));
        assert!(!dom.matches_selector(input, "#other"));
        assert!(!dom.matches_selector(dom.document(), "*"));
    }

    #[test]
    fn test_parents_and_properties() {
        let (mut dom, form, input) = form();
        dom.set_property(input, ElementProperty::Value, "a@b.c");

        assert_eq!(dom.parent_element(input), Some(form));
        assert_eq!(dom.parent_element(form), None);
        assert_eq!(dom.parent_node(form), Some(dom.document()));
        assert_eq!(dom.property(input, ElementProperty::Value).as_deref(), Some("a@b.c"));
        assert_eq!(dom.property(input, ElementProperty::TagName).as_deref(), Some("INPUT"));
        assert_eq!(dom.property(form, ElementProperty::Href), None);
        assert_eq!(ElementProperty::from_name("className"), Some(ElementProperty::ClassName));
        assert_eq!(ElementProperty::from_name("onclick"), None);
    }

    #[test]
    fn test_labels_and_text() {
        let (mut dom, form, _) = form();
        let label = dom.append_element(form, "label");
        dom.set_attribute(label, "for", "email");
        dom.append_text(label, " E-Mail ");

        assert_eq!(dom.elements_by_tag_name(form, "LABEL"), vec![label]);
        assert_eq!(dom.inner_text(label), "E-Mail");
        assert_eq!(dom.element_by_id("email").map(|n| dom.is_element(n)), Some(true));
    }
}
