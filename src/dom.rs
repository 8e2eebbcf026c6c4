//! Arena document used for cloned trees and for the static host's source page
//!
//! Nodes are addressed by [`NodeId`] and never move once created. A node is
//! attached to at most one parent; `append_child` detaches it first.

use crate::css::Declarations;
use std::fmt::Write as _;

pub const HTML_NS: &str = "http://www.w3.org/1999/xhtml";
pub const SVG_NS: &str = "http://www.w3.org/2000/svg";
pub const XLINK_NS: &str = "http://www.w3.org/1999/xlink";

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Html,
    Svg,
}

impl Namespace {
    pub fn uri(self) -> &'static str {
        match self {
            Namespace::Html => HTML_NS,
            Namespace::Svg => SVG_NS,
        }
    }
}

/// Element payload. The `style` attribute is kept parsed in `style`.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub namespace: Namespace,
    pub attrs: Vec<(String, String)>,
    pub style: Declarations,
}

impl Element {
    pub fn new(name: impl Into<String>, namespace: Namespace) -> Self {
        Self {
            name: name.into(),
            namespace,
            attrs: Vec::new(),
            style: Declarations::new(),
        }
    }

    /// Lowercased local name
    pub fn tag(&self) -> String {
        self.name.to_ascii_lowercase()
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| k == name) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((name.to_string(), value)),
        }
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let pos = self.attrs.iter().position(|(k, _)| k == name)?;
        Some(self.attrs.remove(pos).1)
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attr("class").unwrap_or("").split_whitespace()
    }

    pub fn add_class(&mut self, class: &str) {
        if self.classes().any(|c| c == class) {
            return;
        }
        let joined = match self.attr("class") {
            Some(existing) if !existing.trim().is_empty() => format!("{} {}", existing.trim(), class),
            _ => class.to_string(),
        };
        self.set_attr("class", joined);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeData {
    Text(String),
    Element(Element),
    Comment(String),
    /// Markup inserted verbatim when serializing
    Raw(String),
}

#[derive(Debug, Clone)]
struct Node {
    data: NodeData,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Debug, Clone, Default)]
pub struct Document {
    nodes: Vec<Node>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push(&mut self, data: NodeData) -> NodeId {
        self.nodes.push(Node {
            data,
            parent: None,
            children: Vec::new(),
        });
        NodeId(self.nodes.len() - 1)
    }

    pub fn create_element(&mut self, name: &str, namespace: Namespace) -> NodeId {
        self.push(NodeData::Element(Element::new(name, namespace)))
    }

    pub fn create_node(&mut self, data: NodeData) -> NodeId {
        self.push(data)
    }

    pub fn create_text(&mut self, text: impl Into<String>) -> NodeId {
        self.push(NodeData::Text(text.into()))
    }

    pub fn create_raw(&mut self, markup: impl Into<String>) -> NodeId {
        self.push(NodeData::Raw(markup.into()))
    }

    pub fn data(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.0].data
    }

    pub fn element(&self, id: NodeId) -> Option<&Element> {
        match &self.nodes[id.0].data {
            NodeData::Element(e) => Some(e),
            _ => None,
        }
    }

    pub fn element_mut(&mut self, id: NodeId) -> Option<&mut Element> {
        match &mut self.nodes[id.0].data {
            NodeData::Element(e) => Some(e),
            _ => None,
        }
    }

    pub fn text(&self, id: NodeId) -> Option<&str> {
        match &self.nodes[id.0].data {
            NodeData::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn tag(&self, id: NodeId) -> Option<String> {
        self.element(id).map(Element::tag)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub fn first_child(&self, id: NodeId) -> Option<NodeId> {
        self.children(id).first().copied()
    }

    fn detach(&mut self, child: NodeId) {
        if let Some(parent) = self.nodes[child.0].parent.take() {
            self.nodes[parent.0].children.retain(|c| *c != child);
        }
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
    }

    /// Insert `child` before `reference`, or append when `reference` is not a child.
    pub fn insert_before(&mut self, parent: NodeId, child: NodeId, reference: Option<NodeId>) {
        self.detach(child);
        self.nodes[child.0].parent = Some(parent);
        let siblings = &mut self.nodes[parent.0].children;
        match reference.and_then(|r| siblings.iter().position(|c| *c == r)) {
            Some(pos) => siblings.insert(pos, child),
            None => siblings.push(child),
        }
    }

    pub fn prepend_child(&mut self, parent: NodeId, child: NodeId) {
        let first = self.first_child(parent);
        self.insert_before(parent, child, first);
    }

    pub fn remove(&mut self, child: NodeId) {
        self.detach(child);
    }

    /// Preorder walk of `root` and its attached descendants.
    pub fn descendants(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.children(id).iter().rev().copied());
        }
        out
    }

    pub fn text_content(&self, id: NodeId) -> String {
        self.descendants(id)
            .into_iter()
            .filter_map(|n| self.text(n))
            .collect()
    }

    /// First element in `root`'s subtree whose `id` attribute equals `value`.
    pub fn find_by_id(&self, root: NodeId, value: &str) -> Option<NodeId> {
        self.descendants(root)
            .into_iter()
            .find(|n| self.element(*n).and_then(|e| e.attr("id")) == Some(value))
    }

    /// Copy the subtree at `id` in `source` into this document, unattached.
    pub fn import_subtree(&mut self, source: &Document, id: NodeId) -> NodeId {
        let copy = self.push(source.data(id).clone());
        for child in source.children(id) {
            let c = self.import_subtree(source, *child);
            self.append_child(copy, c);
        }
        copy
    }

    /// Serialize `id` as XML, declaring namespaces where they change.
    pub fn serialize(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.write_node(&mut out, id, None);
        out
    }

    fn write_node(&self, out: &mut String, id: NodeId, parent_ns: Option<Namespace>) {
        match self.data(id) {
            NodeData::Text(t) => out.push_str(&escape_text(t)),
            NodeData::Raw(markup) => out.push_str(markup),
            NodeData::Comment(c) => {
                let _ = write!(out, "<!--{}-->", c.replace("--", "- -"));
            }
            NodeData::Element(el) => {
                let _ = write!(out, "<{}", el.name);
                if parent_ns != Some(el.namespace) && !el.has_attr("xmlns") {
                    let _ = write!(out, " xmlns=\"{}\"", el.namespace.uri());
                    if el.namespace == Namespace::Svg && !el.has_attr("xmlns:xlink") {
                        let _ = write!(out, " xmlns:xlink=\"{}\"", XLINK_NS);
                    }
                }
                for (k, v) in &el.attrs {
                    if k == "style" {
                        continue;
                    }
                    let _ = write!(out, " {}=\"{}\"", k, escape_attr(v));
                }
                if !el.style.is_empty() {
                    let _ = write!(out, " style=\"{}\"", escape_attr(&el.style.to_css_text()));
                }
                let children = self.children(id);
                let void = el.namespace == Namespace::Html && VOID_ELEMENTS.contains(&el.tag().as_str());
                if children.is_empty() && (void || el.namespace == Namespace::Svg) {
                    out.push_str("/>");
                    return;
                }
                out.push('>');
                for child in children {
                    self.write_node(out, *child, Some(el.namespace));
                }
                let _ = write!(out, "</{}>", el.name);
            }
        }
    }
}

pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    out
}

pub fn escape_attr(value: &str) -> String {
    escape_text(value).replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_detaches_from_previous_parent() {
        let mut doc = Document::new();
        let a = doc.create_element("div", Namespace::Html);
        let b = doc.create_element("div", Namespace::Html);
        let t = doc.create_text("x");
        doc.append_child(a, t);
        doc.append_child(b, t);
        assert!(doc.children(a).is_empty());
        assert_eq!(doc.children(b), &[t]);
        assert_eq!(doc.parent(t), Some(b));
    }

    #[test]
    fn insert_before_and_prepend() {
        let mut doc = Document::new();
        let root = doc.create_element("svg", Namespace::Svg);
        let fo = doc.create_element("foreignObject", Namespace::Svg);
        let defs = doc.create_element("defs", Namespace::Svg);
        let style = doc.create_element("style", Namespace::Svg);
        doc.append_child(root, fo);
        doc.prepend_child(root, defs);
        doc.prepend_child(root, style);
        assert_eq!(doc.children(root), &[style, defs, fo]);
    }

    #[test]
    fn serializes_namespaces_where_they_change() {
        let mut doc = Document::new();
        let svg = doc.create_element("svg", Namespace::Svg);
        let fo = doc.create_element("foreignObject", Namespace::Svg);
        let div = doc.create_element("div", Namespace::Html);
        let br = doc.create_element("br", Namespace::Html);
        let text = doc.create_text("a < b & \"c\"");
        doc.append_child(svg, fo);
        doc.append_child(fo, div);
        doc.append_child(div, text);
        doc.append_child(div, br);
        doc.element_mut(div).unwrap().set_attr("title", "say \"hi\"");
        doc.element_mut(div).unwrap().style.set("color", "red", false);
        let xml = doc.serialize(svg);
        assert_eq!(
            xml,
            "<svg xmlns=\"http://www.w3.org/2000/svg\" xmlns:xlink=\"http://www.w3.org/1999/xlink\">\
             <foreignObject><div xmlns=\"http://www.w3.org/1999/xhtml\" title=\"say &quot;hi&quot;\" style=\"color: red;\">\
             a &lt; b &amp; \"c\"<br/></div></foreignObject></svg>"
        );
    }

    #[test]
    fn classes_are_deduplicated() {
        let mut el = Element::new("p", Namespace::Html);
        el.add_class("a");
        el.add_class("b");
        el.add_class("a");
        assert_eq!(el.attr("class"), Some("a b"));
    }

    #[test]
    fn import_subtree_copies_across_documents() {
        let mut src = Document::new();
        let g = src.create_element("g", Namespace::Svg);
        let path = src.create_element("path", Namespace::Svg);
        src.append_child(g, path);
        src.element_mut(g).unwrap().set_attr("id", "icon");

        let mut dst = Document::new();
        let copy = dst.import_subtree(&src, g);
        assert_eq!(dst.children(copy).len(), 1);
        assert_eq!(dst.find_by_id(copy, "icon"), Some(copy));
    }
}
