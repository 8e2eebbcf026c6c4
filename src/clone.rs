//! Recursive cloning of the source tree into the capture document

use crate::context::CaptureContext;
use crate::css::{resolve_url, split_font_family, Declarations, Matrix};
use crate::dom::{Document, Element, Namespace, NodeData, NodeId};
use crate::platform::{ElementName, Host, MediaLoad, NodeKind};
use crate::style::{diff_styles, StyleDiff, BACKGROUND_CLIP_TEXT_CLASS};
use crate::FilterNode;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use log::warn;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::time::Duration;

const PSEUDO_ELEMENTS: [&str; 2] = [":before", ":after"];

const SCROLLBAR_PSEUDO_ELEMENTS: [&str; 7] = [
    ":-webkit-scrollbar",
    ":-webkit-scrollbar-button",
    ":-webkit-scrollbar-thumb",
    ":-webkit-scrollbar-track",
    ":-webkit-scrollbar-track-piece",
    ":-webkit-scrollbar-corner",
    ":-webkit-resizer",
];

/// Parents and children across which style inheritance is not assumed
const EXCLUDED_PARENT_NODES: [&str; 1] = ["symbol"];

const FORM_CONTROLS: [&str; 3] = ["textarea", "input", "select"];

/// Attribute names made only of word characters, `-` and `:`
fn is_normal_attribute(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ':')
}

/// Drop quotes and `counter()` calls from a `content` value
fn strip_pseudo_content(content: &str) -> String {
    let mut text: String = content.chars().filter(|c| *c != '"' && *c != '\'').collect();
    if let Some(start) = text.find("counter(") {
        if let Some(end) = text.rfind(')').filter(|end| *end > start) {
            text.replace_range(start..=end, "");
        }
    }
    text
}

/// Records the characters an element's text renders in its font families
pub(crate) struct FontRecorder {
    families: Vec<String>,
    text_transform: Option<String>,
}

impl FontRecorder {
    fn from_style(style: &StyleDiff) -> Option<Self> {
        let families = split_font_family(style.value("font-family")?);
        Some(Self {
            families,
            text_transform: style.value("text-transform").map(str::to_string),
        })
    }

    fn transform(&self, text: &str) -> String {
        match self.text_transform.as_deref() {
            Some("uppercase") => text.to_uppercase(),
            Some("lowercase") => text.to_lowercase(),
            Some("capitalize") => {
                let mut chars = text.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => String::new(),
                }
            }
            _ => text.to_string(),
        }
    }

    fn record<H: Host>(&self, ctx: &CaptureContext<'_, H>, text: &str) {
        let text = self.transform(text);
        let mut usage = ctx.font_families.borrow_mut();
        for family in &self.families {
            usage
                .entry(family.clone())
                .or_insert_with(BTreeSet::new)
                .extend(text.chars());
        }
    }
}

/// Copy a host subtree verbatim, without style inlining.
pub(crate) fn copy_host_subtree<H: Host>(host: &H, doc: &mut Document, node: &H::Node) -> Option<NodeId> {
    match host.node_kind(node) {
        NodeKind::Text => Some(doc.create_text(host.text(node).unwrap_or_default())),
        NodeKind::Element => {
            let name = host.element_name(node)?;
            let id = doc.create_node(NodeData::Element(plain_element(&name, host.attributes(node), true)));
            for child in host.children(node) {
                if let Some(c) = copy_host_subtree(host, doc, &child) {
                    doc.append_child(id, c);
                }
            }
            Some(id)
        }
        _ => None,
    }
}

fn plain_element(name: &ElementName, attributes: Vec<(String, String)>, keep_style: bool) -> Element {
    let mut el = Element::new(name.local.clone(), name.namespace);
    for (k, v) in attributes {
        if k == "style" {
            if keep_style {
                el.style = Declarations::parse(&v);
            }
            continue;
        }
        el.attrs.push((k, v));
    }
    el
}

fn create_image(doc: &mut Document, src: &str) -> NodeId {
    let id = doc.create_element("img", Namespace::Html);
    if let Some(el) = doc.element_mut(id) {
        el.set_attr("decoding", "sync");
        el.set_attr("loading", "eager");
        el.set_attr("src", src);
    }
    id
}

pub(crate) fn encode_png_data_url(pixels: &image::RgbaImage) -> crate::Result<String> {
    let mut buf = std::io::Cursor::new(Vec::new());
    pixels.write_to(&mut buf, image::ImageFormat::Png)?;
    Ok(format!("data:image/png;base64,{}", STANDARD.encode(buf.into_inner())))
}

impl<'h, H: Host> CaptureContext<'h, H> {
    /// Clone `node` and its subtree. Returns `None` for nodes that are not copied.
    pub(crate) fn clone_node<'a>(
        &'a self,
        node: H::Node,
        is_root: bool,
        parent_style: Option<Rc<StyleDiff>>,
        recorder: Option<Rc<FontRecorder>>,
    ) -> LocalBoxFuture<'a, Option<NodeId>> {
        async move {
            match self.host.node_kind(&node) {
                NodeKind::Text => {
                    let text = self.host.text(&node).unwrap_or_default();
                    if let Some(recorder) = &recorder {
                        if text.chars().any(|c| !c.is_whitespace()) {
                            recorder.record(self, &text);
                        }
                    }
                    Some(self.document.borrow_mut().create_text(text))
                }
                NodeKind::Element => self.clone_element(node, is_root, parent_style).await,
                NodeKind::Comment | NodeKind::Other => None,
            }
        }
        .boxed_local()
    }

    async fn clone_element(
        &self,
        node: H::Node,
        is_root: bool,
        parent_style: Option<Rc<StyleDiff>>,
    ) -> Option<NodeId> {
        let name = self.host.element_name(&node)?;
        let attributes = self.host.attributes(&node);
        let id = self.clone_shallow(&node, &name, &attributes).await;

        let style = match self.element_style_diff(&node, &name, &attributes, is_root, parent_style.as_deref()) {
            Ok(style) => style,
            Err(e) => {
                warn!("{} failed to copy styles of <{}>: {}", self.log_prefix(), name.local, e);
                StyleDiff::new()
            }
        };

        {
            let mut doc = self.document.borrow_mut();
            if let Some(el) = doc.element_mut(id) {
                if self.config.features.remove_abnormal_attributes {
                    el.attrs.retain(|(k, _)| is_normal_attribute(k));
                }
                el.style = style.clone();
                if style.value("background-clip") == Some("text") {
                    el.add_class(BACKGROUND_CLIP_TEXT_CLASS);
                }
                if is_root {
                    self.apply_root_options(el);
                }
            }
        }

        let copy_scrollbar = self.config.features.copy_scrollbar && {
            let overflow = [style.value("overflow-x"), style.value("overflow-y")];
            overflow.contains(&Some("scroll"))
                || ((overflow.contains(&Some("auto")) || overflow.contains(&Some("overlay")))
                    && self.host.scroll_metrics(&node).overflows())
        };

        let recorder = FontRecorder::from_style(&style).map(Rc::new);
        let style = Rc::new(style);
        self.copy_pseudo_elements(&node, &name, &attributes, id, copy_scrollbar, &style, recorder.as_deref());

        let tag = name.tag();
        if name.namespace == Namespace::Html && FORM_CONTROLS.contains(&tag.as_str()) {
            if let Some(value) = self.host.form_value(&node) {
                if let Some(el) = self.document.borrow_mut().element_mut(id) {
                    el.set_attr("value", value);
                }
            }
        }

        if !(name.namespace == Namespace::Html && tag == "video") {
            self.clone_children(&node, id, style, recorder).await;
        }
        Some(id)
    }

    fn apply_root_options(&self, el: &mut Element) {
        if let Some(color) = &self.config.background_color {
            el.style.set("background-color", color.clone(), true);
        }
        if self.width > 0.0 {
            el.style.set("width", format!("{}px", self.width), true);
        }
        if self.height > 0.0 {
            el.style.set("height", format!("{}px", self.height), true);
        }
        for (name, value) in &self.config.style {
            el.style.set(name, value.clone(), false);
        }
    }

    /// Element-kind specific shallow clone
    async fn clone_shallow(&self, node: &H::Node, name: &ElementName, attributes: &[(String, String)]) -> NodeId {
        if name.namespace == Namespace::Html {
            match name.tag().as_str() {
                "canvas" => return self.clone_canvas(node, name, attributes),
                "iframe" => {
                    if let Some(id) = self.clone_iframe(node).await {
                        return id;
                    }
                }
                "img" => return self.clone_image(node, name, attributes),
                "video" => return self.clone_video(node, name, attributes).await,
                _ => {}
            }
        }
        self.plain_clone(name, attributes)
    }

    fn plain_clone(&self, name: &ElementName, attributes: &[(String, String)]) -> NodeId {
        let el = plain_element(name, attributes.to_vec(), false);
        self.document.borrow_mut().create_node(NodeData::Element(el))
    }

    fn clone_canvas(&self, node: &H::Node, name: &ElementName, attributes: &[(String, String)]) -> NodeId {
        match self.host.canvas_data_url(node) {
            Ok(url) if url != "data:," => return create_image(&mut self.document.borrow_mut(), &url),
            Ok(_) => {}
            Err(e) => warn!("{} failed to clone canvas: {}", self.log_prefix(), e),
        }
        match self.host.canvas_pixels(node).and_then(|pixels| encode_png_data_url(&pixels)) {
            Ok(url) => create_image(&mut self.document.borrow_mut(), &url),
            Err(e) => {
                warn!("{} failed to copy canvas pixels: {}", self.log_prefix(), e);
                self.plain_clone(name, attributes)
            }
        }
    }

    async fn clone_iframe(&self, node: &H::Node) -> Option<NodeId> {
        match self.host.frame_body(node) {
            Ok(Some(body)) => self.clone_node(body, false, None, None).await,
            Ok(None) => None,
            Err(e) => {
                warn!("{} failed to clone iframe: {}", self.log_prefix(), e);
                None
            }
        }
    }

    fn clone_image(&self, node: &H::Node, name: &ElementName, attributes: &[(String, String)]) -> NodeId {
        let id = self.plain_clone(name, attributes);
        let base = self.host.base_url();
        let mut doc = self.document.borrow_mut();
        if let Some(el) = doc.element_mut(id) {
            if let Some(current) = self.host.current_src(node).filter(|s| !s.is_empty()) {
                let src = el.attr("src").map(|s| resolve_url(s, base.as_ref()));
                if src.as_deref() != Some(current.as_str()) {
                    el.set_attr("src", current);
                    el.set_attr("srcset", "");
                }
            }
            if el.attr("loading") == Some("lazy") {
                el.set_attr("loading", "eager");
            }
            el.set_attr("decoding", "sync");
        }
        id
    }

    async fn clone_video(&self, node: &H::Node, name: &ElementName, attributes: &[(String, String)]) -> NodeId {
        let state = self.host.video(node).unwrap_or_default();
        let poster_or = |fallback: NodeId| match state.poster() {
            Some(poster) => create_image(&mut self.document.borrow_mut(), poster),
            None => fallback,
        };
        if state.shows_poster_only() {
            if let Some(poster) = state.poster() {
                return create_image(&mut self.document.borrow_mut(), poster);
            }
        }

        let id = self.plain_clone(name, attributes);
        if let Some(el) = self.document.borrow_mut().element_mut(id) {
            el.set_attr("crossorigin", "anonymous");
            if let (Some(current), src) = (state.current_src.as_deref(), state.src.as_deref()) {
                if !current.is_empty() && Some(current) != src {
                    el.set_attr("src", current);
                }
            }
        }

        let limit = Duration::from_millis(self.config.timeout_ms);
        match tokio::time::timeout(limit, self.host.wait_media_ready(node)).await {
            Ok(MediaLoad::Ready) => {}
            Ok(MediaLoad::Failed(reason)) => {
                warn!("{} failed video load {:?}: {}", self.log_prefix(), state.playing_src(), reason);
                return poster_or(id);
            }
            Err(_) => warn!("{} video not ready after {}ms", self.log_prefix(), self.config.timeout_ms),
        }

        let frame = tokio::time::timeout(limit, self.host.capture_video_frame(node, state.current_time)).await;
        match frame {
            Ok(Ok(url)) if url != "data:," => create_image(&mut self.document.borrow_mut(), &url),
            Ok(Ok(_)) => poster_or(id),
            Ok(Err(e)) => {
                warn!("{} failed to clone video: {}", self.log_prefix(), e);
                poster_or(id)
            }
            Err(_) => {
                warn!("{} timed out capturing video frame", self.log_prefix());
                poster_or(id)
            }
        }
    }

    /// Turn generated content into class-scoped rules on the clone.
    #[allow(clippy::too_many_arguments)]
    fn copy_pseudo_elements(
        &self,
        node: &H::Node,
        name: &ElementName,
        attributes: &[(String, String)],
        cloned: NodeId,
        copy_scrollbar: bool,
        node_style: &StyleDiff,
        recorder: Option<&FontRecorder>,
    ) {
        let scrollbar: &[&str] = if copy_scrollbar { &SCROLLBAR_PSEUDO_ELEMENTS } else { &[] };
        for pseudo in PSEUDO_ELEMENTS.iter().chain(scrollbar.iter()) {
            let computed = match self.host.computed_style(node, Some(pseudo)) {
                Ok(computed) => computed,
                Err(e) => {
                    warn!("{} failed to read {} style: {}", self.log_prefix(), pseudo, e);
                    continue;
                }
            };
            let content = match computed.value("content") {
                Some(c) if !c.is_empty() && c != "none" => c.to_string(),
                _ => continue,
            };
            if let Some(recorder) = recorder {
                recorder.record(self, &content);
            }
            let content = strip_pseudo_content(&content);

            let baseline = self.default_style(name, attributes, Some(pseudo));
            let mut diff = diff_styles(
                &computed,
                &baseline,
                Some(node_style),
                self.config.include_style_properties.as_deref(),
            );
            diff.remove("content");
            diff.remove("-webkit-locale");

            let mut doc = self.document.borrow_mut();
            let Some(el) = doc.element_mut(cloned) else { return };
            if diff.value("background-clip") == Some("text") {
                el.add_class(BACKGROUND_CLIP_TEXT_CLASS);
            }
            if diff.is_empty() {
                continue;
            }
            let class = self.next_pseudo_class();
            el.add_class(&class);

            let mut lines = vec![format!("content: '{}';", content)];
            lines.extend(diff.iter().map(|d| {
                if d.important {
                    format!("{}: {} !important;", d.name, d.value)
                } else {
                    format!("{}: {};", d.name, d.value)
                }
            }));
            let css_text = lines.join("\n  ");
            let selector = format!(".{}:{}", class, pseudo);

            let mut svg_styles = self.svg_styles.borrow_mut();
            match svg_styles.iter_mut().find(|(text, _)| *text == css_text) {
                Some((_, selectors)) => selectors.push(selector),
                None => svg_styles.push((css_text, vec![selector])),
            }
        }
    }

    async fn clone_children(
        &self,
        node: &H::Node,
        cloned: NodeId,
        style: Rc<StyleDiff>,
        recorder: Option<Rc<FontRecorder>>,
    ) {
        let children = self
            .host
            .shadow_children(node)
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| self.host.children(node));
        for child in children {
            match self.host.node_kind(&child) {
                NodeKind::Comment => continue,
                NodeKind::Element => {
                    let is_slot = self
                        .host
                        .element_name(&child)
                        .map_or(false, |n| n.namespace == Namespace::Html && n.tag() == "slot");
                    if is_slot {
                        if let Some(assigned) = self.host.assigned_nodes(&child) {
                            for slotted in assigned {
                                self.append_child_node(node, cloned, slotted, &style, &recorder).await;
                            }
                            continue;
                        }
                    }
                }
                _ => {}
            }
            self.append_child_node(node, cloned, child, &style, &recorder).await;
        }
    }

    async fn append_child_node(
        &self,
        node: &H::Node,
        cloned: NodeId,
        child: H::Node,
        style: &Rc<StyleDiff>,
        recorder: &Option<Rc<FontRecorder>>,
    ) {
        let kind = self.host.node_kind(&child);
        let child_name = self.host.element_name(&child);
        if let Some(name) = &child_name {
            let tag = name.tag();
            if name.namespace == Namespace::Html && (tag == "style" || tag == "script") {
                return;
            }
        }
        if let Some(filter) = &self.config.filter {
            let attributes = self.host.attributes(&child);
            let info = FilterNode {
                kind,
                name: child_name.as_ref(),
                attributes: &attributes,
            };
            if !filter(&info) {
                return;
            }
        }

        let cloned_tag = self.document.borrow().tag(cloned).unwrap_or_default();
        let child_tag = child_name.as_ref().map(ElementName::tag).unwrap_or_default();
        let parent_style = if EXCLUDED_PARENT_NODES.contains(&cloned_tag.as_str())
            || EXCLUDED_PARENT_NODES.contains(&child_tag.as_str())
        {
            None
        } else {
            Some(style.clone())
        };

        let Some(child_id) = self.clone_node(child, false, parent_style, recorder.clone()).await else {
            return;
        };
        if self.config.features.restore_scroll_position {
            self.restore_scroll_position(node, child_id);
        }
        self.document.borrow_mut().append_child(cloned, child_id);
    }

    /// Offset the cloned child by the parent's scroll position, keeping its
    /// rotation and scale.
    fn restore_scroll_position(&self, node: &H::Node, child: NodeId) {
        let is_html = self
            .host
            .element_name(node)
            .map_or(false, |n| n.namespace == Namespace::Html);
        if !is_html {
            return;
        }
        let metrics = self.host.scroll_metrics(node);
        if metrics.scroll_top == 0.0 && metrics.scroll_left == 0.0 {
            return;
        }
        let mut doc = self.document.borrow_mut();
        let Some(el) = doc.element_mut(child) else { return };
        if el.namespace != Namespace::Html {
            return;
        }
        let current = el.style.value("transform").unwrap_or("none").to_string();
        let Some(mut matrix) = Matrix::parse(&current) else {
            warn!("{} cannot restore scroll position over transform '{}'", self.log_prefix(), current);
            return;
        };
        matrix.translate_keeping_linear(-metrics.scroll_left, -metrics.scroll_top);
        el.style.set("transform", matrix.to_css(), false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abnormal_attribute_names() {
        assert!(is_normal_attribute("data-id"));
        assert!(is_normal_attribute("xlink:href"));
        assert!(is_normal_attribute("aria_label"));
        assert!(!is_normal_attribute("@click"));
        assert!(!is_normal_attribute("x.y"));
        assert!(!is_normal_attribute(""));
    }

    #[test]
    fn pseudo_content_loses_quotes_and_counters() {
        assert_eq!(strip_pseudo_content("\"→\""), "→");
        assert_eq!(strip_pseudo_content("counter(item) \". \""), " . ");
        assert_eq!(strip_pseudo_content("'a'"), "a");
    }

    #[test]
    fn recorder_applies_text_transform() {
        let style: StyleDiff = [("font-family", "\"Inter\", sans-serif"), ("text-transform", "uppercase")]
            .into_iter()
            .collect();
        let recorder = FontRecorder::from_style(&style).unwrap();
        assert_eq!(recorder.families, vec!["inter", "sans-serif"]);
        assert_eq!(recorder.transform("abc"), "ABC");

        let capitalize = FontRecorder {
            families: vec![],
            text_transform: Some("capitalize".to_string()),
        };
        assert_eq!(capitalize.transform("hello world"), "Hello world");
        assert!(FontRecorder::from_style(&StyleDiff::new()).is_none());
    }

    #[test]
    fn plain_element_parses_style_only_when_kept() {
        let attrs = vec![
            ("id".to_string(), "a".to_string()),
            ("style".to_string(), "color: red".to_string()),
        ];
        let kept = plain_element(&ElementName::html("div"), attrs.clone(), true);
        assert_eq!(kept.style.value("color"), Some("red"));
        assert!(!kept.has_attr("style"));
        let dropped = plain_element(&ElementName::html("div"), attrs, false);
        assert!(dropped.style.is_empty());
        assert_eq!(dropped.attr("id"), Some("a"));
    }
}
