//! SVG wrapper around the cloned tree

use crate::context::CaptureContext;
use crate::dom::{Document, Namespace, NodeId};
use crate::platform::Host;
use crate::style::BACKGROUND_CLIP_TEXT_CLASS;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

pub const SVG_DATA_URL_PREFIX: &str = "data:image/svg+xml;charset=utf-8,";

/// Characters `encodeURIComponent` leaves alone
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Characters an XML parser rejects in SVG markup
fn is_control_character(c: char) -> bool {
    matches!(c, '\u{0}'..='\u{8}' | '\u{b}' | '\u{c}' | '\u{e}'..='\u{1f}' | '\u{fffe}' | '\u{ffff}')
}

/// Percent-encode serialized SVG into a data URL.
pub fn svg_to_data_url(markup: &str, remove_control_character: bool) -> String {
    let cleaned;
    let markup = if remove_control_character {
        cleaned = markup.chars().filter(|c| !is_control_character(*c)).collect::<String>();
        cleaned.as_str()
    } else {
        markup
    };
    format!("{}{}", SVG_DATA_URL_PREFIX, utf8_percent_encode(markup, URI_COMPONENT))
}

/// `<svg width height viewBox>` sized to the capture
pub(crate) fn create_svg(doc: &mut Document, width: f64, height: f64) -> NodeId {
    let svg = doc.create_element("svg", Namespace::Svg);
    if let Some(el) = doc.element_mut(svg) {
        el.set_attr("width", width.to_string());
        el.set_attr("height", height.to_string());
        el.set_attr("viewBox", format!("0 0 {} {}", width, height));
    }
    svg
}

/// Place `clone` in a full-size `foreignObject` of a new SVG.
pub(crate) fn create_foreign_object_svg(doc: &mut Document, clone: NodeId, width: f64, height: f64) -> NodeId {
    let svg = create_svg(doc, width, height);
    let foreign_object = doc.create_element("foreignObject", Namespace::Svg);
    if let Some(el) = doc.element_mut(foreign_object) {
        el.set_attr("x", "0%");
        el.set_attr("y", "0%");
        el.set_attr("width", "100%");
        el.set_attr("height", "100%");
    }
    doc.append_child(foreign_object, clone);
    doc.append_child(svg, foreign_object);
    svg
}

/// Stylesheet text for the SVG: the background-clip helper, grouped
/// pseudo-element rules and inlined font faces.
pub(crate) fn style_text(svg_styles: &[(String, Vec<String>)], font_css: &[String]) -> String {
    let mut text = format!(
        "\n.{} {{\n  background-clip: text;\n  -webkit-background-clip: text;\n}}\n",
        BACKGROUND_CLIP_TEXT_CLASS
    );
    for (css_text, selectors) in svg_styles {
        text.push_str(&format!("{} {{\n  {}\n}}\n", selectors.join(",\n"), css_text));
    }
    for css in font_css {
        text.push_str(css);
        text.push('\n');
    }
    text
}

impl<'h, H: Host> CaptureContext<'h, H> {
    /// Wrap the clone and prepend `<style>` and `<defs>`.
    pub(crate) fn assemble_svg(&self, clone: NodeId) -> NodeId {
        let css = style_text(&self.svg_styles.borrow(), &self.font_css.borrow());
        let defs = self.defs.get();
        let mut doc = self.document.borrow_mut();
        let svg = create_foreign_object_svg(&mut doc, clone, self.width, self.height);

        let defs = defs.unwrap_or_else(|| doc.create_element("defs", Namespace::Svg));
        doc.prepend_child(svg, defs);

        let style = doc.create_element("style", Namespace::Html);
        let text = doc.create_text(css);
        doc.append_child(style, text);
        doc.prepend_child(svg, style);
        svg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_matches_uri_component_encoding() {
        let url = svg_to_data_url("<svg a='1'>x y&#</svg>", false);
        assert_eq!(
            url,
            "data:image/svg+xml;charset=utf-8,%3Csvg%20a%3D'1'%3Ex%20y%26%23%3C%2Fsvg%3E"
        );
        assert!(svg_to_data_url("é", false).ends_with("%C3%A9"));
    }

    #[test]
    fn control_characters_are_optional_to_strip() {
        assert_eq!(svg_to_data_url("a\u{1}\u{b}b\n", true), svg_to_data_url("ab\n", false));
        assert!(svg_to_data_url("a\u{1}", false).ends_with("a%01"));
    }

    #[test]
    fn style_groups_selectors_per_rule() {
        let styles = vec![(
            "content: 'x';\n  color: red;".to_string(),
            vec![".a:before".to_string(), ".b:after".to_string()],
        )];
        let text = style_text(&styles, &["@font-face { font-family: A }".to_string()]);
        assert!(text.starts_with("\n.______background-clip--text {\n"));
        assert!(text.contains(".a:before,\n.b:after {\n  content: 'x';\n  color: red;\n}\n"));
        assert!(text.ends_with("@font-face { font-family: A }\n"));
    }

    #[test]
    fn foreign_object_fills_the_svg() {
        let mut doc = Document::new();
        let div = doc.create_element("div", Namespace::Html);
        let svg = create_foreign_object_svg(&mut doc, div, 120.0, 80.5);
        let el = doc.element(svg).unwrap();
        assert_eq!(el.attr("viewBox"), Some("0 0 120 80.5"));
        assert_eq!(el.attr("width"), Some("120"));
        let fo = doc.first_child(svg).unwrap();
        assert_eq!(doc.element(fo).unwrap().attr("width"), Some("100%"));
        assert_eq!(doc.children(fo), &[div]);
    }
}
