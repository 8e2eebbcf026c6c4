//! Minimal style diffs against memoized baseline styles

use crate::context::CaptureContext;
use crate::css::Declarations;
use crate::platform::{BrowserEngine, ElementName, Host};
use crate::Result;
use log::warn;
use std::rc::Rc;

/// Computed style snapshot of an element or pseudo-element
pub type ComputedStyle = Declarations;

/// Properties whose value differs from the baseline or carries `!important`
pub type StyleDiff = Declarations;

/// Marker class for elements with `background-clip: text`
pub const BACKGROUND_CLIP_TEXT_CLASS: &str = "______background-clip--text";

/// Layout-dependent properties never compared against the baseline
const IGNORED_IN_BASELINE: [&str; 3] = ["width", "height", "-webkit-text-fill-color"];

/// Presentation attributes that change an SVG element's default style
const BASELINE_ATTRIBUTES: [&str; 2] = ["stroke", "fill"];

const ALWAYS_STRIPPED: [&str; 4] = ["transition-property", "all", "d", "content"];

const ROOT_MARGINS: [&str; 8] = [
    "margin-top",
    "margin-right",
    "margin-bottom",
    "margin-left",
    "margin-block-start",
    "margin-block-end",
    "margin-inline-start",
    "margin-inline-end",
];

/// SVG elements other than `<svg>` itself get an `svg` signature prefix
fn is_svg_child(name: &ElementName) -> bool {
    name.is_svg() && name.tag() != "svg"
}

/// The attributes that take part in the baseline signature
pub fn baseline_attributes(name: &ElementName, attributes: &[(String, String)]) -> Vec<(String, String)> {
    if !is_svg_child(name) {
        return Vec::new();
    }
    BASELINE_ATTRIBUTES
        .iter()
        .filter_map(|wanted| attributes.iter().find(|(k, _)| k == wanted).cloned())
        .collect()
}

/// Cache key for a baseline style: `[svg:]tag[:stroke=..,fill=..][:pseudo]`
pub fn baseline_key(name: &ElementName, attributes: &[(String, String)], pseudo: Option<&str>) -> String {
    let attrs = baseline_attributes(name, attributes)
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");
    let tag = name.tag();
    [
        if is_svg_child(name) { "svg" } else { "" },
        tag.as_str(),
        attrs.as_str(),
        pseudo.unwrap_or(""),
    ]
    .iter()
    .filter(|part| !part.is_empty())
    .copied()
    .collect::<Vec<_>>()
    .join(":")
}

/// Entries of `style` that differ from `baseline` or are `!important`.
///
/// Names listed in `inherited` are treated as absent from the baseline, so a
/// property set on the parent's clone is always restated on the child.
pub fn diff_styles(
    style: &ComputedStyle,
    baseline: &ComputedStyle,
    inherited: Option<&StyleDiff>,
    include: Option<&[String]>,
) -> StyleDiff {
    let names: Vec<&str> = match include {
        Some(list) => list.iter().map(String::as_str).collect(),
        None => style.names().collect(),
    };
    let mut diff = StyleDiff::new();
    for name in names {
        let Some(decl) = style.get(name) else { continue };
        let masked = inherited.map_or(false, |p| p.contains(name));
        let same = !masked && baseline.value(name) == Some(decl.value.as_str());
        if same && !decl.important {
            continue;
        }
        diff.set(name, decl.value.clone(), decl.important);
    }
    diff
}

impl<'h, H: Host> CaptureContext<'h, H> {
    /// Memoized default style for an element signature.
    ///
    /// Falls back to an empty baseline when the sandbox is gone or fails.
    pub(crate) fn default_style(
        &self,
        name: &ElementName,
        attributes: &[(String, String)],
        pseudo: Option<&str>,
    ) -> Rc<ComputedStyle> {
        let key = baseline_key(name, attributes, pseudo);
        if let Some(cached) = self.default_computed_styles.borrow().get(&key) {
            return cached.clone();
        }
        let mut style = match &self.sandbox {
            Some(sandbox) => sandbox
                .default_style(name, &baseline_attributes(name, attributes), pseudo)
                .unwrap_or_else(|e| {
                    warn!("{} failed to compute default style for {}: {}", self.log_prefix(), key, e);
                    ComputedStyle::new()
                }),
            None => ComputedStyle::new(),
        };
        for ignored in IGNORED_IN_BASELINE {
            style.remove(ignored);
        }
        let style = Rc::new(style);
        self.default_computed_styles
            .borrow_mut()
            .insert(key, style.clone());
        style
    }

    /// Style diff to inline on the clone of `node`.
    pub(crate) fn element_style_diff(
        &self,
        node: &H::Node,
        name: &ElementName,
        attributes: &[(String, String)],
        is_root: bool,
        parent_style: Option<&StyleDiff>,
    ) -> Result<StyleDiff> {
        let computed = self.host.computed_style(node, None)?;
        let baseline = self.default_style(name, attributes, None);
        let mut diff = diff_styles(
            &computed,
            &baseline,
            parent_style,
            self.config.include_style_properties.as_deref(),
        );
        for name in ALWAYS_STRIPPED {
            diff.remove(name);
        }
        if is_root {
            for name in ROOT_MARGINS {
                diff.remove(name);
            }
            diff.set("box-sizing", "border-box", false);
        }
        if self.host.engine() == BrowserEngine::Blink {
            if !diff.contains("font-kerning") {
                diff.set("font-kerning", "normal", false);
            }
            let hidden = diff.value("overflow-x") == Some("hidden") || diff.value("overflow-y") == Some("hidden");
            if hidden && diff.value("text-overflow") == Some("ellipsis") {
                let metrics = self.host.scroll_metrics(node);
                if metrics.scroll_width == metrics.client_width {
                    diff.set("text-overflow", "clip", false);
                }
            }
        }
        Ok(diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decls(pairs: &[(&str, &str)]) -> Declarations {
        pairs.iter().copied().collect()
    }

    #[test]
    fn key_includes_svg_attributes_and_pseudo() {
        let attrs = vec![
            ("fill".to_string(), "red".to_string()),
            ("stroke".to_string(), "blue".to_string()),
            ("id".to_string(), "x".to_string()),
        ];
        assert_eq!(
            baseline_key(&ElementName::svg("path"), &attrs, None),
            "svg:path:stroke=blue,fill=red"
        );
        assert_eq!(baseline_key(&ElementName::svg("svg"), &attrs, None), "svg");
        assert_eq!(baseline_key(&ElementName::html("DIV"), &attrs, Some(":before")), "div::before");
        assert_ne!(
            baseline_key(&ElementName::svg("path"), &attrs[..1], None),
            baseline_key(&ElementName::svg("path"), &attrs[1..2], None)
        );
    }

    #[test]
    fn diff_keeps_only_changed_or_important() {
        let mut style = decls(&[("color", "red"), ("display", "block"), ("margin-top", "0px")]);
        style.set("margin-top", "0px", true);
        let baseline = decls(&[("color", "black"), ("display", "block"), ("margin-top", "0px")]);
        let diff = diff_styles(&style, &baseline, None, None);
        assert_eq!(diff.names().collect::<Vec<_>>(), vec!["color", "margin-top"]);
        for d in diff.iter() {
            assert!(d.important || baseline.value(&d.name) != Some(d.value.as_str()));
        }
    }

    #[test]
    fn parent_entries_are_restated() {
        let style = decls(&[("color", "black"), ("display", "block")]);
        let baseline = decls(&[("color", "black"), ("display", "block")]);
        let parent = decls(&[("color", "red")]);
        let diff = diff_styles(&style, &baseline, Some(&parent), None);
        assert_eq!(diff.value("color"), Some("black"));
        assert!(!diff.contains("display"));
    }

    #[test]
    fn include_list_restricts_names() {
        let style = decls(&[("color", "red"), ("display", "flex")]);
        let include = vec!["display".to_string(), "opacity".to_string()];
        let diff = diff_styles(&style, &Declarations::new(), None, Some(&include));
        assert_eq!(diff.names().collect::<Vec<_>>(), vec!["display"]);
    }
}
