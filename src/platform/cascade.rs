//! Style cascade for static documents
//!
//! Computes a browser-like computed style from initial values, inheritance,
//! user agent defaults and author declarations. Values are kept as authored
//! except for colors, which are normalized to `rgb()`/`rgba()`.

use crate::css::{parse_css, rule_body, split_top_level, Declarations};
use crate::dom::Namespace;
use crate::rendering::software::parse_css_color;
use crate::style::ComputedStyle;

/// Inherited properties with their initial values
const INHERITED: [(&str, &str); 22] = [
    ("color", "rgb(0, 0, 0)"),
    ("cursor", "auto"),
    ("direction", "ltr"),
    ("fill", "rgb(0, 0, 0)"),
    ("font-family", "\"Times New Roman\""),
    ("font-kerning", "auto"),
    ("font-size", "16px"),
    ("font-style", "normal"),
    ("font-weight", "400"),
    ("letter-spacing", "normal"),
    ("line-height", "normal"),
    ("list-style-image", "none"),
    ("list-style-position", "outside"),
    ("list-style-type", "disc"),
    ("stroke", "none"),
    ("stroke-width", "1px"),
    ("text-align", "start"),
    ("text-indent", "0px"),
    ("text-transform", "none"),
    ("visibility", "visible"),
    ("white-space", "normal"),
    ("word-spacing", "0px"),
];

/// Non-inherited properties with their initial values
const NON_INHERITED: [(&str, &str); 45] = [
    ("background-clip", "border-box"),
    ("background-color", "rgba(0, 0, 0, 0)"),
    ("background-image", "none"),
    ("background-position", "0% 0%"),
    ("background-repeat", "repeat"),
    ("background-size", "auto"),
    ("border-bottom-color", "currentcolor"),
    ("border-bottom-style", "none"),
    ("border-bottom-width", "0px"),
    ("border-image-source", "none"),
    ("border-left-color", "currentcolor"),
    ("border-left-style", "none"),
    ("border-left-width", "0px"),
    ("border-right-color", "currentcolor"),
    ("border-right-style", "none"),
    ("border-right-width", "0px"),
    ("border-top-color", "currentcolor"),
    ("border-top-style", "none"),
    ("border-top-width", "0px"),
    ("bottom", "auto"),
    ("box-shadow", "none"),
    ("box-sizing", "content-box"),
    ("content", "normal"),
    ("display", "inline"),
    ("float", "none"),
    ("height", "auto"),
    ("left", "auto"),
    ("margin-bottom", "0px"),
    ("margin-left", "0px"),
    ("margin-right", "0px"),
    ("margin-top", "0px"),
    ("opacity", "1"),
    ("overflow-x", "visible"),
    ("overflow-y", "visible"),
    ("padding-bottom", "0px"),
    ("padding-left", "0px"),
    ("padding-right", "0px"),
    ("padding-top", "0px"),
    ("position", "static"),
    ("right", "auto"),
    ("text-decoration-line", "none"),
    ("text-overflow", "clip"),
    ("top", "auto"),
    ("transform", "none"),
    ("width", "auto"),
];

const BLOCK_ELEMENTS: [&str; 27] = [
    "address", "article", "aside", "blockquote", "body", "dd", "div", "dl", "dt", "fieldset", "figure",
    "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "html", "main", "nav", "p", "pre",
    "section",
];

const HIDDEN_ELEMENTS: [&str; 9] = [
    "head", "link", "meta", "noscript", "script", "style", "template", "title", "datalist",
];

const SIDES: [&str; 4] = ["top", "right", "bottom", "left"];

/// User agent declarations for an HTML tag
fn user_agent_defaults(tag: &str) -> Vec<(&'static str, &'static str)> {
    let mut out = Vec::new();
    if BLOCK_ELEMENTS.contains(&tag) {
        out.push(("display", "block"));
    }
    if HIDDEN_ELEMENTS.contains(&tag) {
        out.push(("display", "none"));
    }
    let heading = |size: &'static str, margin: &'static str| {
        vec![
            ("font-size", size),
            ("font-weight", "700"),
            ("margin-top", margin),
            ("margin-bottom", margin),
        ]
    };
    match tag {
        "body" => out.push(("margin", "8px")),
        "p" | "blockquote" | "dl" | "figure" => {
            out.extend([("margin-top", "16px"), ("margin-bottom", "16px")])
        }
        "h1" => out.extend(heading("32px", "21.44px")),
        "h2" => out.extend(heading("24px", "19.92px")),
        "h3" => out.extend(heading("18.72px", "18.72px")),
        "h4" => out.extend(heading("16px", "21.28px")),
        "h5" => out.extend(heading("13.28px", "22.18px")),
        "h6" => out.extend(heading("10.72px", "24.98px")),
        "b" | "strong" => out.push(("font-weight", "700")),
        "i" | "em" | "cite" => out.push(("font-style", "italic")),
        "a" => out.extend([
            ("color", "rgb(0, 0, 238)"),
            ("text-decoration-line", "underline"),
            ("cursor", "pointer"),
        ]),
        "ul" | "ol" => out.extend([
            ("display", "block"),
            ("margin-top", "16px"),
            ("margin-bottom", "16px"),
            ("padding-left", "40px"),
        ]),
        "li" => out.push(("display", "list-item")),
        "pre" | "code" | "kbd" | "samp" => out.push(("font-family", "monospace")),
        "input" | "button" | "select" | "textarea" => out.push(("display", "inline-block")),
        "table" => out.push(("display", "table")),
        "tr" => out.push(("display", "table-row")),
        "td" => out.push(("display", "table-cell")),
        "th" => out.extend([("display", "table-cell"), ("font-weight", "700")]),
        "thead" => out.push(("display", "table-header-group")),
        "tbody" => out.push(("display", "table-row-group")),
        _ => {}
    }
    if tag == "ol" {
        out.push(("list-style-type", "decimal"));
    }
    if tag == "pre" {
        out.push(("white-space", "pre"));
    }
    out
}

/// `rgb()`/`rgba()` form of a CSS color, if it parses
pub(crate) fn normalize_color(value: &str) -> Option<String> {
    let c = parse_css_color(value)?;
    if c[3] == 255 {
        Some(format!("rgb({}, {}, {})", c[0], c[1], c[2]))
    } else {
        let alpha = (c[3] as f64 / 255.0 * 100.0).round() / 100.0;
        Some(format!("rgba({}, {}, {}, {})", c[0], c[1], c[2], alpha))
    }
}

fn is_color_property(name: &str) -> bool {
    name.ends_with("color") || name == "fill" || name == "stroke"
}

fn normalize_value(name: &str, value: &str) -> String {
    let value = value.trim();
    if is_color_property(name) {
        if let Some(color) = normalize_color(value) {
            return color;
        }
    }
    if value == "0" && (name.starts_with("margin") || name.starts_with("padding") || name.ends_with("width")) {
        return "0px".to_string();
    }
    match (name, value) {
        ("font-weight", "normal") => "400".to_string(),
        ("font-weight", "bold") => "700".to_string(),
        _ => value.to_string(),
    }
}

/// Expand a 1 to 4 value box shorthand into top, right, bottom, left
fn box_values(value: &str) -> Option<[String; 4]> {
    let parts: Vec<&str> = split_top_level(value, ' ')
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    let [t, r, b, l] = match parts.as_slice() {
        [a] => [*a, *a, *a, *a],
        [a, b] => [*a, *b, *a, *b],
        [a, b, c] => [*a, *b, *c, *b],
        [a, b, c, d] => [*a, *b, *c, *d],
        _ => return None,
    };
    Some([t.to_string(), r.to_string(), b.to_string(), l.to_string()])
}

const BORDER_STYLES: [&str; 10] = [
    "none", "hidden", "dotted", "dashed", "solid", "double", "groove", "ridge", "inset", "outset",
];

fn border_parts(value: &str) -> (Option<String>, Option<String>, Option<String>) {
    let (mut width, mut style, mut color) = (None, None, None);
    for token in split_top_level(value, ' ').into_iter().map(str::trim).filter(|t| !t.is_empty()) {
        if BORDER_STYLES.contains(&token) {
            style = Some(token.to_string());
        } else if token.starts_with(|c: char| c.is_ascii_digit() || c == '.')
            || matches!(token, "thin" | "medium" | "thick")
        {
            width = Some(token.to_string());
        } else {
            color = Some(token.to_string());
        }
    }
    (width, style, color)
}

/// Longhand declarations for `name: value`
pub(crate) fn expand(name: &str, value: &str) -> Vec<(String, String)> {
    let name = name.trim().to_ascii_lowercase();
    let value = value.trim();
    let sides = |prefix: &str, suffix: &str| -> Vec<String> {
        SIDES.iter().map(|s| format!("{}{}{}", prefix, s, suffix)).collect()
    };
    let per_side = |names: Vec<String>, values: [String; 4]| -> Vec<(String, String)> {
        names.into_iter().zip(values).collect()
    };
    match name.as_str() {
        "margin" | "padding" => match box_values(value) {
            Some(values) => per_side(sides(&format!("{}-", name), ""), values),
            None => Vec::new(),
        },
        "border-width" | "border-style" | "border-color" => {
            let suffix = &name["border".len()..];
            match box_values(value) {
                Some(values) => per_side(sides("border-", suffix), values),
                None => Vec::new(),
            }
        }
        "overflow" => {
            let parts: Vec<&str> = value.split_whitespace().collect();
            match parts.as_slice() {
                [x] => vec![("overflow-x".into(), x.to_string()), ("overflow-y".into(), x.to_string())],
                [x, y] => vec![("overflow-x".into(), x.to_string()), ("overflow-y".into(), y.to_string())],
                _ => Vec::new(),
            }
        }
        "border" | "border-top" | "border-right" | "border-bottom" | "border-left" => {
            let targets: Vec<&str> = match name.strip_prefix("border-") {
                Some(side) => vec![side],
                None => SIDES.to_vec(),
            };
            let (width, style, color) = border_parts(value);
            let style = style.unwrap_or_else(|| "none".to_string());
            let width = width.unwrap_or_else(|| "medium".to_string());
            let color = color.unwrap_or_else(|| "currentcolor".to_string());
            targets
                .into_iter()
                .flat_map(|side| {
                    [
                        (format!("border-{}-width", side), width.clone()),
                        (format!("border-{}-style", side), style.clone()),
                        (format!("border-{}-color", side), color.clone()),
                    ]
                })
                .collect()
        }
        "background" => {
            let mut out = vec![
                ("background-color".to_string(), "rgba(0, 0, 0, 0)".to_string()),
                ("background-image".to_string(), "none".to_string()),
            ];
            for token in split_top_level(value, ' ').into_iter().map(str::trim) {
                if token.starts_with("url(") || token.contains("gradient(") {
                    out[1].1 = token.to_string();
                } else if normalize_color(token).is_some() {
                    out[0].1 = token.to_string();
                }
            }
            out
        }
        "text-decoration" => vec![(
            "text-decoration-line".to_string(),
            value.split_whitespace().next().unwrap_or("none").to_string(),
        )],
        _ => vec![(name, value.to_string())],
    }
}

fn initial_value(name: &str) -> Option<&'static str> {
    INHERITED
        .iter()
        .chain(NON_INHERITED.iter())
        .find(|(n, _)| *n == name)
        .map(|(_, v)| *v)
}

fn is_inherited(name: &str) -> bool {
    INHERITED.iter().any(|(n, _)| *n == name)
}

/// Apply one authored declaration to `style`.
pub(crate) fn apply_declaration(style: &mut ComputedStyle, name: &str, value: &str, parent: Option<&ComputedStyle>) {
    for (name, value) in expand(name, value) {
        let value = match value.as_str() {
            "inherit" => match parent.and_then(|p| p.value(&name)).or_else(|| initial_value(&name)) {
                Some(v) => v.to_string(),
                None => continue,
            },
            "initial" => match initial_value(&name) {
                Some(v) => v.to_string(),
                None => continue,
            },
            "unset" => {
                let inherited = if is_inherited(&name) { parent.and_then(|p| p.value(&name)) } else { None };
                match inherited.or_else(|| initial_value(&name)) {
                    Some(v) => v.to_string(),
                    None => continue,
                }
            }
            _ => normalize_value(&name, &value),
        };
        style.set(&name, value, false);
    }
}

/// Resolve values that depend on other properties.
pub(crate) fn finish(style: &mut ComputedStyle) {
    let color = style.value("color").unwrap_or("rgb(0, 0, 0)").to_string();
    let names: Vec<String> = style.names().map(str::to_string).collect();
    for name in names {
        if style.value(&name) == Some("currentcolor") {
            style.set(&name, color.clone(), false);
        }
    }
    for side in SIDES {
        let style_name = format!("border-{}-style", side);
        let width_name = format!("border-{}-width", side);
        match style.value(&style_name) {
            Some("none") | Some("hidden") | None => style.set(&width_name, "0px", false),
            _ => {
                let width = match style.value(&width_name) {
                    Some("thin") => Some("1px"),
                    Some("medium") => Some("3px"),
                    Some("thick") => Some("5px"),
                    _ => None,
                };
                if let Some(width) = width {
                    style.set(&width_name, width, false);
                }
            }
        }
    }
}

/// Style of an element before author rules apply: initial values,
/// inheritance from `parent`, UA defaults and SVG presentation attributes.
pub(crate) fn base_style(
    tag: &str,
    namespace: Namespace,
    presentation: &[(String, String)],
    parent: Option<&ComputedStyle>,
    pseudo: Option<&str>,
) -> ComputedStyle {
    let mut style = ComputedStyle::new();
    for (name, initial) in INHERITED {
        let value = parent.and_then(|p| p.value(name)).unwrap_or(initial);
        style.set(name, value, false);
    }
    for (name, initial) in NON_INHERITED {
        style.set(name, initial, false);
    }
    if pseudo.is_some() {
        style.set("content", "none", false);
        return style;
    }
    if namespace == Namespace::Html {
        for (name, value) in user_agent_defaults(tag) {
            apply_declaration(&mut style, name, value, parent);
        }
    } else {
        for (name, value) in presentation {
            if name == "fill" || name == "stroke" {
                apply_declaration(&mut style, name, value, parent);
            }
        }
    }
    style
}

/// A style rule flattened to one selector
#[derive(Debug, Clone)]
pub(crate) struct FlatRule {
    pub selector: String,
    pub pseudo: Option<String>,
    pub specificity: u32,
    pub declarations: Declarations,
}

/// Split a trailing pseudo-element off a selector.
///
/// `a::before` and `a:before` both give `("a", Some(":before"))`.
pub(crate) fn split_pseudo_element(selector: &str) -> (String, Option<String>) {
    const LEGACY: [&str; 2] = [":before", ":after"];
    let selector = selector.trim();
    if let Some(pos) = selector.find("::") {
        let base = selector[..pos].trim();
        let pseudo = format!(":{}", &selector[pos + 2..]);
        return (if base.is_empty() { "*".to_string() } else { base.to_string() }, Some(pseudo));
    }
    for legacy in LEGACY {
        if let Some(base) = selector.strip_suffix(legacy) {
            let base = base.trim();
            return (
                if base.is_empty() { "*".to_string() } else { base.to_string() },
                Some(legacy.to_string()),
            );
        }
    }
    (selector.to_string(), None)
}

/// Selector specificity packed as `ids << 16 | classes << 8 | types`
pub(crate) fn specificity(selector: &str) -> u32 {
    let (mut ids, mut classes, mut types) = (0u32, 0u32, 0u32);
    let mut chars = selector.chars().peekable();
    let mut at_compound_start = true;
    while let Some(c) = chars.next() {
        match c {
            '#' => ids += 1,
            '.' => classes += 1,
            '[' => {
                classes += 1;
                for n in chars.by_ref() {
                    if n == ']' {
                        break;
                    }
                }
            }
            ':' => {
                if chars.peek() == Some(&':') {
                    chars.next();
                    types += 1;
                } else {
                    classes += 1;
                }
                while matches!(chars.peek(), Some(n) if n.is_alphanumeric() || *n == '-') {
                    chars.next();
                }
                at_compound_start = false;
                continue;
            }
            ' ' | '>' | '+' | '~' => {
                at_compound_start = true;
                continue;
            }
            c if at_compound_start && (c.is_alphabetic()) => types += 1,
            _ => {}
        }
        at_compound_start = false;
    }
    (ids.min(255) << 16) | (classes.min(255) << 8) | types.min(255)
}

/// Flatten a stylesheet's rules into single-selector style rules.
/// At-rules are skipped.
pub(crate) fn flatten_rules(rules: &[String]) -> Vec<FlatRule> {
    let mut out = Vec::new();
    for rule in rules {
        let trimmed = rule.trim_start();
        if trimmed.starts_with('@') {
            continue;
        }
        let (Some(open), Some(body)) = (trimmed.find('{'), rule_body(trimmed)) else { continue };
        let declarations = Declarations::parse(body);
        for selector in split_top_level(&trimmed[..open], ',') {
            let (base, pseudo) = split_pseudo_element(selector);
            if base.is_empty() {
                continue;
            }
            out.push(FlatRule {
                specificity: specificity(selector.trim()),
                selector: base,
                pseudo,
                declarations: declarations.clone(),
            });
        }
    }
    out
}

/// Rules of a stylesheet source
pub(crate) fn parse_rules(source: &str) -> Vec<String> {
    parse_css(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorthands_expand_to_longhands() {
        let margin = expand("margin", "1px 2px");
        assert_eq!(
            margin,
            vec![
                ("margin-top".to_string(), "1px".to_string()),
                ("margin-right".to_string(), "2px".to_string()),
                ("margin-bottom".to_string(), "1px".to_string()),
                ("margin-left".to_string(), "2px".to_string()),
            ]
        );
        let overflow = expand("overflow", "hidden auto");
        assert_eq!(overflow[1], ("overflow-y".to_string(), "auto".to_string()));
        let background = expand("background", "#fff url(a.png) no-repeat");
        assert_eq!(background[0].1, "#fff");
        assert_eq!(background[1].1, "url(a.png)");
    }

    #[test]
    fn header_cells_are_bold_table_cells() {
        let th = user_agent_defaults("th");
        assert!(th.contains(&("display", "table-cell")));
        assert!(th.contains(&("font-weight", "700")));
        assert_eq!(user_agent_defaults("td"), vec![("display", "table-cell")]);
    }

    #[test]
    fn border_resolves_width_and_color() {
        let mut style = base_style("div", Namespace::Html, &[], None, None);
        apply_declaration(&mut style, "color", "red", None);
        apply_declaration(&mut style, "border", "solid", None);
        finish(&mut style);
        assert_eq!(style.value("border-top-width"), Some("3px"));
        assert_eq!(style.value("border-left-color"), Some("rgb(255, 0, 0)"));
        assert_eq!(style.value("display"), Some("block"));
    }

    #[test]
    fn inheritance_and_keywords() {
        let mut parent = base_style("div", Namespace::Html, &[], None, None);
        apply_declaration(&mut parent, "color", "#00f", None);
        apply_declaration(&mut parent, "padding", "4px", None);
        let mut child = base_style("span", Namespace::Html, &[], Some(&parent), None);
        assert_eq!(child.value("color"), Some("rgb(0, 0, 255)"));
        assert_eq!(child.value("padding-top"), Some("0px"));
        apply_declaration(&mut child, "padding-top", "inherit", Some(&parent));
        assert_eq!(child.value("padding-top"), Some("4px"));
        apply_declaration(&mut child, "color", "initial", Some(&parent));
        assert_eq!(child.value("color"), Some("rgb(0, 0, 0)"));
    }

    #[test]
    fn pseudo_selectors_and_specificity() {
        assert_eq!(split_pseudo_element("p.note::before"), ("p.note".to_string(), Some(":before".to_string())));
        assert_eq!(split_pseudo_element(".x:after"), (".x".to_string(), Some(":after".to_string())));
        assert_eq!(
            split_pseudo_element("::-webkit-scrollbar"),
            ("*".to_string(), Some(":-webkit-scrollbar".to_string()))
        );
        assert!(specificity("#a") > specificity(".a.b"));
        assert!(specificity(".a") > specificity("div p"));
        assert_eq!(specificity("div p"), 2);
    }

    #[test]
    fn rules_flatten_per_selector() {
        let rules = parse_rules("h1, .t::after { color: red } @media print { p { color: blue } }");
        let flat = flatten_rules(&rules);
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[1].selector, ".t");
        assert_eq!(flat[1].pseudo.as_deref(), Some(":after"));
        assert_eq!(flat[0].declarations.value("color"), Some("red"));
    }
}
