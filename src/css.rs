//! CSS text helpers
//!
//! The engine never runs a full CSS parser. It needs ordered declaration
//! lists, `url()` rewriting, rule splitting for fetched stylesheets and a few
//! `@font-face` accessors, all of which live here.

use std::collections::HashMap;
use url::Url;

/// A single `name: value [!important]` entry
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub name: String,
    pub value: String,
    pub important: bool,
}

/// Ordered list of declarations with by-name lookup.
///
/// Used for computed styles, style diffs and inline styles. Setting an
/// existing property replaces its value in place and keeps its position.
#[derive(Debug, Clone, Default)]
pub struct Declarations {
    entries: Vec<Declaration>,
    index: HashMap<String, usize>,
}

impl PartialEq for Declarations {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Declarations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the body of a declaration block (`color: red; margin: 0 !important`).
    pub fn parse(text: &str) -> Self {
        let mut out = Self::new();
        for part in split_top_level(text, ';') {
            let Some(colon) = part.find(':') else { continue };
            let name = part[..colon].trim().to_ascii_lowercase();
            if name.is_empty() {
                continue;
            }
            let (value, important) = strip_important(part[colon + 1..].trim());
            out.set(&name, value, important);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Declaration> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).map(|d| d.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>, important: bool) {
        let value = value.into();
        match self.index.get(name) {
            Some(&i) => {
                self.entries[i].value = value;
                self.entries[i].important = important;
            }
            None => {
                self.index.insert(name.to_string(), self.entries.len());
                self.entries.push(Declaration {
                    name: name.to_string(),
                    value,
                    important,
                });
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Declaration> {
        let i = self.index.remove(name)?;
        let removed = self.entries.remove(i);
        for slot in self.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        Some(removed)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Declaration> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|d| d.name.as_str())
    }

    /// Serialize as the value of a `style` attribute.
    pub fn to_css_text(&self) -> String {
        self.entries
            .iter()
            .map(|d| {
                if d.important {
                    format!("{}: {} !important;", d.name, d.value)
                } else {
                    format!("{}: {};", d.name, d.value)
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Declarations {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        let mut out = Declarations::new();
        for (name, value) in iter {
            out.set(name, value, false);
        }
        out
    }
}

fn strip_important(value: &str) -> (String, bool) {
    let lower = value.to_ascii_lowercase();
    if let Some(pos) = lower.rfind('!') {
        if lower[pos + 1..].trim() == "important" {
            return (value[..pos].trim_end().to_string(), true);
        }
    }
    (value.to_string(), false)
}

/// Split `text` on `sep` where it is not nested in parentheses or quotes.
pub fn split_top_level(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, ch) in text.char_indices() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None => match ch {
                '"' | '\'' => quote = Some(ch),
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                c if c == sep && depth == 0 => {
                    parts.push(&text[start..i]);
                    start = i + c.len_utf8();
                }
                _ => {}
            },
        }
    }
    if start < text.len() {
        parts.push(&text[start..]);
    }
    parts
}

// ---------------------------------------------------------------------------
// url() tokens
// ---------------------------------------------------------------------------

/// A `url(...)` token located in CSS text
#[derive(Debug, Clone, PartialEq)]
pub struct CssUrl {
    /// Byte range of the whole token, `url(` through `)`
    pub start: usize,
    pub end: usize,
    pub quote: Option<char>,
    pub value: String,
}

/// Locate every `url()` token. Values containing quotes are not tokens.
pub fn find_urls(text: &str) -> Vec<CssUrl> {
    let mut found = Vec::new();
    let bytes = text.as_bytes();
    let mut from = 0;
    while let Some(rel) = text[from..].find("url(") {
        let start = from + rel;
        let mut pos = start + 4;
        let quote = match bytes.get(pos) {
            Some(b'"') => Some('"'),
            Some(b'\'') => Some('\''),
            _ => None,
        };
        if quote.is_some() {
            pos += 1;
        }
        let rest = &text[pos..];
        let parsed = match quote {
            Some(q) => rest.find(q).and_then(|close| {
                (rest.as_bytes().get(close + 1) == Some(&b')'))
                    .then(|| (&rest[..close], pos + close + 2))
            }),
            None => rest.find(')').map(|close| (&rest[..close], pos + close + 1)),
        };
        match parsed {
            Some((value, end)) if !value.is_empty() && !value.contains(['"', '\'']) => {
                found.push(CssUrl {
                    start,
                    end,
                    quote,
                    value: value.to_string(),
                });
                from = end;
            }
            _ => from = start + 4,
        }
    }
    found
}

pub fn has_css_url(text: &str) -> bool {
    !find_urls(text).is_empty()
}

pub fn is_data_url(url: &str) -> bool {
    url.starts_with("data:")
}

/// `(raw, resolved)` pairs for every non-data `url()` in `text`, deduplicated.
pub fn parse_css_urls(text: &str, base: Option<&Url>) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    for token in find_urls(text) {
        if is_data_url(&token.value) || out.iter().any(|(raw, _)| *raw == token.value) {
            continue;
        }
        let resolved = resolve_url(&token.value, base);
        out.push((token.value, resolved));
    }
    out
}

/// Replace every `url()` whose value equals `raw`, keeping its quoting.
pub fn replace_css_url(text: &str, raw: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for token in find_urls(text) {
        if token.value != raw {
            continue;
        }
        out.push_str(&text[last..token.start]);
        let q = token.quote.map(String::from).unwrap_or_default();
        out.push_str(&format!("url({q}{replacement}{q})"));
        last = token.end;
    }
    out.push_str(&text[last..]);
    out
}

/// Rewrite every relative `url()` to an absolute one against `base`.
pub fn absolutize_urls(text: &str, base: &Url) -> String {
    let mut out = text.to_string();
    for (raw, resolved) in parse_css_urls(text, Some(base)) {
        if raw != resolved {
            out = replace_css_url(&out, &raw, &resolved);
        }
    }
    out
}

/// Resolve `url` the way an anchor's `href` would be resolved.
pub fn resolve_url(url: &str, base: Option<&Url>) -> String {
    if let Some((scheme, rest)) = url.split_once("://") {
        if is_scheme(scheme) && !rest.is_empty() {
            return url.to_string();
        }
    }
    if let Some(rest) = url.strip_prefix("//") {
        return match base {
            Some(b) => format!("{}://{}", b.scheme(), rest),
            None => url.to_string(),
        };
    }
    if let Some((scheme, _)) = url.split_once(':') {
        if is_scheme(scheme) {
            return url.to_string();
        }
    }
    match base.and_then(|b| b.join(url).ok()) {
        Some(joined) => joined.to_string(),
        None => url.to_string(),
    }
}

fn is_scheme(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphabetic())
}

/// Split a `font-family` value into normalized family names.
pub fn split_font_family(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|f| f.trim().replace(['"', '\''], "").to_lowercase())
        .filter(|f| !f.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// Strip `/* */` comments.
pub fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find("*/") {
            Some(end) => rest = &rest[start + 2 + end + 2..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Split a stylesheet into top-level rule texts.
///
/// Block rules (`@media`, `@keyframes`, style rules) are kept whole with
/// their nested blocks; statement at-rules such as `@import` end at `;`.
pub fn parse_css(source: &str) -> Vec<String> {
    let text = strip_comments(source);
    let bytes = text.as_bytes();
    let mut rules = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let start = i;
        let mut depth = 0usize;
        let mut quote: Option<u8> = None;
        let mut end = bytes.len();
        while i < bytes.len() {
            let b = bytes[i];
            match quote {
                Some(q) if b == q => quote = None,
                Some(_) => {}
                None => match b {
                    b'"' | b'\'' => quote = Some(b),
                    b'{' => depth += 1,
                    b'}' => {
                        depth = depth.saturating_sub(1);
                        if depth == 0 {
                            end = i + 1;
                            i += 1;
                            break;
                        }
                    }
                    b';' if depth == 0 => {
                        end = i + 1;
                        i += 1;
                        break;
                    }
                    _ => {}
                },
            }
            i += 1;
        }
        let rule = text[start..end.min(text.len())].trim();
        if !rule.is_empty() && rule != ";" {
            rules.push(rule.to_string());
        }
    }
    rules
}

pub fn is_font_face_rule(rule: &str) -> bool {
    rule.trim_start().to_ascii_lowercase().starts_with("@font-face")
}

/// The target of an `@import` rule, if `rule` is one.
pub fn import_href(rule: &str) -> Option<String> {
    let trimmed = rule.trim_start();
    if !trimmed.to_ascii_lowercase().starts_with("@import") {
        return None;
    }
    let rest = trimmed[7..].trim_start();
    if let Some(token) = find_urls(rest).into_iter().next() {
        if token.start == 0 {
            return Some(token.value);
        }
    }
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let inner = &rest[1..];
    inner.find(quote).map(|end| inner[..end].to_string())
}

/// The declaration block of a rule (text between the outer braces).
pub fn rule_body(rule: &str) -> Option<&str> {
    let open = rule.find('{')?;
    let close = rule.rfind('}')?;
    (close > open).then(|| &rule[open + 1..close])
}

/// A declaration value inside a rule's block.
pub fn rule_property(rule: &str, name: &str) -> Option<String> {
    let body = rule_body(rule)?;
    Declarations::parse(body).value(name).map(str::to_string)
}

/// Reduce every multi-format `src:` list to the alternative whose
/// `format()` equals `preferred`. Lists without such an entry are left alone.
pub fn filter_preferred_format(css: &str, preferred: Option<&str>) -> String {
    let Some(preferred) = preferred else {
        return css.to_string();
    };
    let mut out = String::with_capacity(css.len());
    let mut rest = css;
    while let Some(pos) = find_src_property(rest) {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 4..];
        let value_len = declaration_value_len(after);
        let value = &after[..value_len];
        let mut consumed = pos + 4 + value_len;
        let terminated = rest[consumed..].starts_with(';');
        if terminated {
            consumed += 1;
        }
        let choice = split_top_level(value, ',')
            .into_iter()
            .map(str::trim)
            .find(|alt| font_format(alt).as_deref() == Some(preferred));
        match choice {
            Some(alt) => out.push_str(&format!("src: {};", alt)),
            None => out.push_str(&rest[pos..consumed]),
        }
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    out
}

fn find_src_property(text: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(rel) = text[from..].find("src:") {
        let pos = from + rel;
        let boundary = text[..pos]
            .chars()
            .next_back()
            .map_or(true, |c| c.is_whitespace() || c == ';' || c == '{');
        if boundary {
            return Some(pos);
        }
        from = pos + 4;
    }
    None
}

/// Length of a declaration value up to its `;` or closing `}`.
fn declaration_value_len(text: &str) -> usize {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (i, ch) in text.char_indices() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None => match ch {
                '"' | '\'' => quote = Some(ch),
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                ';' | '}' if depth == 0 => return i,
                _ => {}
            },
        }
    }
    text.len()
}

fn font_format(alternative: &str) -> Option<String> {
    let pos = alternative.find("format(")?;
    let inner = &alternative[pos + 7..];
    let end = inner.find(')')?;
    Some(inner[..end].trim().trim_matches(['"', '\'']).to_string())
}

/// Parse a `unicode-range` descriptor into inclusive code point ranges.
pub fn parse_unicode_range(value: &str) -> Vec<(u32, u32)> {
    let mut ranges = Vec::new();
    for item in value.split(',') {
        let item = item.trim();
        let Some(hex) = item.strip_prefix("U+").or_else(|| item.strip_prefix("u+")) else {
            continue;
        };
        let parsed = if let Some((lo, hi)) = hex.split_once('-') {
            u32::from_str_radix(lo, 16)
                .ok()
                .zip(u32::from_str_radix(hi, 16).ok())
        } else if hex.contains('?') {
            let lo = u32::from_str_radix(&hex.replace('?', "0"), 16).ok();
            let hi = u32::from_str_radix(&hex.replace('?', "F"), 16).ok();
            lo.zip(hi)
        } else {
            u32::from_str_radix(hex, 16).ok().map(|v| (v, v))
        };
        if let Some(range) = parsed {
            ranges.push(range);
        }
    }
    ranges
}

pub fn unicode_range_covers(ranges: &[(u32, u32)], ch: char) -> bool {
    let cp = ch as u32;
    ranges.iter().any(|&(lo, hi)| lo <= cp && cp <= hi)
}

// ---------------------------------------------------------------------------
// Transform matrix
// ---------------------------------------------------------------------------

/// A CSS transform matrix in `DOMMatrix` layout (`m[0]` = m11, `m[15]` = m44).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix {
    m: [f64; 16],
    is_2d: bool,
}

impl Default for Matrix {
    fn default() -> Self {
        let mut m = [0.0; 16];
        m[0] = 1.0;
        m[5] = 1.0;
        m[10] = 1.0;
        m[15] = 1.0;
        Self { m, is_2d: true }
    }
}

impl Matrix {
    /// Parse a computed `transform` value (`none`, `matrix()` or `matrix3d()`).
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() || value == "none" {
            return Some(Self::default());
        }
        let (name, args) = value.split_once('(')?;
        let args: Vec<f64> = args
            .trim_end_matches(')')
            .split(',')
            .map(|a| a.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .ok()?;
        let mut out = Self::default();
        match (name.trim(), args.len()) {
            ("matrix", 6) => {
                out.m[0] = args[0];
                out.m[1] = args[1];
                out.m[4] = args[2];
                out.m[5] = args[3];
                out.m[12] = args[4];
                out.m[13] = args[5];
            }
            ("matrix3d", 16) => {
                out.m.copy_from_slice(&args);
                out.is_2d = false;
            }
            _ => return None,
        }
        Some(out)
    }

    /// Translate in the matrix's own coordinate space as if its linear 2×2
    /// part were the identity, leaving rotation and scale untouched.
    pub fn translate_keeping_linear(&mut self, tx: f64, ty: f64) {
        let m = &mut self.m;
        m[12] += tx;
        m[13] += ty;
        m[14] += m[2] * tx + m[6] * ty;
        m[15] += m[3] * tx + m[7] * ty;
    }

    pub fn to_css(&self) -> String {
        let fmt = |v: f64| if v == 0.0 { "0".to_string() } else { format!("{}", v) };
        if self.is_2d {
            let m = &self.m;
            format!(
                "matrix({}, {}, {}, {}, {}, {})",
                fmt(m[0]),
                fmt(m[1]),
                fmt(m[4]),
                fmt(m[5]),
                fmt(m[12]),
                fmt(m[13])
            )
        } else {
            let parts: Vec<String> = self.m.iter().map(|v| fmt(*v)).collect();
            format!("matrix3d({})", parts.join(", "))
        }
    }
}
