//! Web font inlining for the families the clone renders

use crate::context::CaptureContext;
use crate::css::{
    absolutize_urls, filter_preferred_format, has_css_url, import_href, is_font_face_rule, parse_css,
    parse_unicode_range, resolve_url, rule_property, split_font_family, unicode_range_covers,
};
use crate::embed::{RequestKind, Resolved, TaskQueue};
use crate::platform::{Host, ResponseKind, StyleSheet};
use futures::future::join_all;
use futures::FutureExt;
use log::warn;
use std::collections::{BTreeMap, BTreeSet};
use url::Url;

/// Splice fetched `@import` contents into `rules`.
///
/// `fetched` pairs each import's index with its parsed rules. Nested imports
/// land directly after the import that pulled them in; every other rule is
/// appended at the end, in import order.
fn splice_imports(mut rules: Vec<String>, mut fetched: Vec<(usize, Vec<String>)>) -> Vec<String> {
    fetched.sort_by_key(|(index, _)| *index);
    let mut tails = Vec::with_capacity(fetched.len());
    for (index, parsed) in fetched.into_iter().rev() {
        let (nested, other): (Vec<String>, Vec<String>) =
            parsed.into_iter().partition(|rule| rule.trim_start().starts_with("@import"));
        let at = (index + 1).min(rules.len());
        rules.splice(at..at, nested);
        tails.push(other);
    }
    for tail in tails.into_iter().rev() {
        rules.extend(tail);
    }
    rules
}

/// Whether a `@font-face` rule serves any family the clone uses.
///
/// With `minify`, a face whose `unicode-range` covers none of the recorded
/// characters is skipped as well.
fn face_is_used(rule: &str, usage: &BTreeMap<String, BTreeSet<char>>, minify: bool) -> bool {
    if !is_font_face_rule(rule) {
        return false;
    }
    if !rule_property(rule, "src").map_or(false, |src| has_css_url(&src)) {
        return false;
    }
    let families = rule_property(rule, "font-family")
        .map(|f| split_font_family(&f))
        .unwrap_or_default();
    let used: Vec<&BTreeSet<char>> = families.iter().filter_map(|f| usage.get(f)).collect();
    if used.is_empty() {
        return false;
    }
    if !minify {
        return true;
    }
    match rule_property(rule, "unicode-range") {
        Some(range) => {
            let ranges = parse_unicode_range(&range);
            used.iter().any(|chars| chars.iter().any(|c| unicode_range_covers(&ranges, *c)))
        }
        None => true,
    }
}

impl<'h, H: Host> CaptureContext<'h, H> {
    /// Collect inlined `@font-face` CSS for the recorded font usage.
    ///
    /// Memoized faces are appended right away; the rest become tasks on
    /// `queue` that append their CSS once the font files are embedded.
    pub(crate) async fn embed_web_font<'a>(&'a self, queue: &TaskQueue<'a>) {
        let Some(font) = &self.config.font else { return };
        if self.font_families.borrow().is_empty() {
            return;
        }
        let preferred = font.preferred_format.as_deref();

        if let Some(css) = &font.css_text {
            self.font_css.borrow_mut().push(filter_preferred_format(css, preferred));
            return;
        }

        let sheets: Vec<StyleSheet> = self
            .host
            .style_sheets()
            .into_iter()
            .filter(|sheet| match &sheet.rules {
                Some(rules) => !rules.is_empty(),
                None => {
                    warn!(
                        "{} cannot read css rules from {}",
                        self.log_prefix(),
                        sheet.href.as_deref().unwrap_or("inline style")
                    );
                    false
                }
            })
            .collect();
        let sheets = join_all(sheets.into_iter().map(|sheet| self.expand_imports(sheet))).await;

        let usage = self.font_families.borrow().clone();
        for (base, rules) in sheets {
            for rule in rules {
                if !face_is_used(&rule, &usage, font.minify) {
                    continue;
                }
                let memo = self.font_css_texts.borrow().get(&rule).cloned();
                if let Some(css) = memo {
                    self.font_css.borrow_mut().push(css);
                    continue;
                }
                let base = base.clone();
                queue.push(
                    async move {
                        let css = self
                            .replace_css_urls_with_data_urls(rule.clone(), base.as_ref(), false)
                            .await;
                        let css = filter_preferred_format(&css, preferred);
                        self.font_css_texts.borrow_mut().insert(rule, css.clone());
                        self.font_css.borrow_mut().push(css);
                        Ok(())
                    }
                    .boxed_local(),
                );
            }
        }
    }

    /// Fetch the sheet's `@import` targets and splice their rules in.
    /// Returns the sheet's base URL with the expanded rule list.
    async fn expand_imports(&self, sheet: StyleSheet) -> (Option<Url>, Vec<String>) {
        let base = sheet
            .href
            .as_deref()
            .and_then(|href| Url::parse(href).ok())
            .or_else(|| self.host.base_url());
        let rules = sheet.rules.unwrap_or_default();

        let imports: Vec<(usize, String)> = rules
            .iter()
            .enumerate()
            .filter_map(|(index, rule)| import_href(rule).map(|href| (index, resolve_url(&href, base.as_ref()))))
            .collect();
        if imports.is_empty() {
            return (base, rules);
        }

        let fetched = join_all(imports.into_iter().map(|(index, href)| async move {
            let text = self
                .fetch_resource(&href, RequestKind::Text, ResponseKind::Text, None)
                .await
                .and_then(Resolved::into_text)
                .unwrap_or_else(|e| {
                    warn!("{} failed to fetch css import {}: {}", self.log_prefix(), href, e);
                    String::new()
                });
            let text = match Url::parse(&href) {
                Ok(import_base) => absolutize_urls(&text, &import_base),
                Err(_) => text,
            };
            (index, parse_css(&text))
        }))
        .await;

        (base, splice_imports(rules, fetched))
    }
}
