use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use tracing::warn;

use crate::combine::{ContentIter, PageIter};
use crate::page::{PageContent, PageRef};
use crate::site::{NamespaceTable, Site};

/// How a set of patterns is combined when matching one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantifier {
    All,
    Any,
    None,
}

impl Quantifier {
    fn accepts(self, patterns: &[Regex], haystack: &str) -> bool {
        match self {
            Quantifier::All => patterns.iter().all(|p| p.is_match(haystack)),
            Quantifier::Any => patterns.iter().any(|p| p.is_match(haystack)),
            Quantifier::None => !patterns.iter().any(|p| p.is_match(haystack)),
        }
    }
}

/// Compile title/content filter patterns; case-insensitive by default.
pub fn compile_patterns(patterns: &[String], case_sensitive: bool) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(!case_sensitive)
                .build()
                .with_context(|| format!("invalid filter pattern: {pattern}"))
        })
        .collect()
}

/// Drop pages whose namespace id is not in the resolved set.
pub fn namespace_filter(
    source: impl Iterator<Item = PageRef> + 'static,
    allowed: BTreeSet<i32>,
) -> PageIter {
    Box::new(source.filter(move |page| allowed.contains(&page.namespace)))
}

/// Keep pages whose full title satisfies the quantifier over `patterns`.
pub fn title_filter(
    source: impl Iterator<Item = PageRef> + 'static,
    patterns: Vec<Regex>,
    quantifier: Quantifier,
) -> PageIter {
    Box::new(source.filter(move |page| quantifier.accepts(&patterns, &page.title)))
}

/// Keep pages whose text satisfies the quantifier over `patterns`. Requires
/// loaded text, so it must run after the preloading stage.
pub fn content_filter(
    source: impl Iterator<Item = PageContent> + 'static,
    patterns: Vec<Regex>,
    quantifier: Quantifier,
) -> ContentIter {
    Box::new(source.filter(move |content| quantifier.accepts(&patterns, &content.text)))
}

/// Keep pages that are members of every one of `categories` (AND semantics).
pub fn category_filter(
    source: impl Iterator<Item = PageRef> + 'static,
    site: Site,
    categories: Vec<String>,
) -> PageIter {
    let wanted: Vec<String> = categories.iter().map(|c| normalize_category(c)).collect();
    Box::new(source.filter(move |page| {
        let member_of = match site.borrow_mut().categories_of(page) {
            Ok(list) => list,
            Err(error) => {
                warn!(title = %page.title, error = %error, "category lookup failed, dropping page");
                return false;
            }
        };
        let member_of: Vec<String> = member_of.iter().map(|c| normalize_category(c)).collect();
        wanted.iter().all(|want| member_of.contains(want))
    }))
}

fn normalize_category(name: &str) -> String {
    let name = name.trim().replace('_', " ");
    let name = name.strip_prefix("Category:").unwrap_or(&name);
    name.to_lowercase()
}

/// Keep proofread pages whose quality level is in `levels`; pages outside
/// the site's proofread namespace pass through unchanged.
pub fn quality_filter(
    source: impl Iterator<Item = PageRef> + 'static,
    site: Site,
    levels: BTreeSet<u8>,
) -> PageIter {
    let proofread_ns = match site.borrow_mut().proofread_namespace() {
        Ok(ns) => ns,
        Err(error) => {
            warn!(error = %error, "could not determine proofread namespace");
            None
        }
    };
    Box::new(source.filter(move |page| {
        let Some(ns) = proofread_ns else {
            return true;
        };
        if page.namespace != ns {
            return true;
        }
        match site.borrow_mut().quality_level(page) {
            Ok(Some(level)) => levels.contains(&level),
            Ok(None) => false,
            Err(error) => {
                warn!(title = %page.title, error = %error, "quality lookup failed, dropping page");
                false
            }
        }
    }))
}

/// Keep pages whose subpage depth is at most `max_depth`. Depth is
/// namespace-aware: slashes only count in namespaces with subpage support.
pub fn subpage_filter(
    source: impl Iterator<Item = PageRef> + 'static,
    table: NamespaceTable,
    max_depth: usize,
) -> PageIter {
    Box::new(source.filter(move |page| {
        page.depth(table.supports_subpages(page.namespace)) <= max_depth
    }))
}

/// Keep pages whose latest-edit timestamp falls in the inclusive range.
pub fn edit_time_filter(
    source: impl Iterator<Item = PageContent> + 'static,
    after: Option<DateTime<Utc>>,
    before: Option<DateTime<Utc>>,
) -> ContentIter {
    Box::new(source.filter(move |content| {
        if let Some(after) = after
            && content.timestamp < after
        {
            return false;
        }
        if let Some(before) = before
            && content.timestamp > before
        {
            return false;
        }
        true
    }))
}

/// Keep pages whose wikibase item carries every claim in `required` and none
/// in `forbidden`, each claim a (property, value) pair.
pub fn claim_filter(
    source: impl Iterator<Item = PageRef> + 'static,
    site: Site,
    required: Vec<(String, String)>,
    forbidden: Vec<(String, String)>,
) -> PageIter {
    Box::new(source.filter(move |page| {
        let claims = match site.borrow_mut().item_claims(page) {
            Ok(claims) => claims,
            Err(error) => {
                warn!(title = %page.title, error = %error, "claim lookup failed, dropping page");
                return false;
            }
        };
        required.iter().all(|claim| claims.contains(claim))
            && !forbidden.iter().any(|claim| claims.contains(claim))
    }))
}
