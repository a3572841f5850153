//! Exception-aware text replacement.
//!
//! Rules are applied in list order; regions matched by a fix's exceptions
//! (inside named wikitext tags, inside arbitrary regex spans) are subtracted
//! from the candidate match set before substitution. Recursive application
//! re-runs the whole rule list until the text stops changing, bounded by a
//! hard iteration cap since badly authored pairs need not converge.

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use crate::fixes::FixSet;

/// Safety valve for recursive application.
pub const MAX_RECURSION_ROUNDS: usize = 16;

/// One search/replace pair, compiled exactly once before any page is
/// processed. The replacement may carry `$n` group references when the
/// rule came in as a regex.
///
/// The pattern language has no backreferences, so rules that need two
/// parts of a match to agree (the `[[Foo|Foo]]` pipe cleanups) capture
/// both parts and list the group pairs in `same_captures`; candidates
/// where a pair differs are left alone.
#[derive(Debug, Clone)]
pub struct ReplacementRule {
    pub pattern: Regex,
    pub replacement: String,
    pub summary: Option<String>,
    pub title_exceptions: Vec<Regex>,
    pub same_captures: Vec<(usize, usize)>,
}

impl ReplacementRule {
    pub fn build(
        old: &str,
        new: &str,
        is_regex: bool,
        nocase: bool,
        summary: Option<String>,
    ) -> Result<Self> {
        let source = if is_regex {
            old.to_string()
        } else {
            regex::escape(old)
        };
        let pattern = RegexBuilder::new(&source)
            .case_insensitive(nocase)
            .build()
            .with_context(|| format!("invalid replacement pattern: {old}"))?;
        let replacement = if is_regex {
            new.to_string()
        } else {
            // Literal replacements must not be interpreted as expansions.
            new.replace('$', "$$")
        };
        Ok(Self {
            pattern,
            replacement,
            summary,
            title_exceptions: Vec::new(),
            same_captures: Vec::new(),
        })
    }

    pub fn with_title_exceptions(mut self, patterns: Vec<Regex>) -> Self {
        self.title_exceptions = patterns;
        self
    }

    pub fn with_same_captures(mut self, pairs: Vec<(usize, usize)>) -> Self {
        self.same_captures = pairs;
        self
    }
}

/// Regions to skip during substitution, compiled from a fix's exception
/// lists. One instance is shared by all rules of a fix.
#[derive(Debug, Clone, Default)]
pub struct CompiledExceptions {
    pub title: Vec<Regex>,
    pub text_contains: Vec<Regex>,
    pub inside: Vec<Regex>,
    pub inside_tags: Vec<Regex>,
    pub skip_templates: bool,
}

impl CompiledExceptions {
    pub fn title_matches(&self, title: &str) -> bool {
        self.title.iter().any(|pattern| pattern.is_match(title))
    }

    pub fn page_vetoed(&self, text: &str) -> bool {
        self.text_contains.iter().any(|pattern| pattern.is_match(text))
    }

    /// Byte spans of `text` exempt from substitution, sorted by start.
    pub fn exempt_spans(&self, text: &str) -> Vec<(usize, usize)> {
        let mut spans = Vec::new();
        for pattern in self.inside.iter().chain(self.inside_tags.iter()) {
            for found in pattern.find_iter(text) {
                spans.push((found.start(), found.end()));
            }
        }
        if self.skip_templates {
            spans.extend(template_spans(text));
        }
        spans.sort_unstable();
        spans
    }
}

/// Skip-region pattern for a named wikitext tag. `template` is handled by a
/// brace scanner instead, since templates nest.
pub fn tag_pattern(name: &str) -> Result<Option<Regex>> {
    let source = match name {
        "comment" => r"(?s)<!--.*?-->".to_string(),
        "nowiki" | "pre" | "math" | "code" | "gallery" | "timeline" | "source"
        | "syntaxhighlight" => {
            format!(r"(?is)<{name}[^>]*>.*?</{name}>")
        }
        "link" => r"\[\[[^\]]*\]\]".to_string(),
        "hyperlink" => r"https?://[^\s<>\[\]]+".to_string(),
        "header" => r"(?m)^=+.*=+[ \t]*$".to_string(),
        "template" => return Ok(None),
        other => anyhow::bail!("unknown exception tag: {other}"),
    };
    let pattern = Regex::new(&source)
        .with_context(|| format!("invalid tag pattern for {name}"))?;
    Ok(Some(pattern))
}

/// Byte spans of top-level `{{...}}` constructs, including nested templates.
pub fn template_spans(text: &str) -> Vec<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut i = 0usize;
    while i + 1 < bytes.len() {
        if bytes[i] == b'{' && bytes[i + 1] == b'{' {
            if depth == 0 {
                start = i;
            }
            depth += 1;
            i += 2;
        } else if bytes[i] == b'}' && bytes[i + 1] == b'}' && depth > 0 {
            depth -= 1;
            i += 2;
            if depth == 0 {
                spans.push((start, i));
            }
        } else {
            i += 1;
        }
    }
    spans
}

#[derive(Debug, Clone)]
pub struct AppliedRule {
    pub fix: String,
    pub rule: usize,
    pub summary: Option<String>,
    pub old: String,
    pub new: String,
}

#[derive(Debug, Clone)]
pub struct Outcome {
    pub text: String,
    pub applied: Vec<AppliedRule>,
}

impl Outcome {
    pub fn changed(&self, original: &str) -> bool {
        self.text != original
    }
}

/// Applies one or more fixes to page text.
pub struct Replacer {
    groups: Vec<FixSet>,
    recursive: bool,
    max_rounds: usize,
}

impl Replacer {
    pub fn new(groups: Vec<FixSet>) -> Self {
        let recursive = groups.iter().any(|group| group.recursive);
        Self {
            groups,
            recursive,
            max_rounds: MAX_RECURSION_ROUNDS,
        }
    }

    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|group| group.rules.is_empty())
    }

    /// Summary message of the named fix, if it declares one.
    pub fn fix_message(&self, name: &str) -> Option<&crate::fixes::MessageSpec> {
        self.groups
            .iter()
            .find(|group| group.name == name)
            .and_then(|group| group.msg.as_ref())
    }

    /// Apply all rules to `text`. In recursive mode the rule list is re-run
    /// until a fixed point, bounded by the iteration cap.
    pub fn apply(&self, title: &str, text: &str) -> Result<Outcome> {
        let mut current = text.to_string();
        let mut applied: Vec<AppliedRule> = Vec::new();
        for round in 0..self.max_rounds {
            let (next, round_applied, changed) = self.apply_once(title, &current)?;
            for entry in round_applied {
                let already = applied
                    .iter()
                    .any(|seen| seen.fix == entry.fix && seen.rule == entry.rule);
                if !already {
                    applied.push(entry);
                }
            }
            current = next;
            if !changed || !self.recursive {
                break;
            }
            if round + 1 == self.max_rounds {
                warn!(
                    title,
                    rounds = self.max_rounds,
                    "recursive replacement did not converge, stopping"
                );
            }
        }
        Ok(Outcome {
            text: current,
            applied,
        })
    }

    fn apply_once(&self, title: &str, text: &str) -> Result<(String, Vec<AppliedRule>, bool)> {
        let mut current = text.to_string();
        let mut applied = Vec::new();
        let mut changed = false;
        for group in &self.groups {
            let exceptions = group.exceptions()?;
            if exceptions.title_matches(title) {
                debug!(title, fix = %group.name, "title excepted, skipping fix");
                continue;
            }
            if exceptions.page_vetoed(&current) {
                debug!(title, fix = %group.name, "page text excepted, skipping fix");
                continue;
            }
            // A title exception on any rule disables the whole group: rules
            // of one fix succeed or fail together.
            let group_excepted = group.rules.iter().any(|rule| {
                rule.title_exceptions
                    .iter()
                    .any(|pattern| pattern.is_match(title))
            });
            if group_excepted {
                debug!(title, fix = %group.name, "rule title exception, skipping fix");
                continue;
            }
            for (index, rule) in group.rules.iter().enumerate() {
                let exempt = exceptions.exempt_spans(&current);
                let (next, did_apply) = substitute(rule, &current, &exempt);
                if did_apply {
                    changed = true;
                    applied.push(AppliedRule {
                        fix: group.name.clone(),
                        rule: index,
                        summary: rule.summary.clone(),
                        old: rule.pattern.as_str().to_string(),
                        new: rule.replacement.clone(),
                    });
                    current = next;
                }
            }
        }
        Ok((current, applied, changed))
    }

    /// Assemble an edit summary from the rules that applied: explicit
    /// fragments first, then one merged generic message for the rest.
    /// De-duplicated, order-stable, semicolon-joined.
    pub fn build_summary(&self, applied: &[AppliedRule]) -> String {
        let mut fragments: Vec<String> = Vec::new();
        let mut generic: Vec<String> = Vec::new();
        for entry in applied {
            match &entry.summary {
                Some(fragment) => {
                    if !fragments.contains(fragment) {
                        fragments.push(fragment.clone());
                    }
                }
                None => {
                    let pair = format!("{} with {}", entry.old, entry.new);
                    if !generic.contains(&pair) {
                        generic.push(pair);
                    }
                }
            }
        }
        if !generic.is_empty() {
            fragments.push(format!("replacing {}", generic.join(", ")));
        }
        fragments.join("; ")
    }
}

fn overlaps(spans: &[(usize, usize)], start: usize, end: usize) -> bool {
    spans.iter().any(|(s, e)| start < *e && *s < end)
}

fn substitute(rule: &ReplacementRule, text: &str, exempt: &[(usize, usize)]) -> (String, bool) {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut applied = false;
    for caps in rule.pattern.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        if whole.start() == whole.end() {
            continue;
        }
        if overlaps(exempt, whole.start(), whole.end()) {
            continue;
        }
        let groups_differ = rule.same_captures.iter().any(|(a, b)| {
            caps.get(*a).map(|m| m.as_str()) != caps.get(*b).map(|m| m.as_str())
        });
        if groups_differ {
            continue;
        }
        out.push_str(&text[last..whole.start()]);
        caps.expand(&rule.replacement, &mut out);
        last = whole.end();
        applied = true;
    }
    out.push_str(&text[last..]);
    (out, applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixes::{ExceptionSpec, FixSet};

    fn fix(rules: Vec<ReplacementRule>) -> FixSet {
        FixSet::for_tests("test-fix", rules, ExceptionSpec::default(), false)
    }

    fn rule(old: &str, new: &str) -> ReplacementRule {
        ReplacementRule::build(old, new, false, false, None).unwrap()
    }

    fn regex_rule(old: &str, new: &str) -> ReplacementRule {
        ReplacementRule::build(old, new, true, false, None).unwrap()
    }

    #[test]
    fn simple_fix_replaces_all_occurrences_as_one_applied_rule() {
        let replacer = Replacer::new(vec![fix(vec![rule("foo", "bar")])]);
        let outcome = replacer.apply("Page", "foo foo").unwrap();
        assert_eq!(outcome.text, "bar bar");
        assert_eq!(outcome.applied.len(), 1);
    }

    #[test]
    fn no_matching_pattern_leaves_text_unchanged() {
        let replacer = Replacer::new(vec![fix(vec![rule("absent", "x")])]);
        let outcome = replacer.apply("Page", "some text").unwrap();
        assert_eq!(outcome.text, "some text");
        assert!(outcome.applied.is_empty());
    }

    #[test]
    fn one_application_is_idempotent_when_replacement_does_not_match() {
        let replacer = Replacer::new(vec![fix(vec![rule("colour", "color")])]);
        let first = replacer.apply("Page", "colour chart").unwrap();
        assert_eq!(first.text, "color chart");
        let second = replacer.apply("Page", &first.text).unwrap();
        assert_eq!(second.text, first.text);
        assert!(second.applied.is_empty());
    }

    #[test]
    fn regex_rule_expands_capture_groups_in_replacement() {
        let replacer = Replacer::new(vec![fix(vec![regex_rule(
            r"(\w+)\.jpeg",
            "$1.jpg",
        )])]);
        let outcome = replacer.apply("Page", "see photo.jpeg here").unwrap();
        assert_eq!(outcome.text, "see photo.jpg here");
    }

    #[test]
    fn same_capture_guard_only_rewrites_matches_with_equal_groups() {
        let rule = regex_rule(r"\[\[(\w+)\|(\w+)\]\]", "[[$1]]")
            .with_same_captures(vec![(1, 2)]);
        let replacer = Replacer::new(vec![fix(vec![rule])]);
        let outcome = replacer
            .apply("Page", "see [[Foo|Foo]] and [[Foo|Bar]]")
            .unwrap();
        assert_eq!(outcome.text, "see [[Foo]] and [[Foo|Bar]]");
    }

    #[test]
    fn same_capture_guard_skip_keeps_surrounding_text_intact() {
        let rule = regex_rule(r"\[\[(\w+)\|(\w+)\]\]", "[[$1]]")
            .with_same_captures(vec![(1, 2)]);
        let replacer = Replacer::new(vec![fix(vec![rule])]);
        let outcome = replacer.apply("Page", "a [[X|Y]] b").unwrap();
        assert_eq!(outcome.text, "a [[X|Y]] b");
        assert!(outcome.applied.is_empty());
    }

    #[test]
    fn literal_rule_does_not_expand_dollar_signs() {
        let replacer = Replacer::new(vec![fix(vec![rule("price", "$1")])]);
        let outcome = replacer.apply("Page", "price here").unwrap();
        assert_eq!(outcome.text, "$1 here");
    }

    #[test]
    fn case_insensitive_rule_matches_any_case() {
        let replacer = Replacer::new(vec![fix(vec![
            ReplacementRule::build("foo", "bar", false, true, None).unwrap(),
        ])]);
        let outcome = replacer.apply("Page", "FOO Foo foo").unwrap();
        assert_eq!(outcome.text, "bar bar bar");
    }

    #[test]
    fn matches_inside_nowiki_are_not_replaced() {
        let exceptions = ExceptionSpec {
            inside_tags: vec!["nowiki".to_string()],
            ..ExceptionSpec::default()
        };
        let group = FixSet::for_tests("test-fix", vec![rule("foo", "bar")], exceptions, false);
        let replacer = Replacer::new(vec![group]);
        let outcome = replacer
            .apply("Page", "foo <nowiki>foo</nowiki> foo")
            .unwrap();
        assert_eq!(outcome.text, "bar <nowiki>foo</nowiki> bar");
    }

    #[test]
    fn matches_inside_templates_are_not_replaced() {
        let exceptions = ExceptionSpec {
            inside_tags: vec!["template".to_string()],
            ..ExceptionSpec::default()
        };
        let group = FixSet::for_tests("test-fix", vec![rule("foo", "bar")], exceptions, false);
        let replacer = Replacer::new(vec![group]);
        let outcome = replacer
            .apply("Page", "foo {{cite|foo {{inner|foo}}}} foo")
            .unwrap();
        assert_eq!(outcome.text, "bar {{cite|foo {{inner|foo}}}} bar");
    }

    #[test]
    fn inside_regex_spans_are_exempt() {
        let exceptions = ExceptionSpec {
            inside: vec![r"'''.*?'''".to_string()],
            ..ExceptionSpec::default()
        };
        let group = FixSet::for_tests("test-fix", vec![rule("foo", "bar")], exceptions, false);
        let replacer = Replacer::new(vec![group]);
        let outcome = replacer.apply("Page", "foo '''foo''' foo").unwrap();
        assert_eq!(outcome.text, "bar '''foo''' bar");
    }

    #[test]
    fn title_exception_skips_the_whole_fix() {
        let exceptions = ExceptionSpec {
            title: vec!["^Talk:".to_string()],
            ..ExceptionSpec::default()
        };
        let group = FixSet::for_tests(
            "test-fix",
            vec![rule("foo", "bar"), rule("baz", "qux")],
            exceptions,
            false,
        );
        let replacer = Replacer::new(vec![group]);
        let outcome = replacer.apply("Talk:Page", "foo baz").unwrap();
        assert_eq!(outcome.text, "foo baz");
        assert!(outcome.applied.is_empty());
    }

    #[test]
    fn rule_title_exception_disables_sibling_rules_too() {
        let excepted = rule("foo", "bar")
            .with_title_exceptions(vec![Regex::new("^Special").unwrap()]);
        let group = FixSet::for_tests(
            "test-fix",
            vec![excepted, rule("baz", "qux")],
            ExceptionSpec::default(),
            false,
        );
        let replacer = Replacer::new(vec![group]);
        let outcome = replacer.apply("Special page", "foo baz").unwrap();
        assert_eq!(outcome.text, "foo baz");
    }

    #[test]
    fn text_contains_exception_vetoes_the_page() {
        let exceptions = ExceptionSpec {
            text_contains: vec![r"\{\{inuse\}\}".to_string()],
            ..ExceptionSpec::default()
        };
        let group = FixSet::for_tests("test-fix", vec![rule("foo", "bar")], exceptions, false);
        let replacer = Replacer::new(vec![group]);
        let outcome = replacer.apply("Page", "{{inuse}} foo").unwrap();
        assert_eq!(outcome.text, "{{inuse}} foo");
    }

    #[test]
    fn recursive_application_reaches_a_fixed_point() {
        let group = FixSet::for_tests(
            "test-fix",
            vec![rule("aaa", "aa")],
            ExceptionSpec::default(),
            true,
        );
        let replacer = Replacer::new(vec![group]);
        let outcome = replacer.apply("Page", "aaaaaaa b").unwrap();
        assert_eq!(outcome.text, "aa b");
    }

    #[test]
    fn non_converging_recursion_stops_at_the_iteration_cap() {
        let group = FixSet::for_tests(
            "test-fix",
            vec![rule("a", "aa")],
            ExceptionSpec::default(),
            true,
        );
        let replacer = Replacer::new(vec![group]);
        let outcome = replacer.apply("Page", "a").unwrap();
        // Doubles once per round, capped.
        assert_eq!(outcome.text.len(), 1 << MAX_RECURSION_ROUNDS);
    }

    #[test]
    fn summary_merges_default_fragments_and_keeps_explicit_ones() {
        let with_summary =
            ReplacementRule::build("foo", "bar", false, false, Some("tidy foo".to_string()))
                .unwrap();
        let group = FixSet::for_tests(
            "test-fix",
            vec![with_summary, rule("baz", "qux")],
            ExceptionSpec::default(),
            false,
        );
        let replacer = Replacer::new(vec![group]);
        let outcome = replacer.apply("Page", "foo baz").unwrap();
        let summary = replacer.build_summary(&outcome.applied);
        assert_eq!(summary, "tidy foo; replacing baz with qux");
    }

    #[test]
    fn summary_is_deduplicated_and_order_stable() {
        let a = ReplacementRule::build("a", "b", false, false, Some("same".to_string())).unwrap();
        let b = ReplacementRule::build("c", "d", false, false, Some("same".to_string())).unwrap();
        let group = FixSet::for_tests("test-fix", vec![a, b], ExceptionSpec::default(), false);
        let replacer = Replacer::new(vec![group]);
        let outcome = replacer.apply("Page", "a c").unwrap();
        assert_eq!(replacer.build_summary(&outcome.applied), "same");
    }

    #[test]
    fn template_spans_handles_nesting() {
        let spans = template_spans("x {{a|{{b}}}} y {{c}}");
        assert_eq!(spans, vec![(2, 13), (16, 21)]);
    }
}
