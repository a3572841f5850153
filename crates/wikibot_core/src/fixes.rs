//! Declarative fix files.
//!
//! A fix is a named, ordered rule list with shared exceptions, loaded from
//! TOML. Built-in fixes ship embedded in the binary; user fixes are merged
//! on top and may shadow built-ins by name.

use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::replace::{CompiledExceptions, ReplacementRule, tag_pattern};

const BUILTIN_FIXES: &str = include_str!("../fixes/default.toml");

#[derive(Debug, Deserialize)]
struct FixFile {
    #[serde(default)]
    fixes: BTreeMap<String, FixSpec>,
}

#[derive(Debug, Deserialize)]
struct FixSpec {
    #[serde(default)]
    regex: bool,
    #[serde(default)]
    nocase: bool,
    #[serde(default)]
    recursive: bool,
    #[serde(default)]
    msg: Option<MessageSpec>,
    #[serde(default)]
    replacements: Vec<ReplacementSpec>,
    #[serde(default)]
    exceptions: ExceptionSpec,
    #[serde(default)]
    generator: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ReplacementSpec {
    old: String,
    new: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default, rename = "title-exceptions")]
    title_exceptions: Vec<String>,
    /// Capture group pairs that must match the same text, e.g.
    /// `same = [[1, 2]]` for the pipe-link cleanups.
    #[serde(default)]
    same: Vec<(usize, usize)>,
}

/// Edit summary source for a fix: a translation key, or an inline
/// per-language table.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageSpec {
    Key(String),
    Table(BTreeMap<String, String>),
}

/// Raw (uncompiled) exception lists of a fix.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExceptionSpec {
    #[serde(default)]
    pub title: Vec<String>,
    #[serde(default, rename = "text-contains")]
    pub text_contains: Vec<String>,
    #[serde(default)]
    pub inside: Vec<String>,
    #[serde(default, rename = "inside-tags")]
    pub inside_tags: Vec<String>,
}

/// A named rule group. Rules share the group's exceptions; those are
/// compiled on first use and cached, since most runs touch one fix out of
/// the whole catalogue.
pub struct FixSet {
    pub name: String,
    pub rules: Vec<ReplacementRule>,
    pub recursive: bool,
    pub msg: Option<MessageSpec>,
    pub generator: Vec<String>,
    exception_spec: ExceptionSpec,
    compiled: OnceCell<CompiledExceptions>,
}

impl FixSet {
    fn from_spec(name: &str, spec: FixSpec) -> Result<Self> {
        let mut rules = Vec::with_capacity(spec.replacements.len());
        for replacement in spec.replacements {
            let mut rule = ReplacementRule::build(
                &replacement.old,
                &replacement.new,
                spec.regex,
                spec.nocase,
                replacement.summary,
            )
            .with_context(|| format!("fix {name}"))?;
            if !replacement.title_exceptions.is_empty() {
                let patterns = compile_list(&replacement.title_exceptions)
                    .with_context(|| format!("fix {name}: title exceptions"))?;
                rule = rule.with_title_exceptions(patterns);
            }
            if !replacement.same.is_empty() {
                rule = rule.with_same_captures(replacement.same);
            }
            rules.push(rule);
        }
        Ok(Self {
            name: name.to_string(),
            rules,
            recursive: spec.recursive,
            msg: spec.msg,
            generator: spec.generator,
            exception_spec: spec.exceptions,
            compiled: OnceCell::new(),
        })
    }

    /// Rule group assembled at runtime, e.g. from command-line pairs.
    /// No exceptions, no message key.
    pub fn ad_hoc(name: &str, rules: Vec<ReplacementRule>, recursive: bool) -> Self {
        Self {
            name: name.to_string(),
            rules,
            recursive,
            msg: None,
            generator: Vec::new(),
            exception_spec: ExceptionSpec::default(),
            compiled: OnceCell::new(),
        }
    }

    #[cfg(test)]
    pub fn for_tests(
        name: &str,
        rules: Vec<ReplacementRule>,
        exceptions: ExceptionSpec,
        recursive: bool,
    ) -> Self {
        let mut fix = Self::ad_hoc(name, rules, recursive);
        fix.exception_spec = exceptions;
        fix
    }

    /// Compiled exceptions, built on first call.
    pub fn exceptions(&self) -> Result<&CompiledExceptions> {
        if let Some(compiled) = self.compiled.get() {
            return Ok(compiled);
        }
        let compiled = compile_exceptions(&self.exception_spec)
            .with_context(|| format!("fix {}: exceptions", self.name))?;
        Ok(self.compiled.get_or_init(|| compiled))
    }
}

fn compile_list(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).with_context(|| format!("invalid pattern: {pattern}"))
        })
        .collect()
}

fn compile_exceptions(spec: &ExceptionSpec) -> Result<CompiledExceptions> {
    let mut compiled = CompiledExceptions {
        title: compile_list(&spec.title)?,
        text_contains: compile_list(&spec.text_contains)?,
        inside: compile_list(&spec.inside)?,
        ..CompiledExceptions::default()
    };
    for tag in &spec.inside_tags {
        match tag_pattern(tag)? {
            Some(pattern) => compiled.inside_tags.push(pattern),
            None => compiled.skip_templates = true,
        }
    }
    Ok(compiled)
}

/// All known fixes, built-ins first, user files merged over them.
pub struct FixCatalog {
    fixes: BTreeMap<String, FixSet>,
}

impl FixCatalog {
    pub fn builtin() -> Result<Self> {
        let mut catalog = Self {
            fixes: BTreeMap::new(),
        };
        catalog
            .merge_str(BUILTIN_FIXES)
            .context("built-in fix file")?;
        Ok(catalog)
    }

    pub fn merge_file(&mut self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading fix file {}", path.display()))?;
        self.merge_str(&raw)
            .with_context(|| format!("fix file {}", path.display()))
    }

    fn merge_str(&mut self, raw: &str) -> Result<()> {
        let file: FixFile = toml::from_str(raw).context("parsing fix file")?;
        for (name, spec) in file.fixes {
            let fix = FixSet::from_spec(&name, spec)?;
            self.fixes.insert(name, fix);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FixSet> {
        self.fixes.get(name)
    }

    pub fn take(&mut self, name: &str) -> Option<FixSet> {
        self.fixes.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fixes.keys().map(String::as_str)
    }
}

/// Built-in catalogue plus the optional user fix file from the config.
pub fn load_fixes(user_file: Option<&Path>) -> Result<FixCatalog> {
    let mut catalog = FixCatalog::builtin()?;
    if let Some(path) = user_file {
        catalog.merge_file(path)?;
    }
    Ok(catalog)
}
