//! Command-line generator factory.
//!
//! Translates `-name:value` tokens into page sources and filter settings,
//! then assembles the full pipeline. Flags are dispatched through a
//! registry table rather than ad-hoc branching, so the flag surface is
//! enumerable (for help output) and each handler stays small.
//!
//! The namespace selection is frozen the first time something reads it;
//! later `-ns` flags are a configuration error. This makes flag order
//! observable: `-ns:1 -newpages` restricts new pages, `-newpages -ns:1`
//! fails.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tracing::warn;

use crate::combine::{ContentIter, PageIter, chain, deduplicate, intersect};
use crate::dump::dump_refs;
use crate::filters::{
    Quantifier, category_filter, claim_filter, compile_patterns, content_filter,
    edit_time_filter, namespace_filter, quality_filter, subpage_filter, title_filter,
};
use crate::generators;
use crate::preload::{DEFAULT_BATCH_SIZE, preload};
use crate::site::{NamespaceTable, Site, parse_title};

/// The assembled pipeline: bare references, or loaded pages when a
/// preloading stage was inserted.
pub enum PageStream {
    Refs(PageIter),
    Loaded(ContentIter),
}

pub type PromptFn = Box<dyn FnMut(&str) -> Option<String>>;

type Handler = fn(&mut GeneratorFactory, &str) -> Result<()>;

struct Flag {
    name: &'static str,
    aliases: &'static [&'static str],
    /// Question asked through the prompt callback when the value is
    /// missing; `None` means the flag takes no (or an optional) value.
    prompt: Option<&'static str>,
    handler: Handler,
}

const REGISTRY: &[Flag] = &[
    Flag {
        name: "cat",
        aliases: &["category"],
        prompt: Some("Please enter the category name:"),
        handler: GeneratorFactory::arg_cat,
    },
    Flag {
        name: "catr",
        aliases: &[],
        prompt: Some("Please enter the category name:"),
        handler: GeneratorFactory::arg_catr,
    },
    Flag {
        name: "links",
        aliases: &[],
        prompt: Some("Links from which page?"),
        handler: GeneratorFactory::arg_links,
    },
    Flag {
        name: "ref",
        aliases: &["backlinks"],
        prompt: Some("Links to which page?"),
        handler: GeneratorFactory::arg_ref,
    },
    Flag {
        name: "embeddedin",
        aliases: &["transcludes"],
        prompt: Some("Pages embedding which template?"),
        handler: GeneratorFactory::arg_embeddedin,
    },
    Flag {
        name: "start",
        aliases: &[],
        prompt: Some("Start listing at which page?"),
        handler: GeneratorFactory::arg_start,
    },
    Flag {
        name: "newpages",
        aliases: &[],
        prompt: None,
        handler: GeneratorFactory::arg_newpages,
    },
    Flag {
        name: "recentchanges",
        aliases: &["rc"],
        prompt: None,
        handler: GeneratorFactory::arg_recentchanges,
    },
    Flag {
        name: "random",
        aliases: &[],
        prompt: None,
        handler: GeneratorFactory::arg_random,
    },
    Flag {
        name: "page",
        aliases: &[],
        prompt: Some("Which page?"),
        handler: GeneratorFactory::arg_page,
    },
    Flag {
        name: "pageid",
        aliases: &[],
        prompt: Some("Which page ids (comma separated)?"),
        handler: GeneratorFactory::arg_pageid,
    },
    Flag {
        name: "file",
        aliases: &[],
        prompt: Some("Path to the title list file?"),
        handler: GeneratorFactory::arg_file,
    },
    Flag {
        name: "search",
        aliases: &[],
        prompt: Some("Search for what?"),
        handler: GeneratorFactory::arg_search,
    },
    Flag {
        name: "weblink",
        aliases: &["exturlusage"],
        prompt: Some("Pages linking to which external URL?"),
        handler: GeneratorFactory::arg_weblink,
    },
    Flag {
        name: "logevents",
        aliases: &[],
        prompt: Some("Which log type?"),
        handler: GeneratorFactory::arg_logevents,
    },
    Flag {
        name: "usercontribs",
        aliases: &[],
        prompt: Some("Contributions of which user?"),
        handler: GeneratorFactory::arg_usercontribs,
    },
    Flag {
        name: "prefixindex",
        aliases: &["prefix"],
        prompt: Some("Which title prefix?"),
        handler: GeneratorFactory::arg_prefixindex,
    },
    Flag {
        name: "xml",
        aliases: &[],
        prompt: Some("Path to the XML dump?"),
        handler: GeneratorFactory::arg_xml,
    },
    Flag {
        name: "ns",
        aliases: &["namespace", "namespaces"],
        prompt: Some("Which namespaces?"),
        handler: GeneratorFactory::arg_ns,
    },
    Flag {
        name: "limit",
        aliases: &[],
        prompt: Some("How many pages at most?"),
        handler: GeneratorFactory::arg_limit,
    },
    Flag {
        name: "intersect",
        aliases: &[],
        prompt: None,
        handler: GeneratorFactory::arg_intersect,
    },
    Flag {
        name: "titleregex",
        aliases: &[],
        prompt: Some("Keep titles matching which pattern?"),
        handler: GeneratorFactory::arg_titleregex,
    },
    Flag {
        name: "titleregexnot",
        aliases: &[],
        prompt: Some("Drop titles matching which pattern?"),
        handler: GeneratorFactory::arg_titleregexnot,
    },
    Flag {
        name: "grep",
        aliases: &[],
        prompt: Some("Keep pages whose text matches which pattern?"),
        handler: GeneratorFactory::arg_grep,
    },
    Flag {
        name: "grepnot",
        aliases: &[],
        prompt: Some("Drop pages whose text matches which pattern?"),
        handler: GeneratorFactory::arg_grepnot,
    },
    Flag {
        name: "catfilter",
        aliases: &[],
        prompt: Some("Require membership in which category?"),
        handler: GeneratorFactory::arg_catfilter,
    },
    Flag {
        name: "quality",
        aliases: &["ql"],
        prompt: Some("Which proofread quality levels?"),
        handler: GeneratorFactory::arg_quality,
    },
    Flag {
        name: "subpage",
        aliases: &[],
        prompt: Some("Maximum subpage depth?"),
        handler: GeneratorFactory::arg_subpage,
    },
    Flag {
        name: "lastedit",
        aliases: &[],
        prompt: Some("Last edited between which dates (from,to)?"),
        handler: GeneratorFactory::arg_lastedit,
    },
    Flag {
        name: "onlyif",
        aliases: &[],
        prompt: Some("Require which claim (property=value)?"),
        handler: GeneratorFactory::arg_onlyif,
    },
    Flag {
        name: "onlyifnot",
        aliases: &[],
        prompt: Some("Forbid which claim (property=value)?"),
        handler: GeneratorFactory::arg_onlyifnot,
    },
];

pub struct GeneratorFactory {
    site: Site,
    table: Option<NamespaceTable>,
    sources: Vec<PageIter>,
    ns_tokens: Vec<String>,
    frozen_ns: Option<BTreeSet<i32>>,
    limit: Option<usize>,
    intersect_sources: bool,
    title_include: Vec<String>,
    title_exclude: Vec<String>,
    grep: Vec<String>,
    grep_not: Vec<String>,
    cat_filter: Vec<String>,
    quality: BTreeSet<u8>,
    subpage_depth: Option<usize>,
    edit_after: Option<DateTime<Utc>>,
    edit_before: Option<DateTime<Utc>>,
    claims_required: Vec<(String, String)>,
    claims_forbidden: Vec<(String, String)>,
    batch_size: usize,
    prompt: PromptFn,
}

impl GeneratorFactory {
    pub fn new(site: Site) -> Self {
        Self {
            site,
            table: None,
            sources: Vec::new(),
            ns_tokens: Vec::new(),
            frozen_ns: None,
            limit: None,
            intersect_sources: false,
            title_include: Vec::new(),
            title_exclude: Vec::new(),
            grep: Vec::new(),
            grep_not: Vec::new(),
            cat_filter: Vec::new(),
            quality: BTreeSet::new(),
            subpage_depth: None,
            edit_after: None,
            edit_before: None,
            claims_required: Vec::new(),
            claims_forbidden: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            prompt: Box::new(|_| None),
        }
    }

    /// Callback asked for values the command line left out.
    pub fn with_prompt(mut self, prompt: PromptFn) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn set_batch_size(&mut self, batch_size: usize) {
        self.batch_size = batch_size.max(1);
    }

    pub fn has_sources(&self) -> bool {
        !self.sources.is_empty()
    }

    /// Known flag names, for help output.
    pub fn flag_names() -> impl Iterator<Item = &'static str> {
        REGISTRY.iter().map(|flag| flag.name)
    }

    /// Try to consume one command-line token. `Ok(false)` means the token
    /// is not a generator flag and belongs to the caller.
    pub fn handle_arg(&mut self, token: &str) -> Result<bool> {
        let Some(body) = token.strip_prefix('-') else {
            return Ok(false);
        };
        let (name, value) = match body.split_once(':') {
            Some((name, value)) => (name, value),
            None => (body, ""),
        };
        let Some(flag) = REGISTRY
            .iter()
            .find(|flag| flag.name == name || flag.aliases.contains(&name))
        else {
            return Ok(false);
        };
        let value = if value.is_empty() {
            match flag.prompt {
                Some(question) => match (self.prompt)(question) {
                    Some(answer) if !answer.trim().is_empty() => answer,
                    _ => bail!("flag -{name} requires a value"),
                },
                None => String::new(),
            }
        } else {
            value.to_string()
        };
        (flag.handler)(self, &value)?;
        Ok(true)
    }

    fn table(&mut self) -> Result<NamespaceTable> {
        match &self.table {
            Some(table) => Ok(table.clone()),
            None => {
                let table = self.site.borrow_mut().namespaces()?;
                self.table = Some(table.clone());
                Ok(table)
            }
        }
    }

    /// Resolve and freeze the namespace selection. With no `-ns` flags the
    /// set is every namespace the site knows.
    fn resolved_namespaces(&mut self) -> Result<BTreeSet<i32>> {
        if let Some(frozen) = &self.frozen_ns {
            return Ok(frozen.clone());
        }
        let table = self.table()?;
        let mut included = BTreeSet::new();
        let mut excluded = BTreeSet::new();
        for token in &self.ns_tokens {
            let (negated, token) = match token.strip_prefix("not:") {
                Some(rest) => (true, rest),
                None => (false, token.as_str()),
            };
            let id = table
                .resolve(token)
                .with_context(|| format!("unknown namespace: {token}"))?;
            if negated {
                excluded.insert(id);
            } else {
                included.insert(id);
            }
        }
        if included.is_empty() {
            included = table.ids().collect();
        }
        for id in excluded {
            included.remove(&id);
        }
        self.frozen_ns = Some(included.clone());
        Ok(included)
    }

    /// Namespace selection for namespace-dependent sources. Without any
    /// `-ns` token these default to the main namespace, not to everything;
    /// the default still freezes the selection.
    fn generator_namespaces(&mut self) -> Result<BTreeSet<i32>> {
        if self.frozen_ns.is_none() && self.ns_tokens.is_empty() {
            let main = BTreeSet::from([0]);
            self.frozen_ns = Some(main.clone());
            return Ok(main);
        }
        self.resolved_namespaces()
    }

    fn arg_cat(&mut self, value: &str) -> Result<()> {
        self.sources
            .push(generators::category_members(self.site.clone(), value, self.limit));
        Ok(())
    }

    fn arg_catr(&mut self, value: &str) -> Result<()> {
        self.sources.push(generators::category_members_recursive(
            self.site.clone(),
            value,
            self.limit,
        ));
        Ok(())
    }

    fn arg_links(&mut self, value: &str) -> Result<()> {
        self.sources
            .push(generators::linked_pages(self.site.clone(), value, self.limit));
        Ok(())
    }

    fn arg_ref(&mut self, value: &str) -> Result<()> {
        self.sources
            .push(generators::referring_pages(self.site.clone(), value, self.limit));
        Ok(())
    }

    fn arg_embeddedin(&mut self, value: &str) -> Result<()> {
        self.sources.push(generators::transcluding_pages(
            self.site.clone(),
            value,
            self.limit,
        ));
        Ok(())
    }

    fn arg_start(&mut self, value: &str) -> Result<()> {
        let table = self.table()?;
        let site_id = self.site.borrow().site_id();
        let start = parse_title(&site_id, &table, value)
            .with_context(|| format!("bad start title: {value}"))?;
        self.sources.push(generators::all_pages(
            self.site.clone(),
            start.namespace,
            Some(start.title),
            self.limit,
        ));
        Ok(())
    }

    fn arg_newpages(&mut self, value: &str) -> Result<()> {
        let namespaces: Vec<i32> = self.generator_namespaces()?.into_iter().collect();
        let total = parse_optional_count("newpages", value)?.or(self.limit);
        self.sources
            .push(generators::new_pages(self.site.clone(), namespaces, total));
        Ok(())
    }

    fn arg_recentchanges(&mut self, value: &str) -> Result<()> {
        let total = parse_optional_count("recentchanges", value)?.or(self.limit);
        self.sources
            .push(generators::recent_changes(self.site.clone(), total));
        Ok(())
    }

    fn arg_random(&mut self, value: &str) -> Result<()> {
        let count = parse_optional_count("random", value)?.unwrap_or(10);
        self.sources
            .push(generators::random_pages(self.site.clone(), count));
        Ok(())
    }

    fn arg_page(&mut self, value: &str) -> Result<()> {
        self.sources
            .push(generators::single_page(self.site.clone(), value));
        Ok(())
    }

    fn arg_pageid(&mut self, value: &str) -> Result<()> {
        let ids = value
            .split(',')
            .map(|id| {
                id.trim()
                    .parse::<u64>()
                    .with_context(|| format!("bad page id: {id}"))
            })
            .collect::<Result<Vec<u64>>>()?;
        self.sources
            .push(generators::pages_from_ids(self.site.clone(), ids));
        Ok(())
    }

    fn arg_file(&mut self, value: &str) -> Result<()> {
        let source =
            generators::pages_from_file(self.site.clone(), Path::new(value), self.limit)?;
        self.sources.push(source);
        Ok(())
    }

    fn arg_search(&mut self, value: &str) -> Result<()> {
        self.sources
            .push(generators::search_pages(self.site.clone(), value, self.limit));
        Ok(())
    }

    fn arg_weblink(&mut self, value: &str) -> Result<()> {
        self.sources
            .push(generators::weblink_pages(self.site.clone(), value, self.limit));
        Ok(())
    }

    fn arg_logevents(&mut self, value: &str) -> Result<()> {
        self.sources
            .push(generators::log_pages(self.site.clone(), value, self.limit));
        Ok(())
    }

    fn arg_usercontribs(&mut self, value: &str) -> Result<()> {
        self.sources.push(generators::user_contrib_pages(
            self.site.clone(),
            value,
            self.limit,
        ));
        Ok(())
    }

    fn arg_prefixindex(&mut self, value: &str) -> Result<()> {
        self.sources
            .push(generators::prefix_pages(self.site.clone(), value, self.limit));
        Ok(())
    }

    fn arg_xml(&mut self, value: &str) -> Result<()> {
        let site_id = self.site.borrow().site_id();
        self.sources.push(dump_refs(Path::new(value), &site_id)?);
        Ok(())
    }

    fn arg_ns(&mut self, value: &str) -> Result<()> {
        if self.frozen_ns.is_some() {
            bail!("namespace selection is already in use and can no longer change");
        }
        for part in value.split(',') {
            let part = part.trim();
            if !part.is_empty() {
                self.ns_tokens.push(part.to_string());
            }
        }
        Ok(())
    }

    fn arg_limit(&mut self, value: &str) -> Result<()> {
        let limit = value
            .parse::<usize>()
            .with_context(|| format!("bad limit: {value}"))?;
        self.limit = Some(limit);
        Ok(())
    }

    fn arg_intersect(&mut self, _value: &str) -> Result<()> {
        self.intersect_sources = true;
        Ok(())
    }

    fn arg_titleregex(&mut self, value: &str) -> Result<()> {
        self.title_include.push(value.to_string());
        Ok(())
    }

    fn arg_titleregexnot(&mut self, value: &str) -> Result<()> {
        self.title_exclude.push(value.to_string());
        Ok(())
    }

    fn arg_grep(&mut self, value: &str) -> Result<()> {
        self.grep.push(value.to_string());
        Ok(())
    }

    fn arg_grepnot(&mut self, value: &str) -> Result<()> {
        self.grep_not.push(value.to_string());
        Ok(())
    }

    fn arg_catfilter(&mut self, value: &str) -> Result<()> {
        self.cat_filter.push(value.to_string());
        Ok(())
    }

    fn arg_quality(&mut self, value: &str) -> Result<()> {
        for part in value.split(',') {
            let level = part
                .trim()
                .parse::<u8>()
                .with_context(|| format!("bad quality level: {part}"))?;
            self.quality.insert(level);
        }
        Ok(())
    }

    fn arg_subpage(&mut self, value: &str) -> Result<()> {
        let depth = value
            .parse::<usize>()
            .with_context(|| format!("bad subpage depth: {value}"))?;
        self.subpage_depth = Some(depth);
        Ok(())
    }

    fn arg_lastedit(&mut self, value: &str) -> Result<()> {
        let (from, to) = value.split_once(',').unwrap_or((value, ""));
        if !from.trim().is_empty() {
            self.edit_after = Some(parse_day(from.trim(), false)?);
        }
        if !to.trim().is_empty() {
            self.edit_before = Some(parse_day(to.trim(), true)?);
        }
        Ok(())
    }

    fn arg_onlyif(&mut self, value: &str) -> Result<()> {
        self.claims_required.push(parse_claim(value)?);
        Ok(())
    }

    fn arg_onlyifnot(&mut self, value: &str) -> Result<()> {
        self.claims_forbidden.push(parse_claim(value)?);
        Ok(())
    }

    fn filters_configured(&self) -> bool {
        !self.ns_tokens.is_empty()
            || !self.title_include.is_empty()
            || !self.title_exclude.is_empty()
            || !self.grep.is_empty()
            || !self.grep_not.is_empty()
            || !self.cat_filter.is_empty()
            || !self.quality.is_empty()
            || self.subpage_depth.is_some()
            || self.edit_after.is_some()
            || self.edit_before.is_some()
            || !self.claims_required.is_empty()
            || !self.claims_forbidden.is_empty()
    }

    /// Assemble the final stream. `None` when no source flag was given.
    /// Filters run in a fixed order regardless of flag order; content
    /// filters force a preloading stage.
    pub fn combined(mut self, preload_requested: bool) -> Result<Option<PageStream>> {
        if self.sources.is_empty() {
            if self.filters_configured() {
                warn!("filters were given but no page generator; nothing to select from");
            }
            return Ok(None);
        }
        let sources = std::mem::take(&mut self.sources);
        if self.intersect_sources && sources.len() < 2 {
            warn!("-intersect needs at least two generators to intersect");
        }
        let mut stream: PageIter = if self.intersect_sources {
            intersect(sources)
        } else {
            deduplicate(chain(sources))
        };
        if !self.ns_tokens.is_empty() || self.frozen_ns.is_some() {
            let allowed = self.resolved_namespaces()?;
            stream = namespace_filter(stream, allowed);
        }
        if let Some(limit) = self.limit {
            stream = Box::new(stream.take(limit));
        }
        if let Some(depth) = self.subpage_depth {
            stream = subpage_filter(stream, self.table()?, depth);
        }
        if !self.claims_required.is_empty() || !self.claims_forbidden.is_empty() {
            stream = claim_filter(
                stream,
                self.site.clone(),
                std::mem::take(&mut self.claims_required),
                std::mem::take(&mut self.claims_forbidden),
            );
        }
        if !self.quality.is_empty() {
            stream = quality_filter(stream, self.site.clone(), std::mem::take(&mut self.quality));
        }
        if !self.title_include.is_empty() {
            let patterns = compile_patterns(&self.title_include, false)?;
            stream = title_filter(stream, patterns, Quantifier::Any);
        }
        if !self.title_exclude.is_empty() {
            let patterns = compile_patterns(&self.title_exclude, false)?;
            stream = title_filter(stream, patterns, Quantifier::None);
        }
        if !self.cat_filter.is_empty() {
            stream = category_filter(
                stream,
                self.site.clone(),
                std::mem::take(&mut self.cat_filter),
            );
        }

        let needs_content = preload_requested
            || !self.grep.is_empty()
            || !self.grep_not.is_empty()
            || self.edit_after.is_some()
            || self.edit_before.is_some();
        if !needs_content {
            return Ok(Some(PageStream::Refs(stream)));
        }

        let mut loaded = preload(self.site.clone(), stream, self.batch_size);
        if self.edit_after.is_some() || self.edit_before.is_some() {
            loaded = edit_time_filter(loaded, self.edit_after, self.edit_before);
        }
        if !self.grep.is_empty() {
            let patterns = compile_patterns(&self.grep, false)?;
            loaded = content_filter(loaded, patterns, Quantifier::Any);
        }
        if !self.grep_not.is_empty() {
            let patterns = compile_patterns(&self.grep_not, false)?;
            loaded = content_filter(loaded, patterns, Quantifier::None);
        }
        Ok(Some(PageStream::Loaded(loaded)))
    }
}

fn parse_optional_count(flag: &str, value: &str) -> Result<Option<usize>> {
    if value.trim().is_empty() {
        return Ok(None);
    }
    let count = value
        .trim()
        .parse::<usize>()
        .with_context(|| format!("bad count for -{flag}: {value}"))?;
    Ok(Some(count))
}

fn parse_day(raw: &str, end_of_day: bool) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("bad date (expected YYYY-MM-DD): {raw}"))?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|naive| Utc.from_utc_datetime(&naive))
        .with_context(|| format!("bad date: {raw}"))
}

fn parse_claim(raw: &str) -> Result<(String, String)> {
    let (property, value) = raw
        .split_once('=')
        .with_context(|| format!("bad claim (expected property=value): {raw}"))?;
    Ok((property.trim().to_string(), value.trim().to_string()))
}
