use std::cell::RefCell;
use std::rc::Rc;
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::BotConfig;
use crate::page::{PageContent, PageRef};
use crate::retry::RetryPolicy;

/// One batch of an API-paginated query: the resolved pages plus the
/// continuation token for the next batch, if any.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub pages: Vec<PageRef>,
    pub cont: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Namespace {
    pub id: i32,
    pub canonical: String,
    pub aliases: Vec<String>,
    pub subpages: bool,
}

/// Per-site namespace table. Resolves string or numeric namespace tokens
/// against canonical names and aliases, case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct NamespaceTable {
    namespaces: Vec<Namespace>,
}

impl NamespaceTable {
    pub fn new(namespaces: Vec<Namespace>) -> Self {
        Self { namespaces }
    }

    /// The stock MediaWiki namespace layout; used as a fallback and by tests.
    pub fn mediawiki_defaults() -> Self {
        let ns = |id: i32, canonical: &str, aliases: &[&str], subpages: bool| Namespace {
            id,
            canonical: canonical.to_string(),
            aliases: aliases.iter().map(ToString::to_string).collect(),
            subpages,
        };
        Self::new(vec![
            ns(0, "", &["Main"], false),
            ns(1, "Talk", &[], true),
            ns(2, "User", &[], true),
            ns(3, "User talk", &[], true),
            ns(4, "Project", &["Wikipedia"], true),
            ns(5, "Project talk", &["Wikipedia talk"], true),
            ns(6, "File", &["Image"], false),
            ns(7, "File talk", &["Image talk"], true),
            ns(8, "MediaWiki", &[], false),
            ns(9, "MediaWiki talk", &[], true),
            ns(10, "Template", &[], true),
            ns(11, "Template talk", &[], true),
            ns(12, "Help", &[], true),
            ns(13, "Help talk", &[], true),
            ns(14, "Category", &[], false),
            ns(15, "Category talk", &[], true),
        ])
    }

    pub fn get(&self, id: i32) -> Option<&Namespace> {
        self.namespaces.iter().find(|ns| ns.id == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.namespaces.iter().map(|ns| ns.id)
    }

    pub fn supports_subpages(&self, id: i32) -> bool {
        self.get(id).map(|ns| ns.subpages).unwrap_or(false)
    }

    /// Resolve a namespace token: a numeric id (must exist in the table) or
    /// a canonical name / alias, with "_" treated as " ".
    pub fn resolve(&self, token: &str) -> Option<i32> {
        let token = token.trim();
        if let Ok(id) = token.parse::<i32>() {
            return self.get(id).map(|ns| ns.id);
        }
        let wanted = token.replace('_', " ").to_lowercase();
        self.namespaces
            .iter()
            .find(|ns| {
                ns.canonical.to_lowercase() == wanted
                    || (wanted == "main" && ns.id == 0)
                    || ns.aliases.iter().any(|alias| alias.to_lowercase() == wanted)
            })
            .map(|ns| ns.id)
    }
}

/// Parse a raw title into a PageRef for `site_id`: strips `[[...]]` brackets,
/// resolves a namespace prefix against `table`, canonicalizes underscores and
/// uppercases the first letter of the page name.
pub fn parse_title(site_id: &str, table: &NamespaceTable, raw: &str) -> Option<PageRef> {
    let mut text = raw.trim();
    if let Some(stripped) = text.strip_prefix("[[") {
        text = stripped.strip_suffix("]]").unwrap_or(stripped);
    }
    let text = text.trim_start_matches(':').replace('_', " ");
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let (namespace, name) = match text.split_once(':') {
        Some((prefix, rest)) => match table.resolve(prefix) {
            Some(id) if id != 0 => (id, rest.trim()),
            _ => (0, text),
        },
        None => (0, text),
    };
    let name = capitalize_first(name);
    if name.is_empty() {
        return None;
    }
    let title = match table.get(namespace) {
        Some(ns) if !ns.canonical.is_empty() => format!("{}:{}", ns.canonical, name),
        _ => name,
    };
    Some(PageRef::new(site_id, namespace, title))
}

fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved { new_revid: u64 },
    NoChange,
    EditConflict,
    PageMissing,
}

/// Read side of a MediaWiki site. Every list method fetches one batch per
/// call, driven by an opaque continuation token; the source iterators turn
/// these into lazy sequences.
pub trait WikiApi {
    fn site_id(&self) -> String;
    fn namespaces(&mut self) -> Result<NamespaceTable>;
    fn max_batch_size(&self) -> usize {
        50
    }

    fn all_pages(&mut self, namespace: i32, start: Option<&str>, cont: Option<&str>)
    -> Result<Batch>;
    fn category_members(&mut self, category: &str, cont: Option<&str>) -> Result<Batch>;
    fn backlinks(&mut self, title: &str, cont: Option<&str>) -> Result<Batch>;
    fn embedded_in(&mut self, title: &str, cont: Option<&str>) -> Result<Batch>;
    fn page_links(&mut self, title: &str, cont: Option<&str>) -> Result<Batch>;
    fn new_pages(&mut self, namespaces: &[i32], cont: Option<&str>) -> Result<Batch>;
    fn recent_changes(&mut self, cont: Option<&str>) -> Result<Batch>;
    fn random_pages(&mut self, count: usize) -> Result<Batch>;
    fn search(&mut self, query: &str, cont: Option<&str>) -> Result<Batch>;
    fn ext_url_usage(&mut self, query: &str, cont: Option<&str>) -> Result<Batch>;
    fn log_events(&mut self, log_type: &str, cont: Option<&str>) -> Result<Batch>;
    fn user_contribs(&mut self, user: &str, cont: Option<&str>) -> Result<Batch>;
    fn prefix_index(&mut self, prefix: &str, namespace: i32, cont: Option<&str>) -> Result<Batch>;
    fn pages_by_ids(&mut self, ids: &[u64]) -> Result<Vec<PageRef>>;

    fn fetch_content(&mut self, refs: &[PageRef]) -> Result<Vec<PageContent>>;
    fn categories_of(&mut self, page: &PageRef) -> Result<Vec<String>>;
    fn quality_level(&mut self, page: &PageRef) -> Result<Option<u8>>;
    fn item_claims(&mut self, page: &PageRef) -> Result<Vec<(String, String)>>;
    fn proofread_namespace(&mut self) -> Result<Option<i32>>;
}

pub trait WikiWriteApi: WikiApi {
    fn login(&mut self, username: &str, password: &str) -> Result<()>;
    fn save_page(&mut self, page: &PageContent, summary: &str) -> Result<SaveOutcome>;
}

/// Shared single-threaded handle to a site; the whole pipeline is pull-based,
/// so interior mutability is enough and no locking is involved.
pub type Site = Rc<RefCell<dyn WikiApi>>;
pub type WriteSite = Rc<RefCell<dyn WikiWriteApi>>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub site_id: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub retry: RetryPolicy,
}

impl ClientConfig {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            api_url: config.api_url().unwrap_or_default(),
            site_id: config.site_id(),
            user_agent: config.user_agent(),
            timeout_ms: env_u64("WIKI_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_read_ms: env_u64("WIKI_RATE_LIMIT_READ", 300),
            rate_limit_write_ms: env_u64("WIKI_RATE_LIMIT_WRITE", 1_000),
            retry: RetryPolicy::new(
                env_u64("WIKI_HTTP_RETRIES", 3) as usize,
                Duration::from_millis(env_u64("WIKI_HTTP_RETRY_DELAY_MS", 500)),
            ),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

/// Production client over the MediaWiki action API (`formatversion=2`),
/// with cookie-based sessions, CSRF token caching, rate limiting and the
/// shared retry policy.
pub struct MediaWikiClient {
    client: Client,
    config: ClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
    csrf_token: Option<String>,
    namespace_table: Option<NamespaceTable>,
}

impl MediaWikiClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.api_url.is_empty() {
            bail!("no API URL configured; set WIKI_API_URL or [site] api_url in wikibot.toml");
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;
        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
            csrf_token: None,
            namespace_table: None,
        })
    }

    pub fn request_count(&self) -> usize {
        self.request_count
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn base_pairs(params: &[(&str, String)]) -> Vec<(String, String)> {
        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push(((*key).to_string(), value.clone()));
            }
        }
        pairs
    }

    /// GET returning the raw payload, API `error` object included.
    fn api_get_raw(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let base_url = Url::parse(&self.config.api_url)
            .with_context(|| format!("invalid API URL: {}", self.config.api_url))?;
        let pairs = Self::base_pairs(params);
        let retry = self.config.retry.clone();
        retry.run(
            || {
                self.apply_rate_limit(false);
                let response = self
                    .client
                    .get(base_url.clone())
                    .header("User-Agent", self.config.user_agent.clone())
                    .query(&pairs)
                    .send()
                    .context("failed to call MediaWiki API")?;
                let status = response.status();
                if !status.is_success() {
                    return Err(HttpStatusError(status).into());
                }
                response
                    .json()
                    .context("failed to decode MediaWiki API JSON response")
            },
            is_retryable,
        )
    }

    fn api_get(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let payload = self.api_get_raw(params)?;
        ensure_no_api_error(&payload)?;
        Ok(payload)
    }

    fn api_post_raw(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let pairs = Self::base_pairs(params);
        let url = self.config.api_url.clone();
        // Writes are never retried blindly; conflict handling is the
        // caller's responsibility.
        self.apply_rate_limit(true);
        let response = self
            .client
            .post(&url)
            .header("User-Agent", self.config.user_agent.clone())
            .form(&pairs)
            .send()
            .context("failed to call MediaWiki API")?;
        let status = response.status();
        if !status.is_success() {
            bail!("MediaWiki API request failed with HTTP {status}");
        }
        response
            .json()
            .context("failed to decode MediaWiki API JSON response")
    }

    fn ensure_csrf_token(&mut self) -> Result<String> {
        if let Some(token) = &self.csrf_token {
            return Ok(token.clone());
        }
        let payload = self.api_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
        ])?;
        let token = payload
            .pointer("/query/tokens/csrftoken")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki csrf token"))?;
        self.csrf_token = Some(token.clone());
        Ok(token)
    }

    /// Turn a `list=` query response into a Batch, skipping items the API
    /// could not resolve into a page (suppressed log entries and the like).
    fn list_batch(&self, payload: &Value, list: &str, cont_key: &str) -> Batch {
        let mut pages = Vec::new();
        if let Some(items) = payload
            .pointer(&format!("/query/{list}"))
            .and_then(Value::as_array)
        {
            for item in items {
                match page_from_item(&self.config.site_id, item) {
                    Some(page) => pages.push(page),
                    None => warn!(list, "skipping {list} entry without a usable title"),
                }
            }
        }
        let cont = continuation(payload, cont_key);
        debug!(list, pages = pages.len(), more = cont.is_some(), "fetched batch");
        Batch { pages, cont }
    }

    fn wikibase_item(&mut self, page: &PageRef) -> Result<Option<String>> {
        let payload = self.api_get(&[
            ("action", "query".to_string()),
            ("titles", page.title.clone()),
            ("prop", "pageprops".to_string()),
            ("ppprop", "wikibase_item".to_string()),
        ])?;
        Ok(payload
            .pointer("/query/pages/0/pageprops/wikibase_item")
            .and_then(Value::as_str)
            .map(ToString::to_string))
    }
}

#[derive(Debug)]
struct HttpStatusError(StatusCode);

impl std::fmt::Display for HttpStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MediaWiki API request failed with HTTP {}", self.0)
    }
}

impl std::error::Error for HttpStatusError {}

fn is_retryable(error: &anyhow::Error) -> bool {
    for cause in error.chain() {
        if let Some(status) = cause.downcast_ref::<HttpStatusError>() {
            return matches!(status.0.as_u16(), 429 | 500 | 502 | 503 | 504);
        }
        if let Some(request_error) = cause.downcast_ref::<reqwest::Error>() {
            return request_error.is_timeout() || request_error.is_connect();
        }
    }
    false
}

fn ensure_no_api_error(payload: &Value) -> Result<()> {
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info");
        bail!("MediaWiki API error [{code}]: {info}");
    }
    Ok(())
}

fn api_error_code(payload: &Value) -> Option<&str> {
    payload.pointer("/error/code").and_then(Value::as_str)
}

fn page_from_item(site: &str, item: &Value) -> Option<PageRef> {
    let title = item.get("title").and_then(Value::as_str)?;
    let namespace = item.get("ns").and_then(Value::as_i64).unwrap_or(0) as i32;
    let mut page = PageRef::new(site, namespace, title);
    if let Some(id) = item.get("pageid").and_then(Value::as_u64) {
        page = page.with_id(id);
    }
    Some(page)
}

fn continuation(payload: &Value, cont_key: &str) -> Option<String> {
    match payload.pointer(&format!("/continue/{cont_key}")) {
        Some(Value::String(token)) => Some(token.clone()),
        Some(Value::Number(offset)) => Some(offset.to_string()),
        _ => None,
    }
}

fn join_ids(ids: &[i32]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("|")
}

impl WikiApi for MediaWikiClient {
    fn site_id(&self) -> String {
        self.config.site_id.clone()
    }

    fn namespaces(&mut self) -> Result<NamespaceTable> {
        if let Some(table) = &self.namespace_table {
            return Ok(table.clone());
        }
        let payload = self.api_get(&[
            ("action", "query".to_string()),
            ("meta", "siteinfo".to_string()),
            ("siprop", "namespaces|namespacealiases".to_string()),
        ])?;
        let mut namespaces = Vec::new();
        if let Some(table) = payload
            .pointer("/query/namespaces")
            .and_then(Value::as_object)
        {
            for entry in table.values() {
                let Some(id) = entry.get("id").and_then(Value::as_i64) else {
                    continue;
                };
                let canonical = entry
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let subpages = entry
                    .get("subpages")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                namespaces.push(Namespace {
                    id: id as i32,
                    canonical,
                    aliases: Vec::new(),
                    subpages,
                });
            }
        }
        if let Some(aliases) = payload
            .pointer("/query/namespacealiases")
            .and_then(Value::as_array)
        {
            for entry in aliases {
                let id = entry.get("id").and_then(Value::as_i64).unwrap_or(0) as i32;
                let alias = entry.get("alias").and_then(Value::as_str).unwrap_or("");
                if let Some(ns) = namespaces.iter_mut().find(|ns| ns.id == id)
                    && !alias.is_empty()
                {
                    ns.aliases.push(alias.to_string());
                }
            }
        }
        if namespaces.is_empty() {
            bail!("siteinfo response contained no namespaces");
        }
        let table = NamespaceTable::new(namespaces);
        self.namespace_table = Some(table.clone());
        Ok(table)
    }

    fn all_pages(
        &mut self,
        namespace: i32,
        start: Option<&str>,
        cont: Option<&str>,
    ) -> Result<Batch> {
        let payload = self.api_get(&[
            ("action", "query".to_string()),
            ("list", "allpages".to_string()),
            ("apnamespace", namespace.to_string()),
            ("aplimit", "500".to_string()),
            ("apfrom", start.unwrap_or_default().to_string()),
            ("apcontinue", cont.unwrap_or_default().to_string()),
        ])?;
        Ok(self.list_batch(&payload, "allpages", "apcontinue"))
    }

    fn category_members(&mut self, category: &str, cont: Option<&str>) -> Result<Batch> {
        let title = if category.starts_with("Category:") {
            category.to_string()
        } else {
            format!("Category:{category}")
        };
        let payload = self.api_get(&[
            ("action", "query".to_string()),
            ("list", "categorymembers".to_string()),
            ("cmtitle", title),
            ("cmlimit", "500".to_string()),
            ("cmcontinue", cont.unwrap_or_default().to_string()),
        ])?;
        Ok(self.list_batch(&payload, "categorymembers", "cmcontinue"))
    }

    fn backlinks(&mut self, title: &str, cont: Option<&str>) -> Result<Batch> {
        let payload = self.api_get(&[
            ("action", "query".to_string()),
            ("list", "backlinks".to_string()),
            ("bltitle", title.to_string()),
            ("bllimit", "500".to_string()),
            ("blcontinue", cont.unwrap_or_default().to_string()),
        ])?;
        Ok(self.list_batch(&payload, "backlinks", "blcontinue"))
    }

    fn embedded_in(&mut self, title: &str, cont: Option<&str>) -> Result<Batch> {
        let payload = self.api_get(&[
            ("action", "query".to_string()),
            ("list", "embeddedin".to_string()),
            ("eititle", title.to_string()),
            ("eilimit", "500".to_string()),
            ("eicontinue", cont.unwrap_or_default().to_string()),
        ])?;
        Ok(self.list_batch(&payload, "embeddedin", "eicontinue"))
    }

    fn page_links(&mut self, title: &str, cont: Option<&str>) -> Result<Batch> {
        let payload = self.api_get(&[
            ("action", "query".to_string()),
            ("titles", title.to_string()),
            ("prop", "links".to_string()),
            ("pllimit", "500".to_string()),
            ("plcontinue", cont.unwrap_or_default().to_string()),
        ])?;
        let mut pages = Vec::new();
        if let Some(links) = payload
            .pointer("/query/pages/0/links")
            .and_then(Value::as_array)
        {
            for item in links {
                match page_from_item(&self.config.site_id, item) {
                    Some(page) => pages.push(page),
                    None => warn!("skipping link entry without a usable title"),
                }
            }
        }
        let cont = continuation(&payload, "plcontinue");
        Ok(Batch { pages, cont })
    }

    fn new_pages(&mut self, namespaces: &[i32], cont: Option<&str>) -> Result<Batch> {
        let payload = self.api_get(&[
            ("action", "query".to_string()),
            ("list", "recentchanges".to_string()),
            ("rctype", "new".to_string()),
            ("rcnamespace", join_ids(namespaces)),
            ("rcprop", "title|ids".to_string()),
            ("rclimit", "500".to_string()),
            ("rccontinue", cont.unwrap_or_default().to_string()),
        ])?;
        Ok(self.list_batch(&payload, "recentchanges", "rccontinue"))
    }

    fn recent_changes(&mut self, cont: Option<&str>) -> Result<Batch> {
        let payload = self.api_get(&[
            ("action", "query".to_string()),
            ("list", "recentchanges".to_string()),
            ("rctype", "edit|new".to_string()),
            ("rcprop", "title|ids".to_string()),
            ("rclimit", "500".to_string()),
            ("rccontinue", cont.unwrap_or_default().to_string()),
        ])?;
        Ok(self.list_batch(&payload, "recentchanges", "rccontinue"))
    }

    fn random_pages(&mut self, count: usize) -> Result<Batch> {
        let payload = self.api_get(&[
            ("action", "query".to_string()),
            ("list", "random".to_string()),
            ("rnnamespace", "0".to_string()),
            ("rnlimit", count.clamp(1, 500).to_string()),
        ])?;
        Ok(self.list_batch(&payload, "random", "rncontinue"))
    }

    fn search(&mut self, query: &str, cont: Option<&str>) -> Result<Batch> {
        let payload = self.api_get(&[
            ("action", "query".to_string()),
            ("list", "search".to_string()),
            ("srsearch", query.to_string()),
            ("srlimit", "50".to_string()),
            ("sroffset", cont.unwrap_or_default().to_string()),
        ])?;
        Ok(self.list_batch(&payload, "search", "sroffset"))
    }

    fn ext_url_usage(&mut self, query: &str, cont: Option<&str>) -> Result<Batch> {
        let payload = self.api_get(&[
            ("action", "query".to_string()),
            ("list", "exturlusage".to_string()),
            ("euquery", query.to_string()),
            ("euprop", "title|ids".to_string()),
            ("eulimit", "500".to_string()),
            ("eucontinue", cont.unwrap_or_default().to_string()),
        ])?;
        Ok(self.list_batch(&payload, "exturlusage", "eucontinue"))
    }

    fn log_events(&mut self, log_type: &str, cont: Option<&str>) -> Result<Batch> {
        let payload = self.api_get(&[
            ("action", "query".to_string()),
            ("list", "logevents".to_string()),
            ("letype", log_type.to_string()),
            ("lelimit", "500".to_string()),
            ("lecontinue", cont.unwrap_or_default().to_string()),
        ])?;
        Ok(self.list_batch(&payload, "logevents", "lecontinue"))
    }

    fn user_contribs(&mut self, user: &str, cont: Option<&str>) -> Result<Batch> {
        let payload = self.api_get(&[
            ("action", "query".to_string()),
            ("list", "usercontribs".to_string()),
            ("ucuser", user.to_string()),
            ("uclimit", "500".to_string()),
            ("uccontinue", cont.unwrap_or_default().to_string()),
        ])?;
        Ok(self.list_batch(&payload, "usercontribs", "uccontinue"))
    }

    fn prefix_index(&mut self, prefix: &str, namespace: i32, cont: Option<&str>) -> Result<Batch> {
        let payload = self.api_get(&[
            ("action", "query".to_string()),
            ("list", "allpages".to_string()),
            ("apprefix", prefix.to_string()),
            ("apnamespace", namespace.to_string()),
            ("aplimit", "500".to_string()),
            ("apcontinue", cont.unwrap_or_default().to_string()),
        ])?;
        Ok(self.list_batch(&payload, "allpages", "apcontinue"))
    }

    fn pages_by_ids(&mut self, ids: &[u64]) -> Result<Vec<PageRef>> {
        let mut pages = Vec::new();
        for chunk in ids.chunks(self.max_batch_size()) {
            let joined = chunk
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("|");
            let payload = self.api_get(&[
                ("action", "query".to_string()),
                ("pageids", joined),
            ])?;
            if let Some(items) = payload.pointer("/query/pages").and_then(Value::as_array) {
                for item in items {
                    if item.get("missing").and_then(Value::as_bool).unwrap_or(false) {
                        warn!("skipping missing page id");
                        continue;
                    }
                    match page_from_item(&self.config.site_id, item) {
                        Some(page) => pages.push(page),
                        None => warn!("skipping page id entry without a usable title"),
                    }
                }
            }
        }
        Ok(pages)
    }

    fn fetch_content(&mut self, refs: &[PageRef]) -> Result<Vec<PageContent>> {
        let mut results = Vec::new();
        for chunk in refs.chunks(self.max_batch_size()) {
            let titles = chunk
                .iter()
                .map(|page| page.title.as_str())
                .collect::<Vec<_>>()
                .join("|");
            let payload = self.api_get(&[
                ("action", "query".to_string()),
                ("titles", titles),
                ("prop", "revisions".to_string()),
                ("rvprop", "content|timestamp|ids".to_string()),
                ("rvslots", "main".to_string()),
            ])?;
            let Some(items) = payload.pointer("/query/pages").and_then(Value::as_array) else {
                continue;
            };
            for item in items {
                let Some(title) = item.get("title").and_then(Value::as_str) else {
                    continue;
                };
                if item.get("missing").and_then(Value::as_bool).unwrap_or(false) {
                    warn!(title, "page not found, skipping");
                    continue;
                }
                let Some(revision) = item.pointer("/revisions/0") else {
                    warn!(title, "page has no readable revision, skipping");
                    continue;
                };
                let Some(text) = revision
                    .pointer("/slots/main/content")
                    .and_then(Value::as_str)
                else {
                    warn!(title, "revision content hidden, skipping");
                    continue;
                };
                let revid = revision.get("revid").and_then(Value::as_u64).unwrap_or(0);
                let timestamp = revision
                    .get("timestamp")
                    .and_then(Value::as_str)
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|parsed| parsed.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now);
                let namespace = item.get("ns").and_then(Value::as_i64).unwrap_or(0) as i32;
                let mut page = PageRef::new(&self.config.site_id, namespace, title);
                if let Some(id) = item.get("pageid").and_then(Value::as_u64) {
                    page = page.with_id(id);
                }
                results.push(PageContent::new(page, text, revid, timestamp));
            }
        }
        Ok(results)
    }

    fn categories_of(&mut self, page: &PageRef) -> Result<Vec<String>> {
        let mut categories = Vec::new();
        let mut cont: Option<String> = None;
        loop {
            let payload = self.api_get(&[
                ("action", "query".to_string()),
                ("titles", page.title.clone()),
                ("prop", "categories".to_string()),
                ("cllimit", "500".to_string()),
                ("clcontinue", cont.clone().unwrap_or_default()),
            ])?;
            if let Some(items) = payload
                .pointer("/query/pages/0/categories")
                .and_then(Value::as_array)
            {
                for item in items {
                    if let Some(title) = item.get("title").and_then(Value::as_str) {
                        categories.push(title.to_string());
                    }
                }
            }
            cont = continuation(&payload, "clcontinue");
            if cont.is_none() {
                break;
            }
        }
        Ok(categories)
    }

    fn quality_level(&mut self, page: &PageRef) -> Result<Option<u8>> {
        let payload = self.api_get_raw(&[
            ("action", "query".to_string()),
            ("titles", page.title.clone()),
            ("prop", "proofread".to_string()),
        ])?;
        if api_error_code(&payload).is_some() {
            return Ok(None);
        }
        Ok(payload
            .pointer("/query/pages/0/proofread/quality")
            .and_then(Value::as_u64)
            .map(|quality| quality.min(u64::from(u8::MAX)) as u8))
    }

    fn item_claims(&mut self, page: &PageRef) -> Result<Vec<(String, String)>> {
        let Some(item) = self.wikibase_item(page)? else {
            return Ok(Vec::new());
        };
        let payload = self.api_get(&[
            ("action", "wbgetclaims".to_string()),
            ("entity", item),
        ])?;
        let mut claims = Vec::new();
        if let Some(map) = payload.get("claims").and_then(Value::as_object) {
            for (property, statements) in map {
                let Some(statements) = statements.as_array() else {
                    continue;
                };
                for statement in statements {
                    let value = statement.pointer("/mainsnak/datavalue/value");
                    let rendered = match value {
                        Some(Value::String(text)) => text.clone(),
                        Some(Value::Object(object)) => object
                            .get("id")
                            .and_then(Value::as_str)
                            .map(ToString::to_string)
                            .unwrap_or_else(|| Value::Object(object.clone()).to_string()),
                        Some(other) => other.to_string(),
                        None => continue,
                    };
                    claims.push((property.clone(), rendered));
                }
            }
        }
        Ok(claims)
    }

    fn proofread_namespace(&mut self) -> Result<Option<i32>> {
        let payload = self.api_get_raw(&[
            ("action", "query".to_string()),
            ("meta", "proofreadinfo".to_string()),
            ("prprop", "namespaces".to_string()),
        ])?;
        if api_error_code(&payload).is_some() {
            // ProofreadPage extension not installed.
            return Ok(None);
        }
        Ok(payload
            .pointer("/query/proofreadnamespaces/0/id")
            .and_then(Value::as_i64)
            .map(|id| id as i32))
    }
}

impl WikiWriteApi for MediaWikiClient {
    fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let payload = self.api_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
            ("type", "login".to_string()),
        ])?;
        let token = payload
            .pointer("/query/tokens/logintoken")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki login token"))?
            .to_string();
        let payload = self.api_post_raw(&[
            ("action", "login".to_string()),
            ("lgname", username.to_string()),
            ("lgpassword", password.to_string()),
            ("lgtoken", token),
        ])?;
        ensure_no_api_error(&payload)?;
        let result = payload
            .pointer("/login/result")
            .and_then(Value::as_str)
            .unwrap_or("Failed");
        if result != "Success" {
            bail!("MediaWiki login failed: {result}");
        }
        // A fresh session invalidates any cached edit token.
        self.csrf_token = None;
        Ok(())
    }

    fn save_page(&mut self, page: &PageContent, summary: &str) -> Result<SaveOutcome> {
        let token = self.ensure_csrf_token()?;
        let payload = self.api_post_raw(&[
            ("action", "edit".to_string()),
            ("title", page.page.title.clone()),
            ("text", page.text.clone()),
            ("summary", summary.to_string()),
            ("bot", "1".to_string()),
            (
                "basetimestamp",
                page.timestamp.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            ),
            ("nocreate", "1".to_string()),
            ("token", token),
        ])?;
        match api_error_code(&payload) {
            Some("editconflict") => return Ok(SaveOutcome::EditConflict),
            Some("missingtitle") | Some("pagedeleted") => return Ok(SaveOutcome::PageMissing),
            Some("badtoken") => {
                self.csrf_token = None;
                bail!("MediaWiki rejected the edit token; re-run after logging in again");
            }
            Some(_) => {
                ensure_no_api_error(&payload)?;
            }
            None => {}
        }
        if payload.pointer("/edit/nochange").is_some() {
            return Ok(SaveOutcome::NoChange);
        }
        let result = payload
            .pointer("/edit/result")
            .and_then(Value::as_str)
            .unwrap_or("Failure");
        if result != "Success" {
            bail!("MediaWiki edit failed: {result}");
        }
        let new_revid = payload
            .pointer("/edit/newrevid")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        Ok(SaveOutcome::Saved { new_revid })
    }
}
