//! Offline test double for the site traits, shared by the pipeline tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use anyhow::Result;
use chrono::{TimeZone, Utc};

use crate::page::{PageContent, PageRef};
use crate::site::{
    Batch, NamespaceTable, SaveOutcome, Site, WikiApi, WikiWriteApi, WriteSite, parse_title,
};

/// In-memory wiki serving canned query results with real pagination, so the
/// lazy iterators exercise their continuation handling.
pub struct FakeWiki {
    site_id: String,
    table: NamespaceTable,
    lists: BTreeMap<String, Vec<PageRef>>,
    texts: HashMap<String, (String, u64)>,
    categories: HashMap<String, Vec<String>>,
    claims: HashMap<String, Vec<(String, String)>>,
    quality: HashMap<String, u8>,
    proofread_ns: Option<i32>,
    page_size: usize,
    pub fetch_calls: Vec<Vec<String>>,
    pub saves: Vec<(String, String, String)>,
    conflict_once: HashSet<String>,
    missing_on_save: HashSet<String>,
}

impl FakeWiki {
    pub fn new(site_id: &str) -> Self {
        Self {
            site_id: site_id.to_string(),
            table: NamespaceTable::mediawiki_defaults(),
            lists: BTreeMap::new(),
            texts: HashMap::new(),
            categories: HashMap::new(),
            claims: HashMap::new(),
            quality: HashMap::new(),
            proofread_ns: None,
            page_size: 2,
            fetch_calls: Vec::new(),
            saves: Vec::new(),
            conflict_once: HashSet::new(),
            missing_on_save: HashSet::new(),
        }
    }

    /// Batch granularity for paginated queries; small by default so tests
    /// cross continuation boundaries.
    pub fn set_page_size(&mut self, page_size: usize) {
        self.page_size = page_size.max(1);
    }

    fn make_page(&self, title: &str) -> PageRef {
        parse_title(&self.site_id, &self.table, title)
            .unwrap_or_else(|| PageRef::new(&self.site_id, 0, title))
    }

    pub fn set_list(&mut self, key: &str, titles: &[&str]) {
        let pages = titles.iter().map(|title| self.make_page(title)).collect();
        self.lists.insert(key.to_string(), pages);
    }

    pub fn set_pages_with_ids(&mut self, key: &str, pages: &[(&str, u64)]) {
        let pages = pages
            .iter()
            .map(|(title, id)| self.make_page(title).with_id(*id))
            .collect();
        self.lists.insert(key.to_string(), pages);
    }

    pub fn set_text(&mut self, title: &str, text: &str) {
        let revid = self.texts.len() as u64 + 1;
        self.texts.insert(title.to_string(), (text.to_string(), revid));
    }

    pub fn set_categories(&mut self, title: &str, categories: &[&str]) {
        self.categories.insert(
            title.to_string(),
            categories.iter().map(ToString::to_string).collect(),
        );
    }

    pub fn set_claims(&mut self, title: &str, claims: &[(&str, &str)]) {
        self.claims.insert(
            title.to_string(),
            claims
                .iter()
                .map(|(p, v)| (p.to_string(), v.to_string()))
                .collect(),
        );
    }

    pub fn set_quality(&mut self, title: &str, level: u8) {
        self.quality.insert(title.to_string(), level);
    }

    pub fn set_proofread_namespace(&mut self, ns: i32) {
        self.proofread_ns = Some(ns);
    }

    pub fn conflict_once_on(&mut self, title: &str) {
        self.conflict_once.insert(title.to_string());
    }

    pub fn missing_on_save(&mut self, title: &str) {
        self.missing_on_save.insert(title.to_string());
    }

    fn serve(&self, key: &str, cont: Option<&str>) -> Batch {
        let list = self.lists.get(key).cloned().unwrap_or_default();
        let start = cont.and_then(|token| token.parse::<usize>().ok()).unwrap_or(0);
        let end = (start + self.page_size).min(list.len());
        let cont = if end < list.len() {
            Some(end.to_string())
        } else {
            None
        };
        Batch {
            pages: list[start.min(list.len())..end].to_vec(),
            cont,
        }
    }
}

impl WikiApi for FakeWiki {
    fn site_id(&self) -> String {
        self.site_id.clone()
    }

    fn namespaces(&mut self) -> Result<NamespaceTable> {
        Ok(self.table.clone())
    }

    fn max_batch_size(&self) -> usize {
        10
    }

    fn all_pages(
        &mut self,
        namespace: i32,
        _start: Option<&str>,
        cont: Option<&str>,
    ) -> Result<Batch> {
        Ok(self.serve(&format!("all:{namespace}"), cont))
    }

    fn category_members(&mut self, category: &str, cont: Option<&str>) -> Result<Batch> {
        let name = category.strip_prefix("Category:").unwrap_or(category);
        Ok(self.serve(&format!("cat:{name}"), cont))
    }

    fn backlinks(&mut self, title: &str, cont: Option<&str>) -> Result<Batch> {
        Ok(self.serve(&format!("ref:{title}"), cont))
    }

    fn embedded_in(&mut self, title: &str, cont: Option<&str>) -> Result<Batch> {
        Ok(self.serve(&format!("embed:{title}"), cont))
    }

    fn page_links(&mut self, title: &str, cont: Option<&str>) -> Result<Batch> {
        Ok(self.serve(&format!("links:{title}"), cont))
    }

    fn new_pages(&mut self, namespaces: &[i32], cont: Option<&str>) -> Result<Batch> {
        let batch = self.serve("new", cont);
        let pages = batch
            .pages
            .into_iter()
            .filter(|page| namespaces.is_empty() || namespaces.contains(&page.namespace))
            .collect();
        Ok(Batch {
            pages,
            cont: batch.cont,
        })
    }

    fn recent_changes(&mut self, cont: Option<&str>) -> Result<Batch> {
        Ok(self.serve("rc", cont))
    }

    fn random_pages(&mut self, count: usize) -> Result<Batch> {
        let mut batch = self.serve("random", None);
        batch.pages.truncate(count);
        batch.cont = None;
        Ok(batch)
    }

    fn search(&mut self, query: &str, cont: Option<&str>) -> Result<Batch> {
        Ok(self.serve(&format!("search:{query}"), cont))
    }

    fn ext_url_usage(&mut self, query: &str, cont: Option<&str>) -> Result<Batch> {
        Ok(self.serve(&format!("weblink:{query}"), cont))
    }

    fn log_events(&mut self, log_type: &str, cont: Option<&str>) -> Result<Batch> {
        Ok(self.serve(&format!("log:{log_type}"), cont))
    }

    fn user_contribs(&mut self, user: &str, cont: Option<&str>) -> Result<Batch> {
        Ok(self.serve(&format!("contribs:{user}"), cont))
    }

    fn prefix_index(&mut self, prefix: &str, _namespace: i32, cont: Option<&str>) -> Result<Batch> {
        Ok(self.serve(&format!("prefix:{prefix}"), cont))
    }

    fn pages_by_ids(&mut self, ids: &[u64]) -> Result<Vec<PageRef>> {
        let known = self.lists.get("ids").cloned().unwrap_or_default();
        Ok(known
            .into_iter()
            .filter(|page| page.page_id.is_some_and(|id| ids.contains(&id)))
            .collect())
    }

    fn fetch_content(&mut self, refs: &[PageRef]) -> Result<Vec<PageContent>> {
        self.fetch_calls
            .push(refs.iter().map(|page| page.title.clone()).collect());
        let mut contents = Vec::new();
        for page in refs {
            if let Some((text, revid)) = self.texts.get(&page.title) {
                let timestamp = Utc.timestamp_opt(1_600_000_000 + *revid as i64, 0).unwrap();
                contents.push(PageContent::new(page.clone(), text.clone(), *revid, timestamp));
            }
        }
        Ok(contents)
    }

    fn categories_of(&mut self, page: &PageRef) -> Result<Vec<String>> {
        Ok(self.categories.get(&page.title).cloned().unwrap_or_default())
    }

    fn quality_level(&mut self, page: &PageRef) -> Result<Option<u8>> {
        Ok(self.quality.get(&page.title).copied())
    }

    fn item_claims(&mut self, page: &PageRef) -> Result<Vec<(String, String)>> {
        Ok(self.claims.get(&page.title).cloned().unwrap_or_default())
    }

    fn proofread_namespace(&mut self) -> Result<Option<i32>> {
        Ok(self.proofread_ns)
    }
}

impl WikiWriteApi for FakeWiki {
    fn login(&mut self, _username: &str, _password: &str) -> Result<()> {
        Ok(())
    }

    fn save_page(&mut self, page: &PageContent, summary: &str) -> Result<SaveOutcome> {
        let title = page.page.title.clone();
        if self.missing_on_save.contains(&title) {
            return Ok(SaveOutcome::PageMissing);
        }
        if self.conflict_once.remove(&title) {
            return Ok(SaveOutcome::EditConflict);
        }
        if let Some((stored, _)) = self.texts.get(&title)
            && stored == &page.text
        {
            return Ok(SaveOutcome::NoChange);
        }
        let new_revid = page.latest_revid + 100;
        self.texts.insert(title.clone(), (page.text.clone(), new_revid));
        self.saves.push((title, page.text.clone(), summary.to_string()));
        Ok(SaveOutcome::Saved { new_revid })
    }
}

pub fn shared(wiki: FakeWiki) -> Site {
    Rc::new(RefCell::new(wiki))
}

pub fn shared_handle(wiki: FakeWiki) -> Rc<RefCell<FakeWiki>> {
    Rc::new(RefCell::new(wiki))
}

pub fn as_site(handle: &Rc<RefCell<FakeWiki>>) -> Site {
    handle.clone()
}

pub fn as_write_site(handle: &Rc<RefCell<FakeWiki>>) -> WriteSite {
    handle.clone()
}
