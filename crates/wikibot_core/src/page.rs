use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};

/// Identity of a wiki page: owning site, namespace id and canonical title.
///
/// Equality and hashing use the (site, namespace, title) triple only; a page
/// id, when known, is carried along but never participates in identity.
#[derive(Debug, Clone, Eq)]
pub struct PageRef {
    pub site: String,
    pub namespace: i32,
    pub title: String,
    pub page_id: Option<u64>,
}

impl PageRef {
    pub fn new(site: impl Into<String>, namespace: i32, title: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            namespace,
            title: title.into(),
            page_id: None,
        }
    }

    pub fn with_id(mut self, page_id: u64) -> Self {
        self.page_id = Some(page_id);
        self
    }

    /// Subpage depth of the title: number of "/" separators, or 0 when the
    /// namespace does not support subpages.
    pub fn depth(&self, supports_subpages: bool) -> usize {
        if supports_subpages {
            self.title.matches('/').count()
        } else {
            0
        }
    }
}

impl PartialEq for PageRef {
    fn eq(&self, other: &Self) -> bool {
        self.site == other.site && self.namespace == other.namespace && self.title == other.title
    }
}

impl Hash for PageRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.site.hash(state);
        self.namespace.hash(state);
        self.title.hash(state);
    }
}

impl fmt::Display for PageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[[{}]]", self.title)
    }
}

/// A page with fetched wikitext and revision metadata. Created by the
/// preloading stage (or a direct fetch) and handed to the bot driver, which
/// either saves or discards it; the pipeline itself never retains one.
#[derive(Debug, Clone)]
pub struct PageContent {
    pub page: PageRef,
    pub text: String,
    pub latest_revid: u64,
    pub timestamp: DateTime<Utc>,
}

impl PageContent {
    pub fn new(
        page: PageRef,
        text: impl Into<String>,
        latest_revid: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            page,
            text: text.into(),
            latest_revid,
            timestamp,
        }
    }

    pub fn title(&self) -> &str {
        &self.page.title
    }
}
