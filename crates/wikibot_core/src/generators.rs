//! Source iterators: lazy sequences of PageRefs, one per backing query type.
//!
//! Every constructor returns a boxed iterator that suspends at each network
//! call boundary and hides the backing query's pagination. The sequences are
//! not restartable; re-invoke the constructor to iterate again. An item the
//! API cannot resolve into a page is skipped with a logged warning; a failed
//! fetch ends the sequence after a warning rather than panicking the run.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

use crate::combine::PageIter;
use crate::page::PageRef;
use crate::site::{Batch, Site, parse_title};

const NS_CATEGORY: i32 = 14;

/// Adapter turning a batch-at-a-time fetch closure into a lazy page
/// sequence, with an optional `total` cap.
pub struct PagedIter<F>
where
    F: FnMut(Option<&str>) -> Result<Batch>,
{
    fetch: F,
    buffer: VecDeque<PageRef>,
    cont: Option<String>,
    exhausted: bool,
    remaining: Option<usize>,
}

impl<F> PagedIter<F>
where
    F: FnMut(Option<&str>) -> Result<Batch>,
{
    pub fn new(fetch: F, total: Option<usize>) -> Self {
        Self {
            fetch,
            buffer: VecDeque::new(),
            cont: None,
            exhausted: false,
            remaining: total,
        }
    }
}

impl<F> Iterator for PagedIter<F>
where
    F: FnMut(Option<&str>) -> Result<Batch>,
{
    type Item = PageRef;

    fn next(&mut self) -> Option<PageRef> {
        loop {
            if self.remaining == Some(0) {
                return None;
            }
            if let Some(page) = self.buffer.pop_front() {
                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining -= 1;
                }
                return Some(page);
            }
            if self.exhausted {
                return None;
            }
            match (self.fetch)(self.cont.as_deref()) {
                Ok(batch) => {
                    self.cont = batch.cont;
                    if self.cont.is_none() {
                        self.exhausted = true;
                    }
                    self.buffer.extend(batch.pages);
                }
                Err(error) => {
                    warn!(error = %error, "query failed, ending sequence");
                    self.exhausted = true;
                    return None;
                }
            }
        }
    }
}

fn boxed<F>(fetch: F, total: Option<usize>) -> PageIter
where
    F: FnMut(Option<&str>) -> Result<Batch> + 'static,
{
    Box::new(PagedIter::new(fetch, total))
}

/// Members of one category, without recursion.
pub fn category_members(site: Site, category: &str, total: Option<usize>) -> PageIter {
    let category = category.to_string();
    boxed(
        move |cont| site.borrow_mut().category_members(&category, cont),
        total,
    )
}

/// Members of a category and all its subcategories. Breadth-first walk with
/// a visited set, so subcategory loops terminate; subcategory pages are
/// descended into but not yielded.
pub fn category_members_recursive(site: Site, category: &str, total: Option<usize>) -> PageIter {
    struct CatWalk {
        site: Site,
        queue: VecDeque<String>,
        visited: HashSet<String>,
        current: Option<String>,
        cont: Option<String>,
        buffer: VecDeque<PageRef>,
        remaining: Option<usize>,
    }

    impl Iterator for CatWalk {
        type Item = PageRef;

        fn next(&mut self) -> Option<PageRef> {
            loop {
                if self.remaining == Some(0) {
                    return None;
                }
                if let Some(page) = self.buffer.pop_front() {
                    if page.namespace == NS_CATEGORY {
                        if self.visited.insert(page.title.clone()) {
                            self.queue.push_back(page.title.clone());
                        }
                        continue;
                    }
                    if let Some(remaining) = self.remaining.as_mut() {
                        *remaining -= 1;
                    }
                    return Some(page);
                }
                if self.current.is_none() {
                    self.current = self.queue.pop_front();
                    self.cont = None;
                }
                let category = self.current.clone()?;
                let batch = match self
                    .site
                    .borrow_mut()
                    .category_members(&category, self.cont.as_deref())
                {
                    Ok(batch) => batch,
                    Err(error) => {
                        warn!(category, error = %error, "category query failed, skipping");
                        self.current = None;
                        continue;
                    }
                };
                self.cont = batch.cont;
                if self.cont.is_none() {
                    self.current = None;
                }
                self.buffer.extend(batch.pages);
            }
        }
    }

    let name = category.strip_prefix("Category:").unwrap_or(category);
    let root = format!("Category:{name}");
    let mut visited = HashSet::new();
    visited.insert(root.clone());
    Box::new(CatWalk {
        site,
        queue: VecDeque::from([root]),
        visited,
        current: None,
        cont: None,
        buffer: VecDeque::new(),
        remaining: total,
    })
}

/// Pages linked from one page.
pub fn linked_pages(site: Site, title: &str, total: Option<usize>) -> PageIter {
    let title = title.to_string();
    boxed(move |cont| site.borrow_mut().page_links(&title, cont), total)
}

/// Pages linking to one page (internal links and redirects).
pub fn referring_pages(site: Site, title: &str, total: Option<usize>) -> PageIter {
    let title = title.to_string();
    boxed(move |cont| site.borrow_mut().backlinks(&title, cont), total)
}

/// Pages transcluding one page.
pub fn transcluding_pages(site: Site, title: &str, total: Option<usize>) -> PageIter {
    let title = title.to_string();
    boxed(move |cont| site.borrow_mut().embedded_in(&title, cont), total)
}

/// All pages in one namespace, in title order, optionally from a start title.
pub fn all_pages(site: Site, namespace: i32, start: Option<String>, total: Option<usize>) -> PageIter {
    boxed(
        move |cont| site.borrow_mut().all_pages(namespace, start.as_deref(), cont),
        total,
    )
}

/// Recently created pages in the given namespaces (namespace selection is
/// fixed at construction time).
pub fn new_pages(site: Site, namespaces: Vec<i32>, total: Option<usize>) -> PageIter {
    boxed(
        move |cont| site.borrow_mut().new_pages(&namespaces, cont),
        total,
    )
}

/// Recently changed pages, newest first, duplicates possible.
pub fn recent_changes(site: Site, total: Option<usize>) -> PageIter {
    boxed(move |cont| site.borrow_mut().recent_changes(cont), total)
}

/// A fixed number of random pages.
pub fn random_pages(site: Site, count: usize) -> PageIter {
    boxed(move |_| site.borrow_mut().random_pages(count), Some(count))
}

/// Full-text search results.
pub fn search_pages(site: Site, query: &str, total: Option<usize>) -> PageIter {
    let query = query.to_string();
    boxed(move |cont| site.borrow_mut().search(&query, cont), total)
}

/// Pages containing an external link that matches the query.
pub fn weblink_pages(site: Site, query: &str, total: Option<usize>) -> PageIter {
    let query = query.to_string();
    boxed(
        move |cont| site.borrow_mut().ext_url_usage(&query, cont),
        total,
    )
}

/// Pages named in log events of one type; suppressed entries are skipped
/// by the site layer.
pub fn log_pages(site: Site, log_type: &str, total: Option<usize>) -> PageIter {
    let log_type = log_type.to_string();
    boxed(move |cont| site.borrow_mut().log_events(&log_type, cont), total)
}

/// Pages edited by one user.
pub fn user_contrib_pages(site: Site, user: &str, total: Option<usize>) -> PageIter {
    let user = user.to_string();
    boxed(move |cont| site.borrow_mut().user_contribs(&user, cont), total)
}

/// Pages whose title starts with a prefix; the prefix may carry a namespace.
pub fn prefix_pages(site: Site, prefix: &str, total: Option<usize>) -> PageIter {
    let (namespace, name) = match resolve_prefixed(&site, prefix) {
        Ok(parts) => parts,
        Err(error) => {
            warn!(prefix, error = %error, "could not resolve prefix");
            return Box::new(std::iter::empty());
        }
    };
    boxed(
        move |cont| site.borrow_mut().prefix_index(&name, namespace, cont),
        total,
    )
}

fn resolve_prefixed(site: &Site, raw: &str) -> Result<(i32, String)> {
    let mut api = site.borrow_mut();
    let table = api.namespaces()?;
    let site_id = api.site_id();
    drop(api);
    let page = parse_title(&site_id, &table, raw)
        .with_context(|| format!("empty title: {raw:?}"))?;
    let name = match page.title.split_once(':') {
        Some((_, rest)) if page.namespace != 0 => rest.to_string(),
        _ => page.title,
    };
    Ok((page.namespace, name))
}

/// Exactly one page, by title; the title is resolved against the site's
/// namespace table lazily, on first pull.
pub fn single_page(site: Site, title: &str) -> PageIter {
    let title = title.to_string();
    let mut done = false;
    Box::new(std::iter::from_fn(move || {
        if done {
            return None;
        }
        done = true;
        let mut api = site.borrow_mut();
        let table = match api.namespaces() {
            Ok(table) => table,
            Err(error) => {
                warn!(error = %error, "could not load namespace table");
                return None;
            }
        };
        let site_id = api.site_id();
        drop(api);
        match parse_title(&site_id, &table, &title) {
            Some(page) => Some(page),
            None => {
                warn!(title, "skipping empty page title");
                None
            }
        }
    }))
}

/// Pages looked up by numeric page id.
pub fn pages_from_ids(site: Site, ids: Vec<u64>) -> PageIter {
    boxed(
        move |_| {
            let pages = site.borrow_mut().pages_by_ids(&ids)?;
            Ok(Batch { pages, cont: None })
        },
        None,
    )
}

/// Pages read from a text file, one title per line, `[[...]]` brackets
/// tolerated. The file is read eagerly (a bad path is a configuration
/// error); titles resolve lazily.
pub fn pages_from_file(site: Site, path: &Path, total: Option<usize>) -> Result<PageIter> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read page list {}", path.display()))?;
    let lines: Vec<String> = content
        .lines()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect();
    let mut lines = VecDeque::from(lines);
    let mut remaining = total;
    Ok(Box::new(std::iter::from_fn(move || {
        loop {
            if remaining == Some(0) {
                return None;
            }
            let line = lines.pop_front()?;
            let mut api = site.borrow_mut();
            let table = match api.namespaces() {
                Ok(table) => table,
                Err(error) => {
                    warn!(error = %error, "could not load namespace table");
                    return None;
                }
            };
            let site_id = api.site_id();
            drop(api);
            match parse_title(&site_id, &table, &line) {
                Some(page) => {
                    if let Some(remaining) = remaining.as_mut() {
                        *remaining -= 1;
                    }
                    return Some(page);
                }
                None => {
                    warn!(line, "skipping unparsable title in page list");
                    continue;
                }
            }
        }
    })))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::testing::{FakeWiki, shared};

    fn titles(pages: impl Iterator<Item = PageRef>) -> Vec<String> {
        pages.map(|p| p.title).collect()
    }

    #[test]
    fn paged_iter_walks_continuations_lazily() {
        // Counted through a Cell so the assertions can read it while the
        // fetch closure is still alive inside the iterator.
        let calls = std::cell::Cell::new(0usize);
        let data = ["A", "B", "C", "D", "E"];
        let mut iter = PagedIter::new(
            |cont| {
                calls.set(calls.get() + 1);
                let start: usize = cont.map(|c| c.parse().unwrap()).unwrap_or(0);
                let end = (start + 2).min(data.len());
                Ok(Batch {
                    pages: data[start..end]
                        .iter()
                        .map(|t| PageRef::new("w", 0, *t))
                        .collect(),
                    cont: (end < data.len()).then(|| end.to_string()),
                })
            },
            None,
        );
        assert_eq!(iter.next().unwrap().title, "A");
        assert_eq!(calls.get(), 1);
        assert_eq!(iter.next().unwrap().title, "B");
        assert_eq!(calls.get(), 1);
        assert_eq!(iter.next().unwrap().title, "C");
        assert_eq!(calls.get(), 2);
        assert_eq!(titles(iter), ["D", "E"]);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn paged_iter_respects_total_cap() {
        let mut wiki = FakeWiki::new("w");
        wiki.set_list("cat:Fruit", &["A", "B", "C", "D"]);
        let pages = category_members(shared(wiki), "Fruit", Some(3));
        assert_eq!(titles(pages), ["A", "B", "C"]);
    }

    #[test]
    fn paged_iter_ends_sequence_on_error() {
        let mut served = false;
        let iter = PagedIter::new(
            move |_| {
                if served {
                    anyhow::bail!("boom")
                }
                served = true;
                Ok(Batch {
                    pages: vec![PageRef::new("w", 0, "A")],
                    cont: Some("1".to_string()),
                })
            },
            None,
        );
        assert_eq!(titles(iter), ["A"]);
    }

    #[test]
    fn category_members_crosses_batch_boundaries() {
        let mut wiki = FakeWiki::new("w");
        wiki.set_list("cat:Fruit", &["Apple", "Banana", "Cherry"]);
        let pages = category_members(shared(wiki), "Fruit", None);
        assert_eq!(titles(pages), ["Apple", "Banana", "Cherry"]);
    }

    #[test]
    fn recursive_category_walk_descends_and_terminates_on_loops() {
        let mut wiki = FakeWiki::new("w");
        wiki.set_list("cat:Top", &["A", "Category:Sub"]);
        // The subcategory links back to Top; the visited set breaks the loop.
        wiki.set_list("cat:Sub", &["B", "Category:Top"]);
        let pages = category_members_recursive(shared(wiki), "Top", None);
        assert_eq!(titles(pages), ["A", "B"]);
    }

    #[test]
    fn recursive_category_walk_does_not_yield_subcategory_pages() {
        let mut wiki = FakeWiki::new("w");
        wiki.set_list("cat:Top", &["Category:Sub", "A"]);
        wiki.set_list("cat:Sub", &[]);
        let pages = category_members_recursive(shared(wiki), "Top", None);
        assert_eq!(titles(pages), ["A"]);
    }

    #[test]
    fn single_page_builds_one_ref_in_default_namespace() {
        let wiki = FakeWiki::new("en.wikipedia");
        let pages: Vec<PageRef> = single_page(shared(wiki), "Foo").collect();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].namespace, 0);
        assert_eq!(pages[0].title, "Foo");
        assert_eq!(pages[0].site, "en.wikipedia");
    }

    #[test]
    fn pages_from_file_tolerates_brackets_and_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "[[Foo]]\n\nTalk:Bar\n  ").expect("write");
        let wiki = FakeWiki::new("w");
        let pages = pages_from_file(shared(wiki), file.path(), None).expect("open list");
        let pages: Vec<PageRef> = pages.collect();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].title, "Foo");
        assert_eq!(pages[1].namespace, 1);
        assert_eq!(pages[1].title, "Talk:Bar");
    }

    #[test]
    fn pages_from_file_reports_missing_file() {
        let wiki = FakeWiki::new("w");
        let result = pages_from_file(shared(wiki), Path::new("/nonexistent/list.txt"), None);
        assert!(result.is_err());
    }

    #[test]
    fn pages_from_ids_filters_unknown_ids() {
        let mut wiki = FakeWiki::new("w");
        wiki.set_pages_with_ids("ids", &[("Foo", 1), ("Bar", 2)]);
        let pages = pages_from_ids(shared(wiki), vec![2, 99]);
        assert_eq!(titles(pages), ["Bar"]);
    }

    #[test]
    fn new_pages_respects_namespace_selection() {
        let mut wiki = FakeWiki::new("w");
        wiki.set_list("new", &["A", "Talk:B", "C"]);
        let pages = new_pages(shared(wiki), vec![0], None);
        assert_eq!(titles(pages), ["A", "C"]);
    }

    #[test]
    fn prefix_pages_resolves_namespace_from_prefix() {
        let mut wiki = FakeWiki::new("w");
        wiki.set_list("prefix:Foo", &["User:Foo", "User:Foobar"]);
        let pages = prefix_pages(shared(wiki), "User:Foo", None);
        assert_eq!(titles(pages), ["User:Foo", "User:Foobar"]);
    }
}
