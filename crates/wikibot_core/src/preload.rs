//! Preloading stage: batched bulk content fetches keyed by owning site.
//!
//! Pages are grouped by site as they arrive; a group is fetched as one bulk
//! call once it reaches the batch size, and its pages are re-yielded
//! together, in batch-completion order with batch-internal order preserved.
//! Groups that never fill are flushed at end of input. A fetch call never
//! mixes pages from two sites.

use std::collections::VecDeque;

use anyhow::Result;
use tracing::{debug, warn};

use crate::combine::ContentIter;
use crate::page::{PageContent, PageRef};
use crate::site::Site;

pub const DEFAULT_BATCH_SIZE: usize = 50;

pub struct Preloader<I, F>
where
    I: Iterator<Item = PageRef>,
    F: FnMut(&str, &[PageRef]) -> Result<Vec<PageContent>>,
{
    upstream: I,
    fetch: F,
    batch_size: usize,
    // Per-site buffers in first-arrival order, so end-of-input flushing is
    // deterministic.
    buffers: Vec<(String, Vec<PageRef>)>,
    ready: VecDeque<PageContent>,
    upstream_done: bool,
}

impl<I, F> Preloader<I, F>
where
    I: Iterator<Item = PageRef>,
    F: FnMut(&str, &[PageRef]) -> Result<Vec<PageContent>>,
{
    pub fn new(upstream: I, fetch: F, batch_size: usize) -> Self {
        Self {
            upstream,
            fetch,
            batch_size: batch_size.max(1),
            buffers: Vec::new(),
            ready: VecDeque::new(),
            upstream_done: false,
        }
    }

    fn buffer_page(&mut self, page: PageRef) -> Option<usize> {
        let site = page.site.clone();
        let index = match self.buffers.iter().position(|(key, _)| *key == site) {
            Some(index) => {
                self.buffers[index].1.push(page);
                index
            }
            None => {
                self.buffers.push((site, vec![page]));
                self.buffers.len() - 1
            }
        };
        (self.buffers[index].1.len() >= self.batch_size).then_some(index)
    }

    fn flush(&mut self, index: usize) {
        let (site, refs) = self.buffers.remove(index);
        debug!(site, pages = refs.len(), "preloading batch");
        match (self.fetch)(&site, &refs) {
            Ok(contents) => self.ready.extend(contents),
            Err(error) => {
                warn!(site, error = %error, "batch fetch failed, skipping batch");
            }
        }
    }
}

impl<I, F> Iterator for Preloader<I, F>
where
    I: Iterator<Item = PageRef>,
    F: FnMut(&str, &[PageRef]) -> Result<Vec<PageContent>>,
{
    type Item = PageContent;

    fn next(&mut self) -> Option<PageContent> {
        loop {
            if let Some(content) = self.ready.pop_front() {
                return Some(content);
            }
            if self.upstream_done {
                if self.buffers.is_empty() {
                    return None;
                }
                self.flush(0);
                continue;
            }
            match self.upstream.next() {
                Some(page) => {
                    if let Some(full) = self.buffer_page(page) {
                        self.flush(full);
                    }
                }
                None => self.upstream_done = true,
            }
        }
    }
}

/// Preload against a single live site; the batch size is capped by the
/// site's own maximum.
pub fn preload(
    site: Site,
    source: impl Iterator<Item = PageRef> + 'static,
    batch_size: usize,
) -> ContentIter {
    let max = site.borrow().max_batch_size();
    let batch_size = batch_size.clamp(1, max);
    Box::new(Preloader::new(
        source,
        move |_site_key, refs| site.borrow_mut().fetch_content(refs),
        batch_size,
    ))
}
