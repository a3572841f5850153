use std::collections::HashSet;

use crate::page::{PageContent, PageRef};

pub type PageIter = Box<dyn Iterator<Item = PageRef>>;
pub type ContentIter = Box<dyn Iterator<Item = PageContent>>;

/// Concatenate sources, preserving source order.
pub fn chain(sources: Vec<PageIter>) -> PageIter {
    Box::new(sources.into_iter().flatten())
}

/// Yield each page only the first time its (site, namespace, title) key is
/// seen. Streams: O(1) amortized per item, never buffers the input.
pub fn deduplicate(source: impl Iterator<Item = PageRef> + 'static) -> PageIter {
    let mut seen: HashSet<PageRef> = HashSet::new();
    Box::new(source.filter(move |page| seen.insert(page.clone())))
}

/// Yield only pages present in every source. Each source past the first is
/// fully materialized to test membership, so memory cost is O(total items);
/// output order follows the first source, duplicates suppressed.
pub fn intersect(sources: Vec<PageIter>) -> PageIter {
    let mut sources = sources.into_iter();
    let Some(first) = sources.next() else {
        return Box::new(std::iter::empty());
    };
    let rest: Vec<HashSet<PageRef>> = sources.map(|source| source.collect()).collect();
    let mut seen: HashSet<PageRef> = HashSet::new();
    Box::new(first.filter(move |page| {
        rest.iter().all(|keys| keys.contains(page)) && seen.insert(page.clone())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(title: &str) -> PageRef {
        PageRef::new("en.wikipedia", 0, title)
    }

    fn titles(pages: impl Iterator<Item = PageRef>) -> Vec<String> {
        pages.map(|p| p.title).collect()
    }

    fn boxed(names: &[&str]) -> PageIter {
        let pages: Vec<PageRef> = names.iter().map(|name| page(name)).collect();
        Box::new(pages.into_iter())
    }

    #[test]
    fn chain_preserves_source_order() {
        let combined = chain(vec![boxed(&["A", "B"]), boxed(&["C"])]);
        assert_eq!(titles(combined), ["A", "B", "C"]);
    }

    #[test]
    fn deduplicate_keeps_first_seen_order() {
        let combined = deduplicate(chain(vec![boxed(&["A", "B", "C"]), boxed(&["B", "C", "D"])]));
        assert_eq!(titles(combined), ["A", "B", "C", "D"]);
    }

    #[test]
    fn deduplicate_distinguishes_sites() {
        let en = page("A");
        let de = PageRef::new("de.wikipedia", 0, "A");
        let combined = deduplicate(vec![en.clone(), de.clone()].into_iter());
        assert_eq!(combined.count(), 2);
    }

    #[test]
    fn intersect_keeps_common_pages_only() {
        let combined = intersect(vec![boxed(&["A", "B", "C"]), boxed(&["B", "C", "D"])]);
        assert_eq!(titles(combined), ["B", "C"]);
    }

    #[test]
    fn intersect_of_disjoint_sources_is_empty() {
        let combined = intersect(vec![boxed(&["A"]), boxed(&["B"])]);
        assert_eq!(combined.count(), 0);
    }

    #[test]
    fn intersect_suppresses_duplicates_from_first_source() {
        let combined = intersect(vec![boxed(&["B", "B", "C"]), boxed(&["B", "C"])]);
        assert_eq!(titles(combined), ["B", "C"]);
    }

    #[test]
    fn intersect_without_sources_is_empty() {
        assert_eq!(intersect(Vec::new()).count(), 0);
    }
}
