//! Core library for wikibot: page generators, filters and the text
//! replacement engine for MediaWiki maintenance bots.
//!
//! The pipeline is pull-based and lazy: sources yield page references one
//! batch of API results at a time, filters wrap iterators, and the
//! preloading stage turns references into loaded pages in bulk. Nothing is
//! fetched until the consumer asks for the next page.

pub mod bot;
pub mod cache;
pub mod combine;
pub mod config;
pub mod dump;
pub mod factory;
pub mod filters;
pub mod fixes;
pub mod generators;
pub mod page;
pub mod preload;
pub mod replace;
pub mod retry;
pub mod site;
pub mod translator;

#[cfg(test)]
pub(crate) mod testing;
