//! Streaming reader for MediaWiki XML dumps.
//!
//! Pages are yielded one at a time as they are parsed, so a multi-gigabyte
//! dump never has to fit in memory. Dump text is already loaded, which
//! makes this source suitable for offline replacement runs without a
//! preloading stage. Pages that fail to parse are logged and skipped; an
//! XML-level error ends the stream.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::Event;
use tracing::warn;

use crate::combine::{ContentIter, PageIter};
use crate::page::{PageContent, PageRef};

#[derive(Default)]
struct RawPage {
    title: String,
    ns: String,
    page_id: String,
    revid: String,
    timestamp: String,
    text: String,
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    Title,
    Ns,
    PageId,
    RevId,
    Timestamp,
    Text,
}

pub struct DumpReader {
    reader: Reader<BufReader<File>>,
    buf: Vec<u8>,
    site_id: String,
    pending: RawPage,
    field: Option<Field>,
    in_revision: bool,
    in_contributor: bool,
}

impl DumpReader {
    /// Open a dump file. Failure to open is a configuration error and
    /// surfaces immediately; parse problems later are per-page skips.
    pub fn open(path: &Path, site_id: &str) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("opening dump file {}", path.display()))?;
        let mut reader = Reader::from_reader(BufReader::new(file));
        reader.config_mut().trim_text(false);
        Ok(Self {
            reader,
            buf: Vec::new(),
            site_id: site_id.to_string(),
            pending: RawPage::default(),
            field: None,
            in_revision: false,
            in_contributor: false,
        })
    }

    fn start_element(&mut self, name: &[u8]) {
        self.field = match name {
            b"page" => {
                self.pending = RawPage::default();
                None
            }
            b"revision" => {
                self.in_revision = true;
                // A page element may carry several revisions; the last one
                // in document order is the current one.
                self.pending.revid.clear();
                self.pending.timestamp.clear();
                self.pending.text.clear();
                None
            }
            b"contributor" => {
                self.in_contributor = true;
                None
            }
            b"title" => Some(Field::Title),
            b"ns" => Some(Field::Ns),
            b"timestamp" if self.in_revision => Some(Field::Timestamp),
            b"id" if self.in_contributor => None,
            b"id" if self.in_revision => Some(Field::RevId),
            b"id" => Some(Field::PageId),
            b"text" => Some(Field::Text),
            _ => None,
        };
    }

    fn append(&mut self, text: &str) {
        let target = match self.field {
            Some(Field::Title) => &mut self.pending.title,
            Some(Field::Ns) => &mut self.pending.ns,
            Some(Field::PageId) => &mut self.pending.page_id,
            Some(Field::RevId) => &mut self.pending.revid,
            Some(Field::Timestamp) => &mut self.pending.timestamp,
            Some(Field::Text) => &mut self.pending.text,
            None => return,
        };
        target.push_str(text);
    }

    fn finish_page(&mut self) -> Option<PageContent> {
        let raw = std::mem::take(&mut self.pending);
        let namespace: i32 = match raw.ns.trim().parse() {
            Ok(ns) => ns,
            Err(_) => {
                warn!(title = %raw.title, ns = %raw.ns, "bad namespace in dump, skipping page");
                return None;
            }
        };
        let timestamp = match DateTime::parse_from_rfc3339(raw.timestamp.trim()) {
            Ok(parsed) => parsed.with_timezone(&Utc),
            Err(_) => {
                warn!(title = %raw.title, "bad revision timestamp in dump, skipping page");
                return None;
            }
        };
        let revid = raw.revid.trim().parse().unwrap_or(0);
        let mut page = PageRef::new(&self.site_id, namespace, raw.title.trim());
        if let Ok(id) = raw.page_id.trim().parse() {
            page = page.with_id(id);
        }
        Some(PageContent::new(page, raw.text, revid, timestamp))
    }
}

enum Step {
    Start(Vec<u8>),
    Text(String),
    End(Vec<u8>),
    Other,
    Eof,
}

impl Iterator for DumpReader {
    type Item = PageContent;

    fn next(&mut self) -> Option<PageContent> {
        loop {
            self.buf.clear();
            // The event borrows the read buffer, so reduce it to owned data
            // before touching the parse state.
            let step = match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Start(element)) => Step::Start(element.name().as_ref().to_vec()),
                Ok(Event::Text(text)) => match text.unescape() {
                    Ok(unescaped) => Step::Text(unescaped.into_owned()),
                    Err(error) => {
                        warn!(error = %error, "bad text node in dump");
                        Step::Other
                    }
                },
                Ok(Event::End(element)) => Step::End(element.name().as_ref().to_vec()),
                Ok(Event::Eof) => Step::Eof,
                Ok(_) => Step::Other,
                Err(error) => {
                    warn!(error = %error, "dump parse error, ending stream");
                    return None;
                }
            };
            match step {
                Step::Start(name) => self.start_element(&name),
                Step::Text(text) => self.append(&text),
                Step::End(name) => match name.as_slice() {
                    b"revision" => self.in_revision = false,
                    b"contributor" => self.in_contributor = false,
                    b"page" => {
                        if let Some(content) = self.finish_page() {
                            return Some(content);
                        }
                    }
                    _ => self.field = None,
                },
                Step::Eof => return None,
                Step::Other => {}
            }
        }
    }
}

/// Dump source yielding loaded pages.
pub fn dump_pages(path: &Path, site_id: &str) -> Result<ContentIter> {
    Ok(Box::new(DumpReader::open(path, site_id)?))
}

/// Dump source yielding bare page references, for pipelines that filter
/// before loading text from a live site.
pub fn dump_refs(path: &Path, site_id: &str) -> Result<PageIter> {
    let reader = DumpReader::open(path, site_id)?;
    Ok(Box::new(reader.map(|content| content.page)))
}
