//! The replacement bot: consumes a loaded page stream, applies the
//! configured fixes, confirms, saves.
//!
//! Each page goes through a small state machine: apply rules, skip when
//! nothing changed, ask for confirmation unless running in always or
//! dry-run mode, then save with a single retry on edit conflict. Counters
//! are reported at the end of the run.

use std::fmt;

use anyhow::Result;
use similar::TextDiff;
use tracing::{info, warn};

use crate::combine::ContentIter;
use crate::fixes::MessageSpec;
use crate::page::PageContent;
use crate::replace::{AppliedRule, Replacer};
use crate::site::{SaveOutcome, WriteSite};
use crate::translator::Translator;

/// Operator's answer to one proposed edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    Yes,
    No,
    /// Accept this edit and every following one.
    All,
    Quit,
}

pub type ConfirmFn = Box<dyn FnMut(&PageContent, &str) -> Choice>;

pub struct BotOptions {
    pub always: bool,
    pub dry_run: bool,
    /// Explicit summary overriding everything the fixes would produce.
    pub summary: Option<String>,
    pub lang: String,
}

impl Default for BotOptions {
    fn default() -> Self {
        Self {
            always: false,
            dry_run: false,
            summary: None,
            lang: "en".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub examined: usize,
    pub changed: usize,
    pub saved: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub failures: usize,
    /// Titles actually written, for resumable runs.
    pub saved_titles: Vec<String>,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} pages examined", self.examined)?;
        writeln!(f, "{} pages with replacements", self.changed)?;
        writeln!(f, "{} pages saved", self.saved)?;
        writeln!(f, "{} pages skipped", self.skipped)?;
        if self.conflicts > 0 {
            writeln!(f, "{} edit conflicts", self.conflicts)?;
        }
        if self.failures > 0 {
            writeln!(f, "{} failures", self.failures)?;
        }
        Ok(())
    }
}

pub struct ReplaceBot {
    site: WriteSite,
    replacer: Replacer,
    translator: Translator,
    options: BotOptions,
    confirm: ConfirmFn,
}

impl ReplaceBot {
    pub fn new(
        site: WriteSite,
        replacer: Replacer,
        translator: Translator,
        options: BotOptions,
    ) -> Self {
        Self {
            site,
            replacer,
            translator,
            options,
            confirm: Box::new(|_, _| Choice::Yes),
        }
    }

    /// Callback deciding each edit; unused in always and dry-run modes.
    pub fn with_confirm(mut self, confirm: ConfirmFn) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn run(&mut self, pages: ContentIter) -> Result<RunReport> {
        let mut report = RunReport::default();
        for content in pages {
            report.examined += 1;
            let title = content.title().to_string();
            let outcome = self.replacer.apply(&title, &content.text)?;
            if !outcome.changed(&content.text) {
                info!(title, "no replacements apply");
                report.skipped += 1;
                continue;
            }
            report.changed += 1;

            if self.options.dry_run {
                let diff = render_diff(&title, &content.text, &outcome.text);
                println!("{diff}");
                continue;
            }
            if !self.options.always {
                let diff = render_diff(&title, &content.text, &outcome.text);
                match (self.confirm)(&content, &diff) {
                    Choice::Yes => {}
                    Choice::All => self.options.always = true,
                    Choice::No => {
                        report.skipped += 1;
                        continue;
                    }
                    Choice::Quit => break,
                }
            }

            let summary = self.summary_for(&outcome.applied);
            self.save(content, outcome.text, &summary, &mut report);
        }
        Ok(report)
    }

    fn save(
        &mut self,
        mut content: PageContent,
        new_text: String,
        summary: &str,
        report: &mut RunReport,
    ) {
        content.text = new_text;
        match self.try_save(&content, summary) {
            Ok(SaveOutcome::Saved { new_revid }) => {
                info!(title = %content.title(), new_revid, "saved");
                report.saved += 1;
                report.saved_titles.push(content.title().to_string());
            }
            Ok(SaveOutcome::NoChange) => {
                report.skipped += 1;
            }
            Ok(SaveOutcome::PageMissing) => {
                warn!(title = %content.title(), "page vanished before save, skipping");
                report.skipped += 1;
            }
            Ok(SaveOutcome::EditConflict) => {
                report.conflicts += 1;
                if !self.retry_after_conflict(&content.page.clone(), summary, report) {
                    warn!(title = %content.title(), "edit conflict persisted, skipping page");
                    report.skipped += 1;
                }
            }
            Err(error) => {
                warn!(title = %content.title(), error = %error, "save failed");
                report.failures += 1;
            }
        }
    }

    /// Refetch, reapply the rules to the fresh text, save once more.
    fn retry_after_conflict(
        &mut self,
        page: &crate::page::PageRef,
        summary: &str,
        report: &mut RunReport,
    ) -> bool {
        let fresh = match self.site.borrow_mut().fetch_content(std::slice::from_ref(page)) {
            Ok(mut contents) if !contents.is_empty() => contents.remove(0),
            Ok(_) => return false,
            Err(error) => {
                warn!(title = %page.title, error = %error, "refetch after conflict failed");
                return false;
            }
        };
        let outcome = match self.replacer.apply(&page.title, &fresh.text) {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(title = %page.title, error = %error, "reapply after conflict failed");
                return false;
            }
        };
        if !outcome.changed(&fresh.text) {
            return true;
        }
        let mut retried = fresh;
        retried.text = outcome.text;
        match self.try_save(&retried, summary) {
            Ok(SaveOutcome::Saved { .. }) => {
                report.saved += 1;
                report.saved_titles.push(page.title.clone());
                true
            }
            Ok(SaveOutcome::NoChange) => true,
            Ok(_) => false,
            Err(error) => {
                warn!(title = %page.title, error = %error, "save retry failed");
                report.failures += 1;
                true
            }
        }
    }

    fn try_save(&mut self, content: &PageContent, summary: &str) -> Result<SaveOutcome> {
        self.site.borrow_mut().save_page(content, summary)
    }

    fn summary_for(&self, applied: &[AppliedRule]) -> String {
        if let Some(summary) = &self.options.summary {
            return summary.clone();
        }
        let mut parts: Vec<String> = Vec::new();
        let mut seen_fixes: Vec<&str> = Vec::new();
        let mut unkeyed: Vec<AppliedRule> = Vec::new();
        for entry in applied {
            match self.replacer.fix_message(&entry.fix) {
                Some(message) => {
                    if !seen_fixes.contains(&entry.fix.as_str()) {
                        seen_fixes.push(&entry.fix);
                        if let Some(text) = self.resolve_message(message) {
                            parts.push(text);
                        }
                    }
                }
                None => unkeyed.push(entry.clone()),
            }
        }
        if !unkeyed.is_empty() {
            let fragments = self.replacer.build_summary(&unkeyed);
            let wrapped = self
                .translator
                .lookup(&self.options.lang, "replace-summary", &[&fragments])
                .unwrap_or(fragments);
            parts.push(wrapped);
        }
        parts.join("; ")
    }

    fn resolve_message(&self, message: &MessageSpec) -> Option<String> {
        match message {
            MessageSpec::Key(key) => self.translator.lookup(&self.options.lang, key, &[]),
            MessageSpec::Table(table) => table
                .get(&self.options.lang)
                .or_else(|| table.get("en"))
                .cloned(),
        }
    }
}

pub fn render_diff(title: &str, old: &str, new: &str) -> String {
    let diff = TextDiff::from_lines(old, new);
    format!(
        "{}",
        diff.unified_diff()
            .context_radius(3)
            .header(title, title)
    )
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::fixes::{ExceptionSpec, FixSet};
    use crate::replace::ReplacementRule;
    use crate::testing::{FakeWiki, as_site, as_write_site, shared_handle};

    fn simple_replacer(old: &str, new: &str) -> Replacer {
        let rule = ReplacementRule::build(old, new, false, false, None).unwrap();
        Replacer::new(vec![FixSet::for_tests(
            "test-fix",
            vec![rule],
            ExceptionSpec::default(),
            false,
        )])
    }

    fn bot(handle: &Rc<RefCell<FakeWiki>>, replacer: Replacer, options: BotOptions) -> ReplaceBot {
        ReplaceBot::new(
            as_write_site(handle),
            replacer,
            Translator::builtin().unwrap(),
            options,
        )
    }

    fn content_stream(handle: &Rc<RefCell<FakeWiki>>, titles: &[&str]) -> ContentIter {
        let refs: Vec<crate::page::PageRef> = titles
            .iter()
            .map(|t| crate::page::PageRef::new("w", 0, *t))
            .collect();
        let contents = as_site(handle).borrow_mut().fetch_content(&refs).unwrap();
        Box::new(contents.into_iter())
    }

    #[test]
    fn changed_pages_are_saved_with_a_generated_summary() {
        let handle = shared_handle(FakeWiki::new("w"));
        handle.borrow_mut().set_text("A", "foo here");
        handle.borrow_mut().set_text("B", "nothing relevant");
        let stream = content_stream(&handle, &["A", "B"]);

        let options = BotOptions {
            always: true,
            ..BotOptions::default()
        };
        let report = bot(&handle, simple_replacer("foo", "bar"), options)
            .run(stream)
            .unwrap();

        assert_eq!(report.examined, 2);
        assert_eq!(report.changed, 1);
        assert_eq!(report.saved, 1);
        assert_eq!(report.skipped, 1);

        let saves = handle.borrow().saves.clone();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].0, "A");
        assert_eq!(saves[0].1, "bar here");
        assert!(saves[0].2.contains("replacing foo with bar"));
    }

    #[test]
    fn dry_run_saves_nothing() {
        let handle = shared_handle(FakeWiki::new("w"));
        handle.borrow_mut().set_text("A", "foo");
        let stream = content_stream(&handle, &["A"]);

        let options = BotOptions {
            dry_run: true,
            ..BotOptions::default()
        };
        let report = bot(&handle, simple_replacer("foo", "bar"), options)
            .run(stream)
            .unwrap();
        assert_eq!(report.changed, 1);
        assert_eq!(report.saved, 0);
        assert!(handle.borrow().saves.is_empty());
    }

    #[test]
    fn explicit_summary_overrides_generated_one() {
        let handle = shared_handle(FakeWiki::new("w"));
        handle.borrow_mut().set_text("A", "foo");
        let stream = content_stream(&handle, &["A"]);

        let options = BotOptions {
            always: true,
            summary: Some("my own reason".to_string()),
            ..BotOptions::default()
        };
        bot(&handle, simple_replacer("foo", "bar"), options)
            .run(stream)
            .unwrap();
        assert_eq!(handle.borrow().saves[0].2, "my own reason");
    }

    #[test]
    fn confirm_no_skips_and_quit_stops() {
        let handle = shared_handle(FakeWiki::new("w"));
        handle.borrow_mut().set_text("A", "foo a");
        handle.borrow_mut().set_text("B", "foo b");
        handle.borrow_mut().set_text("C", "foo c");
        let stream = content_stream(&handle, &["A", "B", "C"]);

        let answers = Rc::new(RefCell::new(vec![Choice::No, Choice::Quit]));
        let feed = answers.clone();
        let report = bot(
            &handle,
            simple_replacer("foo", "bar"),
            BotOptions::default(),
        )
        .with_confirm(Box::new(move |_, _| feed.borrow_mut().remove(0)))
        .run(stream)
        .unwrap();

        // A declined, B quit; C never examined.
        assert_eq!(report.examined, 2);
        assert_eq!(report.saved, 0);
        assert!(handle.borrow().saves.is_empty());
        assert!(answers.borrow().is_empty());
    }

    #[test]
    fn all_answer_accepts_the_rest_without_asking_again() {
        let handle = shared_handle(FakeWiki::new("w"));
        handle.borrow_mut().set_text("A", "foo a");
        handle.borrow_mut().set_text("B", "foo b");
        let stream = content_stream(&handle, &["A", "B"]);

        let asked = Rc::new(RefCell::new(0));
        let counter = asked.clone();
        let report = bot(
            &handle,
            simple_replacer("foo", "bar"),
            BotOptions::default(),
        )
        .with_confirm(Box::new(move |_, _| {
            *counter.borrow_mut() += 1;
            Choice::All
        }))
        .run(stream)
        .unwrap();

        assert_eq!(*asked.borrow(), 1);
        assert_eq!(report.saved, 2);
    }

    #[test]
    fn edit_conflict_is_retried_once_against_fresh_text() {
        let handle = shared_handle(FakeWiki::new("w"));
        handle.borrow_mut().set_text("A", "foo here");
        handle.borrow_mut().conflict_once_on("A");
        let stream = content_stream(&handle, &["A"]);

        let options = BotOptions {
            always: true,
            ..BotOptions::default()
        };
        let report = bot(&handle, simple_replacer("foo", "bar"), options)
            .run(stream)
            .unwrap();

        assert_eq!(report.conflicts, 1);
        assert_eq!(report.saved, 1);
        assert_eq!(handle.borrow().saves.len(), 1);
        assert_eq!(handle.borrow().saves[0].1, "bar here");
    }

    #[test]
    fn vanished_page_is_skipped() {
        let handle = shared_handle(FakeWiki::new("w"));
        handle.borrow_mut().set_text("A", "foo");
        handle.borrow_mut().missing_on_save("A");
        let stream = content_stream(&handle, &["A"]);

        let options = BotOptions {
            always: true,
            ..BotOptions::default()
        };
        let report = bot(&handle, simple_replacer("foo", "bar"), options)
            .run(stream)
            .unwrap();
        assert_eq!(report.saved, 0);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn fix_message_key_becomes_the_edit_summary() {
        let handle = shared_handle(FakeWiki::new("w"));
        handle.borrow_mut().set_text("A", "a<br>b");
        let stream = content_stream(&handle, &["A"]);

        let mut catalog = crate::fixes::FixCatalog::builtin().unwrap();
        let syntax = catalog.take("syntax").unwrap();
        let options = BotOptions {
            always: true,
            ..BotOptions::default()
        };
        bot(&handle, Replacer::new(vec![syntax]), options)
            .run(stream)
            .unwrap();
        assert_eq!(handle.borrow().saves[0].2, "Bot: cleaning up wiki syntax");
    }

    #[test]
    fn diff_shows_removed_and_added_lines() {
        let diff = render_diff("T", "keep\nold line\n", "keep\nnew line\n");
        assert!(diff.contains("-old line"));
        assert!(diff.contains("+new line"));
    }
}
