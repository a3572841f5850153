//! Message translation for edit summaries.
//!
//! A message package is a TOML table of key -> per-language text. Lookup
//! walks a fallback chain: the requested code, its bare language if the
//! code carries a region, then `en`. No global state; callers hold the
//! `Translator` they loaded.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

const BUILTIN_MESSAGES: &str = include_str!("../i18n/messages.toml");

#[derive(Debug, Default, Deserialize)]
pub struct Translator {
    #[serde(flatten)]
    messages: BTreeMap<String, BTreeMap<String, String>>,
}

impl Translator {
    pub fn builtin() -> Result<Self> {
        Self::load_str(BUILTIN_MESSAGES).context("built-in message package")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading message package {}", path.display()))?;
        Self::load_str(&raw).with_context(|| format!("message package {}", path.display()))
    }

    pub fn load_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("parsing message package")
    }

    /// Translated text for `key`, with `$1..$n` replaced by `params`.
    /// Returns `None` when the key is unknown in every chain language.
    pub fn lookup(&self, code: &str, key: &str, params: &[&str]) -> Option<String> {
        let texts = self.messages.get(key)?;
        let text = fallback_chain(code)
            .into_iter()
            .find_map(|lang| texts.get(lang.as_str()))?;
        Some(substitute(text, params))
    }
}

fn fallback_chain(code: &str) -> Vec<String> {
    let mut chain = vec![code.to_string()];
    if let Some((language, _region)) = code.split_once('-')
        && !chain.contains(&language.to_string())
    {
        chain.push(language.to_string());
    }
    if !chain.contains(&"en".to_string()) {
        chain.push("en".to_string());
    }
    chain
}

fn substitute(text: &str, params: &[&str]) -> String {
    let mut out = text.to_string();
    // Highest index first, so $1 never eats the prefix of $10.
    for (index, value) in params.iter().enumerate().rev() {
        out = out.replace(&format!("${}", index + 1), value);
    }
    out
}
