//! Operator blacklist
//!
//! One entry per line; blank lines and `#` comments are skipped. Each entry
//! is a regular expression that must match the whole file name.

use super::PublishError;
use regex::RegexSet;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct Blacklist {
    patterns: RegexSet,
}

impl Default for Blacklist {
    fn default() -> Self {
        Self {
            patterns: RegexSet::empty(),
        }
    }
}

impl Blacklist {
    pub fn parse(text: &str) -> Result<Self, PublishError> {
        let entries: Vec<String> = text
            .lines()
            .map(|line| line.split('#').next().unwrap_or("").trim())
            .filter(|line| !line.is_empty())
            .map(|line| format!("^(?:{})$", line))
            .collect();
        let patterns = RegexSet::new(&entries).map_err(|e| PublishError::Blacklist(e.to_string()))?;
        Ok(Self { patterns })
    }

    pub fn load(path: &Path) -> Result<Self, PublishError> {
        let text = std::fs::read_to_string(path).map_err(|e| PublishError::Io(path.to_path_buf(), e))?;
        let blacklist = Self::parse(&text)?;
        tracing::info!(path = %path.display(), entries = blacklist.len(), "Loaded publish blacklist");
        Ok(blacklist)
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.patterns.is_match(file_name)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
