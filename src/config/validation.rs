//! Unknown-key detection for pipeline config files.
//!
//! The raw TOML is walked section by section and compared against the
//! fields `PipelineConfig` understands. A misspelt key would otherwise be
//! dropped silently by `#[serde(default)]`, so each unknown key yields a
//! warning, with the nearest known key as a suggestion. Warnings never fail
//! the load.

use std::fmt;

/// Largest edit distance still offered as a suggestion.
const MAX_SUGGESTION_DISTANCE: usize = 3;

/// Sections of the config file and the fields each accepts.
const SECTIONS: &[(&str, &[&str])] = &[
    ("paths", &["tm_dir", "archive_dir", "ledger_dir"]),
    (
        "pipeline",
        &[
            "workers",
            "batch_size",
            "stop_on_error",
            "product_version",
            "tm_file_pattern",
            "poll_interval_secs",
            "settle_secs",
            "queue_capacity",
            "start_with_unprocessed",
        ],
    ),
    (
        "publish",
        &[
            "target_dir",
            "review_dir",
            "waiting_period",
            "include_levels",
            "include_types",
            "version",
            "include_incomplete",
            "blacklist_file",
            "supplement_report",
            "max_supplements",
        ],
    ),
    ("aspect", &["batch_size"]),
    ("logging", &["level", "format"]),
];

/// Key present in a config file that no config field reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownKey {
    /// Dotted path, `section.field` or just `section`
    pub path: String,
    pub suggestion: Option<String>,
}

impl fmt::Display for UnknownKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown config key '{}'", self.path)?;
        match &self.suggestion {
            Some(s) => write!(f, ", did you mean '{}'?", s),
            None => Ok(()),
        }
    }
}

/// Check `raw_toml` for keys the config does not know.
///
/// Unparsable input yields no warnings; the deserializer reports it.
/// Inside an unknown section only the section itself is reported.
pub fn find_unknown_keys(raw_toml: &str) -> Vec<UnknownKey> {
    let Ok(toml::Value::Table(root)) = raw_toml.parse::<toml::Value>() else {
        return Vec::new();
    };

    let mut unknown = Vec::new();
    for (section, value) in &root {
        let Some(fields) = section_fields(section) else {
            unknown.push(UnknownKey {
                path: section.clone(),
                suggestion: nearest(section, SECTIONS.iter().map(|(name, _)| *name)).map(str::to_string),
            });
            continue;
        };

        let Some(table) = value.as_table() else {
            continue;
        };
        for field in table.keys() {
            if fields.contains(&field.as_str()) {
                continue;
            }
            let path = format!("{}.{}", section, field);
            // Same section first; a field placed under the wrong section
            // still finds its home.
            let suggestion = nearest(field, fields.iter().copied())
                .map(|f| format!("{}.{}", section, f))
                .or_else(|| nearest(&path, all_paths().iter().map(String::as_str)).map(str::to_string));
            unknown.push(UnknownKey { path, suggestion });
        }
    }
    unknown
}

fn section_fields(section: &str) -> Option<&'static [&'static str]> {
    SECTIONS
        .iter()
        .find(|(name, _)| *name == section)
        .map(|(_, fields)| *fields)
}

fn all_paths() -> Vec<String> {
    SECTIONS
        .iter()
        .flat_map(|(section, fields)| fields.iter().map(move |f| format!("{}.{}", section, f)))
        .collect()
}

/// Closest candidate within [`MAX_SUGGESTION_DISTANCE`]; ties keep the first.
fn nearest<'a>(word: &str, candidates: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    candidates
        .map(|c| (edit_distance(word, c), c))
        .filter(|(d, _)| *d <= MAX_SUGGESTION_DISTANCE)
        .min_by_key(|(d, _)| *d)
        .map(|(_, c)| c)
}

/// Levenshtein distance over chars, two rolling rows.
fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
