//! Archive file-name convention
//!
//! `solo_{LEVEL}_stix-{type}-{name}_{date_range}_V{version:02}{status}[_{free}].fits`
//!
//! The status marker `U` flags an interim product. The ESA name is the file
//! name with the free field (and extension) stripped; it groups deliveries of
//! the same product and time range.

use super::product::{ProductError, ProductLevel};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Marker for interim/incomplete products.
pub const INCOMPLETE_MARKER: &str = "U";

const EXTENSION: &str = ".fits";

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^solo_(?P<level>[A-Z0-9]+)_(?P<descriptor>stix-[a-z0-9-]+)_(?P<date>[0-9T]+(?:-[0-9T]+)?)_V(?P<version>[0-9]+)(?P<status>U?)(?:_(?P<free>[^.]+))?\.fits$",
        )
        .unwrap_or_else(|_| unreachable!("file name pattern is a valid regex"))
    })
}

#[derive(Debug, thiserror::Error)]
pub enum NamingError {
    #[error("'{0}' does not follow the product file-name convention")]
    Malformed(String),

    #[error("invalid level in '{name}': {source}")]
    Level {
        name: String,
        #[source]
        source: ProductError,
    },
}

/// Parsed product file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProductFileName {
    pub level: ProductLevel,
    /// `stix-{type}-{name}`, possibly with a `-sup{N}` suffix
    pub descriptor: String,
    pub date_range: String,
    pub version: u32,
    pub incomplete: bool,
    pub free_field: Option<String>,
}

impl ProductFileName {
    pub fn new(level: ProductLevel, descriptor: impl Into<String>, date_range: impl Into<String>, version: u32) -> Self {
        Self {
            level,
            descriptor: descriptor.into(),
            date_range: date_range.into(),
            version,
            incomplete: false,
            free_field: None,
        }
    }

    pub fn with_free_field(mut self, free: impl Into<String>) -> Self {
        self.free_field = Some(free.into());
        self
    }

    pub fn with_incomplete(mut self, incomplete: bool) -> Self {
        self.incomplete = incomplete;
        self
    }

    /// Render the full file name.
    pub fn file_name(&self) -> String {
        let mut name = self.esa_name();
        if let Some(free) = &self.free_field {
            name.push('_');
            name.push_str(free);
        }
        name.push_str(EXTENSION);
        name
    }

    /// Canonical name used to group equivalent deliveries: everything up to
    /// and including the version/status token.
    pub fn esa_name(&self) -> String {
        format!(
            "solo_{}_{}_{}_V{:02}{}",
            self.level,
            self.descriptor,
            self.date_range,
            self.version,
            if self.incomplete { INCOMPLETE_MARKER } else { "" }
        )
    }

    /// The same file name with the descriptor extended by `-sup{n}`.
    pub fn with_supplement(&self, n: u32) -> Self {
        let mut renamed = self.clone();
        renamed.descriptor = format!("{}-sup{}", self.descriptor, n);
        renamed
    }

    /// The name once completeness criteria are met (status marker dropped).
    pub fn complete_name(&self) -> Self {
        self.clone().with_incomplete(false)
    }

    /// Version-independent key: two names with the same stem differ only in
    /// version or status.
    pub fn version_stem(&self) -> String {
        let mut stem = format!("solo_{}_{}_{}", self.level, self.descriptor, self.date_range);
        if let Some(free) = &self.free_field {
            stem.push('_');
            stem.push_str(free);
        }
        stem
    }

    /// `type` component of the descriptor (`hk`, `ql`, `sci`, ...).
    pub fn product_type(&self) -> Option<&str> {
        self.descriptor.strip_prefix("stix-")?.split('-').next()
    }
}

impl FromStr for ProductFileName {
    type Err = NamingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = name_pattern()
            .captures(s)
            .ok_or_else(|| NamingError::Malformed(s.to_string()))?;
        let level = caps["level"].parse().map_err(|source| NamingError::Level {
            name: s.to_string(),
            source,
        })?;
        let version = caps["version"]
            .parse()
            .map_err(|_| NamingError::Malformed(s.to_string()))?;
        Ok(Self {
            level,
            descriptor: caps["descriptor"].to_string(),
            date_range: caps["date"].to_string(),
            version,
            incomplete: &caps["status"] == INCOMPLETE_MARKER,
            free_field: caps.name("free").map(|m| m.as_str().to_string()),
        })
    }
}

impl fmt::Display for ProductFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// ESA name of a raw file name string.
pub fn esa_name(file_name: &str) -> Result<String, NamingError> {
    Ok(file_name.parse::<ProductFileName>()?.esa_name())
}
