//! Parser for `/etc/os-release`.

use std::collections::BTreeMap;

/// Key/value pairs read from an `os-release` file.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OsRelease {
    fields: BTreeMap<String, String>,
}

impl OsRelease {
    /// Parses `os-release` text. Comments, blank lines and malformed lines
    /// are skipped; surrounding quotes are removed from values.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let fields = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.trim().to_owned(), unquote(value.trim()).to_owned()))
            .collect();
        Self { fields }
    }

    /// Looks up a raw field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Machine-readable distribution identifier.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.get("ID")
    }

    /// Human-readable distribution name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.get("NAME")
    }

    /// Release identifier.
    #[must_use]
    pub fn version_id(&self) -> Option<&str> {
        self.get("VERSION_ID")
    }
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .into_iter()
        .find_map(|quote| {
            value
                .strip_prefix(quote)
                .and_then(|inner| inner.strip_suffix(quote))
        })
        .unwrap_or(value)
}
