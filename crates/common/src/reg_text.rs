//! Registry-style identity text
//!
//! Device identity properties come back from the platform either as a single
//! string (device id, instance id) or as a multi-string list (hardware ids,
//! compatible ids). `RegText` holds both shapes as an ordered list of entries
//! and provides the matching rules the filter relies on.

use std::fmt;
use tracing::info;

/// An ordered list of identity strings read from a device property
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RegText {
    entries: Vec<String>,
}

impl RegText {
    /// Create from a list of entries
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a single-entry text (device id, instance id)
    pub fn single(value: impl Into<String>) -> Self {
        Self {
            entries: vec![value.into()],
        }
    }

    /// Parse a UTF-16 multi-string buffer
    ///
    /// Entries are NUL-terminated and the list ends at the first empty entry
    /// (a double NUL). A buffer without the final terminator is read up to
    /// its end.
    pub fn from_multi_sz(data: &[u16]) -> Self {
        let mut entries = Vec::new();

        for chunk in data.split(|&c| c == 0) {
            if chunk.is_empty() {
                break;
            }
            entries.push(String::from_utf16_lossy(chunk));
        }

        Self { entries }
    }

    /// Encode as a UTF-16 multi-string buffer, including the list terminator
    pub fn to_multi_sz(&self) -> Vec<u16> {
        let mut data = Vec::with_capacity(self.buffer_len() / 2);
        for entry in &self.entries {
            data.extend(entry.encode_utf16());
            data.push(0);
        }
        data.push(0);
        data
    }

    /// Size in bytes of the multi-string encoding, terminators included
    pub fn buffer_len(&self) -> usize {
        let units: usize = self
            .entries
            .iter()
            .map(|e| e.encode_utf16().count() + 1)
            .sum();
        (units + 1) * std::mem::size_of::<u16>()
    }

    /// True when no non-empty entry is present
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_empty())
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// First entry, if any
    pub fn first(&self) -> Option<&str> {
        self.entries.first().map(String::as_str)
    }

    /// Iterate over the entries
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// Case-insensitive equality against any entry
    pub fn matches(&self, value: &str) -> bool {
        self.iter().any(|e| e.eq_ignore_ascii_case(value))
    }

    /// Case-sensitive prefix match against any entry
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        self.iter().any(|e| e.starts_with(prefix))
    }

    /// Log every entry under the given label
    pub fn dump(&self, label: &str) {
        for entry in self.iter() {
            info!("{}: {}", label, entry);
        }
    }
}

impl fmt::Display for RegText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entries.join(";"))
    }
}

impl From<&str> for RegText {
    fn from(value: &str) -> Self {
        Self::single(value)
    }
}

impl From<Vec<String>> for RegText {
    fn from(entries: Vec<String>) -> Self {
        Self { entries }
    }
}
