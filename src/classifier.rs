//! Payload classification.
//!
//! A record is labelled by searching its raw value bytes for the lowercase
//! markers `us` and `eu`. The search is case-sensitive, unanchored and never
//! decodes the payload, so arbitrary bytes classify without error. When both
//! markers are present the record is labelled [`Region::Us`].

use std::fmt;

const US_MARKER: &[u8] = b"us";
const EU_MARKER: &[u8] = b"eu";

/// Routing label derived from a record's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Region {
    Us,
    Eu,
    Other,
}

impl Region {
    pub const ALL: [Region; 3] = [Region::Us, Region::Eu, Region::Other];

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Us => "us",
            Region::Eu => "eu",
            Region::Other => "other",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a record value.
pub fn classify(value: &[u8]) -> Region {
    if contains(value, US_MARKER) {
        Region::Us
    } else if contains(value, EU_MARKER) {
        Region::Eu
    } else {
        Region::Other
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}
