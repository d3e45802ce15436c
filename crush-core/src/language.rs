use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Language selection replicated alongside the document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    #[default]
    Python,
    #[serde(rename = "PHP")]
    Php,
    Perl,
    Java,
    Ruby,
    JavaScript,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown language: {0}")]
pub struct UnknownLanguage(pub String);

impl Language {
    pub const ALL: [Language; 6] = [
        Language::Python,
        Language::Php,
        Language::Perl,
        Language::Java,
        Language::Ruby,
        Language::JavaScript,
    ];

    /// Name used on the wire and in menus.
    pub fn name(self) -> &'static str {
        match self {
            Language::Python => "Python",
            Language::Php => "PHP",
            Language::Perl => "Perl",
            Language::Java => "Java",
            Language::Ruby => "Ruby",
            Language::JavaScript => "JavaScript",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Language::ALL
            .into_iter()
            .find(|lang| lang.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownLanguage(s.to_string()))
    }
}
