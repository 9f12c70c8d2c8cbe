use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ParseEnumError;

/// Outcome of a classified step or of a whole build.
///
/// Variants are declared in severity order so the derived `Ord` gives
/// `Ok < Warn < Ko`. `Ko` is absorbing under [`Verdict::combine`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    #[default]
    Ok,
    Warn,
    Ko,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warn => "warn",
            Self::Ko => "ko",
        }
    }

    /// Worst of two verdicts.
    pub fn combine(self, other: Verdict) -> Verdict {
        self.max(other)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Ko)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "warn" => Ok(Self::Warn),
            "ko" => Ok(Self::Ko),
            _ => Err(ParseEnumError::new("verdict", s)),
        }
    }
}

/// Worst verdict of a sequence; an empty sequence is `Ok`.
pub fn worst<I>(verdicts: I) -> Verdict
where
    I: IntoIterator<Item = Verdict>,
{
    verdicts.into_iter().max().unwrap_or_default()
}
