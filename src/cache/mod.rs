mod direct;
mod full_assoc;
mod optimizer;
mod router;
mod section;
mod set_assoc;
mod stats;

use crate::pages::PageId;
use crate::storage::StoreError;

use regex::Regex;
use thiserror::Error;

pub use router::SectionedPageCache;
pub use section::Section;
pub use stats::SectionStats;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SectionId(pub(crate) u64);

impl SectionId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The replacement structure of a section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Variant {
    DirectMapped,
    SetAssociative,
    FullyAssociative,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SectionName(String);

impl TryFrom<&str> for SectionName {
    type Error = &'static str;

    fn try_from(name: &str) -> Result<Self, Self::Error> {
        let regex = Regex::new(r"^[\p{L}\p{N}_]{1,64}$").unwrap();
        if regex.is_match(name) {
            Ok(Self(name.to_string()))
        } else {
            Err("SectionName contains invalid characters")
        }
    }
}

impl SectionName {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("invalid page id")]
    InvalidPageId,
    #[error("page not found")]
    NotFound,
    #[error("no evictable page")]
    Exhausted,
    #[error("storage")]
    Store(#[from] StoreError),
    #[error("configuration: {0}")]
    Config(&'static str),
    #[error("unknown section {0}")]
    UnknownSection(SectionId),
    #[error("cannot remove the default section")]
    RemoveDefault,
    #[error("flush failed for {} page(s)", .0.len())]
    FlushAll(Vec<(PageId, StoreError)>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_name_validation() {
        assert!(SectionName::try_from("inner_nodes").is_ok());
        assert!(SectionName::try_from("feuilles_0").is_ok());
        assert!(SectionName::try_from("").is_err());
        assert!(SectionName::try_from("bad name").is_err());
        assert!(SectionName::try_from("a".repeat(65).as_str()).is_err());
    }
}
