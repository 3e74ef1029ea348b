// Data model: Ref / RefSnapshot.

use serde::Deserialize;

/// 40-char hex commit identity. The unit of build distinctness.
pub type Sha = String;

/// An entry as produced by the Fetcher. `name` is carried for diagnostics
/// only; two refs are equivalent for scheduling purposes iff their SHAs are
/// equal.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Ref {
    #[serde(rename = "ref")]
    pub name: String,
    pub object: RefObject,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RefObject {
    pub sha: Sha,
}

impl Ref {
    pub fn new(name: impl Into<String>, sha: impl Into<Sha>) -> Self {
        Self {
            name: name.into(),
            object: RefObject { sha: sha.into() },
        }
    }

    pub fn sha(&self) -> &Sha {
        &self.object.sha
    }
}

/// A finite, unordered-in-meaning-but-stably-ordered-in-representation
/// collection of Refs, produced atomically by the Fetcher.
pub type RefSnapshot = Vec<Ref>;
