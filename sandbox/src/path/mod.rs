//! Guest ⇄ host path mapping.
//!
//! A guest path is what the traced program sees, rooted at the guest `/`.
//! A host path is where that file really lives: under the guest root, or
//! unchanged when the guest path is excluded from translation.

mod canon;

pub use canon::normalize;

use crate::error::PathError;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Bound on symbolic link dereferences while resolving one path, as ELOOP on the host.
pub const MAX_SYMLINK_DEPTH: usize = 40;

/// Whether the last component of a path is dereferenced when it is a symlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Follow {
    Yes,
    No,
}

/// Ordered list of guest paths exempt from translation.
///
/// An entry exempts itself and everything beneath it. Duplicates are harmless.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExclusionSet {
    entries: Vec<PathBuf>,
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. The path is not required to exist.
    pub fn exclude(&mut self, path: impl AsRef<Path>) {
        self.entries.push(normalize(path.as_ref()));
    }

    pub fn matches(&self, path: &Path) -> bool {
        self.entries.iter().any(|entry| path.starts_with(entry))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Maps guest paths into the guest root and back.
#[derive(Debug, Clone, Serialize)]
pub struct PathTranslator {
    root: PathBuf,
    exclusions: ExclusionSet,
}

impl PathTranslator {
    /// `root` must be an absolute host path; callers canonicalize it once up front.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: normalize(root.as_ref()),
            exclusions: ExclusionSet::new(),
        }
    }

    pub fn exclude(&mut self, path: impl AsRef<Path>) {
        self.exclusions.exclude(path);
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exclusions(&self) -> &ExclusionSet {
        &self.exclusions
    }

    /// Translate a guest path into the host path the kernel should operate on.
    ///
    /// `cwd` is the guest directory relative paths are resolved against.
    pub fn translate(
        &self,
        guest: &Path,
        cwd: &Path,
        follow: Follow,
    ) -> Result<PathBuf, PathError> {
        let absolute = if guest.is_absolute() {
            guest.to_path_buf()
        } else {
            normalize(cwd).join(guest)
        };

        let trailing_slash = canon::has_trailing_slash(guest);
        let follow = if trailing_slash { Follow::Yes } else { follow };

        let lexical = normalize(&absolute);
        if self.exclusions.matches(&lexical) {
            return Ok(with_trailing_slash(lexical, trailing_slash));
        }

        let resolved = canon::resolve(self, &absolute, follow)?;
        if self.exclusions.matches(&resolved) {
            return Ok(with_trailing_slash(resolved, trailing_slash));
        }

        Ok(with_trailing_slash(self.to_host(&resolved), trailing_slash))
    }

    /// Map a host path back to the guest view, or `None` when the guest cannot see it.
    pub fn detranslate(&self, host: &Path) -> Option<PathBuf> {
        if !host.is_absolute() {
            return None;
        }
        let host = normalize(host);
        if let Ok(rest) = host.strip_prefix(&self.root) {
            return Some(Path::new("/").join(rest));
        }
        if self.exclusions.matches(&host) {
            return Some(host);
        }
        None
    }

    /// Whether a host path is reachable from inside the guest.
    pub fn is_visible(&self, host: &Path) -> bool {
        host.starts_with(&self.root) || self.exclusions.matches(host)
    }

    /// Host location of a canonical guest path.
    fn to_host(&self, guest: &Path) -> PathBuf {
        match guest.strip_prefix("/") {
            Ok(rest) if !rest.as_os_str().is_empty() => self.root.join(rest),
            _ => self.root.clone(),
        }
    }
}

fn with_trailing_slash(path: PathBuf, trailing_slash: bool) -> PathBuf {
    if !trailing_slash || path == Path::new("/") {
        return path;
    }
    let mut raw = path.into_os_string();
    raw.push("/");
    PathBuf::from(raw)
}


/// Property tests for the lexical guarantees of `translate`.
#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn segment() -> impl Strategy<Value = String> {
        prop_oneof![
            Just(".".to_string()),
            Just("..".to_string()),
            Just(String::new()),
            "[a-z]{1,6}",
        ]
    }

    fn guest_path() -> impl Strategy<Value = String> {
        prop::collection::vec(segment(), 0..12).prop_map(|parts| format!("/{}", parts.join("/")))
    }

    proptest! {
        #[test]
        fn prop_translated_paths_stay_in_root(guest in guest_path()) {
            let translator = PathTranslator::new("/nonexistent-guest-root");
            let host = translator
                .translate(Path::new(&guest), Path::new("/"), Follow::Yes)
                .unwrap();
            prop_assert!(host.starts_with("/nonexistent-guest-root"));
            for component in host.components() {
                prop_assert!(!matches!(
                    component,
                    std::path::Component::ParentDir | std::path::Component::CurDir
                ));
            }
        }

        #[test]
        fn prop_excluded_paths_are_identity(guest in guest_path()) {
            let mut translator = PathTranslator::new("/nonexistent-guest-root");
            let normalized = normalize(Path::new(&guest));
            translator.exclude(&normalized);
            let host = translator.translate(&normalized, Path::new("/"), Follow::Yes).unwrap();
            prop_assert_eq!(host, normalized);
        }

        #[test]
        fn prop_retranslation_is_stable(guest in guest_path()) {
            let translator = PathTranslator::new("/nonexistent-guest-root");
            let host = translator
                .translate(Path::new(&guest), Path::new("/"), Follow::Yes)
                .unwrap();
            let back = translator.detranslate(&host).unwrap();
            let again = translator.translate(&back, Path::new("/"), Follow::Yes).unwrap();
            prop_assert_eq!(host, again);
        }
    }
}
