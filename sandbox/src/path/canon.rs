use super::{Follow, PathTranslator, MAX_SYMLINK_DEPTH};
use crate::error::PathError;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Lexically normalize an absolute path: collapse separators, drop `.`,
/// resolve `..` without ever climbing above `/`.
///
/// Relative input is interpreted as if it were rooted at `/`.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(name) => out.push(name),
        }
    }
    out
}

pub(super) fn has_trailing_slash(path: &Path) -> bool {
    path.as_os_str().as_encoded_bytes().last() == Some(&b'/')
}

fn push_front_components(pending: &mut VecDeque<OsString>, path: &Path) {
    for component in path.components().rev() {
        match component {
            Component::Normal(name) => pending.push_front(name.to_os_string()),
            Component::ParentDir => pending.push_front(OsString::from("..")),
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
        }
    }
}

/// Read the target of `host` if it is a symbolic link.
///
/// Missing components and non-links both yield `None`: the syscall that
/// eventually runs will report the failure to the tracee itself.
fn link_target(host: &Path) -> Option<PathBuf> {
    let meta = fs::symlink_metadata(host).ok()?;
    if !meta.file_type().is_symlink() {
        return None;
    }
    fs::read_link(host).ok().filter(|t| !t.as_os_str().is_empty())
}

/// Canonicalize an absolute guest path component by component, resolving
/// symbolic links inside the guest root.
///
/// Absolute link targets restart from the guest `/`, so a link can never lead
/// out of the root. Components under an excluded prefix are kept as-is and
/// left to the host kernel.
pub(super) fn resolve(
    translator: &PathTranslator,
    guest: &Path,
    follow: Follow,
) -> Result<PathBuf, PathError> {
    let mut pending = VecDeque::new();
    push_front_components(&mut pending, guest);

    let mut resolved = PathBuf::from("/");
    let mut links = 0usize;

    while let Some(component) = pending.pop_front() {
        if component == ".." {
            resolved.pop();
            continue;
        }
        resolved.push(&component);

        if pending.is_empty() && follow == Follow::No {
            break;
        }
        if translator.exclusions().matches(&resolved) {
            continue;
        }

        let Some(target) = link_target(&translator.to_host(&resolved)) else {
            continue;
        };

        links += 1;
        if links > MAX_SYMLINK_DEPTH {
            return Err(PathError::Loop);
        }

        resolved.pop();
        if target.is_absolute() {
            resolved = PathBuf::from("/");
        }
        push_front_components(&mut pending, &target);
    }

    Ok(resolved)
}
