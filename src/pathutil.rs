//! Lexical path normalization, no filesystem access.

use std::path::{Component, Path, PathBuf};

/// Collapse `.` components, resolve `..` against preceding components, and
/// drop duplicate separators. Rooted paths never escape the root; relative
/// paths keep leading `..` components that cannot be resolved. An empty
/// path cleans to `.`.
pub fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir),
            Component::CurDir => {}
            Component::ParentDir => {
                match out.components().next_back() {
                    Some(Component::Normal(_)) => {
                        out.pop();
                    }
                    Some(Component::RootDir) => {}
                    _ => out.push(Component::ParentDir),
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(Component::CurDir);
    }
    out
}
