//! Lexical path helpers.
//!
//! Settings files store references relative to their own directory, while the
//! merge engine compares them as absolute paths. Everything here is purely
//! lexical: no file system access, no symlink resolution, so it works for
//! targets that do not exist (yet) and never depends on the process working
//! directory.

use std::path::{Component, Path, PathBuf};

/// Folds `.` and `..` components out of a path.
///
/// A `..` that would climb above the root (or above the start of a relative
/// path) is kept for relative paths and dropped for absolute ones, mirroring
/// how the OS treats `/..`.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out.iter().map(|c| c.as_os_str()).collect()
}

/// Combines `base` with `path` (which may already be absolute) and normalizes.
pub fn resolve(base: &Path, path: &Path) -> PathBuf {
    normalize(&base.join(path))
}

/// Expresses `target` relative to `base`. Both are expected to be absolute.
///
/// Falls back to `target` itself when the two share no root (e.g. different
/// Windows drives).
pub fn relative_to(target: &Path, base: &Path) -> PathBuf {
    let target = normalize(target);
    let base = normalize(base);

    let mut target_iter = target.components().peekable();
    let mut base_iter = base.components().peekable();

    match (target_iter.peek(), base_iter.peek()) {
        (Some(t), Some(b)) if t == b => {}
        _ => return target,
    }

    while let (Some(t), Some(b)) = (target_iter.peek(), base_iter.peek()) {
        if t != b {
            break;
        }
        target_iter.next();
        base_iter.next();
    }

    let mut relative = PathBuf::new();
    for _ in base_iter {
        relative.push("..");
    }
    for component in target_iter {
        relative.push(component.as_os_str());
    }
    if relative.as_os_str().is_empty() {
        relative.push(".");
    }
    relative
}
