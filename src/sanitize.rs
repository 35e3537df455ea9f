//! Mount-safe copies of directories whose path the runtime's `--volume`
//! syntax cannot express.

use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

use crate::error::{BuildError, Result};

/// Characters docker's volume syntax chokes on.
pub const RESERVED_MOUNT_CHARS: [char; 1] = ['@'];
pub const MOUNT_SAFE_SUBSTITUTE: char = '-';

/// What to do with symbolic links found while copying.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SymlinkPolicy {
    /// Copy what the link points at. A link back into a directory being
    /// copied is a cycle and fails the copy.
    #[default]
    Follow,
    /// Leave links out of the copy.
    Skip,
    /// Fail on the first link.
    Reject,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub directories: usize,
    pub files: usize,
}

pub fn needs_sanitizing(path: &Path) -> bool {
    path.to_string_lossy().contains(RESERVED_MOUNT_CHARS)
}

/// The mount-safe counterpart of `path`, or `None` when it is already safe.
/// Every reserved character is substituted.
pub fn sanitized_path(path: &Path) -> Result<Option<PathBuf>> {
    if !needs_sanitizing(path) {
        return Ok(None);
    }
    let s = path.to_str().ok_or_else(|| {
        BuildError::Config(format!("path '{}' is not valid UTF-8", path.display()))
    })?;
    Ok(Some(PathBuf::from(s.replace(RESERVED_MOUNT_CHARS, &MOUNT_SAFE_SUBSTITUTE.to_string()))))
}

/// Returns a path to `path`'s contents that is safe to mount.
///
/// Safe paths come back unchanged without touching the filesystem. Otherwise
/// the tree is copied to [`sanitized_path`] and that path is returned. When
/// only the last component is reserved the copy sits next to the original;
/// a reserved character higher up moves the copy under the substituted
/// parent as well, since the whole path has to be mountable. The original is never modified, and running this
/// again over an existing copy refreshes it.
pub fn sanitize_mount_path(path: &Path, policy: SymlinkPolicy) -> Result<PathBuf> {
    let Some(target) = sanitized_path(path)? else {
        return Ok(path.to_path_buf());
    };

    fs::create_dir_all(&target).map_err(dup_err("creating", &target))?;
    let stats = copy_tree(path, &target, policy)?;
    info!(
        from = %path.display(),
        to = %target.display(),
        files = stats.files,
        directories = stats.directories,
        "copied action folder to mount-safe path"
    );
    Ok(target)
}

struct Frame {
    src: PathBuf,
    dst: PathBuf,
    /// Canonical paths of `src` and every directory above it in this copy.
    ancestors: Vec<PathBuf>,
}

/// Deep-copies the contents of `src` into the existing directory `dst`.
///
/// Walks with an explicit stack. Existing destination directories are
/// reused and existing files overwritten. The first I/O error aborts the
/// copy.
pub fn copy_tree(src: &Path, dst: &Path, policy: SymlinkPolicy) -> Result<CopyStats> {
    let root = fs::canonicalize(src).map_err(dup_err("reading", src))?;
    let mut stats = CopyStats::default();
    let mut stack = vec![Frame { src: src.to_path_buf(), dst: dst.to_path_buf(), ancestors: vec![root] }];

    while let Some(frame) = stack.pop() {
        let entries = fs::read_dir(&frame.src).map_err(dup_err("reading", &frame.src))?;
        for entry in entries {
            let entry = entry.map_err(dup_err("reading", &frame.src))?;
            let from = entry.path();
            let to = frame.dst.join(entry.file_name());
            let file_type = entry.file_type().map_err(dup_err("reading", &from))?;

            let (is_dir, is_file) = if file_type.is_symlink() {
                match policy {
                    SymlinkPolicy::Reject => return Err(BuildError::SymlinkRejected { path: from }),
                    SymlinkPolicy::Skip => {
                        debug!("skip symlink {}", from.display());
                        continue;
                    }
                    SymlinkPolicy::Follow => {
                        let meta = fs::metadata(&from).map_err(dup_err("reading", &from))?;
                        (meta.is_dir(), meta.is_file())
                    }
                }
            } else {
                (file_type.is_dir(), file_type.is_file())
            };

            if is_dir {
                let canonical = fs::canonicalize(&from).map_err(dup_err("reading", &from))?;
                if frame.ancestors.contains(&canonical) {
                    return Err(BuildError::SymlinkCycle { path: from });
                }
                if !to.is_dir() {
                    fs::create_dir_all(&to).map_err(dup_err("creating", &to))?;
                }
                let mut ancestors = frame.ancestors.clone();
                ancestors.push(canonical);
                stats.directories += 1;
                stack.push(Frame { src: from, dst: to, ancestors });
            } else if is_file {
                fs::copy(&from, &to).map_err(dup_err("copying", &to))?;
                debug!("copy {} to {}", from.display(), to.display());
                stats.files += 1;
            } else {
                return Err(BuildError::UnsupportedEntry { path: from });
            }
        }
    }
    Ok(stats)
}

fn dup_err(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> BuildError {
    let path = path.to_path_buf();
    move |source| BuildError::Duplication { action, path, source }
}
