use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use crate::error::{Error, IoResultExt, Result};

fn walk_err(root: &Path, e: walkdir::Error) -> Error {
    let path = e.path().unwrap_or(root).to_path_buf();
    Error::io(path, e.into())
}

/// Mark every file below `root` read-only. Directories stay writable so the
/// tree can still be removed on close.
pub(crate) fn make_read_only(root: &Path) -> Result<()> {
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| walk_err(root, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let mut perms = entry.metadata().map_err(|e| walk_err(root, e))?.permissions();
        perms.set_readonly(true);
        fs::set_permissions(entry.path(), perms).at(entry.path())?;
    }
    Ok(())
}

/// `remove_dir_all` that first clears read-only flags, which Windows
/// refuses to delete through.
pub(crate) fn remove_tree(root: &Path) -> Result<()> {
    if cfg!(windows) {
        for entry in WalkDir::new(root).into_iter().flatten() {
            if let Ok(meta) = entry.metadata() {
                let mut perms = meta.permissions();
                if perms.readonly() {
                    #[allow(clippy::permissions_set_readonly_false)]
                    perms.set_readonly(false);
                    let _ = fs::set_permissions(entry.path(), perms);
                }
            }
        }
    }
    fs::remove_dir_all(root).at(root)
}
