// Backend for a Drive that the desktop sync client keeps mirrored on local
// disk. Folders are directories under `root`; an upload is a copy into the
// synced tree, after which the sync client takes over.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{
    copy_with_progress, join_relative, to_relative, ByteSink, FolderPage, RemoteFile,
    RemoteFolder, RemoteStorage, Transfer,
};
use crate::error::{Error, IoResultExt, Result};

pub struct MountedDrive {
    root: PathBuf,
    page_size: usize,
}

impl MountedDrive {
    pub fn new(root: impl Into<PathBuf>, page_size: usize) -> Self {
        MountedDrive {
            root: root.into(),
            page_size: page_size.max(1),
        }
    }

    fn folder_dir(&self, folder: &RemoteFolder) -> Result<PathBuf> {
        join_relative(&self.root, &folder.id)
    }

    fn sorted_folder_names(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            Error::remote(format!("drive root {} is not readable: {e}", self.root.display()))
        })?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(Error::remote)?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

impl RemoteStorage for MountedDrive {
    fn location(&self) -> String {
        self.root.display().to_string()
    }

    // Page tokens are plain offsets into the sorted directory listing.
    fn list_folders_page(&self, page_token: Option<&str>) -> Result<FolderPage> {
        let offset = match page_token {
            None => 0,
            Some(t) => t
                .parse::<usize>()
                .map_err(|_| Error::remote(format!("bad page token '{t}'")))?,
        };
        let names = self.sorted_folder_names()?;
        let end = (offset + self.page_size).min(names.len());
        let folders = names
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|n| RemoteFolder::new(n.clone(), n.clone()))
            .collect();
        let next_page = (end < names.len()).then(|| end.to_string());
        Ok(FolderPage { folders, next_page })
    }

    fn list_files(&self, folder: &RemoteFolder) -> Result<Vec<RemoteFile>> {
        let dir = self.folder_dir(folder)?;
        if !dir.is_dir() {
            return Err(Error::remote(format!(
                "folder '{}' not found under {}",
                folder.display_name,
                self.root.display()
            )));
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1) {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.clone());
                Error::io(path, io::Error::new(io::ErrorKind::Other, e.to_string()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(path) = to_relative(&dir, entry.path()) else {
                continue;
            };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            files.push(RemoteFile { path, size });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    fn download(&self, folder: &RemoteFolder, path: &str, dest: &mut dyn Write) -> Result<u64> {
        let src = join_relative(&self.folder_dir(folder)?, path)?;
        let mut file = File::open(&src).at(&src)?;
        io::copy(&mut file, dest).at(&src)
    }

    fn exists(&self, folder: &RemoteFolder, path: &str) -> Result<bool> {
        Ok(join_relative(&self.folder_dir(folder)?, path)?.is_file())
    }

    // Written to a `.part` sibling first and renamed, so the sync client
    // never picks up a half-copied file.
    fn upload(
        &self,
        folder: &RemoteFolder,
        path: &str,
        source: &Path,
        on_bytes: ByteSink,
    ) -> Result<Transfer> {
        let target = join_relative(&self.folder_dir(folder)?, path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }
        let mut part_name = target.file_name().unwrap_or_default().to_os_string();
        part_name.push(".part");
        let part = target.with_file_name(part_name);

        let mut reader = File::open(source).at(source)?;
        let mut writer = File::create(&part).at(&part)?;
        let result = copy_with_progress(&mut reader, &mut writer, &on_bytes);
        drop(writer);

        match result {
            Ok(Transfer::Completed) => {
                fs::rename(&part, &target).at(&target)?;
                debug!(target = %target.display(), "copied into drive");
                Ok(Transfer::Completed)
            }
            Ok(Transfer::Aborted) => {
                discard_part(&part);
                Ok(Transfer::Aborted)
            }
            Err(e) => {
                discard_part(&part);
                Err(Error::io(&target, e))
            }
        }
    }
}

fn discard_part(part: &Path) {
    if let Err(e) = fs::remove_file(part) {
        warn!(path = %part.display(), error = %e, "could not remove partial upload");
    }
}
