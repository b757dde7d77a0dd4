// Remote storage backends. The rest of the crate only ever talks to the
// `RemoteStorage` trait; which concrete store sits behind it is decided once
// in `main` from the settings.

use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};

pub mod http;
pub mod memory;
pub mod mounted;

pub use http::HttpDrive;
pub use memory::MemoryDrive;
pub use mounted::MountedDrive;

/// A top-level folder in the remote store, as returned by one listing call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteFolder {
    pub id: String,
    pub display_name: String,
    pub parent_id: Option<String>,
}

impl RemoteFolder {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        RemoteFolder {
            id: id.into(),
            display_name: display_name.into(),
            parent_id: None,
        }
    }
}

/// One page of a folder listing. `next_page` is an opaque cursor; `None`
/// means the listing is complete.
#[derive(Debug, Clone, Default)]
pub struct FolderPage {
    pub folders: Vec<RemoteFolder>,
    pub next_page: Option<String>,
}

/// A file somewhere below a remote folder. `path` is relative to the folder
/// and always uses `/` separators.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub path: String,
    pub size: u64,
}

/// How a transfer ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Completed,
    /// The byte sink asked to stop; nothing was left behind on the remote.
    Aborted,
}

/// Called with the size of every chunk sent. Returning `false` aborts the
/// transfer between chunks.
pub type ByteSink = Arc<dyn Fn(u64) -> bool + Send + Sync>;

pub trait RemoteStorage: Send + Sync {
    /// Human readable location, used in messages and workspace files.
    fn location(&self) -> String;

    fn list_folders_page(&self, page_token: Option<&str>) -> Result<FolderPage>;

    /// Every file below `folder`, recursively, ordered by path.
    fn list_files(&self, folder: &RemoteFolder) -> Result<Vec<RemoteFile>>;

    /// Stream one file into `dest`, returning the number of bytes written.
    fn download(&self, folder: &RemoteFolder, path: &str, dest: &mut dyn Write) -> Result<u64>;

    fn exists(&self, folder: &RemoteFolder, path: &str) -> Result<bool>;

    /// Upload `source` to `path` below `folder`, creating intermediate
    /// folders and replacing an existing file.
    fn upload(
        &self,
        folder: &RemoteFolder,
        path: &str,
        source: &Path,
        on_bytes: ByteSink,
    ) -> Result<Transfer>;
}

const CHUNK: usize = 64 * 1024;

/// Copy `reader` into `writer` chunk by chunk, reporting each chunk to
/// `on_bytes` and stopping early if it says so.
pub fn copy_with_progress(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    on_bytes: &ByteSink,
) -> io::Result<Transfer> {
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        if !on_bytes(n as u64) {
            return Ok(Transfer::Aborted);
        }
    }
    writer.flush()?;
    Ok(Transfer::Completed)
}

/// Join a `/`-separated relative path onto `root`, refusing anything that
/// would land outside it.
pub fn join_relative(root: &Path, rel: &str) -> Result<PathBuf> {
    let mut out = root.to_path_buf();
    for part in rel.split('/').filter(|p| !p.is_empty()) {
        let mut comps = Path::new(part).components();
        match (comps.next(), comps.next()) {
            (Some(Component::Normal(c)), None) => out.push(c),
            _ => {
                return Err(Error::io(
                    root.join(rel),
                    io::Error::new(io::ErrorKind::InvalidInput, "path escapes its root"),
                ))
            }
        }
    }
    if out == root {
        return Err(Error::io(
            root,
            io::Error::new(io::ErrorKind::InvalidInput, "empty relative path"),
        ));
    }
    Ok(out)
}

/// Relative path of `path` under `root` with `/` separators.
pub fn to_relative(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
