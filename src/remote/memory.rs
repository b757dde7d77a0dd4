// In-process backend. Holds folders and file contents in memory and can be
// told to fail, which makes it the workhorse of the test suite and handy for
// dry runs of the whole flow.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Mutex;

use super::{ByteSink, FolderPage, RemoteFile, RemoteFolder, RemoteStorage, Transfer};
use crate::error::{Error, IoResultExt, Result};

const CHUNK: usize = 4;

#[derive(Default)]
struct Inner {
    folders: Vec<RemoteFolder>,
    files: HashMap<String, BTreeMap<String, Vec<u8>>>,
    unavailable: bool,
    // path -> remaining failures (u32::MAX = always)
    upload_failures: HashMap<String, u32>,
    download_failures: HashMap<String, u32>,
    upload_attempts: HashMap<String, u32>,
}

pub struct MemoryDrive {
    inner: Mutex<Inner>,
    page_size: usize,
}

impl MemoryDrive {
    pub fn new(page_size: usize) -> Self {
        MemoryDrive {
            inner: Mutex::new(Inner::default()),
            page_size: page_size.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic in another test thread must not cascade into this one.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_folder(&self, name: &str) -> RemoteFolder {
        let folder = RemoteFolder::new(format!("id-{name}"), name);
        let mut inner = self.lock();
        inner.folders.push(folder.clone());
        inner.files.entry(folder.id.clone()).or_default();
        folder
    }

    pub fn put_file(&self, folder: &RemoteFolder, path: &str, data: &[u8]) {
        self.lock()
            .files
            .entry(folder.id.clone())
            .or_default()
            .insert(path.to_string(), data.to_vec());
    }

    pub fn file(&self, folder: &RemoteFolder, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(&folder.id)?.get(path).cloned()
    }

    pub fn paths(&self, folder: &RemoteFolder) -> Vec<String> {
        self.lock()
            .files
            .get(&folder.id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Make the next `times` uploads whose target path ends with `suffix`
    /// fail halfway through.
    pub fn fail_uploads(&self, suffix: &str, times: u32) {
        self.lock().upload_failures.insert(suffix.to_string(), times);
    }

    pub fn fail_downloads(&self, path: &str, times: u32) {
        self.lock().download_failures.insert(path.to_string(), times);
    }

    /// Upload attempts seen for every target path ending with `suffix`.
    pub fn upload_attempts(&self, suffix: &str) -> u32 {
        self.lock()
            .upload_attempts
            .iter()
            .filter(|(p, _)| p.ends_with(suffix))
            .map(|(_, n)| *n)
            .sum()
    }

    fn check_available(&self) -> Result<()> {
        if self.lock().unavailable {
            return Err(Error::remote("memory drive is offline"));
        }
        Ok(())
    }

    fn take_failure(map: &mut HashMap<String, u32>, path: &str) -> bool {
        let Some((_, left)) = map.iter_mut().find(|(k, _)| path.ends_with(k.as_str())) else {
            return false;
        };
        match *left {
            0 => false,
            u32::MAX => true,
            _ => {
                *left -= 1;
                true
            }
        }
    }
}

impl RemoteStorage for MemoryDrive {
    fn location(&self) -> String {
        "memory://".into()
    }

    fn list_folders_page(&self, page_token: Option<&str>) -> Result<FolderPage> {
        self.check_available()?;
        let offset: usize = match page_token {
            None => 0,
            Some(t) => t.parse().map_err(|_| Error::remote(format!("bad page token '{t}'")))?,
        };
        let inner = self.lock();
        let end = (offset + self.page_size).min(inner.folders.len());
        let folders = inner.folders.get(offset..end).unwrap_or_default().to_vec();
        let next_page = (end < inner.folders.len()).then(|| end.to_string());
        Ok(FolderPage { folders, next_page })
    }

    fn list_files(&self, folder: &RemoteFolder) -> Result<Vec<RemoteFile>> {
        self.check_available()?;
        let inner = self.lock();
        let files = inner.files.get(&folder.id).ok_or_else(|| {
            Error::remote(format!("folder '{}' not found", folder.display_name))
        })?;
        Ok(files
            .iter()
            .map(|(path, data)| RemoteFile {
                path: path.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    fn download(&self, folder: &RemoteFolder, path: &str, dest: &mut dyn Write) -> Result<u64> {
        self.check_available()?;
        let data = {
            let mut inner = self.lock();
            if Self::take_failure(&mut inner.download_failures, path) {
                return Err(Error::remote(format!("download of '{path}' interrupted")));
            }
            inner
                .files
                .get(&folder.id)
                .and_then(|m| m.get(path))
                .cloned()
                .ok_or_else(|| Error::remote(format!("'{path}' not found")))?
        };
        dest.write_all(&data).at(path)?;
        Ok(data.len() as u64)
    }

    fn exists(&self, folder: &RemoteFolder, path: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self
            .lock()
            .files
            .get(&folder.id)
            .map(|m| m.contains_key(path))
            .unwrap_or(false))
    }

    fn upload(
        &self,
        folder: &RemoteFolder,
        path: &str,
        source: &Path,
        on_bytes: ByteSink,
    ) -> Result<Transfer> {
        self.check_available()?;
        let fail = {
            let mut inner = self.lock();
            *inner.upload_attempts.entry(path.to_string()).or_default() += 1;
            Self::take_failure(&mut inner.upload_failures, path)
        };

        let mut data = Vec::new();
        File::open(source)
            .and_then(|mut f| f.read_to_end(&mut data))
            .at(source)?;

        // Report in small chunks so progress has something to show.
        let cut = if fail { data.len() / 2 } else { data.len() };
        for chunk in data[..cut].chunks(CHUNK) {
            if !on_bytes(chunk.len() as u64) {
                return Ok(Transfer::Aborted);
            }
        }
        if fail {
            return Err(Error::io(
                path,
                io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"),
            ));
        }
        self.lock()
            .files
            .entry(folder.id.clone())
            .or_default()
            .insert(path.to_string(), data);
        Ok(Transfer::Completed)
    }
}
