// Remote folder listing. Pages are pulled from the backend only as the
// caller iterates; a fresh `list_folders` call always starts over.

use std::collections::VecDeque;
use tracing::debug;

use crate::error::{Error, Result};
use crate::remote::{RemoteFolder, RemoteStorage};

pub struct FolderLister<'a> {
    storage: &'a dyn RemoteStorage,
}

impl<'a> FolderLister<'a> {
    pub fn new(storage: &'a dyn RemoteStorage) -> Self {
        FolderLister { storage }
    }

    /// Lazily list every top-level folder in backend order.
    pub fn list_folders(&self) -> FolderListing<'a> {
        FolderListing {
            storage: self.storage,
            buffered: VecDeque::new(),
            cursor: Cursor::Start,
            pages: 0,
        }
    }

    /// The whole listing, or the first error hit while paging.
    pub fn collect_all(&self) -> Result<Vec<RemoteFolder>> {
        let mut listing = self.list_folders();
        let folders = listing.by_ref().collect::<Result<Vec<_>>>()?;
        debug!(folders = folders.len(), pages = listing.pages_fetched(), "folder listing complete");
        Ok(folders)
    }
}

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// Iterator over a folder listing. Yields `Err(RemoteUnavailable)` once and
/// then ends if a page cannot be fetched.
pub struct FolderListing<'a> {
    storage: &'a dyn RemoteStorage,
    buffered: VecDeque<RemoteFolder>,
    cursor: Cursor,
    pages: usize,
}

impl FolderListing<'_> {
    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    fn fetch_next(&mut self) -> Result<()> {
        let token = match &self.cursor {
            Cursor::Done => return Ok(()),
            Cursor::Start => None,
            Cursor::Next(t) => Some(t.clone()),
        };
        let page = self.storage.list_folders_page(token.as_deref())?;
        self.pages += 1;
        debug!(page = self.pages, folders = page.folders.len(), "fetched folder page");

        self.cursor = match page.next_page {
            // A backend handing back the same cursor would page forever.
            Some(next) if token.as_deref() == Some(next.as_str()) => {
                return Err(Error::remote(format!("folder listing stuck on page token '{next}'")));
            }
            Some(next) => Cursor::Next(next),
            None => Cursor::Done,
        };
        self.buffered.extend(page.folders);
        Ok(())
    }
}

impl Iterator for FolderListing<'_> {
    type Item = Result<RemoteFolder>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(folder) = self.buffered.pop_front() {
                return Some(Ok(folder));
            }
            if matches!(self.cursor, Cursor::Done) {
                return None;
            }
            if let Err(e) = self.fetch_next() {
                self.cursor = Cursor::Done;
                return Some(Err(match e {
                    Error::RemoteUnavailable { .. } => e,
                    other => Error::remote(other),
                }));
            }
        }
    }
}
