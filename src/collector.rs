// Change collection: what is in scratch after the editor closed, and which
// of it the user wants uploaded. Scanning touches the disk; selecting never
// does.

use serde::Serialize;
use std::path::Path;
use walkdir::{DirEntry, WalkDir};

use crate::error::{Error, Result};
use crate::remote::to_relative;
use crate::workspace::WorkspaceSession;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CandidateFile {
    /// Relative to the scratch directory, `/`-separated.
    pub relative_path: String,
    pub size_bytes: u64,
    pub selected: bool,
}

impl CandidateFile {
    pub fn is_nested(&self) -> bool {
        self.relative_path.contains('/')
    }
}

pub struct Collector {
    exclude: Vec<String>,
}

impl Collector {
    pub fn new(exclude: Vec<String>) -> Self {
        Collector { exclude }
    }

    /// Scan the session's scratch directory. The mirror is never looked at.
    pub fn collect(&self, session: &WorkspaceSession) -> Result<CandidateList> {
        self.scan(session.scratch_path()).map(CandidateList::new)
    }

    /// Files under `root`, minus anything with an excluded path component.
    /// Files inside subdirectories come first, then top-level files, each
    /// group sorted by path.
    pub fn scan(&self, root: &Path) -> Result<Vec<CandidateFile>> {
        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !self.is_excluded(e));

        let mut files = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(root).to_path_buf();
                Error::io(path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(relative_path) = to_relative(root, entry.path()) else {
                continue;
            };
            let size_bytes = entry
                .metadata()
                .map_err(|e| Error::io(entry.path(), e.into()))?
                .len();
            files.push(CandidateFile {
                relative_path,
                size_bytes,
                selected: true,
            });
        }
        files.sort_by(|a, b| {
            (!a.is_nested(), &a.relative_path).cmp(&(!b.is_nested(), &b.relative_path))
        });
        Ok(files)
    }

    fn is_excluded(&self, entry: &DirEntry) -> bool {
        let name = entry.file_name().to_string_lossy();
        self.exclude.iter().any(|p| *p == name)
    }
}

/// The checklist shown to the user. Every operation is in-memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateList {
    items: Vec<CandidateFile>,
}

impl CandidateList {
    pub fn new(items: Vec<CandidateFile>) -> Self {
        CandidateList { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[CandidateFile] {
        &self.items
    }

    pub fn toggle(&mut self, index: usize) {
        if let Some(item) = self.items.get_mut(index) {
            item.selected = !item.selected;
        }
    }

    pub fn set_all(&mut self, selected: bool) {
        for item in &mut self.items {
            item.selected = selected;
        }
    }

    /// Select exactly the given indices.
    pub fn select_only(&mut self, indices: &[usize]) {
        for (i, item) in self.items.iter_mut().enumerate() {
            item.selected = indices.contains(&i);
        }
    }

    /// Set every file under directory `dir` at once.
    pub fn set_dir(&mut self, dir: &str, selected: bool) {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        for item in &mut self.items {
            if item.relative_path.starts_with(&prefix) {
                item.selected = selected;
            }
        }
    }

    pub fn selected(&self) -> Vec<CandidateFile> {
        self.items.iter().filter(|c| c.selected).cloned().collect()
    }

    pub fn selected_bytes(&self) -> u64 {
        self.items
            .iter()
            .filter(|c| c.selected)
            .map(|c| c.size_bytes)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src/pkg")).unwrap();
        fs::create_dir_all(root.join("__pycache__")).unwrap();
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::write(root.join("notes.txt"), b"0123456789").unwrap();
        fs::write(root.join("a.py"), b"x").unwrap();
        fs::write(root.join("src/pkg/mod.py"), b"pass").unwrap();
        fs::write(root.join("src/main.py"), b"print()").unwrap();
        fs::write(root.join("__pycache__/a.cpython.pyc"), b"junk").unwrap();
        fs::write(root.join("docs/.DS_Store"), b"junk").unwrap();
        dir
    }

    fn collector() -> Collector {
        Collector::new(vec!["__pycache__".into(), ".DS_Store".into()])
    }

    #[test]
    fn nested_files_first_then_top_level() {
        let dir = scratch();
        let files = collector().scan(dir.path()).unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, ["src/main.py", "src/pkg/mod.py", "a.py", "notes.txt"]);
        assert_eq!(files[3].size_bytes, 10);
        assert!(files.iter().all(|f| f.selected));
    }

    #[test]
    fn rescanning_unchanged_scratch_is_stable() {
        let dir = scratch();
        let c = collector();
        assert_eq!(c.scan(dir.path()).unwrap(), c.scan(dir.path()).unwrap());
    }

    #[test]
    fn empty_scratch_has_no_candidates() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collector().scan(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn missing_scratch_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("scratch");
        assert!(matches!(collector().scan(&gone), Err(Error::Io { .. })));
    }

    #[test]
    fn selection_changes_stay_in_memory() {
        let dir = scratch();
        let mut list = CandidateList::new(collector().scan(dir.path()).unwrap());
        list.set_dir("src", false);
        assert_eq!(
            list.selected().iter().map(|c| c.relative_path.as_str()).collect::<Vec<_>>(),
            ["a.py", "notes.txt"]
        );
        list.toggle(2);
        assert_eq!(list.selected().len(), 1);
        assert_eq!(list.selected_bytes(), 10);

        list.select_only(&[0]);
        assert_eq!(list.selected()[0].relative_path, "src/main.py");
        list.set_all(true);
        assert_eq!(list.selected().len(), 4);
        // Nothing on disk moved.
        assert!(dir.path().join("src/main.py").exists());
    }
}
