// Provisioning: turn a chosen remote folder into a session directory with a
// complete read-only mirror and an empty scratch, then hand both to the
// editor and wait for it to close.

use chrono::{DateTime, Local};
use serde_json::json;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    tree, Editor, Manifest, SessionSlot, SessionState, WorkspaceSession, MANIFEST, MIRROR_DIR,
    SCRATCH_DIR,
};
use crate::config::Settings;
use crate::error::{Error, IoResultExt, Result};
use crate::remote::{join_relative, RemoteFolder, RemoteStorage};

const STAGING_DIR: &str = ".mirror.partial";

/// A session from an earlier run whose scratch directory survived, either
/// because its upload partly failed or because the run was interrupted.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub root: PathBuf,
    pub folder: RemoteFolder,
    pub created_at: DateTime<Local>,
    pub state: SessionState,
    pub scratch_files: usize,
}

pub struct Provisioner<'a> {
    storage: &'a dyn RemoteStorage,
    editor: &'a dyn Editor,
    base_path: PathBuf,
    workspace_file: bool,
    template: Option<PathBuf>,
}

impl<'a> Provisioner<'a> {
    pub fn new(storage: &'a dyn RemoteStorage, editor: &'a dyn Editor, base_path: impl Into<PathBuf>) -> Self {
        Provisioner {
            storage,
            editor,
            base_path: base_path.into(),
            workspace_file: false,
            template: None,
        }
    }

    pub fn from_settings(storage: &'a dyn RemoteStorage, editor: &'a dyn Editor, settings: &Settings) -> Self {
        Provisioner::new(storage, editor, &settings.workspace.base_path)
            .with_workspace_file(settings.editor.workspace_file, settings.editor.template.clone())
    }

    pub fn with_workspace_file(mut self, enabled: bool, template: Option<PathBuf>) -> Self {
        self.workspace_file = enabled;
        self.template = template;
        self
    }

    /// Provision a session for `folder`, put it in the slot and block while
    /// the editor is open. Returns the session in `Collecting`.
    pub fn open_session<'s>(
        &self,
        slot: &'s mut SessionSlot,
        folder: &RemoteFolder,
    ) -> Result<&'s mut WorkspaceSession> {
        slot.ensure_free()?;
        let session = slot.occupy(self.provision(folder)?)?;
        self.run_editor(session)?;
        Ok(session)
    }

    /// Create the directories and the mirror. On success the session is
    /// `Active`; on failure nothing is left under the base path.
    pub fn provision(&self, folder: &RemoteFolder) -> Result<WorkspaceSession> {
        fs::create_dir_all(&self.base_path).at(&self.base_path)?;
        let created_at = Local::now();
        let session_id = new_session_id(created_at);
        let root = self.base_path.join(&session_id);
        fs::create_dir(&root).at(&root)?;

        let mut session = WorkspaceSession::new(
            session_id,
            folder.clone(),
            root,
            created_at,
            SessionState::Provisioning,
        );
        info!(session = %session.session_id(), folder = %folder.display_name, "provisioning workspace");

        if let Err(e) = self.bring_up(&mut session) {
            warn!(session = %session.session_id(), error = %e, "provisioning failed, discarding workspace");
            if let Err(close_err) = session.close() {
                warn!(error = %close_err, "could not remove failed workspace");
            }
            return Err(e);
        }
        Ok(session)
    }

    fn bring_up(&self, session: &mut WorkspaceSession) -> Result<()> {
        session.write_manifest()?;
        fs::create_dir(session.scratch_path()).at(session.scratch_path())?;
        self.snapshot(session.remote_folder(), session.root())?;
        if self.workspace_file {
            self.write_workspace_file(session)?;
        }
        session.transition(SessionState::Active)
    }

    /// Download the folder tree into a staging directory and rename it into
    /// place once every file is there.
    fn snapshot(&self, folder: &RemoteFolder, root: &Path) -> Result<()> {
        let sync_err = |reason: String| Error::SyncError {
            folder: folder.display_name.clone(),
            reason,
        };
        let staging = root.join(STAGING_DIR);
        fs::create_dir(&staging).at(&staging)?;

        let files = self
            .storage
            .list_files(folder)
            .map_err(|e| sync_err(e.to_string()))?;
        let mut bytes = 0u64;
        for file in &files {
            let dest = join_relative(&staging, &file.path).map_err(|e| sync_err(e.to_string()))?;
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).at(parent)?;
            }
            let mut out = File::create(&dest).at(&dest)?;
            bytes += self
                .storage
                .download(folder, &file.path, &mut out)
                .map_err(|e| sync_err(format!("{}: {e}", file.path)))?;
        }

        let mirror = root.join(MIRROR_DIR);
        fs::rename(&staging, &mirror).at(&mirror)?;
        tree::make_read_only(&mirror)?;
        debug!(folder = %folder.display_name, files = files.len(), bytes, "mirror complete");
        Ok(())
    }

    fn workspace_file_path(&self, session: &WorkspaceSession) -> PathBuf {
        let name = sanitize_file_name(&session.remote_folder().display_name);
        session.root().join(format!("{name}.code-workspace"))
    }

    fn write_workspace_file(&self, session: &WorkspaceSession) -> Result<()> {
        let path = self.workspace_file_path(session);
        let mirror = session.mirror_path().to_string_lossy().into_owned();
        let scratch = session.scratch_path().to_string_lossy().into_owned();
        let folder = &session.remote_folder().display_name;

        let content = match &self.template {
            Some(template) => {
                let text = fs::read_to_string(template).at(template)?;
                render_template(
                    &text,
                    &[
                        ("${MIRROR}", mirror.as_str()),
                        ("${SCRATCH}", scratch.as_str()),
                        ("${FOLDER}", folder.as_str()),
                        ("${DRIVE_ROOT}", self.storage.location().as_str()),
                    ],
                )
            }
            None => {
                let mut readonly = serde_json::Map::new();
                readonly.insert(format!("{}/**", mirror.replace('\\', "/")), json!(true));
                let doc = json!({
                    "folders": [
                        { "name": format!("{folder} (read-only)"), "path": mirror },
                        { "name": format!("{folder} (scratch)"), "path": scratch },
                    ],
                    "settings": { "files.readonlyInclude": readonly },
                });
                serde_json::to_string_pretty(&doc)
                    .map_err(|e| Error::Config(format!("cannot encode workspace file: {e}")))?
            }
        };
        fs::write(&path, content).at(&path)
    }

    fn editor_targets(&self, session: &WorkspaceSession) -> Vec<PathBuf> {
        if self.workspace_file {
            vec![self.workspace_file_path(session)]
        } else {
            vec![session.mirror_path().to_path_buf(), session.scratch_path().to_path_buf()]
        }
    }

    /// Block on the editor for a freshly provisioned `Active` session.
    /// However the editor ends the session moves to `Collecting`; if it never
    /// starts the session is closed, which is safe because scratch is still
    /// empty.
    pub fn run_editor(&self, session: &mut WorkspaceSession) -> Result<()> {
        if let Err(e) = self.wait_for_editor(session) {
            if let Err(close_err) = session.close() {
                warn!(error = %close_err, "could not remove workspace after editor failure");
            }
            return Err(e);
        }
        session.transition(SessionState::Collecting)
    }

    /// Reopen the editor on a session that is being reviewed. Scratch may
    /// hold unuploaded work here, so a launch failure puts the session back
    /// in `Collecting` and deletes nothing.
    pub fn relaunch_editor(&self, session: &mut WorkspaceSession) -> Result<()> {
        if matches!(session.state(), SessionState::Retained { .. }) {
            session.transition(SessionState::Collecting)?;
        }
        session.transition(SessionState::Active)?;
        let waited = self.wait_for_editor(session);
        session.transition(SessionState::Collecting)?;
        waited
    }

    fn wait_for_editor(&self, session: &WorkspaceSession) -> Result<()> {
        let targets = self.editor_targets(session);
        let exit = self.editor.open_and_wait(&targets)?;
        info!(session = %session.session_id(), code = ?exit.code, "editor closed");
        Ok(())
    }

    /// Earlier sessions for `folder` whose scratch directory still exists,
    /// newest first.
    pub fn retained_sessions(&self, folder: &RemoteFolder) -> Result<Vec<SessionRecord>> {
        if !self.base_path.is_dir() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.base_path).at(&self.base_path)? {
            let entry = entry.at(&self.base_path)?;
            let root = entry.path();
            let manifest_path = root.join(MANIFEST);
            let manifest: Manifest = match fs::read_to_string(&manifest_path)
                .ok()
                .and_then(|text| serde_json::from_str(&text).ok())
            {
                Some(m) => m,
                None => {
                    debug!(path = %root.display(), "skipping directory without a readable manifest");
                    continue;
                }
            };
            let scratch = root.join(SCRATCH_DIR);
            // A session that died while provisioning has no complete mirror.
            if manifest.folder.id != folder.id
                || matches!(manifest.state, SessionState::Closed | SessionState::Provisioning)
                || !scratch.is_dir()
            {
                continue;
            }
            let scratch_files = walkdir::WalkDir::new(&scratch)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .count();
            records.push(SessionRecord {
                session_id: manifest.session_id,
                root,
                folder: manifest.folder,
                created_at: manifest.created_at,
                state: manifest.state,
                scratch_files,
            });
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Adopt a retained session into the slot, ready for collection.
    pub fn resume_session<'s>(
        &self,
        slot: &'s mut SessionSlot,
        record: &SessionRecord,
    ) -> Result<&'s mut WorkspaceSession> {
        slot.ensure_free()?;
        let session = WorkspaceSession::new(
            record.session_id.clone(),
            record.folder.clone(),
            record.root.clone(),
            record.created_at,
            SessionState::Collecting,
        );
        session.write_manifest()?;
        info!(session = %record.session_id, from = %record.state, "resumed retained workspace");
        slot.occupy(session)
    }

    /// Delete a retained session's directory. Destroys its scratch content.
    pub fn discard_session(&self, record: &SessionRecord, confirmed: bool) -> Result<()> {
        if !confirmed {
            return Err(Error::CloseNotConfirmed {
                session_id: record.session_id.clone(),
            });
        }
        tree::remove_tree(&record.root)?;
        info!(session = %record.session_id, "discarded retained workspace");
        Ok(())
    }
}

fn new_session_id(at: DateTime<Local>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", at.format("%Y%m%d-%H%M%S"), &suffix[..8])
}

fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, '-' | '_' | ' ' | '.') { c } else { '_' })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == ' ');
    if trimmed.is_empty() {
        "workspace".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Replace each placeholder with its value escaped for a JSON string.
fn render_template(text: &str, values: &[(&str, &str)]) -> String {
    values.iter().fold(text.to_string(), |acc, (key, value)| {
        let quoted = serde_json::Value::String((*value).to_string()).to_string();
        acc.replace(key, &quoted[1..quoted.len() - 1])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryDrive;
    use crate::workspace::EditorExit;
    use std::cell::RefCell;

    /// Records what it was asked to open and optionally drops a file into
    /// scratch, like a user would.
    struct FakeEditor {
        opened: RefCell<Vec<PathBuf>>,
        fail: bool,
    }

    impl FakeEditor {
        fn new() -> Self {
            FakeEditor {
                opened: RefCell::new(Vec::new()),
                fail: false,
            }
        }
    }

    impl Editor for FakeEditor {
        fn program(&self) -> &str {
            "fake"
        }

        fn open_and_wait(&self, targets: &[PathBuf]) -> Result<EditorExit> {
            if self.fail {
                return Err(Error::EditorLaunch {
                    program: "fake".into(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not installed"),
                });
            }
            self.opened.borrow_mut().extend_from_slice(targets);
            Ok(EditorExit { code: None })
        }
    }

    fn drive_with_project() -> (MemoryDrive, RemoteFolder) {
        let drive = MemoryDrive::new(10);
        let folder = drive.add_folder("ProjectA");
        drive.put_file(&folder, "README.md", b"# A");
        drive.put_file(&folder, "src/main.py", b"print('hi')");
        (drive, folder)
    }

    #[test]
    fn open_session_mirrors_and_waits_for_editor() {
        let base = tempfile::tempdir().unwrap();
        let (drive, folder) = drive_with_project();
        let editor = FakeEditor::new();
        let provisioner = Provisioner::new(&drive, &editor, base.path());
        let mut slot = SessionSlot::new();

        let session = provisioner.open_session(&mut slot, &folder).unwrap();
        assert_eq!(session.state(), &SessionState::Collecting);
        assert_eq!(fs::read(session.mirror_path().join("src/main.py")).unwrap(), b"print('hi')");
        assert!(fs::metadata(session.mirror_path().join("README.md")).unwrap().permissions().readonly());
        assert!(session.scratch_path().is_dir());
        assert_eq!(fs::read_dir(session.scratch_path()).unwrap().count(), 0);
        assert!(!session.root().join(STAGING_DIR).exists());
        assert_ne!(session.scratch_path(), session.mirror_path());

        let opened = editor.opened.borrow();
        assert_eq!(opened.len(), 2);
        assert_eq!(opened[0], session.mirror_path());
        assert_eq!(opened[1], session.scratch_path());
    }

    #[test]
    fn failed_snapshot_leaves_nothing_behind() {
        let base = tempfile::tempdir().unwrap();
        let (drive, folder) = drive_with_project();
        drive.fail_downloads("src/main.py", 1);
        let editor = FakeEditor::new();
        let provisioner = Provisioner::new(&drive, &editor, base.path());
        let mut slot = SessionSlot::new();

        let err = provisioner.open_session(&mut slot, &folder).unwrap_err();
        match err {
            Error::SyncError { folder, reason } => {
                assert_eq!(folder, "ProjectA");
                assert!(reason.contains("src/main.py"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fs::read_dir(base.path()).unwrap().count(), 0);
        assert!(slot.get().is_none());
        assert!(editor.opened.borrow().is_empty());
    }

    #[test]
    fn editor_launch_failure_closes_session() {
        let base = tempfile::tempdir().unwrap();
        let (drive, folder) = drive_with_project();
        let editor = FakeEditor {
            fail: true,
            ..FakeEditor::new()
        };
        let provisioner = Provisioner::new(&drive, &editor, base.path());
        let mut slot = SessionSlot::new();

        assert!(matches!(
            provisioner.open_session(&mut slot, &folder),
            Err(Error::EditorLaunch { .. })
        ));
        let session = slot.get().unwrap();
        assert_eq!(session.state(), &SessionState::Closed);
        assert!(!session.scratch_path().exists());
        assert!(slot.release_closed());
    }

    #[test]
    fn second_session_is_refused_and_paths_are_unique() {
        let base = tempfile::tempdir().unwrap();
        let (drive, folder) = drive_with_project();
        let editor = FakeEditor::new();
        let provisioner = Provisioner::new(&drive, &editor, base.path());
        let mut slot = SessionSlot::new();

        let first_scratch = provisioner
            .open_session(&mut slot, &folder)
            .unwrap()
            .scratch_path()
            .to_path_buf();
        assert!(matches!(
            provisioner.open_session(&mut slot, &folder),
            Err(Error::SessionBusy { .. })
        ));

        slot.get_mut().unwrap().close_without_upload(true).unwrap();
        assert!(slot.release_closed());
        let second = provisioner.open_session(&mut slot, &folder).unwrap();
        assert_ne!(second.scratch_path(), first_scratch);
    }

    #[test]
    fn workspace_file_lists_both_roots() {
        let base = tempfile::tempdir().unwrap();
        let (drive, folder) = drive_with_project();
        let editor = FakeEditor::new();
        let provisioner =
            Provisioner::new(&drive, &editor, base.path()).with_workspace_file(true, None);
        let mut slot = SessionSlot::new();

        let session = provisioner.open_session(&mut slot, &folder).unwrap();
        let opened = editor.opened.borrow();
        assert_eq!(opened.len(), 1);
        assert!(opened[0].to_string_lossy().ends_with("ProjectA.code-workspace"));

        let doc: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&opened[0]).unwrap()).unwrap();
        let folders = doc["folders"].as_array().unwrap();
        assert_eq!(folders[0]["path"].as_str().unwrap(), session.mirror_path().to_string_lossy());
        assert_eq!(folders[1]["path"].as_str().unwrap(), session.scratch_path().to_string_lossy());
    }

    #[test]
    fn template_values_are_json_escaped() {
        let out = render_template(
            r#"{"path": "${MIRROR}", "name": "${FOLDER}"}"#,
            &[("${MIRROR}", r"C:\drive\A"), ("${FOLDER}", "say \"hi\"")],
        );
        let doc: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(doc["path"], r"C:\drive\A");
        assert_eq!(doc["name"], "say \"hi\"");
    }

    #[test]
    fn retained_session_can_be_found_and_resumed() {
        let base = tempfile::tempdir().unwrap();
        let (drive, folder) = drive_with_project();
        let editor = FakeEditor::new();
        let provisioner = Provisioner::new(&drive, &editor, base.path());

        let root = {
            let mut slot = SessionSlot::new();
            let session = provisioner.open_session(&mut slot, &folder).unwrap();
            fs::write(session.scratch_path().join("draft.txt"), b"keep me").unwrap();
            // slot dropped without closing, as if the process had exited
            let root = session.root().to_path_buf();
            root
        };

        let other = drive.add_folder("ProjectB");
        assert!(provisioner.retained_sessions(&other).unwrap().is_empty());

        let records = provisioner.retained_sessions(&folder).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].root, root);
        assert_eq!(records[0].scratch_files, 1);

        let mut slot = SessionSlot::new();
        let session = provisioner.resume_session(&mut slot, &records[0]).unwrap();
        assert_eq!(session.state(), &SessionState::Collecting);
        assert_eq!(fs::read(session.scratch_path().join("draft.txt")).unwrap(), b"keep me");
    }

    #[test]
    fn relaunch_reopens_the_editor_and_returns_to_review() {
        let base = tempfile::tempdir().unwrap();
        let (drive, folder) = drive_with_project();
        let editor = FakeEditor::new();
        let provisioner = Provisioner::new(&drive, &editor, base.path());
        let mut slot = SessionSlot::new();

        let session = provisioner.open_session(&mut slot, &folder).unwrap();
        provisioner.relaunch_editor(session).unwrap();
        assert_eq!(session.state(), &SessionState::Collecting);
        assert_eq!(editor.opened.borrow().len(), 4);
    }

    #[test]
    fn failed_relaunch_keeps_scratch_work() {
        let base = tempfile::tempdir().unwrap();
        let (drive, folder) = drive_with_project();
        let editor = FakeEditor::new();
        let broken = FakeEditor {
            fail: true,
            ..FakeEditor::new()
        };
        let mut slot = SessionSlot::new();

        let session = Provisioner::new(&drive, &editor, base.path())
            .open_session(&mut slot, &folder)
            .unwrap();
        fs::write(session.scratch_path().join("work.txt"), b"unsaved").unwrap();
        session.transition(SessionState::Uploading).unwrap();
        session
            .transition(SessionState::Retained {
                failed: vec!["ProjectA/2024-11-07/work.txt".into()],
            })
            .unwrap();

        let err = Provisioner::new(&drive, &broken, base.path())
            .relaunch_editor(session)
            .unwrap_err();
        assert!(matches!(err, Error::EditorLaunch { .. }));
        assert_eq!(session.state(), &SessionState::Collecting);
        assert_eq!(fs::read(session.scratch_path().join("work.txt")).unwrap(), b"unsaved");
        assert!(session.mirror_path().join("README.md").exists());
    }

    #[test]
    fn interrupted_provisioning_is_not_offered_for_restore() {
        let base = tempfile::tempdir().unwrap();
        let (drive, folder) = drive_with_project();
        let editor = FakeEditor::new();
        let provisioner = Provisioner::new(&drive, &editor, base.path());

        let root = base.path().join("20240101-000000-deadbeef");
        fs::create_dir_all(root.join(SCRATCH_DIR)).unwrap();
        fs::create_dir_all(root.join(STAGING_DIR)).unwrap();
        WorkspaceSession::new(
            "20240101-000000-deadbeef".into(),
            folder.clone(),
            root,
            Local::now(),
            SessionState::Provisioning,
        )
        .write_manifest()
        .unwrap();

        assert!(provisioner.retained_sessions(&folder).unwrap().is_empty());
    }

    #[test]
    fn discarding_needs_confirmation() {
        let base = tempfile::tempdir().unwrap();
        let (drive, folder) = drive_with_project();
        let editor = FakeEditor::new();
        let provisioner = Provisioner::new(&drive, &editor, base.path());
        {
            let mut slot = SessionSlot::new();
            provisioner.open_session(&mut slot, &folder).unwrap();
        }
        let record = provisioner.retained_sessions(&folder).unwrap().remove(0);
        assert!(provisioner.discard_session(&record, false).is_err());
        assert!(record.root.exists());
        provisioner.discard_session(&record, true).unwrap();
        assert!(!record.root.exists());
        assert!(provisioner.retained_sessions(&folder).unwrap().is_empty());
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(sanitize_file_name("A/B:C"), "A_B_C");
        assert_eq!(sanitize_file_name("..."), "workspace");
        assert_eq!(sanitize_file_name("エキスパート"), "エキスパート");
    }
}
