// End-to-end flows over the public API: list, provision, edit, collect,
// upload. The in-memory drive stands in for Drive; the editor is a stub that
// writes files into scratch the way a user would.

use chrono::NaiveDate;
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use swimmy_manager::collector::Collector;
use swimmy_manager::error::Error;
use swimmy_manager::lister::FolderLister;
use swimmy_manager::remote::{MemoryDrive, RemoteFolder, RemoteStorage};
use swimmy_manager::upload::{CancelToken, ProgressEvent, UploadOrchestrator, UploadOutcome, UploadPolicy};
use swimmy_manager::workspace::{Editor, EditorExit, Provisioner, SessionSlot, SessionState};

struct WritingEditor {
    files: Vec<(&'static str, Vec<u8>)>,
}

impl Editor for WritingEditor {
    fn program(&self) -> &str {
        "stub-editor"
    }

    fn open_and_wait(&self, targets: &[PathBuf]) -> swimmy_manager::Result<EditorExit> {
        let scratch = &targets[1];
        for (path, data) in &self.files {
            let dest = scratch.join(path);
            fs::create_dir_all(dest.parent().unwrap()).unwrap();
            fs::write(dest, data).unwrap();
        }
        Ok(EditorExit { code: Some(0) })
    }
}

fn policy() -> UploadPolicy {
    UploadPolicy {
        concurrency: 2,
        max_attempts: 3,
        backoff: Duration::from_millis(1),
    }
}

fn nov_7() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 11, 7).unwrap()
}

fn project_a(drive: &MemoryDrive) -> RemoteFolder {
    let folder = drive.add_folder("ProjectA");
    drive.put_file(&folder, "README.md", b"# ProjectA");
    folder
}

#[test]
fn edit_then_upload_closes_the_workspace() {
    let base = tempfile::tempdir().unwrap();
    let drive = MemoryDrive::new(2);
    drive.add_folder("Archive");
    let folder = project_a(&drive);
    drive.add_folder("Zeta");

    let listed = FolderLister::new(&drive).collect_all().unwrap();
    assert_eq!(listed.len(), 3);
    assert!(listed.contains(&folder));

    let editor = WritingEditor {
        files: vec![("notes.txt", b"0123456789".to_vec())],
    };
    let provisioner = Provisioner::new(&drive, &editor, base.path());
    let mut slot = SessionSlot::new();
    let session = provisioner.open_session(&mut slot, &folder).unwrap();
    assert_eq!(session.state(), &SessionState::Collecting);
    assert!(session.mirror_path().join("README.md").exists());

    let list = Collector::new(vec![]).collect(session).unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list.items()[0].relative_path, "notes.txt");
    assert_eq!(list.items()[0].size_bytes, 10);

    let (tx, rx) = mpsc::channel();
    let orchestrator = UploadOrchestrator::new(&drive, policy(), "%Y-%m-%d");
    let report = orchestrator
        .upload_on(session, &list.selected(), nov_7(), Some(tx), &CancelToken::new())
        .unwrap();

    assert_eq!(report.outcome, UploadOutcome::Completed);
    assert_eq!(report.uploaded(), ["ProjectA/2024-11-07/notes.txt"]);
    assert_eq!(drive.file(&folder, "2024-11-07/notes.txt").unwrap(), b"0123456789");
    assert!(drive.exists(&folder, "2024-11-07/notes.txt").unwrap());
    assert_eq!(session.state(), &SessionState::Closed);
    assert!(!session.scratch_path().exists());

    let fractions: Vec<f64> = rx
        .try_iter()
        .filter_map(|e| match e {
            ProgressEvent::Progress { transferred, total } => Some(ProgressEvent::fraction(transferred, total)),
            _ => None,
        })
        .collect();
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(fractions.last().copied(), Some(1.0));

    assert!(slot.release_closed());
    assert_eq!(fs::read_dir(base.path()).unwrap().count(), 0);
}

#[test]
fn failing_file_retains_scratch_for_a_later_run() {
    let base = tempfile::tempdir().unwrap();
    let drive = MemoryDrive::new(10);
    let folder = project_a(&drive);
    drive.fail_uploads("broken.py", u32::MAX);

    let editor = WritingEditor {
        files: vec![
            ("ok.py", b"print('ok')".to_vec()),
            ("pkg/broken.py", b"print('broken')".to_vec()),
        ],
    };
    let provisioner = Provisioner::new(&drive, &editor, base.path());
    let mut slot = SessionSlot::new();
    let session = provisioner.open_session(&mut slot, &folder).unwrap();
    let session_id = session.session_id().to_string();

    let list = Collector::new(vec![]).collect(session).unwrap();
    let orchestrator = UploadOrchestrator::new(&drive, policy(), "%Y-%m-%d");
    let report = orchestrator
        .upload_on(session, &list.selected(), nov_7(), None, &CancelToken::new())
        .unwrap();

    assert_eq!(drive.upload_attempts("broken.py"), 3);
    assert!(drive.file(&folder, "2024-11-07/ok.py").is_some());
    assert!(drive.file(&folder, "2024-11-07/pkg/broken.py").is_none());
    assert!(session.scratch_path().join("pkg/broken.py").exists());
    assert!(matches!(session.state(), SessionState::Retained { .. }));

    match report.into_result() {
        Err(Error::PartialFailure { folder, failed }) => {
            assert_eq!(folder, "ProjectA");
            assert_eq!(failed, ["ProjectA/2024-11-07/pkg/broken.py"]);
        }
        other => panic!("expected a partial failure, got {other:?}"),
    }

    // A new run finds the retained workspace and can finish the job.
    drop(slot.take());
    let records = provisioner.retained_sessions(&folder).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].session_id, session_id);
    assert_eq!(records[0].scratch_files, 2);

    drive.fail_uploads("broken.py", 0);
    let mut slot = SessionSlot::new();
    let session = provisioner.resume_session(&mut slot, &records[0]).unwrap();
    let list = Collector::new(vec![]).collect(session).unwrap();
    let report = orchestrator
        .upload_on(session, &list.selected(), nov_7(), None, &CancelToken::new())
        .unwrap();
    assert_eq!(report.outcome, UploadOutcome::Completed);
    assert!(drive.file(&folder, "2024-11-07/pkg/broken.py").is_some());
    assert!(provisioner.retained_sessions(&folder).unwrap().is_empty());
}

#[test]
fn second_session_is_refused_while_one_is_open() {
    let base = tempfile::tempdir().unwrap();
    let drive = MemoryDrive::new(10);
    let folder = project_a(&drive);
    let other = drive.add_folder("ProjectB");
    let editor = WritingEditor { files: vec![] };
    let provisioner = Provisioner::new(&drive, &editor, base.path());
    let mut slot = SessionSlot::new();

    provisioner.open_session(&mut slot, &folder).unwrap();
    assert!(matches!(
        provisioner.open_session(&mut slot, &other),
        Err(Error::SessionBusy { .. })
    ));
    assert_eq!(fs::read_dir(base.path()).unwrap().count(), 1);
}

#[test]
fn offline_drive_fails_listing_with_remote_unavailable() {
    let drive = MemoryDrive::new(10);
    project_a(&drive);
    drive.set_unavailable(true);
    let err = FolderLister::new(&drive).collect_all().unwrap_err();
    assert!(matches!(err, Error::RemoteUnavailable { .. }));
}

#[test]
fn excluded_and_nothing_selected() {
    let base = tempfile::tempdir().unwrap();
    let drive = MemoryDrive::new(10);
    let folder = project_a(&drive);
    let editor = WritingEditor {
        files: vec![("__pycache__/x.pyc", b"junk".to_vec())],
    };
    let provisioner = Provisioner::new(&drive, &editor, base.path());
    let mut slot = SessionSlot::new();
    let session = provisioner.open_session(&mut slot, &folder).unwrap();

    let list = Collector::new(vec!["__pycache__".into()]).collect(session).unwrap();
    assert!(list.is_empty());

    let orchestrator = UploadOrchestrator::new(&drive, policy(), "%Y-%m-%d");
    let err = orchestrator
        .upload_on(session, &list.selected(), nov_7(), None, &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, Error::NothingSelected { .. }));
    assert_eq!(session.state(), &SessionState::Collecting);
    assert!(session.scratch_path().exists());
}
