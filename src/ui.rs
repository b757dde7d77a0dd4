// UI layer: interactive flows built with `dialoguer` prompts and `indicatif`
// progress. Everything here is synchronous; the only extra thread is the
// upload itself, so the terminal can keep drawing progress and watching for
// a cancel key.

use anyhow::{anyhow, Result};
use chrono::{Local, NaiveDate};
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal;
use dialoguer::{Confirm, MultiSelect, Select};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::collector::{CandidateFile, CandidateList, Collector};
use crate::config::Settings;
use crate::lister::FolderLister;
use crate::remote::{RemoteFolder, RemoteStorage};
use crate::upload::{CancelToken, ProgressEvent, UploadOrchestrator, UploadOutcome, UploadPolicy};
use crate::workspace::{Editor, Provisioner, SessionRecord, SessionSlot, SessionState, WorkspaceSession};

/// Everything the menus need: settings, the storage backend, the editor and
/// the slot holding the one open session.
pub struct App<'a> {
    settings: &'a Settings,
    storage: &'a dyn RemoteStorage,
    editor: &'a dyn Editor,
    slot: SessionSlot,
}

impl<'a> App<'a> {
    pub fn new(settings: &'a Settings, storage: &'a dyn RemoteStorage, editor: &'a dyn Editor) -> Self {
        App {
            settings,
            storage,
            editor,
            slot: SessionSlot::new(),
        }
    }
}

/// Main interactive menu. Runs until the user chooses "Exit".
pub fn main_menu(mut app: App) -> Result<()> {
    println!("Remote storage: {}", app.storage.location());
    loop {
        let items = ["Open a remote folder", "Exit"];
        let selection = Select::new().items(&items).default(0).interact()?;
        match selection {
            0 => app.open_folder()?,
            _ => break,
        }
    }
    Ok(())
}

impl App<'_> {
    fn open_folder(&mut self) -> Result<()> {
        self.slot.release_closed();
        let Some(folder) = self.pick_folder()? else {
            return Ok(());
        };

        let provisioner = Provisioner::from_settings(self.storage, self.editor, self.settings);
        let opened = match restore_prompt(&provisioner, &folder)? {
            Some(record) => provisioner.resume_session(&mut self.slot, &record),
            None => {
                println!(
                    "Mirroring '{}' and opening {}. Close the editor window when you are done.",
                    folder.display_name,
                    self.editor.program()
                );
                provisioner.open_session(&mut self.slot, &folder)
            }
        };
        let session = match opened {
            Ok(session) => session,
            Err(e) => {
                println!("Could not open '{}': {}", folder.display_name, e);
                return Ok(());
            }
        };

        review(self.settings, self.storage, &provisioner, session)?;

        if let Some(session) = self.slot.take() {
            if session.state() != &SessionState::Closed {
                println!(
                    "Scratch for '{}' kept at {}. Open the folder again to restore it.",
                    folder.display_name,
                    session.scratch_path().display()
                );
            }
        }
        Ok(())
    }

    /// Spinner while the listing loads, then a folder picker. `None` when
    /// there is nothing to pick or the user backed out.
    fn pick_folder(&self) -> Result<Option<RemoteFolder>> {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(ProgressStyle::with_template("{spinner} {msg}")?);
        spinner.set_message("Fetching folders...");
        spinner.enable_steady_tick(Duration::from_millis(100));
        let listed = FolderLister::new(self.storage).collect_all();
        spinner.finish_and_clear();

        let folders = match listed {
            Ok(folders) => folders,
            Err(e) => {
                println!("Could not list folders: {}", e);
                return Ok(None);
            }
        };
        if folders.is_empty() {
            println!("No folders found under {}", self.storage.location());
            return Ok(None);
        }
        let names: Vec<&str> = folders.iter().map(|f| f.display_name.as_str()).collect();
        let choice = Select::new()
            .with_prompt("Folder (Esc to go back)")
            .items(&names)
            .default(0)
            .interact_opt()?;
        Ok(choice.map(|i| folders[i].clone()))
    }
}

/// If earlier work for `folder` survived, offer to pick it up. Returns the
/// session to resume, or `None` to start fresh.
fn restore_prompt(provisioner: &Provisioner, folder: &RemoteFolder) -> Result<Option<SessionRecord>> {
    let records = match provisioner.retained_sessions(folder) {
        Ok(records) => records,
        Err(e) => {
            println!("Could not look for earlier workspaces of '{}': {}", folder.display_name, e);
            return Ok(None);
        }
    };
    let Some(newest) = records.into_iter().next() else {
        return Ok(None);
    };
    println!(
        "A previous workspace for '{}' from {} still has {} file(s) in scratch ({}).",
        folder.display_name,
        newest.created_at.format("%Y-%m-%d %H:%M"),
        newest.scratch_files,
        newest.state
    );
    let items = ["Restore it", "Discard it and start fresh", "Keep it and start fresh"];
    match Select::new().items(&items).default(0).interact()? {
        0 => Ok(Some(newest)),
        1 => {
            let confirmed = Confirm::new()
                .with_prompt(format!("Delete {} unuploaded file(s) for good?", newest.scratch_files))
                .default(false)
                .interact()?;
            if let Err(e) = provisioner.discard_session(&newest, confirmed) {
                println!("Kept the previous workspace: {}", e);
            }
            Ok(None)
        }
        _ => Ok(None),
    }
}

/// The collect/review loop. Returns when the session is closed or the user
/// leaves it for later.
fn review(
    settings: &Settings,
    storage: &dyn RemoteStorage,
    provisioner: &Provisioner,
    session: &mut WorkspaceSession,
) -> Result<()> {
    let collector = Collector::new(settings.workspace.exclude.clone());
    let orchestrator = UploadOrchestrator::new(
        storage,
        UploadPolicy::from(&settings.upload),
        settings.workspace.date_format.clone(),
    );
    let mut list = CandidateList::default();
    rescan(&collector, session, &mut list);

    loop {
        print_candidates(session, &list);
        let items = [
            "Choose files",
            "Upload selected",
            "Reopen editor",
            "Rescan scratch",
            "Close without uploading",
            "Leave for later",
        ];
        match Select::new().items(&items).default(1).interact()? {
            0 => choose_files(&mut list)?,
            1 => {
                upload(&orchestrator, session, &list)?;
                if session.state() == &SessionState::Closed {
                    return Ok(());
                }
                rescan(&collector, session, &mut list);
            }
            2 => {
                if let Err(e) = provisioner.relaunch_editor(session) {
                    println!(
                        "Could not reopen the editor for '{}': {}. Scratch is untouched.",
                        session.remote_folder().display_name,
                        e
                    );
                }
                rescan(&collector, session, &mut list);
            }
            3 => {
                rescan(&collector, session, &mut list);
            }
            4 => {
                let confirmed = Confirm::new()
                    .with_prompt(format!(
                        "Delete the workspace for '{}' and {} file(s) in scratch?",
                        session.remote_folder().display_name,
                        list.len()
                    ))
                    .default(false)
                    .interact()?;
                if confirmed {
                    match session.close_without_upload(true) {
                        Ok(()) => {
                            println!("Workspace removed, nothing uploaded.");
                            return Ok(());
                        }
                        Err(e) => println!(
                            "Could not remove the workspace for '{}': {}",
                            session.remote_folder().display_name,
                            e
                        ),
                    }
                }
            }
            _ => return Ok(()),
        }
    }
}

/// Refresh `list` from scratch. On failure the previous list is kept and the
/// error is reported with the folder name.
fn rescan(collector: &Collector, session: &WorkspaceSession, list: &mut CandidateList) -> bool {
    match collector.collect(session) {
        Ok(fresh) => {
            *list = fresh;
            true
        }
        Err(e) => {
            println!("Could not scan scratch for '{}': {}", session.remote_folder().display_name, e);
            false
        }
    }
}

/// Targets that would be overwritten, or `None` if the check itself failed.
fn existing_targets(
    orchestrator: &UploadOrchestrator,
    session: &WorkspaceSession,
    selected: &[CandidateFile],
    today: NaiveDate,
) -> Option<Vec<String>> {
    match orchestrator.conflicts(session, selected, today) {
        Ok(existing) => Some(existing),
        Err(e) => {
            println!(
                "Could not check for existing files in '{}': {}. Nothing was uploaded.",
                session.remote_folder().display_name,
                e
            );
            None
        }
    }
}

fn print_candidates(session: &WorkspaceSession, list: &CandidateList) {
    println!();
    if list.is_empty() {
        println!("No new files in scratch for '{}'.", session.remote_folder().display_name);
        return;
    }
    println!("New files for '{}':", session.remote_folder().display_name);
    for item in list.items() {
        let mark = if item.selected { "x" } else { " " };
        println!("  [{}] {} ({})", mark, item.relative_path, HumanBytes(item.size_bytes));
    }
    println!(
        "{} of {} selected, {}",
        list.selected().len(),
        list.len(),
        HumanBytes(list.selected_bytes())
    );
}

fn choose_files(list: &mut CandidateList) -> Result<()> {
    if list.is_empty() {
        return Ok(());
    }
    let labels: Vec<String> = list
        .items()
        .iter()
        .map(|c| format!("{} ({})", c.relative_path, HumanBytes(c.size_bytes)))
        .collect();
    let defaults: Vec<bool> = list.items().iter().map(|c| c.selected).collect();
    // Space toggles, Enter confirms, Esc keeps the previous selection.
    if let Some(chosen) = MultiSelect::new()
        .with_prompt("Files to upload")
        .items(&labels)
        .defaults(&defaults)
        .interact_opt()?
    {
        list.select_only(&chosen);
    }
    Ok(())
}

fn upload(orchestrator: &UploadOrchestrator, session: &mut WorkspaceSession, list: &CandidateList) -> Result<()> {
    let selected = list.selected();
    if selected.is_empty() {
        println!("Nothing selected for '{}'.", session.remote_folder().display_name);
        return Ok(());
    }
    let today = Local::now().date_naive();
    let Some(existing) = existing_targets(orchestrator, session, &selected, today) else {
        return Ok(());
    };
    if !existing.is_empty() {
        for path in &existing {
            println!("  already exists: {}", path);
        }
        let overwrite = Confirm::new()
            .with_prompt(format!("Overwrite {} existing file(s)?", existing.len()))
            .default(false)
            .interact()?;
        if !overwrite {
            return Ok(());
        }
    }

    let bar = ProgressBar::new(list.selected_bytes().max(1));
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {percent:>3}% {bytes}/{total_bytes} {msg}")?
            .progress_chars("=> "),
    );
    println!("Uploading... press Esc or q to cancel.");

    let (tx, rx) = mpsc::channel();
    let cancel = CancelToken::new();
    let joined = thread::scope(|s| {
        let handle = s.spawn(|| orchestrator.upload_on(session, &selected, today, Some(tx), &cancel));
        watch_progress(&rx, &cancel, &bar);
        handle.join()
    });
    bar.finish_and_clear();
    let report = match joined.map_err(|_| anyhow!("upload thread panicked"))? {
        Ok(report) => report,
        Err(e) => {
            println!("Upload to '{}' failed: {}", session.remote_folder().display_name, e);
            if e.keeps_scratch() {
                println!("Scratch kept at {}.", session.scratch_path().display());
            }
            return Ok(());
        }
    };

    match &report.outcome {
        UploadOutcome::Completed => {
            println!("Uploaded {} file(s) to '{}':", report.tasks.len(), report.folder);
            for path in report.uploaded() {
                println!("  {}", path);
            }
            println!("Workspace removed.");
        }
        UploadOutcome::PartialFailure { failed } => {
            println!("Uploaded {} of {} file(s).", report.uploaded().len(), report.tasks.len());
            for task in report.tasks.iter().filter(|t| failed.contains(&t.remote_target_path)) {
                println!(
                    "  FAILED {}: {}",
                    task.remote_target_path,
                    task.last_error.as_deref().unwrap_or("unknown error")
                );
            }
            println!(
                "Scratch kept at {}. Upload again to retry.",
                session.scratch_path().display()
            );
        }
        UploadOutcome::Cancelled { uploaded, not_uploaded } => {
            println!(
                "Upload cancelled. {} file(s) already in '{}' stay there, {} not uploaded; scratch is untouched.",
                uploaded.len(),
                report.folder,
                not_uploaded.len()
            );
        }
    }
    Ok(())
}

/// Draw progress until the upload thread drops its sender. Esc or `q`
/// cancels; the remaining events are still drained.
fn watch_progress(rx: &Receiver<ProgressEvent>, cancel: &CancelToken, bar: &ProgressBar) {
    let _raw = RawMode::enable();
    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(ProgressEvent::Progress { transferred, total }) => {
                bar.set_length(total.max(1));
                bar.set_position(transferred);
            }
            Ok(ProgressEvent::FileStarted { path, attempt }) => {
                if attempt > 1 {
                    bar.set_message(format!("{} (attempt {})", path, attempt));
                } else {
                    bar.set_message(path);
                }
            }
            Ok(ProgressEvent::FileFailed { path, will_retry: true, .. }) => {
                bar.set_message(format!("{} failed, retrying", path));
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if !cancel.is_cancelled() && cancel_key_pressed() {
            cancel.cancel();
            bar.set_message("cancelling...");
        }
    }
}

fn cancel_key_pressed() -> bool {
    while let Ok(true) = event::poll(Duration::ZERO) {
        if let Ok(Event::Key(key)) = event::read() {
            if key.kind == KeyEventKind::Press && matches!(key.code, KeyCode::Esc | KeyCode::Char('q')) {
                return true;
            }
        }
    }
    false
}

/// Raw mode for the duration of an upload so single key presses arrive.
struct RawMode(bool);

impl RawMode {
    fn enable() -> Self {
        RawMode(terminal::enable_raw_mode().is_ok())
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if self.0 {
            let _ = terminal::disable_raw_mode();
        }
    }
}
