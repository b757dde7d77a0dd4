// Workspace sessions: the on-disk mirror + scratch pair for one remote
// folder, and the state machine that decides when scratch may be deleted.
//
// Layout of one session under the workspace base:
//
//   <base>/<session_id>/session.json   manifest
//   <base>/<session_id>/mirror/        read-only snapshot of the folder
//   <base>/<session_id>/scratch/       new work, candidate for upload

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Error, IoResultExt, Result};
use crate::remote::RemoteFolder;

pub mod editor;
pub mod provisioner;
mod tree;

pub use editor::{CommandEditor, Editor, EditorExit};
pub use provisioner::{Provisioner, SessionRecord};

pub(crate) const MANIFEST: &str = "session.json";
pub(crate) const MIRROR_DIR: &str = "mirror";
pub(crate) const SCRATCH_DIR: &str = "scratch";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Provisioning,
    Active,
    Collecting,
    Uploading,
    /// Upload finished with failures; scratch is kept for a retry.
    Retained { failed: Vec<String> },
    Closed,
}

impl SessionState {
    pub fn can_transition_to(&self, to: &SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Provisioning, Active)
                | (Provisioning, Closed)
                | (Active, Collecting)
                | (Active, Closed)
                | (Collecting, Active)
                | (Collecting, Uploading)
                | (Collecting, Closed)
                | (Uploading, Closed)
                | (Uploading, Retained { .. })
                | (Uploading, Collecting)
                | (Retained { .. }, Collecting)
                | (Retained { .. }, Closed)
        )
    }

    /// States in which the scratch directory must exist on disk.
    pub fn has_scratch(&self) -> bool {
        matches!(
            self,
            SessionState::Active
                | SessionState::Collecting
                | SessionState::Uploading
                | SessionState::Retained { .. }
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Provisioning => write!(f, "provisioning"),
            SessionState::Active => write!(f, "active"),
            SessionState::Collecting => write!(f, "collecting"),
            SessionState::Uploading => write!(f, "uploading"),
            SessionState::Retained { failed } => write!(f, "retained ({} failed)", failed.len()),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// What gets written to `session.json`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct Manifest {
    pub session_id: String,
    pub folder: RemoteFolder,
    pub created_at: DateTime<Local>,
    #[serde(flatten)]
    pub state: SessionState,
}

#[derive(Debug)]
pub struct WorkspaceSession {
    session_id: String,
    remote_folder: RemoteFolder,
    root: PathBuf,
    mirror_path: PathBuf,
    scratch_path: PathBuf,
    created_at: DateTime<Local>,
    state: SessionState,
}

impl WorkspaceSession {
    pub(crate) fn new(
        session_id: String,
        remote_folder: RemoteFolder,
        root: PathBuf,
        created_at: DateTime<Local>,
        state: SessionState,
    ) -> Self {
        WorkspaceSession {
            mirror_path: root.join(MIRROR_DIR),
            scratch_path: root.join(SCRATCH_DIR),
            session_id,
            remote_folder,
            root,
            created_at,
            state,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn remote_folder(&self) -> &RemoteFolder {
        &self.remote_folder
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mirror_path(&self) -> &Path {
        &self.mirror_path
    }

    pub fn scratch_path(&self) -> &Path {
        &self.scratch_path
    }

    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Move to `to`, persisting the manifest. Closing goes through
    /// [`WorkspaceSession::close`] so the directories are removed first.
    pub fn transition(&mut self, to: SessionState) -> Result<()> {
        if !self.state.can_transition_to(&to) {
            return Err(Error::InvalidTransition {
                session_id: self.session_id.clone(),
                from: self.state.clone(),
                to,
            });
        }
        if to == SessionState::Closed {
            return self.close();
        }
        debug!(session = %self.session_id, from = %self.state, to = %to, "session transition");
        self.state = to;
        self.write_manifest()
    }

    /// Delete the session directory (scratch and mirror) and mark the
    /// session closed. If deletion fails the state is left unchanged.
    pub(crate) fn close(&mut self) -> Result<()> {
        if !self.state.can_transition_to(&SessionState::Closed) {
            return Err(Error::InvalidTransition {
                session_id: self.session_id.clone(),
                from: self.state.clone(),
                to: SessionState::Closed,
            });
        }
        if self.root.exists() {
            tree::remove_tree(&self.root)?;
        }
        info!(session = %self.session_id, folder = %self.remote_folder.display_name, "session closed, workspace removed");
        self.state = SessionState::Closed;
        Ok(())
    }

    /// The explicit "close without upload" action. Everything still in
    /// scratch is lost, so the caller has to pass the user's confirmation.
    pub fn close_without_upload(&mut self, confirmed: bool) -> Result<()> {
        if !confirmed {
            return Err(Error::CloseNotConfirmed {
                session_id: self.session_id.clone(),
            });
        }
        self.transition(SessionState::Closed)
    }

    pub(crate) fn manifest(&self) -> Manifest {
        Manifest {
            session_id: self.session_id.clone(),
            folder: self.remote_folder.clone(),
            created_at: self.created_at,
            state: self.state.clone(),
        }
    }

    pub(crate) fn write_manifest(&self) -> Result<()> {
        let path = self.root.join(MANIFEST);
        let json = serde_json::to_string_pretty(&self.manifest())
            .map_err(|e| Error::Config(format!("cannot encode session manifest: {e}")))?;
        fs::write(&path, json).at(path)
    }
}

/// The one workspace session a running instance may hold.
#[derive(Debug, Default)]
pub struct SessionSlot {
    current: Option<WorkspaceSession>,
}

impl SessionSlot {
    pub fn new() -> Self {
        SessionSlot::default()
    }

    /// Fails with `SessionBusy` while a session that is not closed occupies
    /// the slot.
    pub fn ensure_free(&self) -> Result<()> {
        match &self.current {
            Some(s) if s.state != SessionState::Closed => Err(Error::SessionBusy {
                session_id: s.session_id.clone(),
            }),
            _ => Ok(()),
        }
    }

    pub(crate) fn occupy(&mut self, session: WorkspaceSession) -> Result<&mut WorkspaceSession> {
        self.ensure_free()?;
        Ok(self.current.insert(session))
    }

    pub fn get(&self) -> Option<&WorkspaceSession> {
        self.current.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut WorkspaceSession> {
        self.current.as_mut()
    }

    /// Hand the session back to the caller and leave the slot empty. A
    /// session that is not closed keeps its directory and shows up again as
    /// a retained session.
    pub fn take(&mut self) -> Option<WorkspaceSession> {
        self.current.take()
    }

    /// Drop a closed session so the slot can be reused. Returns whether the
    /// slot is now empty.
    pub fn release_closed(&mut self) -> bool {
        if matches!(&self.current, Some(s) if s.state == SessionState::Closed) {
            self.current = None;
        }
        self.current.is_none()
    }
}
