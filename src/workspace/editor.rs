// External editor. The contract is small: accept some paths, run until the
// user closes it. Anything richer (window titles, IPC) stays out of here.

use std::path::PathBuf;
use std::process::Command;
use tracing::{info, warn};

use crate::config::EditorSettings;
use crate::error::{Error, Result};

/// How the editor process ended. `code` is `None` when it was killed by a
/// signal or its status could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditorExit {
    pub code: Option<i32>,
}

impl EditorExit {
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

pub trait Editor {
    fn program(&self) -> &str;

    /// Open `targets` and block until the editor exits. Only a failure to
    /// start the editor is an error; however it ends, the session moves on.
    fn open_and_wait(&self, targets: &[PathBuf]) -> Result<EditorExit>;
}

/// Runs a configured program as a child process and waits on it.
#[derive(Debug, Clone)]
pub struct CommandEditor {
    program: String,
    args: Vec<String>,
}

impl CommandEditor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        CommandEditor {
            program: program.into(),
            args,
        }
    }

    pub fn from_settings(settings: &EditorSettings) -> Self {
        CommandEditor::new(settings.program.clone(), settings.args.clone())
    }
}

impl Editor for CommandEditor {
    fn program(&self) -> &str {
        &self.program
    }

    fn open_and_wait(&self, targets: &[PathBuf]) -> Result<EditorExit> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .args(targets)
            .spawn()
            .map_err(|source| Error::EditorLaunch {
                program: self.program.clone(),
                source,
            })?;
        info!(program = %self.program, pid = child.id(), "editor started, waiting for it to close");

        match child.wait() {
            Ok(status) => {
                if !status.success() {
                    warn!(program = %self.program, %status, "editor exited abnormally");
                }
                Ok(EditorExit {
                    code: status.code(),
                })
            }
            Err(e) => {
                warn!(program = %self.program, error = %e, "lost track of editor process");
                Ok(EditorExit { code: None })
            }
        }
    }
}
