// Library root
// -----------
// The binary (`main.rs`) wires these modules into the interactive manager.
//
// Module responsibilities:
// - `remote`: the storage seam (`RemoteStorage`) and its backends: a
//   locally mounted Drive folder, an HTTP gateway and an in-memory store.
// - `lister`: paginated, lazy listing of the remote folders.
// - `workspace`: session directories (mirror + scratch), their state
//   machine, the editor handoff and retained-session recovery.
// - `collector`: scans scratch and keeps the user's upload selection.
// - `upload`: concurrent, retried uploads with progress and cancellation.
// - `ui`: terminal flows on top of all of the above.
// - `config`, `logging`, `error`: settings, tracing setup, error types.
pub mod collector;
pub mod config;
pub mod error;
pub mod lister;
pub mod logging;
pub mod remote;
pub mod ui;
pub mod upload;
pub mod workspace;

pub use error::{Error, Result};
