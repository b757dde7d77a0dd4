// Entrypoint for the workspace manager.
// - Keeps `main` small: load settings, build the storage backend and the
//   editor, then hand them to the UI loop.
// - Returns `anyhow::Result` so startup failures print with their context.

use anyhow::Context;
use swimmy_manager::config::{BackendKind, Settings};
use swimmy_manager::remote::{HttpDrive, MountedDrive, RemoteStorage};
use swimmy_manager::ui::{main_menu, App};
use swimmy_manager::workspace::CommandEditor;
use swimmy_manager::logging;

fn main() -> anyhow::Result<()> {
    logging::init_subscriber();

    let settings = Settings::load().context("Failed to load settings")?;
    let storage: Box<dyn RemoteStorage> = match settings.backend.kind {
        BackendKind::Mounted => Box::new(MountedDrive::new(
            settings.backend.drive_root.clone(),
            settings.backend.page_size,
        )),
        BackendKind::Http => Box::new(HttpDrive::from_settings(&settings.backend)?),
    };
    let editor = CommandEditor::from_settings(&settings.editor);

    // Blocks until the user exits.
    main_menu(App::new(&settings, storage.as_ref(), &editor))?;
    Ok(())
}
