// Workspace configuration
//
// Settings mirror what the host application's settings UI persists; the
// loader covers standalone use (tests, headless indexing runs).

pub mod loader;
pub mod settings;

pub use loader::load_settings;
pub use settings::WorkspaceSettings;
