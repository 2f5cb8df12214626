pub mod state;

pub use state::{EngineSettings, SettingsError, SettingsStore};
