// Configuration loader
// Loads settings from ~/.vaultmind/config.toml with environment fallbacks.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use super::settings::WorkspaceSettings;

/// Load settings from the user config file, falling back to environment
/// variables for API keys that the file leaves empty.
pub fn load_settings() -> Result<WorkspaceSettings> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    let config_path = home.join(".vaultmind/config.toml");
    load_settings_from(&config_path)
}

/// Load settings from an explicit path (missing file means defaults).
pub fn load_settings_from(path: &Path) -> Result<WorkspaceSettings> {
    let mut settings = if path.exists() {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Invalid TOML in config file: {}", path.display()))?
    } else {
        WorkspaceSettings::default()
    };

    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn apply_env_overrides(settings: &mut WorkspaceSettings) {
    let overrides: [(&str, &mut String); 5] = [
        ("OPENAI_API_KEY", &mut settings.openai_api_key),
        ("ANTHROPIC_API_KEY", &mut settings.anthropic_api_key),
        ("GEMINI_API_KEY", &mut settings.gemini_api_key),
        ("XAI_API_KEY", &mut settings.grok_api_key),
        ("OPENROUTER_API_KEY", &mut settings.openrouter_api_key),
    ];
    for (var, slot) in overrides {
        if slot.is_empty() {
            if let Ok(value) = std::env::var(var) {
                if !value.is_empty() {
                    *slot = value;
                }
            }
        }
    }
}
