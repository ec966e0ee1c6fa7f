//! Configuration management for ninepresent
//!
//! Settings are read from a TOML file. Every section is optional and falls
//! back to its defaults, so an empty file is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PresentConfig {
    #[serde(default)]
    pub general: GeneralSection,

    /// Presentation pacing and buffer release
    #[serde(default)]
    pub present: PresentSection,

    /// Display mode and fullscreen window handling
    #[serde(default)]
    pub fullscreen: FullscreenSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct GeneralSection {
    /// Enable debug logging
    pub debug: bool,
}

/// Override of the application's presentation interval
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VblankMode {
    /// Never wait for vblank
    Never,
    /// Honour whatever the application asks for
    #[default]
    Default,
    /// Always wait for at least one vblank
    Always,
}

impl VblankMode {
    /// Apply the override to an application-requested interval.
    pub fn apply(self, interval: u32) -> u32 {
        match self {
            Self::Never => 0,
            Self::Default => interval,
            Self::Always => interval.max(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PresentSection {
    pub vblank_mode: VblankMode,

    /// Frames past the last target at which the drain sentinel fires (3-5)
    pub drain_margin: u64,

    /// Size of the copy re-present used to reclaim flipped buffers
    pub release_sliver_width: u16,
    pub release_sliver_height: u16,

    /// Highest enabled API extension level (minor version, 0-2)
    pub api_minor: u32,
}

impl Default for PresentSection {
    fn default() -> Self {
        Self {
            vblank_mode: VblankMode::Default,
            drain_margin: 5,
            release_sliver_width: 8,
            release_sliver_height: 1,
            api_minor: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FullscreenSection {
    /// Refresh rates above this are treated as "driver default"
    pub max_refresh_rate: u32,

    /// Minimize the fullscreen window when it loses focus
    pub minimize_on_focus_loss: bool,
}

impl Default for FullscreenSection {
    fn default() -> Self {
        Self {
            max_refresh_rate: 1000,
            minimize_on_focus_loss: true,
        }
    }
}

impl PresentConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Expand ~ to home directory
        let expanded_path = if path.to_string_lossy().starts_with('~') {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            Path::new(&home).join(path.strip_prefix("~").unwrap_or(path))
        } else {
            path.to_path_buf()
        };

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: PresentConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(3..=5).contains(&self.present.drain_margin) {
            anyhow::bail!(
                "Invalid drain_margin {}: must be between 3 and 5",
                self.present.drain_margin
            );
        }

        if self.present.release_sliver_width == 0 || self.present.release_sliver_height == 0 {
            anyhow::bail!("Invalid release sliver: width and height must be non-zero");
        }

        if self.present.api_minor > 2 {
            anyhow::bail!("Invalid api_minor {}: highest level is 2", self.present.api_minor);
        }

        if self.fullscreen.max_refresh_rate == 0 {
            anyhow::bail!("Invalid max_refresh_rate: must be non-zero");
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }
}
