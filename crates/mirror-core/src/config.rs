//! Engine configuration.
//!
//! Provides configurable parameters for scanning, per-tick placement
//! throughput, content restrictions, and data storage. Configuration
//! can be loaded from and saved to a TOML file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Configuration file name.
const CONFIG_FILE: &str = "mirrorspace.toml";

/// Engine configuration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // === Scanning Settings ===
    /// Default radius (in blocks) to scan around an anchor point
    pub default_scan_radius: u32,
    /// Minimum allowed scan radius
    pub min_scan_radius: u32,
    /// Maximum allowed scan radius (for server performance)
    pub max_scan_radius: u32,

    // === Placement Settings ===
    /// Number of simple blocks to place per tick in the target region
    pub blocks_per_tick: usize,
    /// Number of complex blocks to materialize per tick
    pub complex_per_tick: usize,

    // === Content Restrictions ===
    /// Block identifiers that may not be replicated into the target region
    pub banned_blocks: Vec<String>,

    // === Regions ===
    /// Identifier of the target region replicas are built into
    pub target_region: String,

    // === Storage ===
    /// Directory for durable engine state and profile snapshots
    pub data_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            // Scanning
            default_scan_radius: 16,
            min_scan_radius: 1,
            max_scan_radius: 64,

            // Placement
            blocks_per_tick: 100,
            complex_per_tick: 10,

            // Restrictions
            banned_blocks: vec!["ender_chest".to_string()],

            // Regions
            target_region: "mirror:sandbox".to_string(),

            // Storage
            data_dir: PathBuf::from("mirror_data"),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the default file location.
    /// Returns default config if the file doesn't exist.
    pub fn load() -> Self {
        Self::load_from(Self::config_path())
    }

    /// Load configuration from a specific path.
    /// Returns default config if the file doesn't exist or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();

        if !path.exists() {
            info!("Config file not found, using defaults");
            return Self::default();
        }

        match fs::File::open(path) {
            Ok(mut file) => {
                let mut contents = String::new();
                if let Err(e) = file.read_to_string(&mut contents) {
                    warn!("Failed to read config file: {e}");
                    return Self::default();
                }

                match toml::from_str::<Self>(&contents) {
                    Ok(config) => {
                        if config.validate() {
                            info!("Loaded config from {}", path.display());
                            config
                        } else {
                            warn!("Config file has out-of-range values, using defaults");
                            Self::default()
                        }
                    },
                    Err(e) => {
                        warn!("Failed to parse config file: {e}");
                        Self::default()
                    },
                }
            },
            Err(e) => {
                warn!("Failed to open config file: {e}");
                Self::default()
            },
        }
    }

    /// Save configuration to a specific path.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut file = fs::File::create(path)?;
        file.write_all(contents.as_bytes())?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Returns the default config file path.
    #[must_use]
    pub fn config_path() -> PathBuf {
        PathBuf::from(CONFIG_FILE)
    }

    /// Validates configured ranges.
    #[must_use]
    pub fn validate(&self) -> bool {
        self.min_scan_radius >= 1
            && self.min_scan_radius <= self.max_scan_radius
            && (self.min_scan_radius..=self.max_scan_radius).contains(&self.default_scan_radius)
            && self.blocks_per_tick >= 1
            && self.complex_per_tick >= 1
            && !self.target_region.is_empty()
    }

    /// Clamps a requested scan radius into the configured bounds.
    #[must_use]
    pub fn clamp_radius(&self, radius: u32) -> u32 {
        radius.clamp(self.min_scan_radius, self.max_scan_radius)
    }
}
