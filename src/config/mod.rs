//! Configuration management for the compositing core
//!
//! Settings are loaded from a TOML file. Every section is optional and
//! falls back to its defaults, so an empty file is a valid configuration.
//!
//! ```toml
//! [swapchain]
//! mode = "queue"
//! queue_depth = 3
//!
//! [allocator]
//! dmabuf_import = false
//! software_formats = ["argb8888", "xrgb8888"]
//!
//! [workers]
//! render_threads = 2
//! ```

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::buffer::PixelFormat;
use crate::swapchain::{SwapchainMode, MAX_QUEUE_DEPTH};

/// Main configuration struct containing all core settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CoreConfig {
    /// Buffering policy of surface streams
    #[serde(default)]
    pub swapchain: SwapchainConfig,

    /// Buffer import and allocation
    #[serde(default)]
    pub allocator: AllocatorConfig,

    /// Render worker pool
    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Presentation cadence
    #[serde(default)]
    pub presentation: PresentationConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Only the newest submitted buffer is kept
    #[default]
    Mailbox,
    /// Bounded FIFO of `queue_depth` buffers
    Queue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SwapchainConfig {
    pub mode: StreamMode,

    /// Buffers a queue-mode stream holds (2-8); ignored in mailbox mode
    #[serde(default = "SwapchainConfig::default_queue_depth")]
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Bind the client display to the GPU for native pixmap and dmabuf import
    pub hardware_import: bool,

    /// Use the dmabuf import path when the device supports it
    pub dmabuf_import: bool,

    /// Create GPU images on the render workers right after commit
    #[serde(default)]
    pub prewarm_gpu_images: bool,

    /// Free server buffers kept per size and format
    #[serde(default = "AllocatorConfig::default_pool_size")]
    pub pool_size_per_key: usize,

    /// Formats accepted on the software path
    #[serde(default = "AllocatorConfig::default_software_formats")]
    pub software_formats: Vec<PixelFormat>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkersConfig {
    /// Threads available for GPU work (1-16)
    pub render_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresentationConfig {
    /// Target refresh rate in Hz
    pub refresh_hz: u32,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            mode: StreamMode::Mailbox,
            queue_depth: Self::default_queue_depth(),
        }
    }
}

impl SwapchainConfig {
    fn default_queue_depth() -> usize {
        3
    }

    /// The buffering policy new streams are created with
    pub fn mode(&self) -> SwapchainMode {
        match self.mode {
            StreamMode::Mailbox => SwapchainMode::Mailbox,
            StreamMode::Queue => SwapchainMode::Queue {
                depth: self.queue_depth,
            },
        }
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            hardware_import: true,
            dmabuf_import: true,
            prewarm_gpu_images: false,
            pool_size_per_key: Self::default_pool_size(),
            software_formats: Self::default_software_formats(),
        }
    }
}

impl AllocatorConfig {
    fn default_pool_size() -> usize {
        4
    }

    fn default_software_formats() -> Vec<PixelFormat> {
        PixelFormat::ALL.to_vec()
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self { render_threads: 2 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self { refresh_hz: 60 }
    }
}

impl CoreConfig {
    /// Load configuration from a TOML file
    ///
    /// A missing file is not an error; the defaults are used instead.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Expand ~ to home directory
        let expanded_path = if path.to_string_lossy().starts_with('~') {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            Path::new(&home).join(path.strip_prefix("~").unwrap_or(path))
        } else {
            path.to_path_buf()
        };

        if !expanded_path.exists() {
            info!(
                "📄 No config file at {}, using defaults",
                expanded_path.display()
            );
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to load config file: {}", expanded_path.display()))
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: CoreConfig = toml::from_str(contents).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.swapchain.mode == StreamMode::Queue
            && !(2..=MAX_QUEUE_DEPTH).contains(&self.swapchain.queue_depth)
        {
            anyhow::bail!(
                "Invalid queue_depth {}: must be between 2 and {}",
                self.swapchain.queue_depth,
                MAX_QUEUE_DEPTH
            );
        }

        if !(1..=16).contains(&self.workers.render_threads) {
            anyhow::bail!(
                "Invalid render_threads {}: must be between 1 and 16",
                self.workers.render_threads
            );
        }

        if self.allocator.software_formats.is_empty() {
            anyhow::bail!("Invalid software_formats: at least one format is required");
        }

        if self.presentation.refresh_hz == 0 || self.presentation.refresh_hz > 1000 {
            anyhow::bail!("Invalid refresh_hz: must be between 1 and 1000");
        }

        if self.logging.level.trim().is_empty() {
            anyhow::bail!("Invalid logging level: must not be empty");
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
