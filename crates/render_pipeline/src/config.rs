//! # Pipeline Configuration
//!
//! Serializable settings for the render pipeline, loaded from TOML or RON
//! through the [`Config`] trait. The file extension selects the format.
//!
//! ```toml
//! application_name = "Frame Runner"
//! frames_in_flight = 3
//! fence_timeout_ms = 1000
//! sample_count = 4
//!
//! [extent]
//! width = 1280
//! height = 720
//!
//! [memory]
//! block_size = 16777216
//! max_blocks = 8
//! transient_bytes_per_frame = 1048576
//! ```

use ash::vk;
pub use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::subpass::DebugOverlay;

/// On-disk formats, chosen by file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// `.toml`
    Toml,
    /// `.ron`
    Ron,
}

impl ConfigFormat {
    /// Format for `path`, ignoring extension case
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let extension = path.extension().and_then(|extension| extension.to_str()).unwrap_or_default();
        if extension.eq_ignore_ascii_case("toml") {
            Ok(Self::Toml)
        } else if extension.eq_ignore_ascii_case("ron") {
            Ok(Self::Ron)
        } else {
            Err(ConfigError::UnsupportedFormat(path.to_path_buf()))
        }
    }
}

/// Settings read from and written to disk
///
/// Loading parses, then validates; a file that parses but holds
/// out-of-range values is rejected the same way as a malformed one. Saving
/// refuses to write an invalid configuration.
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Reject out-of-range values; accepts everything by default
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Parse and validate `contents`
    fn from_str_as(contents: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let config: Self = match format {
            ConfigFormat::Toml => toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?,
            ConfigFormat::Ron => ron::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML or RON file
    fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_str_as(&contents, format).map_err(|e| e.at(path))?;
        log::debug!("Loaded {:?} configuration from {}", format, path.display());
        Ok(config)
    }

    /// Validate, then write as TOML or RON
    fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;
        self.validate()?;

        let contents = match format {
            ConfigFormat::Toml => toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?,
            ConfigFormat::Ron => ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?,
        };
        std::fs::write(path, contents).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The file could not be read or written
    #[error("Cannot access {}: {source}", path.display())]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The contents are not valid TOML or RON for the settings type
    #[error("Parse error: {0}")]
    Parse(String),

    /// The settings could not be serialized
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// The extension is neither `.toml` nor `.ron`
    #[error("Unsupported configuration format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    /// A value is outside its accepted range
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// Parse or validation failure in a file
    #[error("{}: {source}", path.display())]
    InFile {
        /// File that was loaded
        path: PathBuf,
        /// What was wrong with it
        #[source]
        source: Box<ConfigError>,
    },
}

impl ConfigError {
    /// Attach the file the error came from
    #[must_use]
    pub fn at(self, path: &Path) -> Self {
        Self::InFile {
            path: path.to_path_buf(),
            source: Box::new(self),
        }
    }

    /// The error without file context
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::InFile { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Width and height in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Extent {
    /// Create an extent
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Convert to the Vulkan extent type
    #[must_use]
    pub const fn to_vk(self) -> vk::Extent2D {
        vk::Extent2D { width: self.width, height: self.height }
    }

    /// Whether either side is zero
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Color formats accepted for the composited image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorFormat {
    /// `B8G8R8A8_SRGB`
    Bgra8Srgb,
    /// `B8G8R8A8_UNORM`
    Bgra8Unorm,
    /// `R8G8B8A8_UNORM`
    Rgba8Unorm,
    /// `R16G16B16A16_SFLOAT`
    Rgba16Float,
}

impl ColorFormat {
    /// Vulkan format
    #[must_use]
    pub const fn to_vk(self) -> vk::Format {
        match self {
            Self::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
            Self::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
            Self::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            Self::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        }
    }
}

/// Depth formats accepted for depth attachments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepthFormat {
    /// `D32_SFLOAT`
    D32Float,
    /// `D24_UNORM_S8_UINT`
    D24UnormS8,
    /// `D32_SFLOAT_S8_UINT`
    D32FloatS8,
}

impl DepthFormat {
    /// Vulkan format
    #[must_use]
    pub const fn to_vk(self) -> vk::Format {
        match self {
            Self::D32Float => vk::Format::D32_SFLOAT,
            Self::D24UnormS8 => vk::Format::D24_UNORM_S8_UINT,
            Self::D32FloatS8 => vk::Format::D32_SFLOAT_S8_UINT,
        }
    }
}

/// Debug overlay options
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Draw scene meshes as wireframe
    pub wireframe: bool,
    /// Draw the scene's debug lines
    pub lines: bool,
    /// Wireframe color (RGBA)
    pub wireframe_color: [f32; 4],
}

impl DebugConfig {
    /// Overlay flags for the debug subpass
    #[must_use]
    pub fn overlay(&self) -> DebugOverlay {
        let mut overlay = DebugOverlay::empty();
        overlay.set(DebugOverlay::WIREFRAME, self.wireframe);
        overlay.set(DebugOverlay::LINES, self.lines);
        overlay
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            wireframe: false,
            lines: true,
            wireframe_color: [0.0, 1.0, 0.0, 1.0],
        }
    }
}

/// Memory pool sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Size of each device memory block requested when a pool grows
    pub block_size: u64,
    /// Maximum number of blocks per memory location
    pub max_blocks: usize,
    /// Capacity of each frame slot's transient arena
    pub transient_bytes_per_frame: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            block_size: 16 * 1024 * 1024,
            max_blocks: 8,
            transient_bytes_per_frame: 1024 * 1024,
        }
    }
}

/// # Render Pipeline Configuration
///
/// Everything the pipeline needs before the first frame: frame pacing,
/// target formats, multisampling, optional subpasses and memory pools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Application name, used for logging and instance creation
    pub application_name: String,
    /// Frames that may be in flight at once (1..=3)
    pub frames_in_flight: usize,
    /// Upper bound on a frame fence wait before the device is declared lost
    pub fence_timeout_ms: u64,
    /// Initial swapchain extent
    pub extent: Extent,
    /// Format of the composited color image
    pub color_format: ColorFormat,
    /// Format of depth attachments
    pub depth_format: DepthFormat,
    /// Samples per pixel for the lighting pass (1, 2, 4 or 8)
    pub sample_count: u32,
    /// Fixed offscreen G-buffer extent; follows the swapchain when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offscreen_extent: Option<Extent>,
    /// Append the debug overlay subpass
    pub enable_debug: bool,
    /// Append the UI subpass
    pub enable_ui: bool,
    /// Debug overlay options
    pub debug: DebugConfig,
    /// Memory pool sizing
    pub memory: MemoryConfig,
}

impl PipelineConfig {
    /// Create a configuration with defaults and the given application name
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            frames_in_flight: 2,
            fence_timeout_ms: 1000,
            extent: Extent::new(1280, 720),
            color_format: ColorFormat::Bgra8Srgb,
            depth_format: DepthFormat::D32Float,
            sample_count: 1,
            offscreen_extent: None,
            enable_debug: true,
            enable_ui: true,
            debug: DebugConfig::default(),
            memory: MemoryConfig::default(),
        }
    }

    /// Set frames in flight
    #[must_use]
    pub const fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Set the fence wait timeout in milliseconds
    #[must_use]
    pub const fn with_fence_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.fence_timeout_ms = timeout_ms;
        self
    }

    /// Set the initial extent
    #[must_use]
    pub const fn with_extent(mut self, width: u32, height: u32) -> Self {
        self.extent = Extent::new(width, height);
        self
    }

    /// Set the lighting pass sample count
    #[must_use]
    pub const fn with_sample_count(mut self, samples: u32) -> Self {
        self.sample_count = samples;
        self
    }

    /// Render the G-buffer at a fixed size instead of following the swapchain
    #[must_use]
    pub const fn with_offscreen_extent(mut self, width: u32, height: u32) -> Self {
        self.offscreen_extent = Some(Extent::new(width, height));
        self
    }

    /// Enable or disable the debug overlay subpass
    #[must_use]
    pub const fn with_debug(mut self, enabled: bool) -> Self {
        self.enable_debug = enabled;
        self
    }

    /// Enable or disable the UI subpass
    #[must_use]
    pub const fn with_ui(mut self, enabled: bool) -> Self {
        self.enable_ui = enabled;
        self
    }

    /// Set memory pool sizing
    #[must_use]
    pub const fn with_memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    /// Fence wait timeout
    #[must_use]
    pub const fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new("Render Pipeline")
    }
}

impl Config for PipelineConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.application_name.is_empty() {
            return Err(ConfigError::Invalid("application name cannot be empty".to_string()));
        }

        if !(1..=3).contains(&self.frames_in_flight) {
            return Err(ConfigError::Invalid(format!(
                "frames in flight must be between 1 and 3, got {}",
                self.frames_in_flight
            )));
        }

        if self.fence_timeout_ms == 0 {
            return Err(ConfigError::Invalid("fence timeout must be non-zero".to_string()));
        }

        if self.extent.is_zero() {
            return Err(ConfigError::Invalid("initial extent must be non-zero".to_string()));
        }

        if !matches!(self.sample_count, 1 | 2 | 4 | 8) {
            return Err(ConfigError::Invalid(format!(
                "sample count must be 1, 2, 4 or 8, got {}",
                self.sample_count
            )));
        }

        if self.offscreen_extent.is_some_and(Extent::is_zero) {
            return Err(ConfigError::Invalid("offscreen extent must be non-zero".to_string()));
        }

        if self.memory.block_size == 0 || self.memory.max_blocks == 0 {
            return Err(ConfigError::Invalid("memory pools need a non-zero block size and count".to_string()));
        }

        if self.memory.transient_bytes_per_frame == 0 {
            return Err(ConfigError::Invalid("transient arena must be non-zero".to_string()));
        }

        Ok(())
    }
}
