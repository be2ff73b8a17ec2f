//! Error types shared by every layer of the pipeline

use ash::vk;
use thiserror::Error;

use crate::config::ConfigError;
use crate::device::MemoryLocation;

/// Misuse of the buffer map/write/flush/unmap state machine
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingError {
    /// `map` called on a buffer that is already mapped
    #[error("Buffer is already mapped")]
    AlreadyMapped,

    /// `write`, `flush` or `unmap` called on an unmapped buffer
    #[error("Buffer is not mapped")]
    NotMapped,

    /// Device-local memory cannot be mapped by the host
    #[error("Buffer memory is not host visible")]
    NotHostVisible,

    /// Write or flush range exceeds the buffer
    #[error("Range {offset}..{} exceeds buffer size {size}", .offset + .len)]
    OutOfRange {
        /// Offset of the rejected range
        offset: u64,
        /// Length of the rejected range
        len: u64,
        /// Size of the buffer
        size: u64,
    },

    /// The device refused to map the memory
    #[error("Device failed to map memory")]
    MapFailed,
}

/// Rendering errors
#[derive(Error, Debug)]
pub enum RenderError {
    /// Allocator exhausted after reuse and growth
    #[error("Out of memory: {requested} bytes (alignment {alignment})")]
    OutOfMemory {
        /// Requested size in bytes
        requested: u64,
        /// Requested alignment in bytes
        alignment: u64,
    },

    /// A buffer cannot live in the memory type its pool allocates from
    #[error("{location:?} memory type {memory_type} is not allowed by buffer memory type bits {type_bits:#b}")]
    IncompatibleMemory {
        /// Pool the buffer was meant for
        location: MemoryLocation,
        /// Memory type index of that pool
        memory_type: u32,
        /// Types the buffer accepts
        type_bits: u32,
    },

    /// More lights than the lighting uniform holds
    #[error("{count} {kind} lights exceed the limit of {max}")]
    TooManyLights {
        /// Light kind
        kind: &'static str,
        /// Lights supplied
        count: usize,
        /// Capacity
        max: usize,
    },

    /// Buffer mapping misuse
    #[error("Mapping error: {0}")]
    Mapping(#[from] MappingError),

    /// A subpass reads an attachment its predecessor does not produce
    #[error("Subpass '{subpass}' requires attachment '{attachment}' which is not produced by its predecessor")]
    Dependency {
        /// Name of the subpass that failed to build
        subpass: String,
        /// Name of the missing attachment
        attachment: String,
    },

    /// Fence timeout or lost device
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// Swapchain no longer matches the surface; call `resize`
    #[error("Swapchain out of date")]
    SwapchainOutOfDate,

    /// State machine misuse
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Any other device result
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Configuration load or validation failure
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl RenderError {
    /// Whether the pipeline cannot continue after this error
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceLost(_) | Self::Dependency { .. } | Self::Config(_))
    }

    /// Convert a device result, attaching the request size to memory exhaustion
    #[must_use]
    pub fn from_allocation(result: vk::Result, requested: u64, alignment: u64) -> Self {
        match Self::from(result) {
            Self::OutOfMemory { .. } => Self::OutOfMemory { requested, alignment },
            other => other,
        }
    }

    pub(crate) fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState(reason.into())
    }
}

impl From<vk::Result> for RenderError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::TIMEOUT => Self::DeviceLost("fence wait timed out".to_string()),
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost("device reported loss".to_string()),
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                Self::OutOfMemory { requested: 0, alignment: 0 }
            }
            vk::Result::ERROR_MEMORY_MAP_FAILED => Self::Mapping(MappingError::MapFailed),
            vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR => {
                Self::SwapchainOutOfDate
            }
            other => Self::Api(other),
        }
    }
}

/// Result alias for pipeline operations
pub type RenderResult<T> = Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    /// Device results map onto the pipeline's recovery classes
    #[test]
    fn test_vk_result_conversion() {
        assert!(matches!(RenderError::from(vk::Result::TIMEOUT), RenderError::DeviceLost(_)));
        assert!(matches!(
            RenderError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            RenderError::OutOfMemory { .. }
        ));
        assert!(matches!(
            RenderError::from(vk::Result::ERROR_MEMORY_MAP_FAILED),
            RenderError::Mapping(MappingError::MapFailed)
        ));
        assert!(matches!(
            RenderError::from(vk::Result::ERROR_OUT_OF_DATE_KHR),
            RenderError::SwapchainOutOfDate
        ));
        assert!(matches!(
            RenderError::from(vk::Result::ERROR_FORMAT_NOT_SUPPORTED),
            RenderError::Api(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)
        ));
    }

    #[test]
    fn test_allocation_conversion_keeps_request() {
        let err = RenderError::from_allocation(vk::Result::ERROR_OUT_OF_HOST_MEMORY, 4096, 256);
        assert!(matches!(err, RenderError::OutOfMemory { requested: 4096, alignment: 256 }));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(RenderError::DeviceLost("x".into()).is_fatal());
        assert!(RenderError::Dependency { subpass: "a".into(), attachment: "b".into() }.is_fatal());
        assert!(!RenderError::SwapchainOutOfDate.is_fatal());
        assert!(!RenderError::OutOfMemory { requested: 1, alignment: 1 }.is_fatal());
        assert!(!RenderError::Mapping(MappingError::NotMapped).is_fatal());
    }

    #[test]
    fn test_out_of_range_message() {
        let err = MappingError::OutOfRange { offset: 8, len: 16, size: 12 };
        assert_eq!(err.to_string(), "Range 8..24 exceeds buffer size 12");
    }
}
