//! SPIR-V shader words

use crate::error::{RenderError, RenderResult};

/// First word of every SPIR-V module
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

const HEADER_WORDS: usize = 5;

/// SPIR-V module handed in by the asset layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderCode {
    words: Vec<u32>,
}

impl ShaderCode {
    /// Wrap SPIR-V words; the device checks the header when building a pipeline
    #[must_use]
    pub const fn new(words: Vec<u32>) -> Self {
        Self { words }
    }

    /// Decode little-endian SPIR-V bytes, as stored in `.spv` files
    pub fn from_bytes(bytes: &[u8]) -> RenderResult<Self> {
        if bytes.len() % 4 != 0 {
            return Err(RenderError::InvalidState(format!(
                "SPIR-V byte length {} is not a multiple of 4",
                bytes.len()
            )));
        }

        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        let code = Self::new(words);

        if !code.is_spirv() {
            return Err(RenderError::invalid_state("missing SPIR-V magic number"));
        }
        Ok(code)
    }

    /// Header-only module with no entry point
    ///
    /// Accepted by the headless device; a real driver rejects it.
    #[must_use]
    pub fn placeholder() -> Self {
        Self::new(vec![SPIRV_MAGIC, 0x0001_0000, 0, 1, 0])
    }

    /// Module words
    #[must_use]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Whether the words start with a complete SPIR-V header
    #[must_use]
    pub fn is_spirv(&self) -> bool {
        self.words.len() >= HEADER_WORDS && self.words[0] == SPIRV_MAGIC
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes_checks_magic() {
        let mut bytes = Vec::new();
        for word in ShaderCode::placeholder().words() {
            bytes.extend_from_slice(&word.to_le_bytes());
        }

        assert_eq!(ShaderCode::from_bytes(&bytes).unwrap(), ShaderCode::placeholder());
        assert!(ShaderCode::from_bytes(&bytes[..7]).is_err());

        bytes[0] = 0;
        assert!(ShaderCode::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_truncated_header_is_not_spirv() {
        assert!(!ShaderCode::new(vec![SPIRV_MAGIC]).is_spirv());
        assert!(ShaderCode::placeholder().is_spirv());
    }
}
