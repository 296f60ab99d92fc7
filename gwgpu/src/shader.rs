use std::borrow::Cow;
use std::ffi::CString;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateShaderModuleError {
    #[error("SPIR-V length {0} is not a whole number of words")]
    InvalidLength(usize),

    #[error("Shader module creation failed: {0}")]
    Vulkan(vk::Result),
}

/// The single pipeline stage a SPIR-V entry point targets.
///
/// [`vk::ShaderStageFlags`] is a bitmask; an entry point always means
/// exactly one stage, which this enum encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl From<ShaderStage> for vk::ShaderStageFlags {
    fn from(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => Self::VERTEX,
            ShaderStage::Fragment => Self::FRAGMENT,
        }
    }
}

/// View `spirv_bytes` as SPIR-V code words.
///
/// Borrows the input when it is already `u32`-aligned on a little-endian
/// target; otherwise decodes into an owned `Vec`. SPIR-V out of glslc is
/// little-endian words, hence `from_le_bytes` on the decode path.
fn spirv_words(spirv_bytes: &[u8]) -> Result<Cow<'_, [u32]>, CreateShaderModuleError> {
    if spirv_bytes.len() % 4 != 0 {
        return Err(CreateShaderModuleError::InvalidLength(spirv_bytes.len()));
    }

    // SAFETY: every bit pattern is a valid u32 and the length is a multiple
    // of 4, so viewing the aligned middle section is sound.
    let (prefix, aligned_words, _suffix) = unsafe { spirv_bytes.align_to::<u32>() };
    if cfg!(target_endian = "little") && prefix.is_empty() {
        Ok(Cow::Borrowed(aligned_words))
    } else {
        Ok(Cow::Owned(
            spirv_bytes
                .chunks_exact(4)
                .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
                .collect(),
        ))
    }
}

pub struct ShaderModule {
    device: Arc<Device>,
    raw: vk::ShaderModule,
}

impl std::fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderModule")
            .field("handle", &self.raw)
            .finish_non_exhaustive()
    }
}

impl ShaderModule {
    /// Wrap raw SPIR-V bytes, typically the output of `include_bytes!` on a
    /// compiled `.spv` file, in a shader module.
    ///
    /// A byte length that is not a multiple of 4 cannot be SPIR-V and is
    /// rejected before the device sees it.
    ///
    /// `name` becomes a debug label when `VK_EXT_debug_utils` is around; a
    /// labeling failure only warns.
    pub fn new(
        device: &Arc<Device>,
        spirv_bytes: &[u8],
        name: Option<&str>,
    ) -> Result<Self, CreateShaderModuleError> {
        let code = spirv_words(spirv_bytes)?;
        let info = vk::ShaderModuleCreateInfo::default().code(&code);

        // SAFETY: info borrows code, which lives past the call.
        let raw = unsafe { device.create_raw_shader_module(&info) }
            .map_err(CreateShaderModuleError::Vulkan)?;

        // SAFETY: raw was just created from device.
        if let Err(e) = unsafe { device.set_object_name_str(raw, name) } {
            tracing::warn!("Could not name shader module {raw:?}: {e}");
        }

        Ok(Self {
            device: Arc::clone(device),
            raw,
        })
    }

    /// Pair this module with an entry point name and stage.
    ///
    /// Only an interior NUL in `name` can make this fail.
    pub fn entry_point(
        &self,
        name: &str,
        stage: ShaderStage,
    ) -> Result<EntryPoint<'_>, std::ffi::NulError> {
        Ok(EntryPoint {
            module: self,
            name: CString::new(name)?,
            stage,
        })
    }

    pub fn raw_handle(&self) -> vk::ShaderModule {
        self.raw
    }

    pub fn get_parent(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        tracing::debug!("Dropping shader module {:?}", self.raw);
        // SAFETY: the module came from this device, and pipelines built
        // from it do not retain it after creation.
        unsafe { self.device.destroy_raw_shader_module(self.raw) };
    }
}

/// A [`ShaderModule`] plus the entry point name and stage to run it at.
///
/// The borrow ties any stage create info built from this view to the
/// module's lifetime.
#[derive(Debug)]
pub struct EntryPoint<'a> {
    module: &'a ShaderModule,
    name: CString,
    stage: ShaderStage,
}

impl EntryPoint<'_> {
    /// The `VkPipelineShaderStageCreateInfo` for this entry point. The
    /// result borrows from `self`.
    pub fn as_pipeline_stage_create_info(&self) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage.into())
            .module(self.module.raw_handle())
            .name(&self.name)
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spirv_words_rejects_non_word_multiple() {
        let result = spirv_words(&[0u8; 6]);
        assert!(matches!(
            result,
            Err(CreateShaderModuleError::InvalidLength(6))
        ));
    }

    #[test]
    fn spirv_words_decodes_magic_number() {
        // The SPIR-V magic number 0x07230203 as it appears on disk.
        let bytes = [0x03u8, 0x02, 0x23, 0x07];
        let words = spirv_words(&bytes).expect("word-multiple input");
        assert_eq!(words.as_ref(), &[0x0723_0203]);
    }

    #[test]
    fn spirv_words_accepts_empty_input() {
        let words = spirv_words(&[]).expect("empty input is trivially valid");
        assert!(words.is_empty());
    }
}
