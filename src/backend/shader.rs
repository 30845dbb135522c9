// Shader module loading
//
// Shaders are precompiled SPIR-V read from disk at startup (and again on hot
// reload). build.rs compiles the GLSL sources when glslc is installed.

use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;
use std::sync::Arc;
use super::VulkanDevice;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Read a SPIR-V binary into 32-bit words
pub fn load_spirv<P: AsRef<Path>>(path: P) -> Result<Vec<u32>> {
    let path = path.as_ref();
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open shader {:?}", path))?;
    let words = ash::util::read_spv(&mut file)
        .with_context(|| format!("Failed to read SPIR-V from {:?}", path))?;

    anyhow::ensure!(
        words.first() == Some(&SPIRV_MAGIC),
        "{:?} is not a SPIR-V module",
        path
    );
    Ok(words)
}

pub struct ShaderModule {
    pub module: vk::ShaderModule,
    device: Arc<VulkanDevice>,
}

impl ShaderModule {
    pub fn from_file<P: AsRef<Path>>(device: Arc<VulkanDevice>, path: P) -> Result<Self> {
        let path = path.as_ref();
        let code = load_spirv(path)?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
        let module = unsafe { device.device.create_shader_module(&create_info, None) }
            .with_context(|| format!("Failed to create shader module from {:?}", path))?;

        log::debug!("Loaded shader {:?} ({} words)", path, code.len());
        Ok(Self { module, device })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_shader_module(self.module, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_file(name: &str, bytes: &[u8]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cube-renderer-spv-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn reads_little_endian_words() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        let path = scratch_file("ok.spv", &bytes);

        let words = load_spirv(&path).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn rejects_truncated_binary() {
        let path = scratch_file("short.spv", &[0x03, 0x02, 0x23, 0x07, 0x00]);
        assert!(load_spirv(&path).is_err());
    }

    #[test]
    fn rejects_non_spirv() {
        let path = scratch_file("text.spv", b"void main() {}  ");
        assert!(load_spirv(&path).is_err());
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = load_spirv("shaders/missing.spv").unwrap_err();
        assert!(format!("{:#}", err).contains("missing.spv"));
    }
}
