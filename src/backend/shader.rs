// Shader binaries and modules
//
// Vulkan consumes SPIR-V words. Blobs are read from disk once at startup and
// validated here; modules only live until the pipeline that uses them is built.

use ash::vk;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use super::error::{RendererError, Result};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Immutable SPIR-V code for one shader stage
#[derive(Debug, Clone)]
pub struct ShaderBinary {
    pub path: PathBuf,
    words: Vec<u32>,
}

impl ShaderBinary {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| RendererError::ShaderLoad {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(path, &bytes)
    }

    pub fn from_bytes(path: impl Into<PathBuf>, bytes: &[u8]) -> Result<Self> {
        let path = path.into();
        match parse_spirv(bytes) {
            Ok(words) => {
                log::debug!("Loaded shader {:?} ({} words)", path, words.len());
                Ok(Self { path, words })
            }
            Err(source) => Err(RendererError::ShaderLoad { path, source }),
        }
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }
}

fn parse_spirv(bytes: &[u8]) -> io::Result<Vec<u32>> {
    if bytes.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "empty shader binary"));
    }
    // read_spv checks the length and fixes byte order
    let words = ash::util::read_spv(&mut Cursor::new(bytes))?;
    if words.first() != Some(&SPIRV_MAGIC) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "missing SPIR-V magic number",
        ));
    }
    Ok(words)
}

/// The two stages of the triangle pipeline
#[derive(Debug, Clone)]
pub struct ShaderBinaries {
    pub vertex: ShaderBinary,
    pub fragment: ShaderBinary,
}

impl ShaderBinaries {
    pub fn load(vertex: impl AsRef<Path>, fragment: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            vertex: ShaderBinary::load(vertex)?,
            fragment: ShaderBinary::load(fragment)?,
        })
    }
}

/// Shader module destroyed when it goes out of scope
pub struct ShaderModule<'a> {
    device: &'a ash::Device,
    pub handle: vk::ShaderModule,
}

impl<'a> ShaderModule<'a> {
    pub fn new(device: &'a ash::Device, binary: &ShaderBinary) -> Result<Self> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(binary.words());

        let handle = unsafe { device.create_shader_module(&create_info, None) }.map_err(|source| {
            RendererError::PipelineCreation {
                stage: "shader module",
                source,
            }
        })?;
        log::debug!("Created shader module from {:?}", binary.path);

        Ok(Self { device, handle })
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.handle, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn accepts_spirv_header() {
        let bytes = words_to_bytes(&[SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]);
        let binary = ShaderBinary::from_bytes("triangle.vert.spv", &bytes).unwrap();
        assert_eq!(binary.words().len(), 5);
        assert_eq!(binary.words()[0], SPIRV_MAGIC);
    }

    #[test]
    fn byte_swapped_binary_is_normalized() {
        let bytes: Vec<u8> = [SPIRV_MAGIC, 7]
            .iter()
            .flat_map(|w| w.to_be_bytes())
            .collect();
        let binary = ShaderBinary::from_bytes("be.spv", &bytes).unwrap();
        assert_eq!(binary.words(), &[SPIRV_MAGIC, 7]);
    }

    #[test]
    fn rejects_truncated_and_foreign_blobs() {
        for bytes in [vec![], vec![0x03, 0x02, 0x23], words_to_bytes(&[0xDEAD_BEEF, 0])] {
            let err = ShaderBinary::from_bytes("bad.spv", &bytes).unwrap_err();
            assert!(matches!(err, RendererError::ShaderLoad { .. }), "{err}");
        }
    }

    #[test]
    fn missing_file_is_a_shader_load_error() {
        let err = ShaderBinary::load("shaders/does-not-exist.spv").unwrap_err();
        match err {
            RendererError::ShaderLoad { path, source } => {
                assert_eq!(path, PathBuf::from("shaders/does-not-exist.spv"));
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
