use ash::vk;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::SystemTime;

use crate::config::SPIRV_MAGIC;
use crate::{RenderError, Result};

/// One shader stage's source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    pub path: PathBuf,
    pub stage: vk::ShaderStageFlags,
}

impl ShaderSource {
    pub fn new(path: impl Into<PathBuf>, stage: vk::ShaderStageFlags) -> Self {
        Self {
            path: path.into(),
            stage,
        }
    }

    pub fn vertex(path: impl Into<PathBuf>) -> Self {
        Self::new(path, vk::ShaderStageFlags::VERTEX)
    }

    pub fn fragment(path: impl Into<PathBuf>) -> Self {
        Self::new(path, vk::ShaderStageFlags::FRAGMENT)
    }

    pub fn compute(path: impl Into<PathBuf>) -> Self {
        Self::new(path, vk::ShaderStageFlags::COMPUTE)
    }

    /// Last modification time, if the file exists.
    pub fn modified(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }
}

/// Turns a shader source into a SPIR-V binary.
///
/// Errors are reported as [`RenderError::ShaderCompile`] (or `Io`); callers must not touch any
/// GPU state until this step has succeeded.
pub trait ShaderCompiler: Send + Sync {
    fn compile(&self, source: &ShaderSource) -> Result<Vec<u8>>;
}

/// Invokes `glslc` and reads back its output.
#[derive(Debug, Clone)]
pub struct GlslcCompiler {
    executable: PathBuf,
    output_dir: Option<PathBuf>,
}

impl Default for GlslcCompiler {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("glslc"),
            output_dir: None,
        }
    }
}

impl GlslcCompiler {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            output_dir: None,
        }
    }

    /// Writes binaries to `dir` instead of next to the source.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// `shader.frag` becomes `shader.frag.spv`.
    pub fn output_path(&self, source: &Path) -> PathBuf {
        let mut file_name = source.file_name().unwrap_or_default().to_os_string();
        file_name.push(".spv");
        match &self.output_dir {
            Some(dir) => dir.join(file_name),
            None => source.with_file_name(file_name),
        }
    }
}

impl ShaderCompiler for GlslcCompiler {
    fn compile(&self, source: &ShaderSource) -> Result<Vec<u8>> {
        let output = self.output_path(&source.path);
        let result = Command::new(&self.executable)
            .arg(&source.path)
            .arg("-o")
            .arg(&output)
            .output()?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(RenderError::ShaderCompile(format!(
                "{}: {}",
                source.path.display(),
                stderr.trim()
            )));
        }
        log::debug!("[Shader] Compiled {}", source.path.display());
        Ok(fs::read(&output)?)
    }
}

/// Treats every source path as an already-compiled SPIR-V binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrecompiledShaders;

impl ShaderCompiler for PrecompiledShaders {
    fn compile(&self, source: &ShaderSource) -> Result<Vec<u8>> {
        fs::read(&source.path).map_err(|e| {
            RenderError::ShaderCompile(format!("failed to read {}: {e}", source.path.display()))
        })
    }
}

/// Checks length and magic number, then decodes the binary into words.
pub fn validate_spirv(code: &[u8]) -> Result<Vec<u32>> {
    if code.len() < 4 || code.len() % 4 != 0 {
        return Err(RenderError::InvalidShaderBinary(format!(
            "size {} is not a non-zero multiple of 4",
            code.len()
        )));
    }
    let magic = u32::from_le_bytes([code[0], code[1], code[2], code[3]]);
    if magic != SPIRV_MAGIC && magic.swap_bytes() != SPIRV_MAGIC {
        return Err(RenderError::InvalidShaderBinary(format!(
            "bad magic number {magic:#010x}"
        )));
    }
    ash::util::read_spv(&mut Cursor::new(code))
        .map_err(|e| RenderError::InvalidShaderBinary(format!("failed to parse SPIR-V: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spirv_header() -> Vec<u8> {
        let words = [SPIRV_MAGIC, 0x0001_0300, 0, 1, 0];
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn accepts_valid_header() {
        let words = validate_spirv(&spirv_header()).unwrap();
        assert_eq!(words[0], SPIRV_MAGIC);
        assert_eq!(words.len(), 5);
    }

    #[test]
    fn rejects_bad_magic_and_length() {
        let mut code = spirv_header();
        code[0] = 0;
        assert!(matches!(
            validate_spirv(&code),
            Err(RenderError::InvalidShaderBinary(_))
        ));
        assert!(validate_spirv(&spirv_header()[..7]).is_err());
        assert!(validate_spirv(&[]).is_err());
    }

    #[test]
    fn glslc_output_path() {
        let compiler = GlslcCompiler::default();
        assert_eq!(
            compiler.output_path(Path::new("shaders/gbuffer.frag")),
            PathBuf::from("shaders/gbuffer.frag.spv")
        );
        let compiler = compiler.with_output_dir("build");
        assert_eq!(
            compiler.output_path(Path::new("shaders/gbuffer.frag")),
            PathBuf::from("build/gbuffer.frag.spv")
        );
    }
}
