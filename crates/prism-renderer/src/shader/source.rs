//! Source loading and dialect detection.
//!
//! The file extension is the whole protocol: one of the GLSL stage
//! extensions selects the GLSL front end and the stage, `.slang` selects the
//! Slang front end (always compute), and a trailing `.spv` marks precompiled
//! bytecode whose stage comes from the extension before it.

use std::path::Path;

use prism_common::FileSystem;

use super::ShaderStage;
use crate::error::ShaderError;

/// SPIR-V magic number, first word of every module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Front end a source file goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Glsl,
    Slang,
    /// Precompiled SPIR-V, no front end.
    Spirv,
}

impl Dialect {
    pub fn name(self) -> &'static str {
        match self {
            Dialect::Glsl => "GLSL",
            Dialect::Slang => "Slang",
            Dialect::Spirv => "SPIR-V",
        }
    }
}

/// GLSL stage extensions, in stage order.
pub const GLSL_EXTENSIONS: [(&str, ShaderStage); 8] = [
    ("vert", ShaderStage::Vertex),
    ("tesc", ShaderStage::TessControl),
    ("tese", ShaderStage::TessEval),
    ("geom", ShaderStage::Geometry),
    ("frag", ShaderStage::Fragment),
    ("comp", ShaderStage::Compute),
    ("task", ShaderStage::Task),
    ("mesh", ShaderStage::Mesh),
];

/// Stage for a GLSL extension (without the dot).
pub fn glsl_stage(extension: &str) -> Option<ShaderStage> {
    GLSL_EXTENSIONS
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, stage)| *stage)
}

/// Dialect and declared stage for a shader path.
pub fn detect(path: &Path) -> Result<(Dialect, ShaderStage), ShaderError> {
    let unsupported = || ShaderError::UnsupportedExtension {
        path: path.to_path_buf(),
    };

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(unsupported)?;

    match extension {
        "slang" => Ok((Dialect::Slang, ShaderStage::Compute)),
        "spv" => {
            let stem = path.file_stem().map(Path::new).ok_or_else(unsupported)?;
            stem.extension()
                .and_then(|e| e.to_str())
                .and_then(glsl_stage)
                .map(|stage| (Dialect::Spirv, stage))
                .ok_or_else(unsupported)
        }
        other => glsl_stage(other)
            .map(|stage| (Dialect::Glsl, stage))
            .ok_or_else(unsupported),
    }
}

/// Raw contents of a shader file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShaderSource {
    Text(String),
    Binary(Vec<u32>),
}

/// Read a shader file in the form its dialect needs.
pub fn load(fs: &dyn FileSystem, path: &Path, dialect: Dialect) -> Result<ShaderSource, ShaderError> {
    let io_error = |source| ShaderError::Io {
        path: path.to_path_buf(),
        source,
    };

    match dialect {
        Dialect::Glsl | Dialect::Slang => fs
            .read_to_string(path)
            .map(ShaderSource::Text)
            .map_err(io_error),
        Dialect::Spirv => {
            let bytes = fs.read(path).map_err(io_error)?;
            words_from_bytes(&bytes)
                .map(ShaderSource::Binary)
                .map_err(|log| ShaderError::Compile {
                    path: path.to_path_buf(),
                    log,
                })
        }
    }
}

/// Convert a SPIR-V byte stream to words, fixing up byte order.
pub fn words_from_bytes(bytes: &[u8]) -> Result<Vec<u32>, String> {
    if bytes.len() % 4 != 0 {
        return Err(format!(
            "SPIR-V size {} is not a multiple of 4 bytes",
            bytes.len()
        ));
    }

    let mut words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned::<u32>)
        .collect();

    match words.first().copied() {
        Some(SPIRV_MAGIC) => Ok(words),
        Some(magic) if magic.swap_bytes() == SPIRV_MAGIC => {
            for word in &mut words {
                *word = word.swap_bytes();
            }
            Ok(words)
        }
        Some(magic) => Err(format!("bad SPIR-V magic number {magic:#010x}")),
        None => Err("empty SPIR-V module".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_common::MemoryFileSystem;
    use std::path::PathBuf;

    // ============================================================
    // Detection
    // ============================================================

    #[test]
    fn test_detect_every_glsl_extension() {
        for (ext, stage) in GLSL_EXTENSIONS {
            let path = PathBuf::from(format!("shaders/lit.{ext}"));
            assert_eq!(detect(&path).unwrap(), (Dialect::Glsl, stage), "{ext}");
        }
    }

    #[test]
    fn test_detect_precompiled_uses_penultimate_extension() {
        for (ext, stage) in GLSL_EXTENSIONS {
            let path = PathBuf::from(format!("lit.{ext}.spv"));
            assert_eq!(detect(&path).unwrap(), (Dialect::Spirv, stage));
        }
    }

    #[test]
    fn test_detect_slang_is_compute() {
        assert_eq!(
            detect(Path::new("post/blur.slang")).unwrap(),
            (Dialect::Slang, ShaderStage::Compute)
        );
    }

    #[test]
    fn test_detect_rejects_unknown() {
        for bad in ["lit.hlsl", "lit", "lit.spv", "lit.txt.spv", "lit.slang.spv", ".vert.spv.bak"] {
            assert!(
                matches!(detect(Path::new(bad)), Err(ShaderError::UnsupportedExtension { .. })),
                "{bad}"
            );
        }
    }

    // ============================================================
    // Bytes to words
    // ============================================================

    fn module_bytes(words: &[u32], big_endian: bool) -> Vec<u8> {
        words
            .iter()
            .flat_map(|w| if big_endian { w.to_be_bytes() } else { w.to_le_bytes() })
            .collect()
    }

    #[test]
    fn test_words_native_and_swapped() {
        let words = [SPIRV_MAGIC, 0x0001_0600, 0, 8, 0];
        let native: Vec<u8> = words.iter().flat_map(|w| w.to_ne_bytes()).collect();
        assert_eq!(words_from_bytes(&native).unwrap(), words);

        let swapped = module_bytes(&words, cfg!(target_endian = "little"));
        assert_eq!(words_from_bytes(&swapped).unwrap(), words);
    }

    #[test]
    fn test_words_rejects_bad_input() {
        assert!(words_from_bytes(&[]).is_err());
        assert!(words_from_bytes(&[1, 2, 3]).is_err());
        assert!(words_from_bytes(&[0xde, 0xad, 0xbe, 0xef]).is_err());
    }

    // ============================================================
    // Loading
    // ============================================================

    #[test]
    fn test_load_text_and_binary() {
        let fs = MemoryFileSystem::new();
        fs.write("a.frag", "void main() {}");
        fs.write("a.vert.spv", module_bytes(&[SPIRV_MAGIC, 0x0001_0000, 0, 1, 0], false));

        assert_eq!(
            load(&fs, Path::new("a.frag"), Dialect::Glsl).unwrap(),
            ShaderSource::Text("void main() {}".into())
        );
        match load(&fs, Path::new("a.vert.spv"), Dialect::Spirv).unwrap() {
            ShaderSource::Binary(words) => assert_eq!(words[0], SPIRV_MAGIC),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_load_missing_is_io_error() {
        let fs = MemoryFileSystem::new();
        assert!(matches!(
            load(&fs, Path::new("gone.vert"), Dialect::Glsl),
            Err(ShaderError::Io { .. })
        ));
    }
}
