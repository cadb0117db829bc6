//! Shader toolchain configuration.
//!
//! Holds the compiler targets, search paths and the vertex-attribute
//! semantic names the reflector recognizes. Built with [`Default`] plus
//! setters, then passed through [`ShaderConfig::validated`].

use std::path::PathBuf;

/// Vertex-attribute semantics recognized by default, both as input variable
/// names and as the argument of a `#pragma <SEMANTIC>` line.
pub const DEFAULT_SEMANTICS: &[&str] = &[
    "POSITION", "NORMAL", "TANGENT", "TEXCOORD0", "TEXCOORD1", "COLOR0", "JOINTS0", "WEIGHTS0",
];

const MAX_SPIRV_VERSION: (u8, u8) = (1, 6);

const DEFAULT_RUNTIME_ARRAY_DESCRIPTORS: u32 = 1024;

/// Configuration shared by the compiler, reflector and registry.
#[derive(Debug, Clone)]
pub struct ShaderConfig {
    /// Directories relative shader paths are resolved against, highest priority first.
    pub search_paths: Vec<PathBuf>,
    /// Target Vulkan API version (major, minor)
    pub vulkan_version: (u32, u32),
    /// Target SPIR-V version (major, minor)
    pub spirv_version: (u8, u8),
    /// Entry point name passed to the front ends
    pub entry_point: String,
    /// Module search paths for the Slang front end
    pub slang_search_paths: Vec<PathBuf>,
    /// Preprocessor macros for the Slang front end
    pub slang_macros: Vec<(String, String)>,
    /// Slang target profile
    pub slang_profile: String,
    /// Known vertex-attribute semantic names (upper case)
    pub semantics: Vec<String>,
    /// Reproduce the old separate-image descriptor mapping
    /// (buffer-dim images become uniform texel buffers, all others storage images).
    pub legacy_separate_image_mapping: bool,
    /// Emit debug names into generated SPIR-V so bindings keep their names
    pub debug_info: bool,
    /// Descriptor count given to runtime-sized (unbounded) arrays in derived layouts
    pub runtime_array_descriptors: u32,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            search_paths: vec![PathBuf::from("shaders")],
            vulkan_version: (1, 3),
            spirv_version: (1, 6),
            entry_point: "main".to_string(),
            slang_search_paths: vec![PathBuf::from("shaders/slang")],
            slang_macros: vec![("ENABLE_FANCY_FEATURE".to_string(), "1".to_string())],
            slang_profile: "glsl_450".to_string(),
            semantics: DEFAULT_SEMANTICS.iter().map(|s| s.to_string()).collect(),
            legacy_separate_image_mapping: false,
            debug_info: true,
            runtime_array_descriptors: DEFAULT_RUNTIME_ARRAY_DESCRIPTORS,
        }
    }
}

impl ShaderConfig {
    /// Config with a single search root.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            search_paths: vec![root.into()],
            ..Self::default()
        }
    }

    pub fn search_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_paths.push(dir.into());
        self
    }

    pub fn vulkan_version(mut self, major: u32, minor: u32) -> Self {
        self.vulkan_version = (major, minor);
        self
    }

    pub fn spirv_version(mut self, major: u8, minor: u8) -> Self {
        self.spirv_version = (major, minor);
        self
    }

    pub fn slang_search_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.slang_search_paths.push(dir.into());
        self
    }

    pub fn slang_macro(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.slang_macros.push((name.into(), value.into()));
        self
    }

    pub fn semantic(mut self, name: impl Into<String>) -> Self {
        self.semantics.push(name.into());
        self
    }

    pub fn legacy_separate_image_mapping(mut self, enabled: bool) -> Self {
        self.legacy_separate_image_mapping = enabled;
        self
    }

    pub fn debug_info(mut self, enabled: bool) -> Self {
        self.debug_info = enabled;
        self
    }

    pub fn runtime_array_descriptors(mut self, count: u32) -> Self {
        self.runtime_array_descriptors = count;
        self
    }

    /// Clamp out-of-range values and normalize the semantic list.
    pub fn validated(mut self) -> Self {
        if self.entry_point.trim().is_empty() {
            log::warn!("Empty shader entry point, using \"main\"");
            self.entry_point = "main".to_string();
        }

        if self.spirv_version.0 != 1 || self.spirv_version > MAX_SPIRV_VERSION {
            log::warn!(
                "Unsupported SPIR-V target {}.{}, using {}.{}",
                self.spirv_version.0,
                self.spirv_version.1,
                MAX_SPIRV_VERSION.0,
                MAX_SPIRV_VERSION.1
            );
            self.spirv_version = MAX_SPIRV_VERSION;
        }

        if self.vulkan_version.0 != 1 {
            log::warn!(
                "Unsupported Vulkan target {}.{}, using 1.3",
                self.vulkan_version.0,
                self.vulkan_version.1
            );
            self.vulkan_version = (1, 3);
        }

        if self.runtime_array_descriptors == 0 {
            log::warn!(
                "Runtime array descriptor count must be non-zero, using {}",
                DEFAULT_RUNTIME_ARRAY_DESCRIPTORS
            );
            self.runtime_array_descriptors = DEFAULT_RUNTIME_ARRAY_DESCRIPTORS;
        }

        let mut semantics: Vec<String> = self
            .semantics
            .iter()
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        semantics.sort();
        semantics.dedup();
        self.semantics = semantics;

        self
    }

    /// The configured semantic matching a variable name, compared case-insensitively.
    pub fn semantic_for(&self, name: &str) -> Option<&str> {
        self.semantics
            .iter()
            .find(|s| s.eq_ignore_ascii_case(name))
            .map(String::as_str)
    }
}
