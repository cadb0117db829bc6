//! Source annotations.
//!
//! GLSL vertex inputs can be tagged with the attribute they carry:
//!
//! ```glsl
//! #pragma NORMAL
//! layout(location = 1) in vec3 in_normal;
//! ```
//!
//! The pragma name must be one of the configured semantics. The scan is
//! textual and runs before compilation; its results become the semantic hints
//! handed to reflection.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use super::reflect::SemanticHints;
use super::ShaderStage;
use crate::config::ShaderConfig;

/// One annotated vertex input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeAnnotation {
    pub attribute: String,
    pub location: u32,
    #[serde(rename = "type")]
    pub ty: String,
    pub name: String,
}

/// Serializable summary of a shader source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShaderAnalysis {
    pub name: String,
    pub path: String,
    pub stage: ShaderStage,
    pub inputs: Vec<AttributeAnnotation>,
}

impl ShaderAnalysis {
    pub fn new(path: &Path, stage: ShaderStage, inputs: Vec<AttributeAnnotation>) -> Self {
        Self {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: path.to_string_lossy().replace('\\', "/"),
            stage,
            inputs,
        }
    }
}

fn pragma_regex() -> Option<&'static Regex> {
    static PRAGMA: OnceLock<Option<Regex>> = OnceLock::new();
    PRAGMA
        .get_or_init(|| {
            Regex::new(
                r"#pragma\s+([A-Za-z_]\w*)\s*layout\s*\(\s*location\s*=\s*(\d+)\s*\)\s*in\s+([A-Za-z_]\w*)\s+([A-Za-z_]\w*)\s*;",
            )
            .ok()
        })
        .as_ref()
}

/// Collect `#pragma <SEMANTIC>` annotated inputs, in source order.
///
/// Pragmas naming something other than a configured semantic are ignored.
pub fn scan_attributes(source: &str, config: &ShaderConfig) -> Vec<AttributeAnnotation> {
    let Some(regex) = pragma_regex() else {
        return Vec::new();
    };

    regex
        .captures_iter(source)
        .filter_map(|caps| {
            let attribute = config.semantic_for(&caps[1])?.to_string();
            Some(AttributeAnnotation {
                attribute,
                location: caps[2].parse().ok()?,
                ty: caps[3].to_string(),
                name: caps[4].to_string(),
            })
        })
        .collect()
}

/// Location to semantic map for reflection.
pub fn semantic_hints(attributes: &[AttributeAnnotation]) -> SemanticHints {
    SemanticHints {
        by_location: attributes
            .iter()
            .map(|a| (a.location, a.attribute.clone()))
            .collect(),
        ..SemanticHints::default()
    }
}
