// Shared infrastructure for the prism shader toolchain

pub mod files;

pub use files::{DiskFileSystem, FileSystem, MemoryFileSystem, SearchPaths};
