//! Error types for parsing, editing and rebuilding PE images.

use std::fmt;

use thiserror::Error;

/// Which magic value failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    /// `MZ` at offset 0.
    Dos,
    /// `PE\0\0` at `e_lfanew`.
    Nt,
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signature::Dos => write!(f, "DOS signature (expected 0x5A4D)"),
            Signature::Nt => write!(f, "PE signature (expected 0x00004550)"),
        }
    }
}

/// The input buffer is not a PE image this crate can model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid {0}")]
    BadSignature(Signature),
    #[error("file is truncated: {needed} bytes needed at offset {offset:#x}")]
    Truncated { offset: usize, needed: usize },
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("{what} RVA {rva:#x} does not map into the file")]
    BadRva { what: &'static str, rva: u32 },
}

/// A symbol lookup against the target or a candidate module failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("import already exists: {module}::{function}")]
    AlreadyExists { module: String, function: String },
    #[error("module {module} could not be loaded: {reason}")]
    ModuleNotFound { module: String, reason: String },
    #[error("{module} does not export {function}")]
    SymbolNotFound { module: String, function: String },
    #[error("the target does not import {module}::{function}")]
    ImportNotFound { module: String, function: String },
}

/// A destructive edit was requested without the caller acknowledging it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "refusing to remove {module}::{function} without force: code calling through its IAT slot will break"
)]
pub struct PolicyRefusal {
    pub module: String,
    pub function: String,
}

/// An internal invariant did not hold while laying out or writing the image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("RVA {0:#x} does not map into the file")]
    UnmappedRva(u32),
    #[error("patch at offset {0:#x} falls outside the output buffer")]
    PatchOutOfRange(u32),
    #[error("image has no import data directory slot")]
    NoImportDirectory,
    #[error("section name {0:?} is longer than 8 bytes")]
    SectionName(String),
    #[error("no free section name derived from {0:?}")]
    NoSectionName(String),
    #[error("section table is full and headers cannot grow past the first section at {first_section:#x}")]
    NoHeaderRoom { first_section: u32 },
    #[error("image exceeds the 4 GiB PE limit")]
    TooLarge,
}

/// Everything the mutation engine can fail with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditError {
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error(transparent)]
    Refused(#[from] PolicyRefusal),
    #[error(transparent)]
    Build(#[from] BuildError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_display() {
        assert_eq!(
            ParseError::BadSignature(Signature::Dos).to_string(),
            "invalid DOS signature (expected 0x5A4D)"
        );
        assert_eq!(
            ParseError::Truncated { offset: 0x3c, needed: 4 }.to_string(),
            "file is truncated: 4 bytes needed at offset 0x3c"
        );
        assert_eq!(
            ParseError::BadRva { what: "import directory", rva: 0x2000 }.to_string(),
            "import directory RVA 0x2000 does not map into the file"
        );
    }

    #[test]
    fn edit_error_is_transparent() {
        let err: EditError = LookupError::AlreadyExists {
            module: "user32.dll".into(),
            function: "MessageBoxA".into(),
        }
        .into();
        assert_eq!(err.to_string(), "import already exists: user32.dll::MessageBoxA");
    }
}
