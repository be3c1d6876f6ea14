//! PE import table editing engine.
//!
//! The crate parses a Portable Executable held entirely in memory into an
//! [`Image`], lets callers add or remove a single import, and serialises the
//! result back to bytes.  Growth is append-only: new descriptors, lookup and
//! address tables live in a freshly appended section so that no IAT slot
//! already referenced by code ever moves.
//!
//! ```no_run
//! use impedit_core::{EditOptions, Image, Symbol, Validation};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bytes = std::fs::read("app.exe")?;
//! let mut image = Image::parse(bytes)?;
//! let symbol: Symbol = "user32.dll::MessageBoxA".parse()?;
//! image.add_import(&symbol, Validation::Skip, &EditOptions::default())?;
//! std::fs::write("app_modified.exe", image.build()?)?;
//! # Ok(())
//! # }
//! ```

pub mod edit;
pub mod error;
pub mod pe;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use edit::symbol::{Symbol, SymbolParseError, SymbolRef};
pub use edit::{EditOptions, EditState, ExportSource, ImportRecord, NameMatch, Validation};
pub use error::{BuildError, EditError, LookupError, ParseError, PolicyRefusal};
pub use pe::exports::{ExportEntry, ExportTable};
pub use pe::headers::{DataDirectory, DirectoryEntry, Section, SectionFlags};
pub use pe::imports::{ImportDescriptor, ImportEntry, ImportKind};
pub use pe::translate::Translator;
pub use pe::Image;
