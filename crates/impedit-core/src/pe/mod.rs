//! In-memory model of a PE image.
//!
//! [`Image::parse`] takes ownership of the file bytes and builds the header,
//! section, import and export models from them.  The bytes themselves are
//! never modified; edits are recorded in the model and an import layout plan,
//! and [`Image::build`] produces a fresh buffer.

pub mod checksum;
pub mod cursor;
pub mod exports;
pub mod headers;
pub mod imports;
pub mod translate;
pub mod writer;

use crate::edit::layout::{ImportPlan, LayoutContext};
use crate::edit::EditState;
use crate::error::{BuildError, ParseError};

use self::exports::{parse_exports, ExportTable};
use self::headers::{parse_headers, DosHeader, HeaderLayout, NtHeaders, Section};
use self::imports::{parse_imports, ImportDescriptor};
use self::translate::Translator;

/// A parsed PE file held entirely in memory.
#[derive(Debug, Clone)]
pub struct Image {
    data: Vec<u8>,
    dos_header: DosHeader,
    original_headers: NtHeaders,
    original_sections: Vec<Section>,
    original_descriptors: usize,
    /// End of the furthest section's raw data, clamped to the file length.
    /// Everything after it is overlay.
    data_end: usize,
    layout: HeaderLayout,
    pub(crate) headers: NtHeaders,
    pub(crate) sections: Vec<Section>,
    pub(crate) imports: Vec<ImportDescriptor>,
    exports: Option<ExportTable>,
    pub(crate) plan: Option<ImportPlan>,
    pub(crate) state: EditState,
}

impl Image {
    /// Parse a PE image.  No partial result is returned on failure.
    pub fn parse(data: Vec<u8>) -> Result<Image, ParseError> {
        let set = parse_headers(&data)?;
        let translator = Translator::new(&set.sections);
        let imports = parse_imports(&data, &set.nt, &translator)?;
        let exports = parse_exports(&data, &set.nt, &translator)?;

        let headers_end = (set.nt.optional_header.size_of_headers as usize).min(data.len());
        let data_end = set
            .sections
            .iter()
            .filter(|s| s.raw_size != 0)
            .map(|s| s.raw_end().min(data.len() as u64) as usize)
            .fold(headers_end, usize::max);

        tracing::debug!(
            descriptors = imports.len(),
            exports = exports.as_ref().map_or(0, |t| t.entries.len()),
            overlay = data.len() - data_end,
            "parsed image"
        );

        Ok(Image {
            dos_header: set.dos,
            original_headers: set.nt.clone(),
            original_sections: set.sections.clone(),
            original_descriptors: imports.len(),
            data_end,
            layout: set.layout,
            headers: set.nt,
            sections: set.sections,
            imports,
            exports,
            plan: None,
            state: EditState::Parsed,
            data,
        })
    }

    // -- accessors ----------------------------------------------------------

    pub fn dos_header(&self) -> &DosHeader {
        &self.dos_header
    }

    /// Current headers, including any changes made by pending edits.
    pub fn nt_headers(&self) -> &NtHeaders {
        &self.headers
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn imports(&self) -> &[ImportDescriptor] {
        &self.imports
    }

    pub fn exports(&self) -> Option<&ExportTable> {
        self.exports.as_ref()
    }

    pub fn translator(&self) -> Translator<'_> {
        Translator::new(&self.sections)
    }

    pub fn is_64bit(&self) -> bool {
        self.headers.is_64bit()
    }

    /// The bytes the image was parsed from.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Trailing bytes not covered by any section (often the certificate
    /// table).
    pub fn overlay(&self) -> &[u8] {
        &self.data[self.data_end..]
    }

    pub fn state(&self) -> EditState {
        self.state
    }

    pub fn is_modified(&self) -> bool {
        self.plan.is_some()
    }

    pub(crate) fn layout_context(&self) -> LayoutContext<'_> {
        LayoutContext {
            data: &self.data,
            nt: &self.original_headers,
            sections: &self.original_sections,
            layout: self.layout,
            data_end: self.data_end,
            original_descriptors: self.original_descriptors,
        }
    }

    /// Serialise the image.  An image with no pending edits comes back
    /// byte-for-byte identical to its input.
    pub fn build(self) -> Result<Vec<u8>, BuildError> {
        writer::build(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::PeFixture;

    #[test]
    fn parse_builds_full_model() {
        let data = PeFixture::new()
            .import("kernel32.dll", &["ExitProcess"])
            .exports("app.exe", &["Exported"])
            .build();
        let image = Image::parse(data).unwrap();
        assert_eq!(image.sections().len(), 3);
        assert_eq!(image.imports().len(), 1);
        assert_eq!(image.exports().unwrap().entries.len(), 1);
        assert_eq!(image.state(), EditState::Parsed);
        assert!(!image.is_modified());
        assert!(image.overlay().is_empty());
    }

    #[test]
    fn overlay_is_bytes_past_section_data() {
        let data = PeFixture::new().overlay(b"trailing").build();
        let image = Image::parse(data).unwrap();
        assert_eq!(image.overlay(), b"trailing");
    }

    #[test]
    fn translator_maps_import_directory() {
        let data = PeFixture::new().import("kernel32.dll", &["Sleep"]).build();
        let image = Image::parse(data).unwrap();
        let dir = image
            .nt_headers()
            .directory(headers::DirectoryEntry::Import)
            .unwrap();
        let offset = image.translator().rva_to_offset(dir.virtual_address).unwrap();
        assert_eq!(image.translator().offset_to_rva(offset), Some(dir.virtual_address));
    }
}
