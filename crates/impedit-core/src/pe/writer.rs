//! Serialise an [`Image`] back to bytes.
//!
//! Output order: the header region (with rewritten header fields and the
//! extended section table), any header growth, the original section data,
//! the appended import section, then the overlay.  In-place patches from
//! removals are applied on top of the copied section data.

use super::checksum::pe_checksum;
use super::cursor::{put_u16, put_u32, ByteCursor};
use super::headers::{
    DirectoryEntry, DATA_DIRECTORY_SIZE, OPT_SIZE_OF_HEADERS, OPT_SIZE_OF_IMAGE,
    OPT_SIZE_OF_INITIALIZED_DATA, SECTION_HEADER_SIZE, SEC_CHARACTERISTICS, SEC_RAW_OFFSET,
    SEC_RAW_SIZE, SEC_VIRTUAL_ADDRESS, SEC_VIRTUAL_SIZE,
};
use super::translate::Translator;
use super::Image;
use crate::edit::layout::ImportPlan;
use crate::edit::EditState;
use crate::error::BuildError;

/// Size of one `IMAGE_DEBUG_DIRECTORY` entry.
const DEBUG_ENTRY_SIZE: usize = 28;

pub(crate) fn build(image: Image) -> Result<Vec<u8>, BuildError> {
    let Some(plan) = image.plan.as_ref() else {
        tracing::debug!(len = image.data.len(), "no pending edits, emitting input unchanged");
        return Ok(image.data);
    };

    let data = &image.data;
    let headers_end = plan.headers_end as usize;
    let data_end = plan.data_end as usize;
    let growth = plan.header_growth as usize;

    // -- body ---------------------------------------------------------------
    let extra = plan.new_section.as_ref().map_or(0, |s| s.header.raw_size as usize);
    let mut out = Vec::with_capacity(data.len() + growth + extra);
    out.extend_from_slice(&data[..headers_end]);
    out.resize(headers_end + growth, 0);
    out.extend_from_slice(&data[headers_end..data_end]);

    for patch in &plan.patches {
        let at = plan.relocate(patch.offset) as usize;
        out.get_mut(at..at + patch.bytes.len())
            .ok_or(BuildError::PatchOutOfRange(patch.offset))?
            .copy_from_slice(&patch.bytes);
    }

    if let Some(section) = &plan.new_section {
        out.resize(section.header.raw_offset as usize, 0);
        out.extend_from_slice(&section.data);
        out.resize((section.header.raw_offset + section.header.raw_size) as usize, 0);
    }
    out.extend_from_slice(&data[data_end..]);
    if out.len() > u32::MAX as usize {
        return Err(BuildError::TooLarge);
    }

    // -- headers ------------------------------------------------------------
    write_headers(&image, &mut out)?;
    fix_debug_entries(&image, plan, &mut out)?;

    if image.original_headers.optional_header.checksum != 0 {
        let at = image.layout.checksum_offset();
        let sum = pe_checksum(&out, at);
        put_u32(&mut out, at, sum);
        tracing::debug!(checksum = format_args!("{sum:#010x}"), "recomputed checksum");
    }

    tracing::debug!(state = ?EditState::Rebuilt, len = out.len(), "image rebuilt");
    Ok(out)
}

fn write_headers(image: &Image, out: &mut [u8]) -> Result<(), BuildError> {
    let layout = &image.layout;
    let nt = &image.headers;
    let opt = &nt.optional_header;
    let header_room = opt.size_of_headers as usize;

    put_u16(out, layout.nt_offset + 6, nt.file_header.number_of_sections);
    put_u32(out, layout.opt_offset + OPT_SIZE_OF_INITIALIZED_DATA, opt.size_of_initialized_data);
    put_u32(out, layout.opt_offset + OPT_SIZE_OF_IMAGE, opt.size_of_image);
    put_u32(out, layout.opt_offset + OPT_SIZE_OF_HEADERS, opt.size_of_headers);

    for (i, dir) in nt.data_directories.iter().enumerate() {
        let at = layout.data_directory_offset + i * DATA_DIRECTORY_SIZE;
        put_u32(out, at, dir.virtual_address);
        put_u32(out, at + 4, dir.size);
    }

    let original_rows = image.original_sections.len();
    for (i, section) in image.sections.iter().enumerate() {
        let row = layout.section_row_offset(i);
        let end = row + SECTION_HEADER_SIZE;
        if end > header_room || end > out.len() {
            return Err(BuildError::NoHeaderRoom {
                first_section: image.sections.first().map_or(0, |s| s.virtual_address),
            });
        }
        if i >= original_rows {
            out[row..end].fill(0);
        }
        out[row..row + 8].copy_from_slice(&section.name);
        put_u32(out, row + SEC_VIRTUAL_SIZE, section.virtual_size);
        put_u32(out, row + SEC_VIRTUAL_ADDRESS, section.virtual_address);
        put_u32(out, row + SEC_RAW_SIZE, section.raw_size);
        put_u32(out, row + SEC_RAW_OFFSET, section.raw_offset);
        put_u32(out, row + SEC_CHARACTERISTICS, section.characteristics.bits());
    }
    Ok(())
}

/// Debug directory entries carry a raw file offset to their payload.
fn fix_debug_entries(image: &Image, plan: &ImportPlan, out: &mut [u8]) -> Result<(), BuildError> {
    let Some(dir) = image
        .original_headers
        .directory(DirectoryEntry::Debug)
        .filter(|d| d.is_present())
    else {
        return Ok(());
    };
    if plan.header_growth == 0 && plan.new_section.is_none() {
        return Ok(());
    }

    let before = Translator::new(&image.original_sections);
    let after = Translator::new(&image.sections);
    let base = before
        .range_to_offset(dir.virtual_address, dir.size)
        .ok_or(BuildError::UnmappedRva(dir.virtual_address))?;
    let cur = ByteCursor::new(&image.data);

    for i in 0..dir.size as usize / DEBUG_ENTRY_SIZE {
        let entry = base as usize + i * DEBUG_ENTRY_SIZE;
        let pointer = cur
            .u32(entry + 24)
            .map_err(|_| BuildError::PatchOutOfRange(entry as u32))?;
        if pointer == 0 {
            continue;
        }
        // A payload inside a section keeps its RVA; one in the headers or
        // the overlay moves with its region.
        let moved = match before.offset_to_rva(pointer) {
            Some(rva) => after.rva_to_offset(rva).ok_or(BuildError::UnmappedRva(rva))?,
            None => plan.relocate(pointer),
        };
        if moved != pointer {
            let at = plan.relocate(entry as u32 + 24) as usize;
            if at + 4 > out.len() {
                return Err(BuildError::PatchOutOfRange(entry as u32 + 24));
            }
            put_u32(out, at, moved);
        }
    }
    Ok(())
}
