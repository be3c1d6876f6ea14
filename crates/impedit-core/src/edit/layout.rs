//! Import layout planning.
//!
//! A plan is always computed from the original bytes plus the current
//! import model, never from a previous plan, so repeated edits converge on
//! the same result as a single combined edit.
//!
//! Two kinds of change are produced:
//!
//! * **patches**: in-place rewrites of existing lookup/address tables and of
//!   the descriptor array when entries or whole descriptors are removed;
//! * **a new section** holding a fresh descriptor array plus the tables and
//!   strings of every appended entry.  Untouched descriptors are copied into
//!   it verbatim and keep pointing at their original tables, and entries
//!   appended to an existing module get a continuation descriptor that
//!   reuses the module's name string.  No IAT slot referenced by existing
//!   code ever moves.

use crate::error::BuildError;
use crate::pe::cursor::{align_up, put_thunk, put_u16, put_u32};
use crate::pe::headers::{
    DataDirectory, DirectoryEntry, HeaderLayout, NtHeaders, Section, SectionFlags,
    SECTION_HEADER_SIZE,
};
use crate::pe::imports::{
    ordinal_flag, DescriptorOrigin, EntryOrigin, ImportDescriptor, ImportEntry, ImportKind,
    IMPORT_DESCRIPTOR_SIZE,
};
use crate::pe::translate::Translator;

const DESC: u32 = IMPORT_DESCRIPTOR_SIZE as u32;

/// Read-only view of the image as it was parsed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LayoutContext<'a> {
    pub data: &'a [u8],
    pub nt: &'a NtHeaders,
    pub sections: &'a [Section],
    pub layout: HeaderLayout,
    pub data_end: usize,
    pub original_descriptors: usize,
}

impl<'a> LayoutContext<'a> {
    fn translator(&self) -> Translator<'a> {
        Translator::new(self.sections)
    }

    fn thunk_size(&self) -> u32 {
        self.nt.optional_header.thunk_size()
    }

    fn headers_end(&self) -> usize {
        (self.nt.optional_header.size_of_headers as usize).min(self.data.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Patch {
    /// Offset in the original file.
    pub offset: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NewSection {
    pub header: Section,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ImportPlan {
    pub patches: Vec<Patch>,
    pub new_section: Option<NewSection>,
    pub import_directory: DataDirectory,
    /// Bytes inserted after the original header region.
    pub header_growth: u32,
    /// Original header region end; raw data from here on moves by
    /// `header_growth`.
    pub headers_end: u32,
    /// Original end of section data; the overlay starts here.
    pub data_end: u32,
}

impl ImportPlan {
    /// Where the overlay lands in the output.
    pub fn overlay_start(&self) -> u32 {
        match &self.new_section {
            Some(s) => s.header.raw_offset + s.header.raw_size,
            None => self.data_end + self.header_growth,
        }
    }

    /// Map a file offset in the original buffer to its output position.
    pub fn relocate(&self, offset: u32) -> u32 {
        if offset >= self.data_end {
            (offset - self.data_end).saturating_add(self.overlay_start())
        } else if offset >= self.headers_end {
            offset.saturating_add(self.header_growth)
        } else {
            offset
        }
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Lay out the current import model.  Fills in the RVAs of appended entries
/// and descriptors as a side effect.  Returns `None` when the model matches
/// the original image.
pub(crate) fn plan(
    ctx: &LayoutContext<'_>,
    imports: &mut [ImportDescriptor],
    section_name: &str,
) -> Result<Option<ImportPlan>, BuildError> {
    let original_dir = ctx
        .nt
        .directory(DirectoryEntry::Import)
        .ok_or(BuildError::NoImportDirectory)?;
    let headers_end = ctx.headers_end() as u32;
    let data_end = u32::try_from(ctx.data_end).map_err(|_| BuildError::TooLarge)?;

    let mut patches = compact_tables(ctx, imports)?;
    let kept_rows = imports.iter().filter_map(kept_row).count();
    let appended = imports.iter().any(|d| d.entries.iter().any(|e| !e.is_parsed()));

    if !appended {
        if patches.is_empty() && kept_rows == ctx.original_descriptors {
            return Ok(None);
        }
        let import_directory = if kept_rows == ctx.original_descriptors {
            original_dir
        } else {
            let (patch, dir) = rewrite_descriptor_array(ctx, imports, original_dir)?;
            patches.push(patch);
            dir
        };
        tracing::debug!(patches = patches.len(), "import layout fits in place");
        return Ok(Some(ImportPlan {
            patches,
            new_section: None,
            import_directory,
            header_growth: 0,
            headers_end,
            data_end,
        }));
    }

    let name = pick_section_name(ctx.sections, section_name)?;
    let header_growth = header_growth(ctx)?;
    let (new_section, import_directory) =
        build_import_section(ctx, imports, name, header_growth)?;
    tracing::debug!(
        section = new_section.header.name_str(),
        rva = format_args!("{:#x}", new_section.header.virtual_address),
        raw_offset = format_args!("{:#x}", new_section.header.raw_offset),
        header_growth,
        "appending import section"
    );

    Ok(Some(ImportPlan {
        patches,
        new_section: Some(new_section),
        import_directory,
        header_growth,
        headers_end,
        data_end,
    }))
}

/// Derive the post-edit headers and section table from the originals.
pub(crate) fn apply(
    ctx: &LayoutContext<'_>,
    plan: &ImportPlan,
) -> Result<(NtHeaders, Vec<Section>), BuildError> {
    let mut nt = ctx.nt.clone();
    let mut sections = ctx.sections.to_vec();
    let opt = &mut nt.optional_header;

    if plan.header_growth > 0 {
        for section in sections.iter_mut().filter(|s| s.raw_offset >= plan.headers_end) {
            section.raw_offset = section
                .raw_offset
                .checked_add(plan.header_growth)
                .ok_or(BuildError::TooLarge)?;
        }
        opt.size_of_headers += plan.header_growth;
    }

    if let Some(new) = &plan.new_section {
        let header = new.header;
        sections.push(header);
        nt.file_header.number_of_sections = nt
            .file_header
            .number_of_sections
            .checked_add(1)
            .ok_or(BuildError::TooLarge)?;
        opt.size_of_initialized_data = opt
            .size_of_initialized_data
            .checked_add(header.raw_size)
            .ok_or(BuildError::TooLarge)?;
        opt.size_of_image = align_up(
            header.virtual_address.checked_add(header.virtual_size).ok_or(BuildError::TooLarge)?,
            opt.section_alignment,
        )
        .ok_or(BuildError::TooLarge)?;
    }

    if !nt.set_directory(DirectoryEntry::Import, plan.import_directory) {
        return Err(BuildError::NoImportDirectory);
    }
    if nt.directory(DirectoryEntry::BoundImport).is_some_and(|d| d.is_present()) {
        nt.set_directory(DirectoryEntry::BoundImport, DataDirectory::default());
    }
    if let Some(mut security) = nt.directory(DirectoryEntry::Security).filter(|d| d.is_present()) {
        // The security directory holds a file offset, not an RVA.
        security.virtual_address = plan.relocate(security.virtual_address);
        nt.set_directory(DirectoryEntry::Security, security);
    }

    Ok((nt, sections))
}

/// File offset of the original descriptor row that stays in the array.
/// Only a descriptor emptied by removals loses its row; one that never had
/// entries still makes the loader map its module.
fn kept_row(desc: &ImportDescriptor) -> Option<usize> {
    match desc.origin {
        DescriptorOrigin::Parsed { offset, slots }
            if slots == 0 || desc.entries.iter().any(ImportEntry::is_parsed) =>
        {
            Some(offset as usize)
        }
        _ => None,
    }
}

fn original_row<'a>(ctx: &LayoutContext<'a>, offset: usize) -> Result<&'a [u8], BuildError> {
    ctx.data
        .get(offset..offset + IMPORT_DESCRIPTOR_SIZE)
        .ok_or(BuildError::PatchOutOfRange(offset as u32))
}

/// Rewrite the lookup and address tables of every descriptor that lost
/// entries, keeping the survivors in order and moving the terminator up.
fn compact_tables(
    ctx: &LayoutContext<'_>,
    imports: &mut [ImportDescriptor],
) -> Result<Vec<Patch>, BuildError> {
    let translator = ctx.translator();
    let wide = ctx.nt.is_64bit();
    let ts = ctx.thunk_size();
    let mut patches = Vec::new();

    for desc in imports.iter_mut() {
        let DescriptorOrigin::Parsed { offset, slots } = desc.origin else {
            continue;
        };
        let kept: Vec<u64> = desc
            .entries
            .iter()
            .filter_map(|e| match e.origin {
                EntryOrigin::Parsed { thunk, .. } => Some(thunk),
                EntryOrigin::Appended => None,
            })
            .collect();
        if kept.len() as u32 == slots {
            continue;
        }

        let len = (slots + 1) * ts;
        let mut table = vec![0u8; len as usize];
        for (k, &thunk) in kept.iter().enumerate() {
            put_thunk(&mut table, k * ts as usize, thunk, wide);
        }

        let iat = desc.import_address_table_rva;
        let ilt = desc.import_lookup_table_rva;
        let tables = if ilt != 0 && ilt != iat { vec![ilt, iat] } else { vec![iat] };
        for rva in tables {
            let at = translator.range_to_offset(rva, len).ok_or(BuildError::UnmappedRva(rva))?;
            patches.push(Patch { offset: at, bytes: table.clone() });
        }

        // A bound IAT no longer matches its descriptor once slots move.
        let stamp_at = offset as usize + 4;
        if original_row(ctx, offset as usize)?[4..8].iter().any(|&b| b != 0) {
            patches.push(Patch { offset: stamp_at as u32, bytes: vec![0; 4] });
        }
        desc.time_date_stamp = 0;

        for (k, entry) in desc.entries.iter_mut().filter(|e| e.is_parsed()).enumerate() {
            entry.iat_rva = iat + k as u32 * ts;
        }
        tracing::debug!(module = %desc.module_name, kept = kept.len(), slots, "compacted import tables");
    }

    Ok(patches)
}

/// Shrink the descriptor array in place after whole descriptors were
/// dropped.
fn rewrite_descriptor_array(
    ctx: &LayoutContext<'_>,
    imports: &[ImportDescriptor],
    original_dir: DataDirectory,
) -> Result<(Patch, DataDirectory), BuildError> {
    let rows = (ctx.original_descriptors as u32 + 1) * DESC;
    let offset = ctx
        .translator()
        .range_to_offset(original_dir.virtual_address, rows)
        .ok_or(BuildError::UnmappedRva(original_dir.virtual_address))?;

    let mut bytes = vec![0u8; rows as usize];
    let mut kept = 0usize;
    for (desc, row) in imports.iter().filter_map(|d| kept_row(d).map(|row| (d, row))) {
        let at = kept * IMPORT_DESCRIPTOR_SIZE;
        bytes[at..at + IMPORT_DESCRIPTOR_SIZE].copy_from_slice(original_row(ctx, row)?);
        put_u32(&mut bytes, at + 4, desc.time_date_stamp);
        kept += 1;
    }

    let dir = if kept == 0 {
        DataDirectory::default()
    } else {
        DataDirectory {
            virtual_address: original_dir.virtual_address,
            size: (kept as u32 + 1) * DESC,
        }
    };
    tracing::debug!(descriptors = kept, "rewrote descriptor array in place");
    Ok((Patch { offset, bytes }, dir))
}

/// First unused name among `base`, `base2` ... `base9`.
fn pick_section_name(existing: &[Section], base: &str) -> Result<[u8; 8], BuildError> {
    if base.is_empty() || base.len() > 8 {
        return Err(BuildError::SectionName(base.to_string()));
    }
    let candidates = std::iter::once(base.to_string()).chain((2..=9).map(|n| format!("{base}{n}")));
    for candidate in candidates.filter(|c| c.len() <= 8) {
        if existing.iter().all(|s| s.name_str() != candidate) {
            let mut name = [0u8; 8];
            name[..candidate.len()].copy_from_slice(candidate.as_bytes());
            return Ok(name);
        }
    }
    Err(BuildError::NoSectionName(base.to_string()))
}

/// Bytes the header region must grow by to fit one more section row.
fn header_growth(ctx: &LayoutContext<'_>) -> Result<u32, BuildError> {
    let soh = ctx.nt.optional_header.size_of_headers as usize;
    let first_section = ctx.sections.iter().map(|s| s.virtual_address).min().unwrap_or(u32::MAX);
    let row_start = ctx.layout.section_row_offset(ctx.sections.len());
    let row_end = row_start + SECTION_HEADER_SIZE;

    // Bound-import data often sits right after the section table; it is
    // discarded with the directory, so its bytes count as free.
    let bound = ctx.nt.directory(DirectoryEntry::BoundImport).filter(|d| d.is_present());
    let free = |at: usize| {
        ctx.data.get(at).map_or(true, |&b| b == 0)
            || bound.is_some_and(|d| d.contains(at as u32))
    };
    if !(row_start..row_end.min(soh)).all(free) {
        return Err(BuildError::NoHeaderRoom { first_section });
    }
    if row_end <= soh {
        return Ok(0);
    }

    let growth = align_up((row_end - soh) as u32, ctx.nt.optional_header.file_alignment)
        .ok_or(BuildError::TooLarge)?;
    if u64::from(soh as u32) + u64::from(growth) > u64::from(first_section) {
        return Err(BuildError::NoHeaderRoom { first_section });
    }
    Ok(growth)
}

enum Row {
    /// An original descriptor copied verbatim.
    Copy { desc: usize, offset: usize },
    /// A descriptor whose tables live in the new section; indexes `fresh`.
    Fresh(usize),
}

struct HintName {
    rva: u32,
    hint: u16,
    name: String,
}

struct FreshTables {
    desc: usize,
    /// Indices of the entries placed in this descriptor's tables.
    entries: Vec<usize>,
    thunks: Vec<u64>,
    hint_names: Vec<HintName>,
    ilt: u32,
    iat: u32,
    name: u32,
}

fn build_import_section(
    ctx: &LayoutContext<'_>,
    imports: &mut [ImportDescriptor],
    name: [u8; 8],
    header_growth: u32,
) -> Result<(NewSection, DataDirectory), BuildError> {
    let opt = &ctx.nt.optional_header;
    let wide = ctx.nt.is_64bit();
    let ts = ctx.thunk_size();
    let flag = ordinal_flag(wide);
    let too_large = |_| BuildError::TooLarge;

    let virtual_end = ctx
        .sections
        .iter()
        .map(Section::virtual_end)
        .max()
        .unwrap_or(u64::from(opt.size_of_headers));
    let va = align_up(u32::try_from(virtual_end).map_err(too_large)?, opt.section_alignment)
        .ok_or(BuildError::TooLarge)?;

    // -- rows ---------------------------------------------------------------
    let mut rows = Vec::new();
    let mut fresh = Vec::new();
    for (d, desc) in imports.iter().enumerate() {
        if let Some(offset) = kept_row(desc) {
            rows.push(Row::Copy { desc: d, offset });
        }
        let entries: Vec<usize> = (0..desc.entries.len()).filter(|&i| !desc.entries[i].is_parsed()).collect();
        if !entries.is_empty() {
            rows.push(Row::Fresh(fresh.len()));
            fresh.push(FreshTables {
                desc: d,
                entries,
                thunks: Vec::new(),
                hint_names: Vec::new(),
                ilt: 0,
                iat: 0,
                name: desc.name_rva,
            });
        }
    }

    // -- offsets ------------------------------------------------------------
    let mut size = (rows.len() as u32 + 1) * DESC;
    size = align_up(size, 8).ok_or(BuildError::TooLarge)?;

    for tables in fresh.iter_mut() {
        tables.ilt = va + size;
        size += (tables.entries.len() as u32 + 1) * ts;
    }
    for tables in fresh.iter_mut() {
        tables.iat = va + size;
        size += (tables.entries.len() as u32 + 1) * ts;
    }
    for tables in fresh.iter_mut() {
        let desc = &imports[tables.desc];
        for &i in &tables.entries {
            let thunk = match &desc.entries[i].kind {
                ImportKind::ByName { name, hint } => {
                    size = align_up(size, 2).ok_or(BuildError::TooLarge)?;
                    let rva = va + size;
                    size += 2 + name.len() as u32 + 1;
                    tables.hint_names.push(HintName { rva, hint: *hint, name: name.clone() });
                    u64::from(rva)
                }
                ImportKind::ByOrdinal(ord) => flag | u64::from(*ord),
            };
            tables.thunks.push(thunk);
        }
    }
    for tables in fresh.iter_mut() {
        let desc = &imports[tables.desc];
        if matches!(desc.origin, DescriptorOrigin::Added) {
            tables.name = va + size;
            size += desc.module_name.len() as u32 + 1;
        }
    }
    va.checked_add(size).ok_or(BuildError::TooLarge)?;

    // -- bytes --------------------------------------------------------------
    let mut data = vec![0u8; size as usize];
    let local = |rva: u32| (rva - va) as usize;

    for (r, row) in rows.iter().enumerate() {
        let at = r * IMPORT_DESCRIPTOR_SIZE;
        match *row {
            Row::Copy { desc, offset } => {
                data[at..at + IMPORT_DESCRIPTOR_SIZE].copy_from_slice(original_row(ctx, offset)?);
                put_u32(&mut data, at + 4, imports[desc].time_date_stamp);
            }
            Row::Fresh(f) => {
                let tables = &fresh[f];
                put_u32(&mut data, at, tables.ilt);
                put_u32(&mut data, at + 12, tables.name);
                put_u32(&mut data, at + 16, tables.iat);
            }
        }
    }

    for tables in &fresh {
        for (k, &thunk) in tables.thunks.iter().enumerate() {
            let slot = k * ts as usize;
            put_thunk(&mut data, local(tables.ilt) + slot, thunk, wide);
            put_thunk(&mut data, local(tables.iat) + slot, thunk, wide);
        }
        for entry in &tables.hint_names {
            let o = local(entry.rva);
            put_u16(&mut data, o, entry.hint);
            data[o + 2..o + 2 + entry.name.len()].copy_from_slice(entry.name.as_bytes());
        }
        let desc = &imports[tables.desc];
        if matches!(desc.origin, DescriptorOrigin::Added) {
            let o = local(tables.name);
            data[o..o + desc.module_name.len()].copy_from_slice(desc.module_name.as_bytes());
        }
    }

    // -- model --------------------------------------------------------------
    for tables in &fresh {
        let desc = &mut imports[tables.desc];
        if matches!(desc.origin, DescriptorOrigin::Added) {
            desc.import_lookup_table_rva = tables.ilt;
            desc.import_address_table_rva = tables.iat;
            desc.name_rva = tables.name;
        }
        for (k, &i) in tables.entries.iter().enumerate() {
            desc.entries[i].iat_rva = tables.iat + k as u32 * ts;
        }
    }

    let data_end = u32::try_from(ctx.data_end).map_err(too_large)?;
    let raw_offset = data_end
        .checked_add(header_growth)
        .and_then(|end| align_up(end, opt.file_alignment))
        .ok_or(BuildError::TooLarge)?;
    let raw_size = align_up(size, opt.file_alignment).ok_or(BuildError::TooLarge)?;
    raw_offset.checked_add(raw_size).ok_or(BuildError::TooLarge)?;

    let header = Section {
        name,
        virtual_size: size,
        virtual_address: va,
        raw_size,
        raw_offset,
        characteristics: SectionFlags::CNT_INITIALIZED_DATA
            | SectionFlags::MEM_READ
            | SectionFlags::MEM_WRITE,
    };
    let dir = DataDirectory { virtual_address: va, size: (rows.len() as u32 + 1) * DESC };
    Ok((NewSection { header, data }, dir))
}
