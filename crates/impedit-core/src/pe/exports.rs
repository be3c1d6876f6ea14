//! Export directory reader.

use super::cursor::ByteCursor;
use super::headers::{DirectoryEntry, NtHeaders};
use super::translate::Translator;
use crate::error::ParseError;

pub const EXPORT_DIRECTORY_SIZE: usize = 40;
const MAX_EXPORTS: u32 = 65_536;

/// One exported symbol.  A function exported under several names appears
/// once per name; an ordinal-only export has no `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub name: Option<String>,
    /// RVA of the function, or of the forwarder string when `forwarder` is set.
    pub address: u32,
    /// Biased ordinal (`ordinal_base + index`).
    pub ordinal: u32,
    /// `OTHER.Function` when the export is forwarded to another module.
    pub forwarder: Option<String>,
    /// Position in the sorted name pointer table; importers use it as the hint.
    pub name_index: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportTable {
    pub module_name: String,
    pub ordinal_base: u32,
    pub entries: Vec<ExportEntry>,
}

impl ExportTable {
    /// Exact, case-sensitive name lookup.  The name table is not assumed to
    /// be sorted.
    pub fn find_name(&self, name: &str) -> Option<&ExportEntry> {
        self.entries.iter().find(|e| e.name.as_deref() == Some(name))
    }

    pub fn find_ordinal(&self, ordinal: u16) -> Option<&ExportEntry> {
        self.entries.iter().find(|e| e.ordinal == u32::from(ordinal))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub(crate) fn parse_exports(
    data: &[u8],
    nt: &NtHeaders,
    translator: &Translator<'_>,
) -> Result<Option<ExportTable>, ParseError> {
    let dir = match nt.directory(DirectoryEntry::Export) {
        Some(dir) if dir.is_present() => dir,
        _ => return Ok(None),
    };
    let cur = ByteCursor::new(data);
    let map = |what: &'static str, rva: u32| {
        translator.rva_to_offset(rva).map(|o| o as usize).ok_or(ParseError::BadRva { what, rva })
    };

    let base = map("export directory", dir.virtual_address)?;
    cur.bytes(base, EXPORT_DIRECTORY_SIZE)?;
    let name_rva = cur.u32(base + 12)?;
    let ordinal_base = cur.u32(base + 16)?;
    let function_count = cur.u32(base + 20)?;
    let name_count = cur.u32(base + 24)?;
    let functions_rva = cur.u32(base + 28)?;
    let names_rva = cur.u32(base + 32)?;
    let ordinals_rva = cur.u32(base + 36)?;

    if function_count > MAX_EXPORTS || name_count > MAX_EXPORTS {
        return Err(ParseError::UnsupportedFormat(format!(
            "export directory declares {function_count} functions and {name_count} names"
        )));
    }

    let module_name = if name_rva == 0 {
        String::new()
    } else {
        cur.cstr(map("export module name", name_rva)?)?
    };

    // Names grouped by the function index they resolve to.
    let mut names: Vec<Vec<(u32, String)>> = vec![Vec::new(); function_count as usize];
    if name_count > 0 {
        let names_at = map("export name table", names_rva)?;
        let ordinals_at = map("export ordinal table", ordinals_rva)?;
        for i in 0..name_count as usize {
            let index = cur.u16(ordinals_at + i * 2)? as usize;
            let ptr = cur.u32(names_at + i * 4)?;
            let name = cur.cstr(map("export name", ptr)?)?;
            match names.get_mut(index) {
                Some(slot) => slot.push((i as u32, name)),
                None => tracing::trace!(%name, index, "export name points past the address table"),
            }
        }
    }

    let mut entries = Vec::new();
    if function_count > 0 {
        let functions_at = map("export address table", functions_rva)?;
        for (index, named) in names.into_iter().enumerate() {
            let address = cur.u32(functions_at + index * 4)?;
            if address == 0 {
                continue;
            }
            let forwarder = if dir.contains(address) {
                Some(cur.cstr(map("export forwarder", address)?)?)
            } else {
                None
            };
            let ordinal = ordinal_base.wrapping_add(index as u32);
            if named.is_empty() {
                entries.push(ExportEntry { name: None, address, ordinal, forwarder, name_index: None });
            } else {
                for (name_index, name) in named {
                    entries.push(ExportEntry {
                        name: Some(name),
                        address,
                        ordinal,
                        forwarder: forwarder.clone(),
                        name_index: Some(name_index),
                    });
                }
            }
        }
    }

    tracing::debug!(module = %module_name, exports = entries.len(), "parsed export directory");
    Ok(Some(ExportTable { module_name, ordinal_base, entries }))
}
