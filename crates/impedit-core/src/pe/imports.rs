//! Import directory model and parser.
//!
//! Descriptors and entries remember where they came from in the original
//! buffer (`origin`) so the layout pass can copy untouched descriptors
//! byte-for-byte and compact tables in place after a removal.

use std::fmt;

use super::cursor::ByteCursor;
use super::headers::{DirectoryEntry, NtHeaders};
use super::translate::Translator;
use crate::edit::symbol::SymbolRef;
use crate::error::ParseError;

/// Size of an `IMAGE_IMPORT_DESCRIPTOR`.
pub const IMPORT_DESCRIPTOR_SIZE: usize = 20;

const MAX_DESCRIPTORS: usize = 4096;
const MAX_THUNKS: u32 = 65_536;

pub(crate) const ORDINAL_FLAG_32: u64 = 0x8000_0000;
pub(crate) const ORDINAL_FLAG_64: u64 = 0x8000_0000_0000_0000;
const HINT_NAME_RVA_MASK: u64 = 0x7FFF_FFFF;

pub(crate) fn ordinal_flag(wide: bool) -> u64 {
    if wide {
        ORDINAL_FLAG_64
    } else {
        ORDINAL_FLAG_32
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How an import slot is resolved by the loader.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImportKind {
    /// Resolved by name; `hint` is the expected index into the exporting
    /// module's name table.
    ByName { name: String, hint: u16 },
    ByOrdinal(u16),
}

impl ImportKind {
    pub fn matches(&self, symbol: &SymbolRef) -> bool {
        match (self, symbol) {
            (ImportKind::ByName { name, .. }, SymbolRef::Name(wanted)) => name == wanted,
            (ImportKind::ByOrdinal(ord), SymbolRef::Ordinal(wanted)) => ord == wanted,
            _ => false,
        }
    }
}

impl fmt::Display for ImportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportKind::ByName { name, .. } => f.write_str(name),
            ImportKind::ByOrdinal(ord) => write!(f, "#{ord}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryOrigin {
    /// Read from slot `slot` of the original tables; `thunk` is the raw
    /// lookup-table value.
    Parsed { slot: u32, thunk: u64 },
    /// Added in this session and not yet laid out.
    Appended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    pub kind: ImportKind,
    /// RVA of the IAT slot the loader fills for this entry.  Zero for an
    /// appended entry until the layout pass places it.
    pub iat_rva: u32,
    pub(crate) origin: EntryOrigin,
}

impl ImportEntry {
    pub(crate) fn appended(kind: ImportKind) -> Self {
        ImportEntry { kind, iat_rva: 0, origin: EntryOrigin::Appended }
    }

    pub(crate) fn is_parsed(&self) -> bool {
        matches!(self.origin, EntryOrigin::Parsed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DescriptorOrigin {
    /// Lives at file offset `offset`; its tables originally held `slots`
    /// entries before the terminator.
    Parsed { offset: u32, slots: u32 },
    Added,
}

/// One module in the import directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDescriptor {
    pub module_name: String,
    pub import_lookup_table_rva: u32,
    pub import_address_table_rva: u32,
    pub name_rva: u32,
    pub time_date_stamp: u32,
    pub forwarder_chain: u32,
    pub entries: Vec<ImportEntry>,
    pub(crate) origin: DescriptorOrigin,
}

impl ImportDescriptor {
    pub(crate) fn added(module_name: String) -> Self {
        ImportDescriptor {
            module_name,
            import_lookup_table_rva: 0,
            import_address_table_rva: 0,
            name_rva: 0,
            time_date_stamp: 0,
            forwarder_chain: 0,
            entries: Vec::new(),
            origin: DescriptorOrigin::Added,
        }
    }

    pub fn find(&self, symbol: &SymbolRef) -> Option<&ImportEntry> {
        self.entries.iter().find(|e| e.kind.matches(symbol))
    }

    pub(crate) fn position(&self, symbol: &SymbolRef) -> Option<usize> {
        self.entries.iter().position(|e| e.kind.matches(symbol))
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

pub(crate) fn parse_imports(
    data: &[u8],
    nt: &NtHeaders,
    translator: &Translator<'_>,
) -> Result<Vec<ImportDescriptor>, ParseError> {
    let dir = match nt.directory(DirectoryEntry::Import) {
        Some(dir) if dir.is_present() => dir,
        _ => return Ok(Vec::new()),
    };
    let cur = ByteCursor::new(data);
    let wide = nt.is_64bit();
    let map = |what: &'static str, rva: u32| {
        translator.rva_to_offset(rva).map(|o| o as usize).ok_or(ParseError::BadRva { what, rva })
    };

    let base = map("import directory", dir.virtual_address)?;
    let mut descriptors = Vec::new();

    for i in 0..MAX_DESCRIPTORS {
        let offset = base + i * IMPORT_DESCRIPTOR_SIZE;
        let raw = cur.bytes(offset, IMPORT_DESCRIPTOR_SIZE)?;
        if raw.iter().all(|&b| b == 0) {
            break;
        }
        let ilt = cur.u32(offset)?;
        let time_date_stamp = cur.u32(offset + 4)?;
        let forwarder_chain = cur.u32(offset + 8)?;
        let name_rva = cur.u32(offset + 12)?;
        let iat = cur.u32(offset + 16)?;
        if name_rva == 0 && iat == 0 {
            break;
        }

        let module_name = cur.cstr(map("module name", name_rva)?)?;
        let lookup = if ilt != 0 { ilt } else { iat };
        let entries = parse_thunks(&cur, translator, lookup, iat, wide)?;
        tracing::trace!(module = %module_name, entries = entries.len(), "import descriptor");

        descriptors.push(ImportDescriptor {
            module_name,
            import_lookup_table_rva: ilt,
            import_address_table_rva: iat,
            name_rva,
            time_date_stamp,
            forwarder_chain,
            origin: DescriptorOrigin::Parsed {
                offset: offset as u32,
                slots: entries.len() as u32,
            },
            entries,
        });
    }

    Ok(descriptors)
}

fn parse_thunks(
    cur: &ByteCursor<'_>,
    translator: &Translator<'_>,
    lookup_rva: u32,
    iat_rva: u32,
    wide: bool,
) -> Result<Vec<ImportEntry>, ParseError> {
    let thunk_size: u32 = if wide { 8 } else { 4 };
    let flag = ordinal_flag(wide);
    let mut entries = Vec::new();

    for slot in 0..MAX_THUNKS {
        let rva = lookup_rva.wrapping_add(slot * thunk_size);
        let offset = translator
            .rva_to_offset(rva)
            .ok_or(ParseError::BadRva { what: "import lookup table", rva })?;
        let thunk = cur.thunk(offset as usize, wide)?;
        if thunk == 0 {
            return Ok(entries);
        }

        let kind = if thunk & flag != 0 {
            ImportKind::ByOrdinal((thunk & 0xFFFF) as u16)
        } else {
            let hint_rva = (thunk & HINT_NAME_RVA_MASK) as u32;
            let at = translator
                .rva_to_offset(hint_rva)
                .ok_or(ParseError::BadRva { what: "hint/name entry", rva: hint_rva })?
                as usize;
            ImportKind::ByName { hint: cur.u16(at)?, name: cur.cstr(at + 2)? }
        };

        entries.push(ImportEntry {
            kind,
            iat_rva: iat_rva.wrapping_add(slot * thunk_size),
            origin: EntryOrigin::Parsed { slot, thunk },
        });
    }

    Err(ParseError::UnsupportedFormat(format!(
        "import table at {lookup_rva:#x} has more than {MAX_THUNKS} entries"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::headers::parse_headers;
    use crate::testing::PeFixture;

    fn parse(data: &[u8]) -> Result<Vec<ImportDescriptor>, ParseError> {
        let set = parse_headers(data).unwrap();
        parse_imports(data, &set.nt, &Translator::new(&set.sections))
    }

    #[test]
    fn reads_modules_and_names_in_order() {
        let data = PeFixture::new()
            .import("kernel32.dll", &["ExitProcess", "GetLastError"])
            .import("user32.dll", &["MessageBoxW"])
            .build();
        let descs = parse(&data).unwrap();
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].module_name, "kernel32.dll");
        let names: Vec<String> = descs[0].entries.iter().map(|e| e.kind.to_string()).collect();
        assert_eq!(names, ["ExitProcess", "GetLastError"]);
        assert_eq!(descs[1].module_name, "user32.dll");
        assert_eq!(descs[0].entries[1].iat_rva, descs[0].import_address_table_rva + 8);
        assert!(descs[0].entries.iter().all(ImportEntry::is_parsed));
    }

    #[test]
    fn decodes_ordinals_for_both_widths() {
        for fixture in [PeFixture::new(), PeFixture::pe32()] {
            let data = fixture.import("ws2_32.dll", &["#23", "WSAStartup"]).build();
            let descs = parse(&data).unwrap();
            assert_eq!(descs[0].entries[0].kind, ImportKind::ByOrdinal(23));
            assert!(matches!(
                &descs[0].entries[1].kind,
                ImportKind::ByName { name, .. } if name == "WSAStartup"
            ));
        }
    }

    #[test]
    fn falls_back_to_iat_when_lookup_table_missing() {
        let mut data = PeFixture::new().import("kernel32.dll", &["Sleep"]).build();
        let descs = parse(&data).unwrap();
        let DescriptorOrigin::Parsed { offset, .. } = descs[0].origin else {
            panic!("parsed descriptor expected");
        };
        data[offset as usize..offset as usize + 4].fill(0);
        let descs = parse(&data).unwrap();
        assert_eq!(descs[0].import_lookup_table_rva, 0);
        assert_eq!(descs[0].entries[0].kind.to_string(), "Sleep");
    }

    #[test]
    fn no_import_directory_is_empty() {
        let data = PeFixture::new().build();
        assert!(parse(&data).unwrap().is_empty());
    }

    #[test]
    fn unmapped_name_rva_is_reported() {
        let mut data = PeFixture::new().import("kernel32.dll", &["Sleep"]).build();
        let descs = parse(&data).unwrap();
        let DescriptorOrigin::Parsed { offset, .. } = descs[0].origin else {
            panic!("parsed descriptor expected");
        };
        let at = offset as usize + 12;
        data[at..at + 4].copy_from_slice(&0x00F0_0000u32.to_le_bytes());
        assert_eq!(
            parse(&data).unwrap_err(),
            ParseError::BadRva { what: "module name", rva: 0x00F0_0000 }
        );
    }

    #[test]
    fn kind_matching_distinguishes_names_and_ordinals() {
        let by_name = ImportKind::ByName { name: "Sleep".into(), hint: 0 };
        assert!(by_name.matches(&SymbolRef::Name("Sleep".into())));
        assert!(!by_name.matches(&SymbolRef::Name("sleep".into())));
        assert!(!by_name.matches(&SymbolRef::Ordinal(1)));
        assert!(ImportKind::ByOrdinal(7).matches(&SymbolRef::Ordinal(7)));
        assert_eq!(ImportKind::ByOrdinal(7).to_string(), "#7");
    }
}
