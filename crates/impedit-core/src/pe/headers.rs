//! DOS, NT and section headers.
//!
//! Only the fields the editing engine reads or rewrites are modelled.  Every
//! other header byte is carried through untouched by the writer, which works
//! on a copy of the original buffer.

use bitflags::bitflags;

use super::cursor::ByteCursor;
use crate::error::{ParseError, Signature};

// ---------------------------------------------------------------------------
// Well-known constants
// ---------------------------------------------------------------------------

/// `MZ`
pub const DOS_MAGIC: u16 = 0x5A4D;
/// `PE\0\0`
pub const PE_SIGNATURE: u32 = 0x0000_4550;

/// Optional-header magic for PE32 (32-bit).
pub const PE32_MAGIC: u16 = 0x010B;
/// Optional-header magic for PE32+ (64-bit).
pub const PE32PLUS_MAGIC: u16 = 0x020B;
/// Optional-header magic for ROM images.
pub const ROM_MAGIC: u16 = 0x0107;

pub const MACHINE_I386: u16 = 0x014C;
pub const MACHINE_AMD64: u16 = 0x8664;

pub const FILE_HEADER_SIZE: usize = 20;
pub const SECTION_HEADER_SIZE: usize = 40;
pub const DATA_DIRECTORY_SIZE: usize = 8;
pub const MAX_DATA_DIRECTORIES: usize = 16;

const ARCHIVE_MAGIC: &[u8] = b"!<arch>\n";
const E_LFANEW_OFFSET: usize = 0x3C;

// Optional-header field offsets shared by both formats.
pub(crate) const OPT_SIZE_OF_INITIALIZED_DATA: usize = 8;
pub(crate) const OPT_ENTRY_POINT: usize = 16;
pub(crate) const OPT_SECTION_ALIGNMENT: usize = 32;
pub(crate) const OPT_FILE_ALIGNMENT: usize = 36;
pub(crate) const OPT_SIZE_OF_IMAGE: usize = 56;
pub(crate) const OPT_SIZE_OF_HEADERS: usize = 60;
pub(crate) const OPT_CHECKSUM: usize = 64;

// Section header field offsets.
pub(crate) const SEC_VIRTUAL_SIZE: usize = 8;
pub(crate) const SEC_VIRTUAL_ADDRESS: usize = 12;
pub(crate) const SEC_RAW_SIZE: usize = 16;
pub(crate) const SEC_RAW_OFFSET: usize = 20;
pub(crate) const SEC_CHARACTERISTICS: usize = 36;

// ---------------------------------------------------------------------------
// Structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosHeader {
    pub e_magic: u16,
    /// File offset of the `PE\0\0` signature.
    pub e_lfanew: u32,
}

/// COFF file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

/// The optional-header fields shared by PE32 and PE32+.  `image_base` is
/// zero-extended for PE32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionalHeader {
    pub magic: u16,
    pub size_of_initialized_data: u32,
    pub entry_point: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub number_of_rva_and_sizes: u32,
}

impl OptionalHeader {
    pub fn is_64bit(&self) -> bool {
        self.magic == PE32PLUS_MAGIC
    }

    /// Width of an import thunk in bytes.
    pub fn thunk_size(&self) -> u32 {
        if self.is_64bit() {
            8
        } else {
            4
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

impl DataDirectory {
    pub fn is_present(&self) -> bool {
        self.virtual_address != 0 && self.size != 0
    }

    pub fn contains(&self, rva: u32) -> bool {
        rva >= self.virtual_address && (rva - self.virtual_address) < self.size
    }
}

/// Indices into the data directory array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryEntry {
    Export = 0,
    Import = 1,
    Resource = 2,
    Exception = 3,
    /// Holds a file offset, not an RVA.
    Security = 4,
    BaseReloc = 5,
    Debug = 6,
    Architecture = 7,
    GlobalPtr = 8,
    Tls = 9,
    LoadConfig = 10,
    BoundImport = 11,
    Iat = 12,
    DelayImport = 13,
    ClrRuntime = 14,
}

impl DirectoryEntry {
    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtHeaders {
    pub file_header: FileHeader,
    pub optional_header: OptionalHeader,
    /// `min(NumberOfRvaAndSizes, 16)` entries, further limited by what fits
    /// in the declared optional-header size.
    pub data_directories: Vec<DataDirectory>,
}

impl NtHeaders {
    pub fn directory(&self, entry: DirectoryEntry) -> Option<DataDirectory> {
        self.data_directories.get(entry.index()).copied()
    }

    /// Returns `false` when the image declares too few directories to hold
    /// `entry`.
    pub(crate) fn set_directory(&mut self, entry: DirectoryEntry, dir: DataDirectory) -> bool {
        match self.data_directories.get_mut(entry.index()) {
            Some(slot) => {
                *slot = dir;
                true
            }
            None => false,
        }
    }

    pub fn is_64bit(&self) -> bool {
        self.optional_header.is_64bit()
    }
}

bitflags! {
    /// Section characteristics the engine reads or sets.  Unknown bits read
    /// from an image are retained.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SectionFlags: u32 {
        const CNT_CODE = 0x0000_0020;
        const CNT_INITIALIZED_DATA = 0x0000_0040;
        const CNT_UNINITIALIZED_DATA = 0x0000_0080;
        const MEM_DISCARDABLE = 0x0200_0000;
        const MEM_SHARED = 0x1000_0000;
        const MEM_EXECUTE = 0x2000_0000;
        const MEM_READ = 0x4000_0000;
        const MEM_WRITE = 0x8000_0000;

        const _ = !0;
    }
}

/// One row of the section table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    /// Raw 8-byte name, NUL padded.
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub raw_size: u32,
    pub raw_offset: u32,
    pub characteristics: SectionFlags,
}

impl Section {
    fn read(cur: &ByteCursor<'_>, base: usize) -> Result<Self, ParseError> {
        let mut name = [0u8; 8];
        name.copy_from_slice(cur.bytes(base, 8)?);
        Ok(Section {
            name,
            virtual_size: cur.u32(base + SEC_VIRTUAL_SIZE)?,
            virtual_address: cur.u32(base + SEC_VIRTUAL_ADDRESS)?,
            raw_size: cur.u32(base + SEC_RAW_SIZE)?,
            raw_offset: cur.u32(base + SEC_RAW_OFFSET)?,
            characteristics: SectionFlags::from_bits_retain(cur.u32(base + SEC_CHARACTERISTICS)?),
        })
    }

    /// The name with trailing NULs trimmed; non-UTF-8 names read as
    /// `"<invalid>"`.
    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..len]).unwrap_or("<invalid>")
    }

    /// Virtual span used for RVA lookups.  Some linkers leave `VirtualSize`
    /// zero, in which case the raw size stands in.
    pub fn virtual_extent(&self) -> u32 {
        if self.virtual_size == 0 {
            self.raw_size
        } else {
            self.virtual_size
        }
    }

    pub fn virtual_end(&self) -> u64 {
        u64::from(self.virtual_address) + u64::from(self.virtual_extent())
    }

    pub fn raw_end(&self) -> u64 {
        u64::from(self.raw_offset) + u64::from(self.raw_size)
    }

    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.virtual_address && u64::from(rva) < self.virtual_end()
    }
}

/// Absolute file offsets of the header structures, fixed at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLayout {
    pub nt_offset: usize,
    pub opt_offset: usize,
    pub data_directory_offset: usize,
    pub section_table_offset: usize,
}

impl HeaderLayout {
    pub fn checksum_offset(&self) -> usize {
        self.opt_offset + OPT_CHECKSUM
    }

    pub fn section_row_offset(&self, index: usize) -> usize {
        self.section_table_offset + index * SECTION_HEADER_SIZE
    }

    pub fn directory_offset(&self, entry: DirectoryEntry) -> usize {
        self.data_directory_offset + entry.index() * DATA_DIRECTORY_SIZE
    }
}

/// Everything read from the header region of an image.
#[derive(Debug, Clone)]
pub(crate) struct HeaderSet {
    pub dos: DosHeader,
    pub nt: NtHeaders,
    pub sections: Vec<Section>,
    pub layout: HeaderLayout,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

pub(crate) fn parse_headers(data: &[u8]) -> Result<HeaderSet, ParseError> {
    if data.starts_with(ARCHIVE_MAGIC) {
        return Err(ParseError::UnsupportedFormat("static library archive".into()));
    }
    let cur = ByteCursor::new(data);

    let e_magic = cur.u16(0)?;
    if e_magic != DOS_MAGIC {
        return Err(ParseError::BadSignature(Signature::Dos));
    }
    let e_lfanew = cur.u32(E_LFANEW_OFFSET)?;
    let dos = DosHeader { e_magic, e_lfanew };

    let nt_offset = e_lfanew as usize;
    if cur.u32(nt_offset)? != PE_SIGNATURE {
        return Err(ParseError::BadSignature(Signature::Nt));
    }

    let fh = nt_offset + 4;
    let file_header = FileHeader {
        machine: cur.u16(fh)?,
        number_of_sections: cur.u16(fh + 2)?,
        time_date_stamp: cur.u32(fh + 4)?,
        size_of_optional_header: cur.u16(fh + 16)?,
        characteristics: cur.u16(fh + 18)?,
    };
    if file_header.size_of_optional_header == 0 {
        return Err(ParseError::UnsupportedFormat("object file without an optional header".into()));
    }

    let opt_offset = fh + FILE_HEADER_SIZE;
    let opt_size = file_header.size_of_optional_header as usize;
    let magic = cur.u16(opt_offset)?;
    let (image_base, nrva_rel, dirs_rel) = match magic {
        PE32_MAGIC => (u64::from(cur.u32(opt_offset + 28)?), 92, 96),
        PE32PLUS_MAGIC => (cur.u64(opt_offset + 24)?, 108, 112),
        ROM_MAGIC => return Err(ParseError::UnsupportedFormat("ROM image".into())),
        other => {
            return Err(ParseError::UnsupportedFormat(format!(
                "unknown optional header magic {other:#06x}"
            )))
        }
    };
    if opt_size < dirs_rel {
        return Err(ParseError::UnsupportedFormat(format!(
            "optional header too small ({opt_size} bytes)"
        )));
    }

    let optional_header = OptionalHeader {
        magic,
        size_of_initialized_data: cur.u32(opt_offset + OPT_SIZE_OF_INITIALIZED_DATA)?,
        entry_point: cur.u32(opt_offset + OPT_ENTRY_POINT)?,
        image_base,
        section_alignment: cur.u32(opt_offset + OPT_SECTION_ALIGNMENT)?,
        file_alignment: cur.u32(opt_offset + OPT_FILE_ALIGNMENT)?,
        size_of_image: cur.u32(opt_offset + OPT_SIZE_OF_IMAGE)?,
        size_of_headers: cur.u32(opt_offset + OPT_SIZE_OF_HEADERS)?,
        checksum: cur.u32(opt_offset + OPT_CHECKSUM)?,
        number_of_rva_and_sizes: cur.u32(opt_offset + nrva_rel)?,
    };
    for (what, value) in [
        ("section", optional_header.section_alignment),
        ("file", optional_header.file_alignment),
    ] {
        if !value.is_power_of_two() {
            return Err(ParseError::UnsupportedFormat(format!(
                "{what} alignment {value:#x} is not a power of two"
            )));
        }
    }

    let data_directory_offset = opt_offset + dirs_rel;
    let fits = (opt_size - dirs_rel) / DATA_DIRECTORY_SIZE;
    let count = (optional_header.number_of_rva_and_sizes as usize)
        .min(MAX_DATA_DIRECTORIES)
        .min(fits);
    let data_directories = (0..count)
        .map(|i| {
            let base = data_directory_offset + i * DATA_DIRECTORY_SIZE;
            Ok(DataDirectory { virtual_address: cur.u32(base)?, size: cur.u32(base + 4)? })
        })
        .collect::<Result<Vec<_>, ParseError>>()?;

    let section_table_offset = opt_offset + opt_size;
    let sections = (0..file_header.number_of_sections as usize)
        .map(|i| Section::read(&cur, section_table_offset + i * SECTION_HEADER_SIZE))
        .collect::<Result<Vec<_>, ParseError>>()?;

    for pair in sections.windows(2) {
        if u64::from(pair[1].virtual_address) < pair[0].virtual_end() {
            return Err(ParseError::UnsupportedFormat(format!(
                "sections {} and {} are unordered or overlap",
                pair[0].name_str(),
                pair[1].name_str()
            )));
        }
    }

    tracing::debug!(
        machine = format_args!("{:#06x}", file_header.machine),
        sections = sections.len(),
        directories = data_directories.len(),
        pe32_plus = optional_header.is_64bit(),
        "parsed headers"
    );

    Ok(HeaderSet {
        dos,
        nt: NtHeaders { file_header, optional_header, data_directories },
        sections,
        layout: HeaderLayout {
            nt_offset,
            opt_offset,
            data_directory_offset,
            section_table_offset,
        },
    })
}
