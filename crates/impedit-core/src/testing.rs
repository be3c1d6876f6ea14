//! Synthetic PE images for tests.
//!
//! [`PeFixture`] lays out a small but loader-shaped image: `.text` at RVA
//! `0x1000`, imports in `.rdata` at `0x2000`, and optionally an `.edata`
//! section with exports right after it.  File alignment is `0x200` and
//! section alignment `0x1000`.

use crate::pe::checksum::pe_checksum;
use crate::pe::cursor::{align_up, put_thunk, put_u16, put_u32, put_u64};
use crate::pe::headers::{
    DirectoryEntry, DOS_MAGIC, MACHINE_AMD64, MACHINE_I386, OPT_CHECKSUM, PE32PLUS_MAGIC,
    PE32_MAGIC, PE_SIGNATURE,
};
use crate::pe::imports::ordinal_flag;

const FILE_ALIGNMENT: u32 = 0x200;
const SECTION_ALIGNMENT: u32 = 0x1000;
const TEXT_RVA: u32 = 0x1000;
const TEXT_SIZE: u32 = 0x200;
const RDATA_RVA: u32 = 0x2000;
const DEBUG_DIR_AT: u32 = 0x100;
const DEBUG_PAYLOAD_AT: u32 = 0x180;

/// Builder for synthetic PE32/PE32+ images.
#[derive(Debug, Clone)]
pub struct PeFixture {
    wide: bool,
    imports: Vec<(String, Vec<String>)>,
    exports: Option<(String, Vec<String>)>,
    overlay: Vec<u8>,
    certificate: bool,
    checksum: bool,
    tight: bool,
    debug: bool,
}

impl Default for PeFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl PeFixture {
    /// A PE32+ (x64) image.
    pub fn new() -> Self {
        PeFixture {
            wide: true,
            imports: Vec::new(),
            exports: None,
            overlay: Vec::new(),
            certificate: false,
            checksum: false,
            tight: false,
            debug: false,
        }
    }

    /// A PE32 (x86) image.
    pub fn pe32() -> Self {
        PeFixture { wide: false, ..Self::new() }
    }

    /// Import `functions` from `module`; `#N` imports ordinal `N`.
    pub fn import(mut self, module: &str, functions: &[&str]) -> Self {
        self.imports
            .push((module.to_string(), functions.iter().map(|f| f.to_string()).collect()));
        self
    }

    /// Export `names` under `module`.  `Name=OTHER.Func` exports a forwarder;
    /// a bare `#` exports by ordinal only.
    pub fn exports(mut self, module: &str, names: &[&str]) -> Self {
        self.exports = Some((module.to_string(), names.iter().map(|n| n.to_string()).collect()));
        self
    }

    /// Append raw bytes after the last section.
    pub fn overlay(mut self, bytes: &[u8]) -> Self {
        self.overlay = bytes.to_vec();
        self
    }

    /// Append `bytes` as the overlay and point the security directory at it.
    pub fn certificate(mut self, bytes: &[u8]) -> Self {
        self.overlay = bytes.to_vec();
        self.certificate = true;
        self
    }

    /// Store a valid (nonzero) checksum.
    pub fn with_checksum(mut self) -> Self {
        self.checksum = true;
        self
    }

    /// End the header region exactly at the end of the section table.
    pub fn tight_headers(mut self) -> Self {
        self.tight = true;
        self
    }

    /// Add a CodeView debug directory in `.text`.
    pub fn debug(mut self) -> Self {
        self.debug = true;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let opt_size: u32 = if self.wide { 240 } else { 224 };
        let (rdata, import_dir, iat_dir) = self.import_blob(RDATA_RVA);
        let rdata_vsize = (rdata.len() as u32).max(0x10);
        let edata_rva = RDATA_RVA + align(rdata_vsize, SECTION_ALIGNMENT);
        let edata = self.export_blob(edata_rva);

        let section_count = 2 + u32::from(edata.is_some());
        let (e_lfanew, soh) = if self.tight {
            (0x200 - (24 + opt_size + section_count * 40), 0x200)
        } else {
            (0x80, 0x400)
        };

        let text_raw = soh;
        let rdata_raw = text_raw + TEXT_SIZE;
        let rdata_raw_size = align(rdata_vsize, FILE_ALIGNMENT);
        let mut data_end = rdata_raw + rdata_raw_size;
        let mut sections = vec![
            (*b".text\0\0\0", TEXT_SIZE, TEXT_RVA, TEXT_SIZE, text_raw, 0x6000_0020u32),
            (*b".rdata\0\0", rdata_vsize, RDATA_RVA, rdata_raw_size, rdata_raw, 0x4000_0040),
        ];
        let mut export_dir = (0, 0);
        if let Some((blob, size)) = &edata {
            let raw_size = align(blob.len() as u32, FILE_ALIGNMENT);
            sections.push((*b".edata\0\0", blob.len() as u32, edata_rva, raw_size, data_end, 0x4000_0040));
            export_dir = (edata_rva, *size);
            data_end += raw_size;
        }

        let mut out = vec![0u8; data_end as usize];

        // DOS header.
        put_u16(&mut out, 0, DOS_MAGIC);
        put_u32(&mut out, 0x3C, e_lfanew);

        // NT headers.
        let nt = e_lfanew as usize;
        put_u32(&mut out, nt, PE_SIGNATURE);
        let fh = nt + 4;
        put_u16(&mut out, fh, if self.wide { MACHINE_AMD64 } else { MACHINE_I386 });
        put_u16(&mut out, fh + 2, section_count as u16);
        put_u32(&mut out, fh + 4, 0x6500_0000);
        put_u16(&mut out, fh + 16, opt_size as u16);
        put_u16(&mut out, fh + 18, if self.wide { 0x0022 } else { 0x0102 });

        let opt = fh + 20;
        put_u16(&mut out, opt, if self.wide { PE32PLUS_MAGIC } else { PE32_MAGIC });
        out[opt + 2] = 14;
        put_u32(&mut out, opt + 4, TEXT_SIZE);
        put_u32(&mut out, opt + 8, sections[1..].iter().map(|s| s.3).sum());
        put_u32(&mut out, opt + 16, TEXT_RVA);
        put_u32(&mut out, opt + 20, TEXT_RVA);
        if self.wide {
            put_u64(&mut out, opt + 24, 0x1_4000_0000);
        } else {
            put_u32(&mut out, opt + 24, RDATA_RVA);
            put_u32(&mut out, opt + 28, 0x40_0000);
        }
        put_u32(&mut out, opt + 32, SECTION_ALIGNMENT);
        put_u32(&mut out, opt + 36, FILE_ALIGNMENT);
        put_u16(&mut out, opt + 40, 6);
        put_u16(&mut out, opt + 48, 6);
        let last = sections[sections.len() - 1];
        put_u32(&mut out, opt + 56, align(last.2 + last.1, SECTION_ALIGNMENT));
        put_u32(&mut out, opt + 60, soh);
        put_u16(&mut out, opt + 68, 3);
        put_u16(&mut out, opt + 70, 0x8160);

        let (nrva_at, dirs_at) = if self.wide { (opt + 108, opt + 112) } else { (opt + 92, opt + 96) };
        put_u32(&mut out, nrva_at, 16);
        let mut set_dir = |entry: DirectoryEntry, va: u32, size: u32| {
            let at = dirs_at + entry.index() * 8;
            put_u32(&mut out, at, va);
            put_u32(&mut out, at + 4, size);
        };
        set_dir(DirectoryEntry::Export, export_dir.0, export_dir.1);
        set_dir(DirectoryEntry::Import, import_dir.0, import_dir.1);
        set_dir(DirectoryEntry::Iat, iat_dir.0, iat_dir.1);
        if self.debug {
            set_dir(DirectoryEntry::Debug, TEXT_RVA + DEBUG_DIR_AT, 28);
        }
        if self.certificate {
            set_dir(DirectoryEntry::Security, data_end, self.overlay.len() as u32);
        }

        let table = opt + opt_size as usize;
        for (i, (name, vsize, va, raw_size, raw, flags)) in sections.iter().enumerate() {
            let row = table + i * 40;
            out[row..row + 8].copy_from_slice(name);
            put_u32(&mut out, row + 8, *vsize);
            put_u32(&mut out, row + 12, *va);
            put_u32(&mut out, row + 16, *raw_size);
            put_u32(&mut out, row + 20, *raw);
            put_u32(&mut out, row + 36, *flags);
        }

        // Section contents.
        let text = text_raw as usize;
        out[text] = 0xC3;
        if self.debug {
            let dir = text + DEBUG_DIR_AT as usize;
            put_u32(&mut out, dir + 12, 2);
            put_u32(&mut out, dir + 16, 0x18);
            put_u32(&mut out, dir + 20, TEXT_RVA + DEBUG_PAYLOAD_AT);
            put_u32(&mut out, dir + 24, text_raw + DEBUG_PAYLOAD_AT);
            let payload = text + DEBUG_PAYLOAD_AT as usize;
            out[payload..payload + 4].copy_from_slice(b"RSDS");
        }
        out[rdata_raw as usize..rdata_raw as usize + rdata.len()].copy_from_slice(&rdata);
        if let Some((blob, _)) = &edata {
            let at = sections[2].4 as usize;
            out[at..at + blob.len()].copy_from_slice(blob);
        }

        out.extend_from_slice(&self.overlay);
        if self.checksum {
            let at = opt + OPT_CHECKSUM;
            let sum = pe_checksum(&out, at);
            put_u32(&mut out, at, sum);
        }
        out
    }

    /// Returns the blob plus the import and IAT directories.
    fn import_blob(&self, base: u32) -> (Vec<u8>, (u32, u32), (u32, u32)) {
        if self.imports.is_empty() {
            return (Vec::new(), (0, 0), (0, 0));
        }
        let ts: u32 = if self.wide { 8 } else { 4 };
        let flag = ordinal_flag(self.wide);
        let desc_size = (self.imports.len() as u32 + 1) * 20;

        let mut cursor = align(desc_size, 8);
        let mut ilt = Vec::new();
        for (_, functions) in &self.imports {
            ilt.push(cursor);
            cursor += (functions.len() as u32 + 1) * ts;
        }
        let iat_start = cursor;
        let mut iat = Vec::new();
        for (_, functions) in &self.imports {
            iat.push(cursor);
            cursor += (functions.len() as u32 + 1) * ts;
        }
        let iat_end = cursor;
        let mut hint_names = Vec::new();
        for (_, functions) in &self.imports {
            let mut offsets = Vec::new();
            for function in functions {
                if function.starts_with('#') {
                    offsets.push(None);
                } else {
                    cursor = align(cursor, 2);
                    offsets.push(Some(cursor));
                    cursor += 2 + function.len() as u32 + 1;
                }
            }
            hint_names.push(offsets);
        }
        let mut names = Vec::new();
        for (module, _) in &self.imports {
            names.push(cursor);
            cursor += module.len() as u32 + 1;
        }

        let mut blob = vec![0u8; cursor as usize];
        for (i, (module, functions)) in self.imports.iter().enumerate() {
            let d = i * 20;
            put_u32(&mut blob, d, base + ilt[i]);
            put_u32(&mut blob, d + 12, base + names[i]);
            put_u32(&mut blob, d + 16, base + iat[i]);
            let n = names[i] as usize;
            blob[n..n + module.len()].copy_from_slice(module.as_bytes());

            for (j, function) in functions.iter().enumerate() {
                let thunk = match hint_names[i][j] {
                    Some(at) => {
                        let o = at as usize;
                        put_u16(&mut blob, o, j as u16);
                        blob[o + 2..o + 2 + function.len()].copy_from_slice(function.as_bytes());
                        u64::from(base + at)
                    }
                    None => {
                        let ordinal: u16 = function[1..].parse().unwrap_or(0);
                        flag | u64::from(ordinal)
                    }
                };
                let slot = (j as u32 * ts) as usize;
                put_thunk(&mut blob, ilt[i] as usize + slot, thunk, self.wide);
                put_thunk(&mut blob, iat[i] as usize + slot, thunk, self.wide);
            }
        }
        (blob, (base, desc_size), (base + iat_start, iat_end - iat_start))
    }

    /// Returns the blob and the export directory size.
    fn export_blob(&self, base: u32) -> Option<(Vec<u8>, u32)> {
        let (module, entries) = self.exports.as_ref()?;
        let parsed: Vec<(&str, Option<&str>)> = entries
            .iter()
            .map(|e| match e.split_once('=') {
                Some((name, target)) => (name, Some(target)),
                None => (e.as_str(), None),
            })
            .collect();
        let n = parsed.len() as u32;
        let named: Vec<usize> = (0..parsed.len()).filter(|&i| parsed[i].0 != "#").collect();
        let names = named.len() as u32;

        let eat = 40;
        let npt = eat + 4 * n;
        let ords = npt + 4 * names;
        let mut cursor = ords + 2 * names;
        let module_at = cursor;
        cursor += module.len() as u32 + 1;
        let mut name_at = vec![0; parsed.len()];
        for &i in &named {
            name_at[i] = cursor;
            cursor += parsed[i].0.len() as u32 + 1;
        }
        let mut forward_at = Vec::new();
        for (_, target) in &parsed {
            forward_at.push(target.map(|t| {
                let at = cursor;
                cursor += t.len() as u32 + 1;
                at
            }));
        }

        let mut blob = vec![0u8; cursor as usize];
        put_u32(&mut blob, 12, base + module_at);
        put_u32(&mut blob, 16, 1);
        put_u32(&mut blob, 20, n);
        put_u32(&mut blob, 24, names);
        put_u32(&mut blob, 28, base + eat);
        put_u32(&mut blob, 32, base + npt);
        put_u32(&mut blob, 36, base + ords);
        let m = module_at as usize;
        blob[m..m + module.len()].copy_from_slice(module.as_bytes());

        for (i, (name, target)) in parsed.iter().enumerate() {
            let address = match (forward_at[i], target) {
                (Some(at), Some(t)) => {
                    let o = at as usize;
                    blob[o..o + t.len()].copy_from_slice(t.as_bytes());
                    base + at
                }
                _ => TEXT_RVA + 0x10 * i as u32,
            };
            put_u32(&mut blob, (eat + 4 * i as u32) as usize, address);
            if *name != "#" {
                let o = name_at[i] as usize;
                blob[o..o + name.len()].copy_from_slice(name.as_bytes());
            }
        }

        let mut sorted = named;
        sorted.sort_by_key(|&i| parsed[i].0);
        for (slot, &i) in sorted.iter().enumerate() {
            put_u32(&mut blob, (npt + 4 * slot as u32) as usize, base + name_at[i]);
            put_u16(&mut blob, (ords + 2 * slot as u32) as usize, i as u16);
        }
        Some((blob, cursor))
    }
}

fn align(value: u32, alignment: u32) -> u32 {
    align_up(value, alignment).unwrap_or(value)
}
