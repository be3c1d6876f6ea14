//! RVA <-> file offset conversion over a section table.

use super::headers::Section;

/// Borrowing view over a section table that maps between the virtual and
/// on-disk coordinate spaces.
#[derive(Debug, Clone, Copy)]
pub struct Translator<'a> {
    sections: &'a [Section],
}

impl<'a> Translator<'a> {
    pub fn new(sections: &'a [Section]) -> Self {
        Self { sections }
    }

    /// Index of the section whose virtual range contains `rva`.
    pub fn section_index(&self, rva: u32) -> Option<usize> {
        self.sections.iter().position(|s| s.contains_rva(rva))
    }

    pub fn section(&self, rva: u32) -> Option<&'a Section> {
        self.section_index(rva).map(|i| &self.sections[i])
    }

    /// Map an RVA to a file offset.  RVAs in the uninitialised tail of a
    /// section (past its raw data) have no file offset.
    pub fn rva_to_offset(&self, rva: u32) -> Option<u32> {
        let section = self.section(rva)?;
        let delta = rva - section.virtual_address;
        if delta >= section.raw_size {
            return None;
        }
        section.raw_offset.checked_add(delta)
    }

    /// Map `len` bytes starting at `rva`; the whole range must stay inside
    /// one section's raw data.
    pub fn range_to_offset(&self, rva: u32, len: u32) -> Option<u32> {
        let section = self.section(rva)?;
        let delta = rva - section.virtual_address;
        let end = u64::from(delta) + u64::from(len);
        if end > u64::from(section.raw_size) || u64::from(rva) + u64::from(len) > section.virtual_end()
        {
            return None;
        }
        section.raw_offset.checked_add(delta)
    }

    pub fn offset_to_rva(&self, offset: u32) -> Option<u32> {
        self.sections
            .iter()
            .find(|s| offset >= s.raw_offset && u64::from(offset) < s.raw_end())
            .and_then(|s| s.virtual_address.checked_add(offset - s.raw_offset))
    }
}
