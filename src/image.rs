//! The module image as laid out in memory.

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

bitflags! {
    /// Section characteristics relevant to classification.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SectionFlags: u32 {
        const CODE = 0x0000_0020;
        const INITIALIZED_DATA = 0x0000_0040;
        const UNINITIALIZED_DATA = 0x0000_0080;
        const EXECUTE = 0x2000_0000;
        const READ = 0x4000_0000;
        const WRITE = 0x8000_0000;
    }
}

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub flags: SectionFlags,
}

impl Section {
    pub fn is_executable(&self) -> bool {
        self.flags.intersects(SectionFlags::EXECUTE | SectionFlags::CODE)
    }

    fn contains_rva(&self, rva: u64) -> bool {
        let start = self.virtual_address as u64;
        rva >= start && rva < start + self.virtual_size as u64
    }
}

/// A loaded module laid out at its virtual addresses.
///
/// `data[rva]` holds the byte mapped at `base + rva`; bytes not backed by the
/// file are zero.
#[derive(Debug, Clone)]
pub struct Image {
    base: u64,
    data: Vec<u8>,
    size_of_headers: u32,
    sections: Vec<Section>,
}

impl Image {
    pub fn new(base: u64, data: Vec<u8>, size_of_headers: u32, sections: Vec<Section>) -> Self {
        Self {
            base,
            data,
            size_of_headers,
            sections,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size_of_image(&self) -> u64 {
        self.data.len() as u64
    }

    /// Exclusive end of the image.
    pub fn end(&self) -> u64 {
        self.base + self.size_of_image()
    }

    /// Exclusive end of the header range.
    pub fn header_end(&self) -> u64 {
        self.base + (self.size_of_headers as u64).min(self.size_of_image())
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.end()
    }

    pub fn section_index(&self, address: u64) -> Option<usize> {
        let rva = address.checked_sub(self.base)?;
        self.sections.iter().position(|s| s.contains_rva(rva))
    }

    pub fn section_of(&self, address: u64) -> Option<&Section> {
        self.section_index(address).map(|i| &self.sections[i])
    }

    /// True when the address lies in an executable section or in no section at all.
    pub fn is_executable_or_unmapped(&self, address: u64) -> bool {
        self.section_of(address).is_none_or(Section::is_executable)
    }

    /// Exclusive end address of the section containing `address`.
    pub fn section_end(&self, address: u64) -> Option<u64> {
        self.section_of(address)
            .map(|s| self.base + s.virtual_address as u64 + s.virtual_size as u64)
    }

    /// All bytes from `address` to the end of the image.
    pub fn bytes_from(&self, address: u64) -> &[u8] {
        match address.checked_sub(self.base) {
            Some(rva) if (rva as usize) < self.data.len() => &self.data[rva as usize..],
            _ => &[],
        }
    }

    pub fn read(&self, address: u64, len: usize) -> Option<&[u8]> {
        let bytes = self.bytes_from(address);
        (bytes.len() >= len).then(|| &bytes[..len])
    }

    pub fn read_u32(&self, address: u64) -> Option<u32> {
        self.read(address, 4).map(LittleEndian::read_u32)
    }

    pub fn read_i32(&self, address: u64) -> Option<i32> {
        self.read(address, 4).map(LittleEndian::read_i32)
    }

    pub fn read_u64(&self, address: u64) -> Option<u64> {
        self.read(address, 8).map(LittleEndian::read_u64)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub const TEXT: u64 = 0x1000;
    pub const RDATA: u64 = 0x8000;

    /// Image based at 0 with `.text` at 0x1000 (0x7000 bytes, int3 filled)
    /// and `.rdata` at 0x8000 (0x1000 bytes).
    pub fn image_with(code: &[(u64, &[u8])], rdata: &[(u64, &[u8])]) -> Image {
        let mut data = vec![0u8; 0x9000];
        data[TEXT as usize..RDATA as usize].fill(0xcc);
        for (address, bytes) in code.iter().chain(rdata) {
            let at = *address as usize;
            data[at..at + bytes.len()].copy_from_slice(bytes);
        }
        Image::new(
            0,
            data,
            0x400,
            vec![
                Section {
                    name: ".text".into(),
                    virtual_address: TEXT as u32,
                    virtual_size: (RDATA - TEXT) as u32,
                    flags: SectionFlags::CODE | SectionFlags::EXECUTE | SectionFlags::READ,
                },
                Section {
                    name: ".rdata".into(),
                    virtual_address: RDATA as u32,
                    virtual_size: 0x1000,
                    flags: SectionFlags::INITIALIZED_DATA | SectionFlags::READ,
                },
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;

    #[test]
    fn test_section_lookup() {
        let image = image_with(&[(0x1000, &[0xc3])], &[]);
        assert!(image.section_of(0x1000).unwrap().is_executable());
        assert!(!image.section_of(0x8004).unwrap().is_executable());
        assert!(image.section_of(0x200).is_none());
        assert!(image.is_executable_or_unmapped(0x200));
        assert!(!image.is_executable_or_unmapped(0x8000));
        assert_eq!(image.section_end(0x1234), Some(0x8000));
        assert_eq!(image.header_end(), 0x400);
    }

    #[test]
    fn test_reads_past_end() {
        let image = image_with(&[], &[(0x8ffc, &[1, 0, 0, 0])]);
        assert_eq!(image.read_u32(0x8ffc), Some(1));
        assert_eq!(image.read_u32(0x8ffd), None);
        assert!(image.bytes_from(0x9000).is_empty());
    }
}
