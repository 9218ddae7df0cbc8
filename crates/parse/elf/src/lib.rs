//! ELF64 parsing and validation.
//!
//! [`ElfImage::parse`] checks everything the kernel needs to trust
//! before it maps a single page: identification, machine and type,
//! program header table bounds, per-segment sanity (sizes, overflow,
//! alignment, NULL-page and user-space bounds), pairwise segment
//! overlap, the entry point, and the absence of an interpreter. Only
//! statically linked `ET_EXEC` / `ET_DYN` images for x86-64 pass.
//!
//! Parsing borrows the input buffer; nothing is copied.

#![cfg_attr(not(test), no_std)]

use core::fmt;

/// ELF file class: 64-bit.
const ELFCLASS64: u8 = 2;
/// ELF data encoding: little-endian.
const ELFDATA2LSB: u8 = 1;
/// Current ELF version.
const EV_CURRENT: u8 = 1;
/// Machine: AMD x86-64.
const EM_X86_64: u16 = 62;
/// Object type: executable.
const ET_EXEC: u16 = 2;
/// Object type: shared object / PIE.
const ET_DYN: u16 = 3;

/// Program header type: loadable segment.
pub const PT_LOAD: u32 = 1;
/// Program header type: interpreter request (rejected).
pub const PT_INTERP: u32 = 3;

/// Segment flag: executable.
pub const PF_X: u32 = 1;
/// Segment flag: writable.
pub const PF_W: u32 = 2;
/// Segment flag: readable.
pub const PF_R: u32 = 4;

/// Size of the ELF64 file header.
const EHDR_SIZE: usize = 64;
/// Size of one ELF64 program header.
const PHDR_SIZE: usize = 56;

/// First valid user address; the page below is the NULL guard.
const NULL_GUARD_END: u64 = 0x1000;
/// First non-canonical address; segments must end below it.
const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// Why an image was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// The magic bytes are wrong.
    BadMagic,
    /// Not ELFCLASS64.
    UnsupportedClass,
    /// Not little-endian.
    UnsupportedEncoding,
    /// Not EV_CURRENT.
    BadVersion,
    /// Not EM_X86_64.
    UnsupportedMachine,
    /// Not ET_EXEC or ET_DYN.
    UnsupportedType,
    /// A read ran past the end of the buffer.
    Truncated,
    /// Program header table is missing or out of bounds.
    BadProgramHeaders,
    /// A segment's sizes or offsets are inconsistent.
    BadSegment,
    /// A segment alignment is not a power of two.
    BadAlignment,
    /// A segment covers the NULL guard page.
    NullPageSegment,
    /// A segment reaches outside the user half.
    OutsideUserSpace,
    /// Two loadable segments overlap.
    SegmentOverlap,
    /// The entry point is not inside an executable segment.
    BadEntryPoint,
    /// The image requests a dynamic interpreter.
    HasInterpreter,
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::BadMagic => "bad magic",
            Self::UnsupportedClass => "not a 64-bit image",
            Self::UnsupportedEncoding => "not little-endian",
            Self::BadVersion => "bad ELF version",
            Self::UnsupportedMachine => "not an x86-64 image",
            Self::UnsupportedType => "not an executable",
            Self::Truncated => "truncated image",
            Self::BadProgramHeaders => "bad program header table",
            Self::BadSegment => "inconsistent segment",
            Self::BadAlignment => "bad segment alignment",
            Self::NullPageSegment => "segment covers the NULL page",
            Self::OutsideUserSpace => "segment outside user space",
            Self::SegmentOverlap => "overlapping segments",
            Self::BadEntryPoint => "entry point not executable",
            Self::HasInterpreter => "dynamic interpreter not supported",
        };
        f.write_str(msg)
    }
}

/// One parsed ELF64 program header.
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    /// Segment type (`PT_*`).
    pub p_type: u32,
    /// Permission flags (`PF_*`).
    pub p_flags: u32,
    /// Offset of the segment data in the file.
    pub p_offset: u64,
    /// Virtual load address.
    pub p_vaddr: u64,
    /// Bytes stored in the file.
    pub p_filesz: u64,
    /// Bytes occupied in memory (>= `p_filesz`; the tail is BSS).
    pub p_memsz: u64,
    /// Required alignment.
    pub p_align: u64,
}

/// One validated loadable segment, borrowing its file bytes.
#[derive(Debug, Clone, Copy)]
pub struct LoadSegment<'a> {
    /// Virtual load address.
    pub vaddr: u64,
    /// File bytes to place at `vaddr`.
    pub data: &'a [u8],
    /// Total size in memory.
    pub memsz: u64,
    /// Permission flags (`PF_*`).
    pub flags: u32,
}

impl LoadSegment<'_> {
    /// Whether the segment is writable.
    pub fn is_writable(&self) -> bool {
        self.flags & PF_W != 0
    }

    /// Whether the segment is executable.
    pub fn is_executable(&self) -> bool {
        self.flags & PF_X != 0
    }
}

/// A validated ELF64 image.
pub struct ElfImage<'a> {
    data: &'a [u8],
    entry: u64,
    phoff: usize,
    phentsize: usize,
    phnum: usize,
}

impl<'a> ElfImage<'a> {
    /// Parses and fully validates an ELF64 image.
    ///
    /// No mapping decisions are made here; a successful parse means the
    /// loader can trust every offset and size in the image.
    pub fn parse(data: &'a [u8]) -> Result<Self, ElfError> {
        if data.len() < EHDR_SIZE {
            return Err(ElfError::Truncated);
        }
        if data[..4] != [0x7F, b'E', b'L', b'F'] {
            return Err(ElfError::BadMagic);
        }
        if data[4] != ELFCLASS64 {
            return Err(ElfError::UnsupportedClass);
        }
        if data[5] != ELFDATA2LSB {
            return Err(ElfError::UnsupportedEncoding);
        }
        if data[6] != EV_CURRENT || read_u32(data, 0x14)? != u32::from(EV_CURRENT) {
            return Err(ElfError::BadVersion);
        }

        let e_type = read_u16(data, 0x10)?;
        if e_type != ET_EXEC && e_type != ET_DYN {
            return Err(ElfError::UnsupportedType);
        }
        if read_u16(data, 0x12)? != EM_X86_64 {
            return Err(ElfError::UnsupportedMachine);
        }

        let entry = read_u64(data, 0x18)?;
        let phoff = read_u64(data, 0x20)? as usize;
        let phentsize = read_u16(data, 0x36)? as usize;
        let phnum = read_u16(data, 0x38)? as usize;

        if phnum == 0 || phentsize < PHDR_SIZE {
            return Err(ElfError::BadProgramHeaders);
        }
        let table_len = phnum
            .checked_mul(phentsize)
            .ok_or(ElfError::BadProgramHeaders)?;
        let table_end = phoff
            .checked_add(table_len)
            .ok_or(ElfError::BadProgramHeaders)?;
        if table_end > data.len() {
            return Err(ElfError::BadProgramHeaders);
        }

        let image = Self {
            data,
            entry,
            phoff,
            phentsize,
            phnum,
        };
        image.validate_segments()?;
        Ok(image)
    }

    /// The program entry point.
    pub fn entry_point(&self) -> u64 {
        self.entry
    }

    /// Number of program headers.
    pub fn phdr_count(&self) -> usize {
        self.phnum
    }

    /// Reads the `idx`-th program header.
    pub fn phdr(&self, idx: usize) -> Result<ProgramHeader, ElfError> {
        if idx >= self.phnum {
            return Err(ElfError::BadProgramHeaders);
        }
        let base = self.phoff + idx * self.phentsize;
        Ok(ProgramHeader {
            p_type: read_u32(self.data, base)?,
            p_flags: read_u32(self.data, base + 4)?,
            p_offset: read_u64(self.data, base + 8)?,
            p_vaddr: read_u64(self.data, base + 16)?,
            p_filesz: read_u64(self.data, base + 32)?,
            p_memsz: read_u64(self.data, base + 40)?,
            p_align: read_u64(self.data, base + 48)?,
        })
    }

    /// Iterates the loadable segments with their file bytes.
    pub fn load_segments(&self) -> impl Iterator<Item = LoadSegment<'a>> + '_ {
        (0..self.phnum).filter_map(move |idx| {
            let phdr = self.phdr(idx).ok()?;
            if phdr.p_type != PT_LOAD || phdr.p_memsz == 0 {
                return None;
            }
            let start = phdr.p_offset as usize;
            let end = start + phdr.p_filesz as usize;
            Some(LoadSegment {
                vaddr: phdr.p_vaddr,
                data: &self.data[start..end],
                memsz: phdr.p_memsz,
                flags: phdr.p_flags,
            })
        })
    }

    /// The full validation pass over the program headers.
    fn validate_segments(&self) -> Result<(), ElfError> {
        let mut entry_ok = false;

        for idx in 0..self.phnum {
            let phdr = self.phdr(idx)?;

            if phdr.p_type == PT_INTERP {
                return Err(ElfError::HasInterpreter);
            }
            if phdr.p_type != PT_LOAD {
                continue;
            }

            if phdr.p_memsz == 0 {
                continue;
            }
            if phdr.p_filesz > phdr.p_memsz {
                return Err(ElfError::BadSegment);
            }
            let file_end = phdr
                .p_offset
                .checked_add(phdr.p_filesz)
                .ok_or(ElfError::BadSegment)?;
            if file_end > self.data.len() as u64 {
                return Err(ElfError::BadSegment);
            }
            if phdr.p_align != 0 && !phdr.p_align.is_power_of_two() {
                return Err(ElfError::BadAlignment);
            }
            let mem_end = phdr
                .p_vaddr
                .checked_add(phdr.p_memsz)
                .ok_or(ElfError::BadSegment)?;
            if phdr.p_vaddr < NULL_GUARD_END {
                return Err(ElfError::NullPageSegment);
            }
            if mem_end > USER_SPACE_END {
                return Err(ElfError::OutsideUserSpace);
            }

            // Pairwise overlap with every later loadable segment.
            for other_idx in idx + 1..self.phnum {
                let other = self.phdr(other_idx)?;
                if other.p_type != PT_LOAD || other.p_memsz == 0 {
                    continue;
                }
                let other_end = other
                    .p_vaddr
                    .checked_add(other.p_memsz)
                    .ok_or(ElfError::BadSegment)?;
                if phdr.p_vaddr < other_end && other.p_vaddr < mem_end {
                    return Err(ElfError::SegmentOverlap);
                }
            }

            if phdr.p_flags & PF_X != 0
                && self.entry >= phdr.p_vaddr
                && self.entry < mem_end
            {
                entry_ok = true;
            }
        }

        if !entry_ok {
            return Err(ElfError::BadEntryPoint);
        }
        Ok(())
    }
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, ElfError> {
    let bytes = data
        .get(offset..offset + 2)
        .ok_or(ElfError::Truncated)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, ElfError> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or(ElfError::Truncated)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u64(data: &[u8], offset: usize) -> Result<u64, ElfError> {
    let bytes = data
        .get(offset..offset + 8)
        .ok_or(ElfError::Truncated)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a minimal valid ELF64 image: header + program headers +
    /// segment payloads appended in order.
    struct Builder {
        entry: u64,
        phdrs: Vec<ProgramHeader>,
        payloads: Vec<Vec<u8>>,
    }

    impl Builder {
        fn new(entry: u64) -> Self {
            Self {
                entry,
                phdrs: Vec::new(),
                payloads: Vec::new(),
            }
        }

        fn segment(mut self, vaddr: u64, payload: &[u8], memsz: u64, flags: u32) -> Self {
            self.phdrs.push(ProgramHeader {
                p_type: PT_LOAD,
                p_flags: flags,
                p_offset: 0, // patched in build()
                p_vaddr: vaddr,
                p_filesz: payload.len() as u64,
                p_memsz: memsz,
                p_align: 0x1000,
            });
            self.payloads.push(payload.to_vec());
            self
        }

        fn raw_phdr(mut self, phdr: ProgramHeader) -> Self {
            self.phdrs.push(phdr);
            self.payloads.push(Vec::new());
            self
        }

        fn build(mut self) -> Vec<u8> {
            let phoff = EHDR_SIZE;
            let mut data_off = phoff + self.phdrs.len() * PHDR_SIZE;

            for (phdr, payload) in self.phdrs.iter_mut().zip(&self.payloads) {
                if !payload.is_empty() {
                    phdr.p_offset = data_off as u64;
                    data_off += payload.len();
                }
            }

            let mut out = vec![0u8; EHDR_SIZE];
            out[..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
            out[4] = ELFCLASS64;
            out[5] = ELFDATA2LSB;
            out[6] = EV_CURRENT;
            out[0x10..0x12].copy_from_slice(&ET_EXEC.to_le_bytes());
            out[0x12..0x14].copy_from_slice(&EM_X86_64.to_le_bytes());
            out[0x14..0x18].copy_from_slice(&1u32.to_le_bytes());
            out[0x18..0x20].copy_from_slice(&self.entry.to_le_bytes());
            out[0x20..0x28].copy_from_slice(&(phoff as u64).to_le_bytes());
            out[0x36..0x38].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
            out[0x38..0x3A].copy_from_slice(&(self.phdrs.len() as u16).to_le_bytes());

            for phdr in &self.phdrs {
                out.extend_from_slice(&phdr.p_type.to_le_bytes());
                out.extend_from_slice(&phdr.p_flags.to_le_bytes());
                out.extend_from_slice(&phdr.p_offset.to_le_bytes());
                out.extend_from_slice(&phdr.p_vaddr.to_le_bytes());
                out.extend_from_slice(&0u64.to_le_bytes()); // p_paddr
                out.extend_from_slice(&phdr.p_filesz.to_le_bytes());
                out.extend_from_slice(&phdr.p_memsz.to_le_bytes());
                out.extend_from_slice(&phdr.p_align.to_le_bytes());
            }

            for payload in &self.payloads {
                out.extend_from_slice(payload);
            }
            out
        }
    }

    fn valid_image() -> Vec<u8> {
        Builder::new(0x40_0000)
            .segment(0x40_0000, &[0x90; 16], 0x100, PF_R | PF_X)
            .segment(0x41_0000, &[0xAA; 8], 0x2000, PF_R | PF_W)
            .build()
    }

    #[test]
    fn valid_image_parses() {
        let data = valid_image();
        let image = ElfImage::parse(&data).unwrap();
        assert_eq!(image.entry_point(), 0x40_0000);

        let segs: Vec<_> = image.load_segments().collect();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].vaddr, 0x40_0000);
        assert!(segs[0].is_executable());
        assert!(!segs[0].is_writable());
        assert_eq!(segs[0].data, &[0x90; 16]);
        assert_eq!(segs[1].memsz, 0x2000);
        assert!(segs[1].is_writable());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = valid_image();
        data[0] = 0x7E;
        assert_eq!(ElfImage::parse(&data).err(), Some(ElfError::BadMagic));
    }

    #[test]
    fn rejects_wrong_class() {
        let mut data = valid_image();
        data[4] = 1; // ELFCLASS32
        assert_eq!(ElfImage::parse(&data).err(), Some(ElfError::UnsupportedClass));
    }

    #[test]
    fn rejects_big_endian() {
        let mut data = valid_image();
        data[5] = 2;
        assert_eq!(ElfImage::parse(&data).err(), Some(ElfError::UnsupportedEncoding));
    }

    #[test]
    fn rejects_wrong_machine() {
        let mut data = valid_image();
        data[0x12] = 0x28; // EM_AARCH64
        assert_eq!(ElfImage::parse(&data).err(), Some(ElfError::UnsupportedMachine));
    }

    #[test]
    fn rejects_relocatable_type() {
        let mut data = valid_image();
        data[0x10] = 1; // ET_REL
        assert_eq!(ElfImage::parse(&data).err(), Some(ElfError::UnsupportedType));
    }

    #[test]
    fn accepts_pie() {
        let mut data = valid_image();
        data[0x10] = 3; // ET_DYN
        assert!(ElfImage::parse(&data).is_ok());
    }

    #[test]
    fn rejects_truncated_header() {
        let data = valid_image();
        assert_eq!(ElfImage::parse(&data[..32]).err(), Some(ElfError::Truncated));
    }

    #[test]
    fn rejects_phdr_table_past_eof() {
        let mut data = valid_image();
        // Claim far more program headers than the file holds.
        data[0x38..0x3A].copy_from_slice(&1000u16.to_le_bytes());
        assert_eq!(ElfImage::parse(&data).err(), Some(ElfError::BadProgramHeaders));
    }

    #[test]
    fn rejects_filesz_larger_than_memsz() {
        let data = Builder::new(0x40_0000)
            .segment(0x40_0000, &[0x90; 64], 0x10, PF_R | PF_X)
            .build();
        assert_eq!(ElfImage::parse(&data).err(), Some(ElfError::BadSegment));
    }

    #[test]
    fn rejects_segment_data_past_eof() {
        let mut data = valid_image();
        // Push the first segment's file offset past the end.
        let base = EHDR_SIZE;
        data[base + 8..base + 16].copy_from_slice(&(1u64 << 30).to_le_bytes());
        assert_eq!(ElfImage::parse(&data).err(), Some(ElfError::BadSegment));
    }

    #[test]
    fn rejects_non_power_of_two_alignment() {
        let mut data = valid_image();
        let base = EHDR_SIZE;
        data[base + 48..base + 56].copy_from_slice(&3u64.to_le_bytes());
        assert_eq!(ElfImage::parse(&data).err(), Some(ElfError::BadAlignment));
    }

    #[test]
    fn rejects_null_page_segment() {
        let data = Builder::new(0x800)
            .segment(0x800, &[0x90; 8], 0x100, PF_R | PF_X)
            .build();
        assert_eq!(ElfImage::parse(&data).err(), Some(ElfError::NullPageSegment));
    }

    #[test]
    fn rejects_kernel_half_segment() {
        let data = Builder::new(0x7FFF_FFFF_0000)
            .segment(0x7FFF_FFFF_0000, &[0x90; 8], 0x2_0000, PF_R | PF_X)
            .build();
        assert_eq!(ElfImage::parse(&data).err(), Some(ElfError::OutsideUserSpace));
    }

    #[test]
    fn rejects_vaddr_overflow() {
        let data = Builder::new(0x40_0000)
            .segment(u64::MAX - 0x10, &[], 0x100, PF_R | PF_X)
            .build();
        assert_eq!(ElfImage::parse(&data).err(), Some(ElfError::BadSegment));
    }

    #[test]
    fn rejects_overlapping_segments() {
        let data = Builder::new(0x40_0000)
            .segment(0x40_0000, &[0x90; 16], 0x2000, PF_R | PF_X)
            .segment(0x40_1000, &[0xAA; 8], 0x1000, PF_R | PF_W)
            .build();
        assert_eq!(ElfImage::parse(&data).err(), Some(ElfError::SegmentOverlap));
    }

    #[test]
    fn rejects_entry_in_data_segment() {
        let data = Builder::new(0x41_0000)
            .segment(0x40_0000, &[0x90; 16], 0x100, PF_R | PF_X)
            .segment(0x41_0000, &[0xAA; 8], 0x2000, PF_R | PF_W)
            .build();
        assert_eq!(ElfImage::parse(&data).err(), Some(ElfError::BadEntryPoint));
    }

    #[test]
    fn rejects_interpreter() {
        let data = Builder::new(0x40_0000)
            .segment(0x40_0000, &[0x90; 16], 0x100, PF_R | PF_X)
            .raw_phdr(ProgramHeader {
                p_type: PT_INTERP,
                p_flags: PF_R,
                p_offset: 0,
                p_vaddr: 0,
                p_filesz: 0,
                p_memsz: 0,
                p_align: 1,
            })
            .build();
        assert_eq!(ElfImage::parse(&data).err(), Some(ElfError::HasInterpreter));
    }

    #[test]
    fn zero_memsz_segments_are_skipped() {
        let data = Builder::new(0x40_0000)
            .segment(0x40_0000, &[0x90; 16], 0x100, PF_R | PF_X)
            .raw_phdr(ProgramHeader {
                p_type: PT_LOAD,
                p_flags: PF_R,
                p_offset: 0,
                p_vaddr: 0x50_0000,
                p_filesz: 0,
                p_memsz: 0,
                p_align: 0x1000,
            })
            .build();
        let image = ElfImage::parse(&data).unwrap();
        assert_eq!(image.load_segments().count(), 1);
    }
}
