//! ELF32 validation.
//!
//! [`validate32`] is a pure validator: it parses and bounds-checks the
//! ELF header and program headers of a 32-bit, little-endian, `EM_386`
//! executable and returns the list of `PT_LOAD` segments, but never
//! reads segment *content*. Actual page contents are faulted in lazily,
//! one page at a time, by the page-fault handler
//! (`process::memory::install_exec_segment` records the backing node and
//! file range per segment; the fault handler reads through it later).

extern crate alloc;

use alloc::{sync::Arc, vec::Vec};

use crate::error::{KernelError, KernelResult};
use crate::fs::VfsNode;

const EI_NIDENT: usize = 16;
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;
const PT_LOAD: u32 = 1;

/// User address space bounds every `PT_LOAD` segment must fit inside.
const USER_LOAD_LOW: u32 = 0x0800_0000;
const USER_LOAD_HIGH: u32 = 0xB000_0000;

/// Maximum number of program headers this loader will walk.
const PN_XNUM_MAX: u16 = 64;

/// Raw ELF32 file header, as laid out on disk.
#[repr(C)]
#[derive(Clone, Copy)]
struct Elf32Header {
    e_ident: [u8; EI_NIDENT],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u32,
    e_phoff: u32,
    e_shoff: u32,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

const ELF32_HEADER_SIZE: usize = core::mem::size_of::<Elf32Header>();

/// Raw ELF32 program header, as laid out on disk.
#[repr(C)]
#[derive(Clone, Copy)]
struct Elf32ProgramHeader {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_paddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
    p_align: u32,
}

const ELF32_PHDR_SIZE: usize = core::mem::size_of::<Elf32ProgramHeader>();

/// One `PT_LOAD` segment's geometry, ready for lazy demand-paging.
#[derive(Debug, Clone, Copy)]
pub struct LoadSegment {
    pub vaddr: u32,
    pub mem_size: u32,
    pub file_size: u32,
    pub file_offset: u32,
    pub writable: bool,
    pub executable: bool,
}

/// Everything `spawn_elf` needs to set up a new address space, without
/// having read a single byte of segment content yet.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub entry: u32,
    pub max_vaddr: u32,
    pub segments: Vec<LoadSegment>,
}

fn read_exact(node: &Arc<dyn VfsNode>, offset: usize, buf: &mut [u8]) -> KernelResult<()> {
    let n = node.read(offset, buf)?;
    if n != buf.len() {
        return Err(KernelError::LegacyError { message: "truncated ELF read" });
    }
    Ok(())
}

fn parse_header(node: &Arc<dyn VfsNode>) -> KernelResult<Elf32Header> {
    let mut raw = [0u8; ELF32_HEADER_SIZE];
    read_exact(node, 0, &mut raw)?;

    if raw[0..4] != ELF_MAGIC {
        return Err(KernelError::LegacyError { message: "not an ELF file" });
    }
    if raw[4] != ELFCLASS32 {
        return Err(KernelError::LegacyError { message: "not a 32-bit ELF" });
    }
    if raw[5] != ELFDATA2LSB {
        return Err(KernelError::LegacyError { message: "not little-endian" });
    }

    // SAFETY: `raw` is exactly `size_of::<Elf32Header>()` bytes and the
    // struct has no padding-sensitive invariants beyond byte layout.
    let header = unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const Elf32Header) };

    if header.e_type != ET_EXEC {
        return Err(KernelError::LegacyError { message: "not an executable ELF" });
    }
    if header.e_machine != EM_386 {
        return Err(KernelError::LegacyError { message: "wrong machine type, expected EM_386" });
    }
    if header.e_phentsize as usize != ELF32_PHDR_SIZE {
        return Err(KernelError::LegacyError { message: "unexpected program header size" });
    }
    if header.e_phnum == 0 {
        return Err(KernelError::LegacyError { message: "no program headers" });
    }
    if header.e_phnum > PN_XNUM_MAX {
        return Err(KernelError::LegacyError { message: "too many program headers" });
    }

    Ok(header)
}

/// Validates `node` as a loadable ELF32 executable and returns its
/// `PT_LOAD` segment geometry. Never reads segment content.
pub fn validate32(node: &Arc<dyn VfsNode>) -> KernelResult<LoadedImage> {
    let header = parse_header(node)?;

    let mut segments = Vec::with_capacity(header.e_phnum as usize);
    let mut max_vaddr: u32 = 0;

    for i in 0..header.e_phnum as usize {
        let offset = header.e_phoff as usize + i * ELF32_PHDR_SIZE;
        let mut raw = [0u8; ELF32_PHDR_SIZE];
        read_exact(node, offset, &mut raw)?;
        // SAFETY: `raw` is exactly `size_of::<Elf32ProgramHeader>()` bytes.
        let ph = unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const Elf32ProgramHeader) };

        if ph.p_type != PT_LOAD {
            continue;
        }
        if ph.p_filesz > ph.p_memsz {
            return Err(KernelError::LegacyError { message: "segment file size exceeds memory size" });
        }

        let end = ph.p_vaddr.checked_add(ph.p_memsz).ok_or(KernelError::LegacyError {
            message: "segment address overflow",
        })?;
        if ph.p_vaddr < USER_LOAD_LOW || end > USER_LOAD_HIGH {
            return Err(KernelError::LegacyError { message: "segment outside user address range" });
        }
        max_vaddr = max_vaddr.max(end);

        segments.push(LoadSegment {
            vaddr: ph.p_vaddr,
            mem_size: ph.p_memsz,
            file_size: ph.p_filesz,
            file_offset: ph.p_offset,
            writable: ph.p_flags & 0x2 != 0,
            executable: ph.p_flags & 0x1 != 0,
        });
    }

    if segments.is_empty() {
        return Err(KernelError::LegacyError { message: "no PT_LOAD segments" });
    }
    let entry_in_segment = segments
        .iter()
        .any(|s| header.e_entry >= s.vaddr && header.e_entry < s.vaddr + s.mem_size);
    if !entry_in_segment {
        return Err(KernelError::LegacyError { message: "entry point outside loaded segments" });
    }

    Ok(LoadedImage { entry: header.e_entry, max_vaddr, segments })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{DirEntry, Metadata, NodeType, Permissions};

    struct FakeFile(alloc::vec::Vec<u8>);

    impl VfsNode for FakeFile {
        fn node_type(&self) -> NodeType {
            NodeType::File
        }
        fn read(&self, offset: usize, buffer: &mut [u8]) -> Result<usize, &'static str> {
            if offset >= self.0.len() {
                return Ok(0);
            }
            let n = buffer.len().min(self.0.len() - offset);
            buffer[..n].copy_from_slice(&self.0[offset..offset + n]);
            Ok(n)
        }
        fn write(&self, _offset: usize, _data: &[u8]) -> Result<usize, &'static str> {
            Err("read-only")
        }
        fn metadata(&self) -> Result<Metadata, &'static str> {
            Err("unsupported")
        }
        fn readdir(&self) -> Result<alloc::vec::Vec<DirEntry>, &'static str> {
            Err("not a directory")
        }
        fn lookup(&self, _name: &str) -> Result<Arc<dyn VfsNode>, &'static str> {
            Err("not a directory")
        }
        fn create(&self, _name: &str, _p: Permissions) -> Result<Arc<dyn VfsNode>, &'static str> {
            Err("unsupported")
        }
        fn mkdir(&self, _name: &str, _p: Permissions) -> Result<Arc<dyn VfsNode>, &'static str> {
            Err("unsupported")
        }
        fn unlink(&self, _name: &str) -> Result<(), &'static str> {
            Err("unsupported")
        }
        fn truncate(&self, _size: usize) -> Result<(), &'static str> {
            Err("unsupported")
        }
    }

    fn make_minimal_elf32(entry: u32, vaddr: u32, filesz: u32, memsz: u32) -> Vec<u8> {
        let mut buf = alloc::vec![0u8; ELF32_HEADER_SIZE + ELF32_PHDR_SIZE + filesz as usize];
        buf[0..4].copy_from_slice(&ELF_MAGIC);
        buf[4] = ELFCLASS32;
        buf[5] = ELFDATA2LSB;
        buf[6] = 1;
        buf[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        buf[18..20].copy_from_slice(&EM_386.to_le_bytes());
        buf[24..28].copy_from_slice(&entry.to_le_bytes());
        buf[28..32].copy_from_slice(&(ELF32_HEADER_SIZE as u32).to_le_bytes());
        buf[42..44].copy_from_slice(&(ELF32_PHDR_SIZE as u16).to_le_bytes());
        buf[44..46].copy_from_slice(&1u16.to_le_bytes());

        let ph_off = ELF32_HEADER_SIZE;
        buf[ph_off..ph_off + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        buf[ph_off + 4..ph_off + 8].copy_from_slice(&(ph_off as u32 + ELF32_PHDR_SIZE as u32).to_le_bytes());
        buf[ph_off + 8..ph_off + 12].copy_from_slice(&vaddr.to_le_bytes());
        buf[ph_off + 16..ph_off + 20].copy_from_slice(&filesz.to_le_bytes());
        buf[ph_off + 20..ph_off + 24].copy_from_slice(&memsz.to_le_bytes());
        buf[ph_off + 24..ph_off + 28].copy_from_slice(&0x5u32.to_le_bytes()); // R+X

        buf
    }

    #[test]
    fn accepts_minimal_valid_binary() {
        let data = make_minimal_elf32(0x0800_1000, 0x0800_1000, 0x100, 0x2000);
        let node: Arc<dyn VfsNode> = Arc::new(FakeFile(data));
        let image = validate32(&node).unwrap();
        assert_eq!(image.entry, 0x0800_1000);
        assert_eq!(image.max_vaddr, 0x0800_3000);
        assert_eq!(image.segments.len(), 1);
        assert_eq!(image.segments[0].vaddr, 0x0800_1000);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = make_minimal_elf32(0x0800_1000, 0x0800_1000, 0x100, 0x2000);
        data[0] = 0;
        let node: Arc<dyn VfsNode> = Arc::new(FakeFile(data));
        assert!(validate32(&node).is_err());
    }

    #[test]
    fn rejects_entry_outside_segments() {
        let data = make_minimal_elf32(0x0900_0000, 0x0800_1000, 0x100, 0x2000);
        let node: Arc<dyn VfsNode> = Arc::new(FakeFile(data));
        assert!(validate32(&node).is_err());
    }

    #[test]
    fn rejects_filesz_larger_than_memsz() {
        let data = make_minimal_elf32(0x0800_1000, 0x0800_1000, 0x3000, 0x2000);
        let node: Arc<dyn VfsNode> = Arc::new(FakeFile(data));
        assert!(validate32(&node).is_err());
    }

    #[test]
    fn rejects_segment_outside_user_range() {
        let data = make_minimal_elf32(0x1000, 0x1000, 0x100, 0x2000);
        let node: Arc<dyn VfsNode> = Arc::new(FakeFile(data));
        assert!(validate32(&node).is_err());
    }

    /// Two non-contiguous `PT_LOAD` segments (a gap from `0x08002000` to
    /// `0x08010000`) with `entry` pointed into that gap -- inside the
    /// aggregate min/max vaddr span across both segments, but not inside
    /// either one.
    fn make_two_segment_elf32(entry: u32) -> Vec<u8> {
        let ph_off = ELF32_HEADER_SIZE;
        let ph2_off = ph_off + ELF32_PHDR_SIZE;
        let mut buf = alloc::vec![0u8; ph2_off + ELF32_PHDR_SIZE];
        buf[0..4].copy_from_slice(&ELF_MAGIC);
        buf[4] = ELFCLASS32;
        buf[5] = ELFDATA2LSB;
        buf[6] = 1;
        buf[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        buf[18..20].copy_from_slice(&EM_386.to_le_bytes());
        buf[24..28].copy_from_slice(&entry.to_le_bytes());
        buf[28..32].copy_from_slice(&(ph_off as u32).to_le_bytes());
        buf[42..44].copy_from_slice(&(ELF32_PHDR_SIZE as u16).to_le_bytes());
        buf[44..46].copy_from_slice(&2u16.to_le_bytes()); // e_phnum = 2

        buf[ph_off..ph_off + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        buf[ph_off + 8..ph_off + 12].copy_from_slice(&0x0800_1000u32.to_le_bytes());
        buf[ph_off + 20..ph_off + 24].copy_from_slice(&0x1000u32.to_le_bytes());

        buf[ph2_off..ph2_off + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        buf[ph2_off + 8..ph2_off + 12].copy_from_slice(&0x0801_0000u32.to_le_bytes());
        buf[ph2_off + 20..ph2_off + 24].copy_from_slice(&0x1000u32.to_le_bytes());

        buf
    }

    #[test]
    fn rejects_entry_in_gap_between_segments() {
        let data = make_two_segment_elf32(0x0800_5000);
        let node: Arc<dyn VfsNode> = Arc::new(FakeFile(data));
        assert!(validate32(&node).is_err());
    }

    #[test]
    fn accepts_entry_inside_second_of_two_segments() {
        let data = make_two_segment_elf32(0x0801_0000);
        let node: Arc<dyn VfsNode> = Arc::new(FakeFile(data));
        assert!(validate32(&node).is_ok());
    }

    #[test]
    fn rejects_too_many_program_headers() {
        let mut data = make_minimal_elf32(0x0800_1000, 0x0800_1000, 0x100, 0x2000);
        data[44..46].copy_from_slice(&65u16.to_le_bytes());
        let node: Arc<dyn VfsNode> = Arc::new(FakeFile(data));
        assert!(validate32(&node).is_err());
    }
}
