//! Object image: one loaded version of one shared object.
//!
//! An `Image` owns the mapped pages of exactly one version of one ELF file.
//! Header, program header, dynamic section and symbol table entries are
//! parsed eagerly into owned (and where possible `Copy`) values via
//! `goblin`; string-table lookups are resolved on demand against the raw
//! bytes: parse what's cheap and structural up front, defer anything
//! variable-length.

use crate::errors::{LuciError, Result};
use goblin::elf::{Dyn, Elf, ProgramHeader, Sym};
use goblin::elf::program_header::{PT_DYNAMIC, PT_GNU_RELRO, PT_LOAD, PT_TLS};
use std::collections::HashMap;
use std::fs::File;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

/// High bit of a `versym` entry: the definition is hidden (non-default),
/// per the GNU symbol versioning scheme.
const VERSYM_HIDDEN: u16 = 0x8000;

const PAGE_SIZE: usize = 0x1000;

fn page_floor(x: usize) -> usize {
    x & !(PAGE_SIZE - 1)
}

fn page_ceil(x: usize) -> usize {
    (x + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

bitflags::bitflags! {
    /// Segment protection bits, independent of the OS `mprotect` encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u8 {
        const READ  = 0b001;
        const WRITE = 0b010;
        const EXEC  = 0b100;
    }
}

impl Prot {
    pub fn to_libc(self) -> i32 {
        let mut p = 0;
        if self.contains(Prot::READ) {
            p |= libc::PROT_READ;
        }
        if self.contains(Prot::WRITE) {
            p |= libc::PROT_WRITE;
        }
        if self.contains(Prot::EXEC) {
            p |= libc::PROT_EXEC;
        }
        p
    }
}

/// One `PT_LOAD` segment.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub prot: Prot,
}

/// Static-TLS-relevant parameters parsed out of `PT_TLS`, populated once the
/// TLS manager has assigned a module id and (for static modules) an offset.
#[derive(Debug, Clone)]
pub struct TlsInfo {
    pub init_image_offset: u64,
    pub init_size: u64,
    pub block_size: u64,
    pub align: u64,
    pub module_id: u32,
    /// `Some` once the TLS manager has decided this module is static.
    pub static_offset: Option<isize>,
}

/// Eager and lazy relocation lists, matching `DT_RELA`+`DT_RELACOUNT` and
/// `DT_JMPREL` respectively.
#[derive(Debug, Clone, Default)]
pub struct RelocSet {
    pub eager: Vec<goblin::elf::Rela>,
    pub lazy: Vec<goblin::elf::Rela>,
}

/// Image lifecycle, monotone modulo the `Ready -> Retiring` transition at
/// retirement (see `Identity::retire`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ImageState {
    Unloaded = 0,
    Mapped = 1,
    Relocating = 2,
    Initializing = 3,
    Ready = 4,
    Retiring = 5,
}

impl ImageState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ImageState::Unloaded,
            1 => ImageState::Mapped,
            2 => ImageState::Relocating,
            3 => ImageState::Initializing,
            4 => ImageState::Ready,
            _ => ImageState::Retiring,
        }
    }
}

/// `ImageState` behind an atomic cell, so a transition (in particular the
/// `Ready -> Retiring` one at DSU retirement) can be observed and applied
/// through a shared `Arc<Image>` without requiring unique ownership.
#[derive(Debug)]
pub struct AtomicImageState(std::sync::atomic::AtomicU8);

impl AtomicImageState {
    pub fn new(state: ImageState) -> Self {
        AtomicImageState(std::sync::atomic::AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> ImageState {
        ImageState::from_u8(self.0.load(std::sync::atomic::Ordering::SeqCst))
    }

    pub fn set(&self, state: ImageState) {
        self.0.store(state as u8, std::sync::atomic::Ordering::SeqCst);
    }
}

/// A keyed view into the dynamic section. Tags that legally repeat (like
/// `DT_NEEDED`) become a list; everything else is the last entry seen,
/// matching glibc's own last-wins resolution order.
#[derive(Debug, Default)]
pub struct DynInfo {
    pub strtab_off: Option<u64>,
    pub symtab_off: Option<u64>,
    pub hash_off: Option<u64>,
    pub gnu_hash_off: Option<u64>,
    pub rela_off: Option<u64>,
    pub rela_size: Option<u64>,
    pub rela_ent: Option<u64>,
    pub rela_count: Option<u64>,
    pub jmprel_off: Option<u64>,
    pub pltrel_size: Option<u64>,
    pub init: Option<u64>,
    pub fini: Option<u64>,
    pub init_array: Option<(u64, u64)>,
    pub fini_array: Option<(u64, u64)>,
    pub preinit_array: Option<(u64, u64)>,
    pub needed: Vec<u64>, // strtab offsets
    pub soname: Option<u64>,
    pub rpath: Option<u64>,
    pub runpath: Option<u64>,
    pub flags: u64,
    pub flags_1: u64,
    pub debug_tag_addr: Option<u64>, // address of the d_un field for DT_DEBUG
    pub versym_off: Option<u64>,
    pub verdef_off: Option<u64>,
    pub verdef_num: Option<u64>,
    pub verneed_off: Option<u64>,
    pub verneed_num: Option<u64>,
}

impl DynInfo {
    fn parse(dynamic: &[Dyn]) -> Self {
        use goblin::elf::dynamic::*;
        let mut info = DynInfo::default();
        for (idx, d) in dynamic.iter().enumerate() {
            match d.d_tag {
                DT_STRTAB => info.strtab_off = Some(d.d_val),
                DT_SYMTAB => info.symtab_off = Some(d.d_val),
                DT_HASH => info.hash_off = Some(d.d_val),
                DT_GNU_HASH => info.gnu_hash_off = Some(d.d_val),
                DT_RELA => info.rela_off = Some(d.d_val),
                DT_RELASZ => info.rela_size = Some(d.d_val),
                DT_RELAENT => info.rela_ent = Some(d.d_val),
                DT_RELACOUNT => info.rela_count = Some(d.d_val),
                DT_JMPREL => info.jmprel_off = Some(d.d_val),
                DT_PLTRELSZ => info.pltrel_size = Some(d.d_val),
                DT_INIT => info.init = Some(d.d_val),
                DT_FINI => info.fini = Some(d.d_val),
                DT_INIT_ARRAY => {
                    info.init_array = Some((d.d_val, info.init_array.map_or(0, |(_, s)| s)))
                }
                DT_INIT_ARRAYSZ => {
                    info.init_array = Some((info.init_array.map_or(0, |(o, _)| o), d.d_val))
                }
                DT_FINI_ARRAY => {
                    info.fini_array = Some((d.d_val, info.fini_array.map_or(0, |(_, s)| s)))
                }
                DT_FINI_ARRAYSZ => {
                    info.fini_array = Some((info.fini_array.map_or(0, |(o, _)| o), d.d_val))
                }
                DT_PREINIT_ARRAY => {
                    info.preinit_array =
                        Some((d.d_val, info.preinit_array.map_or(0, |(_, s)| s)))
                }
                DT_PREINIT_ARRAYSZ => {
                    info.preinit_array = Some((info.preinit_array.map_or(0, |(o, _)| o), d.d_val))
                }
                DT_NEEDED => info.needed.push(d.d_val),
                DT_SONAME => info.soname = Some(d.d_val),
                DT_RPATH => info.rpath = Some(d.d_val),
                DT_RUNPATH => info.runpath = Some(d.d_val),
                DT_FLAGS => info.flags = d.d_val,
                DT_FLAGS_1 => info.flags_1 = d.d_val,
                DT_DEBUG => info.debug_tag_addr = Some((idx as u64) * 16 + 8),
                DT_VERSYM => info.versym_off = Some(d.d_val),
                DT_VERDEF => info.verdef_off = Some(d.d_val),
                DT_VERDEFNUM => info.verdef_num = Some(d.d_val),
                DT_VERNEED => info.verneed_off = Some(d.d_val),
                DT_VERNEEDNUM => info.verneed_num = Some(d.d_val),
                _ => {}
            }
        }
        info
    }

    pub fn is_relro_requested(&self, segments: &[Segment]) -> bool {
        // Presence of a PT_GNU_RELRO segment is what actually drives relro;
        // flags are consulted by callers that want DF_BIND_NOW semantics.
        let _ = segments;
        self.flags & goblin::elf::dynamic::DF_BIND_NOW != 0
    }
}

/// One concrete mapped version of one shared object.
pub struct Image {
    pub path: PathBuf,
    pub base: usize,
    pub segments: Vec<Segment>,
    pub relro: Option<(u64, u64)>,
    pub program_headers: Vec<ProgramHeader>,
    pub dyn_info: DynInfo,
    pub symtab: Vec<Sym>,
    /// Raw file bytes, used for on-demand string-table and relocation-table lookups.
    pub file_bytes: Vec<u8>,
    pub relocs: RelocSet,
    pub tls: Option<TlsInfo>,
    pub needed: Vec<String>,
    pub soname: Option<String>,
    pub state: AtomicImageState,
    pub fd: Option<RawFd>,
    pub is_pie: bool,
    pub entry: u64,
    /// `versym` entries, index-aligned with `symtab`. Empty when the image
    /// carries no `DT_VERSYM` (i.e. it wasn't built with symbol versioning).
    pub versym: Vec<u16>,
    /// `verdef` version index -> version name, built by walking the
    /// `DT_VERDEF` chain once at parse time.
    pub verdef_names: HashMap<u16, String>,
    /// `verneed` version index -> version name, from the `DT_VERNEED` chain.
    /// Parsed and kept for completeness with spec's data model; not yet
    /// consulted by the resolver (lookups never carry a version derived from
    /// a requester's own `verneed` table, only an explicitly requested one).
    pub verneed_names: HashMap<u16, String>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("path", &self.path)
            .field("base", &self.base)
            .field("state", &self.state.get())
            .field("segments", &self.segments.len())
            .finish()
    }
}

impl Image {
    /// Loads an ELF file from `path` and parses it into a `Mapped` image.
    /// Does not run initializers and does not choose a final load address
    /// beyond what `base` already captures; that is the caller's
    /// concern when deciding the ASLR policy.
    pub fn load(path: &Path, base_hint: usize) -> Result<Self> {
        use std::os::unix::io::IntoRawFd;
        let file = File::open(path).map_err(LuciError::Io)?;
        let fd = file.into_raw_fd();
        let bytes = std::fs::read(path).map_err(LuciError::Io)?;
        let mut image = Self::parse_bytes(path.to_path_buf(), bytes, base_hint, Some(fd))?;
        let mapped_base = map_segments(&image.segments, &image.file_bytes, image.is_pie, image.base)?;
        image.base = mapped_base;
        image.state.set(ImageState::Mapped);
        Ok(image)
    }

    /// Parses an in-memory byte buffer as an ELF image. Used both by
    /// `load` and directly by tests against synthetic ELF layouts.
    pub fn parse_bytes(
        path: PathBuf,
        bytes: Vec<u8>,
        base: usize,
        fd: Option<RawFd>,
    ) -> Result<Self> {
        let elf = Elf::parse(&bytes).map_err(|e| LuciError::BadFormat {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        if elf.header.e_ident[goblin::elf::header::EI_CLASS] != goblin::elf::header::ELFCLASS64
            || elf.header.e_ident[goblin::elf::header::EI_DATA] != goblin::elf::header::ELFDATA2LSB
            || elf.header.e_machine != goblin::elf::header::EM_X86_64
            || !(elf.header.e_type == goblin::elf::header::ET_DYN
                || elf.header.e_type == goblin::elf::header::ET_EXEC)
        {
            return Err(LuciError::BadFormat {
                path,
                reason: "not a 64-bit little-endian x86-64 ET_DYN/ET_EXEC ELF".into(),
            });
        }
        let is_pie = elf.header.e_type == goblin::elf::header::ET_DYN;
        let base = if is_pie { base } else { 0 };

        let dynamic = elf
            .dynamic
            .as_ref()
            .map(|d| d.dyns.clone())
            .unwrap_or_default();
        let dyn_info = DynInfo::parse(&dynamic);

        if dyn_info.strtab_off.is_none() || dyn_info.symtab_off.is_none() {
            return Err(LuciError::BadFormat {
                path,
                reason: "missing DT_STRTAB or DT_SYMTAB".into(),
            });
        }
        if dyn_info.hash_off.is_none() && dyn_info.gnu_hash_off.is_none() {
            return Err(LuciError::BadFormat {
                path,
                reason: "missing DT_HASH and DT_GNU_HASH".into(),
            });
        }

        let mut segments = Vec::new();
        let mut relro = None;
        let mut tls_raw = None;
        for ph in elf.program_headers.iter() {
            match ph.p_type {
                PT_LOAD => {
                    let mut prot = Prot::empty();
                    if ph.p_flags & goblin::elf::program_header::PF_R != 0 {
                        prot |= Prot::READ;
                    }
                    if ph.p_flags & goblin::elf::program_header::PF_W != 0 {
                        prot |= Prot::WRITE;
                    }
                    if ph.p_flags & goblin::elf::program_header::PF_X != 0 {
                        prot |= Prot::EXEC;
                    }
                    segments.push(Segment {
                        offset: ph.p_offset,
                        vaddr: ph.p_vaddr,
                        filesz: ph.p_filesz,
                        memsz: ph.p_memsz,
                        prot,
                    });
                }
                PT_GNU_RELRO => relro = Some((ph.p_vaddr, ph.p_memsz)),
                PT_TLS => tls_raw = Some((ph.p_offset, ph.p_filesz, ph.p_memsz, ph.p_align)),
                PT_DYNAMIC => {}
                _ => {}
            }
        }
        if segments.is_empty() {
            return Err(LuciError::BadFormat {
                path,
                reason: "no PT_LOAD segments".into(),
            });
        }

        let symtab: Vec<Sym> = elf.dynsyms.iter().collect();
        let needed: Vec<String> = elf.libraries.iter().map(|s| s.to_string()).collect();
        let soname = elf.soname.map(|s| s.to_string());

        let relocs = RelocSet {
            eager: elf.dynrelas.iter().collect(),
            lazy: elf.pltrelocs.iter().collect(),
        };

        let tls = tls_raw.map(|(_off, filesz, memsz, align)| TlsInfo {
            init_image_offset: _off,
            init_size: filesz,
            block_size: memsz,
            align: align.max(1),
            module_id: 0, // assigned later by the TLS manager
            static_offset: None,
        });

        let strtab_file_off = dyn_info
            .strtab_off
            .and_then(|vaddr| file_offset_of(&segments, vaddr));
        let versym = parse_versym(&bytes, &segments, &dyn_info, symtab.len());
        let verdef_names = parse_verdef(&bytes, &segments, &dyn_info, strtab_file_off);
        let verneed_names = parse_verneed(&bytes, &segments, &dyn_info, strtab_file_off);

        Ok(Image {
            path,
            base,
            segments,
            relro,
            program_headers: elf.program_headers.iter().copied().collect(),
            dyn_info,
            symtab,
            file_bytes: bytes,
            relocs,
            tls,
            needed,
            soname,
            state: AtomicImageState::new(ImageState::Mapped),
            fd,
            is_pie,
            entry: elf.entry,
            versym,
            verdef_names,
            verneed_names,
        })
    }

    /// Address a relocated pointer would have in this image: `base + vaddr`
    /// for PIE/PIC, and `vaddr` directly (base is forced to 0) otherwise.
    pub fn addr(&self, vaddr: u64) -> usize {
        self.base + vaddr as usize
    }

    /// Reads a NUL-terminated string out of the dynamic string table.
    pub fn dynstr(&self, offset: u64) -> Result<&str> {
        let strtab_off = self.dyn_info.strtab_off.ok_or_else(|| LuciError::BadFormat {
            path: self.path.clone(),
            reason: "no string table".into(),
        })?;
        // strtab_off is a virtual address; resolve against the first PT_LOAD
        // segment it falls within to get a file offset.
        let file_off = self.vaddr_to_file_offset(strtab_off)? + offset;
        let start = file_off as usize;
        let bytes = &self.file_bytes[start..];
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        std::str::from_utf8(&bytes[..end]).map_err(|_| LuciError::BadFormat {
            path: self.path.clone(),
            reason: "non-utf8 string table entry".into(),
        })
    }

    fn vaddr_to_file_offset(&self, vaddr: u64) -> Result<u64> {
        file_offset_of(&self.segments, vaddr).ok_or_else(|| LuciError::BadFormat {
            path: self.path.clone(),
            reason: format!("vaddr {vaddr:#x} not within any PT_LOAD segment"),
        })
    }

    pub fn symbol_name(&self, sym: &Sym) -> Result<&str> {
        self.dynstr(sym.st_name as u64)
    }

    pub fn is_ifunc(sym: &Sym) -> bool {
        sym.st_type() == goblin::elf::sym::STT_GNU_IFUNC
    }

    pub fn is_weak(sym: &Sym) -> bool {
        sym.st_bind() == goblin::elf::sym::STB_WEAK
    }

    pub fn is_unique(sym: &Sym) -> bool {
        // STB_GNU_UNIQUE has no dedicated goblin constant; glibc defines it as 10.
        sym.st_bind() == 10
    }

    pub fn is_tls(sym: &Sym) -> bool {
        sym.st_type() == goblin::elf::sym::STT_TLS
    }

    /// The raw `versym` entry for `symtab[symtab_idx]`, or `None` if this
    /// image carries no `DT_VERSYM` table or the entry is the reserved
    /// "local" index (0).
    pub fn version_index(&self, symtab_idx: usize) -> Option<u16> {
        self.versym.get(symtab_idx).copied().filter(|&v| v != 0)
    }

    /// The `verdef` name backing `symtab[symtab_idx]`'s version, or `None`
    /// for an unversioned symbol (no `DT_VERSYM` entry, or the reserved
    /// "base"/global index 1, which names the file itself, not a version).
    pub fn version_name(&self, symtab_idx: usize) -> Option<&str> {
        let ndx = self.version_index(symtab_idx)? & !VERSYM_HIDDEN;
        if ndx < 2 {
            return None;
        }
        self.verdef_names.get(&ndx).map(|s| s.as_str())
    }

    /// Whether `symtab[symtab_idx]`'s version is a non-default (hidden)
    /// definition: a name-only lookup must skip it in favor of the default
    /// version of the same name, if any exists.
    pub fn version_is_hidden(&self, symtab_idx: usize) -> bool {
        self.version_index(symtab_idx)
            .map(|v| v & VERSYM_HIDDEN != 0)
            .unwrap_or(false)
    }
}

/// Resolves `vaddr` to a file offset via the first `PT_LOAD` segment it
/// falls within. Standalone (rather than `Image::vaddr_to_file_offset`)
/// because it's needed before the `Image` it would belong to is built.
fn file_offset_of(segments: &[Segment], vaddr: u64) -> Option<u64> {
    for seg in segments {
        if vaddr >= seg.vaddr && vaddr < seg.vaddr + seg.filesz {
            return Some(seg.offset + (vaddr - seg.vaddr));
        }
    }
    None
}

fn read_u16(bytes: &[u8], off: usize) -> Option<u16> {
    bytes.get(off..off + 2).map(|s| u16::from_le_bytes([s[0], s[1]]))
}

fn read_u32(bytes: &[u8], off: usize) -> Option<u32> {
    bytes
        .get(off..off + 4)
        .map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

fn read_cstr(bytes: &[u8], off: usize) -> Option<String> {
    let slice = bytes.get(off..)?;
    let end = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
    std::str::from_utf8(&slice[..end]).ok().map(str::to_string)
}

/// One entry per `symtab` index, parsed from `DT_VERSYM`. Empty when the
/// image carries no version table.
fn parse_versym(bytes: &[u8], segments: &[Segment], dyn_info: &DynInfo, symcount: usize) -> Vec<u16> {
    let Some(off) = dyn_info.versym_off.and_then(|v| file_offset_of(segments, v)) else {
        return Vec::new();
    };
    (0..symcount)
        .map(|i| read_u16(bytes, off as usize + i * 2).unwrap_or(0))
        .collect()
}

/// Walks the `DT_VERDEF` chain (`Elf64_Verdef` + first `Elf64_Verdaux`),
/// mapping each version index to its own name.
fn parse_verdef(
    bytes: &[u8],
    segments: &[Segment],
    dyn_info: &DynInfo,
    strtab_file_off: Option<u64>,
) -> HashMap<u16, String> {
    let mut map = HashMap::new();
    let (Some(base_vaddr), Some(count), Some(strtab_off)) =
        (dyn_info.verdef_off, dyn_info.verdef_num, strtab_file_off)
    else {
        return map;
    };
    let Some(mut off) = file_offset_of(segments, base_vaddr).map(|o| o as usize) else {
        return map;
    };
    for _ in 0..count {
        let (Some(vd_ndx), Some(vd_aux), Some(vd_next)) = (
            read_u16(bytes, off + 4),
            read_u32(bytes, off + 12),
            read_u32(bytes, off + 16),
        ) else {
            break;
        };
        let aux_off = off + vd_aux as usize;
        if let Some(vda_name) = read_u32(bytes, aux_off) {
            if let Some(name) = read_cstr(bytes, strtab_off as usize + vda_name as usize) {
                map.insert(vd_ndx & !VERSYM_HIDDEN, name);
            }
        }
        if vd_next == 0 {
            break;
        }
        off += vd_next as usize;
    }
    map
}

/// Walks the `DT_VERNEED` chain (`Elf64_Verneed` + `Elf64_Vernaux` list),
/// mapping each needed version index to its name.
fn parse_verneed(
    bytes: &[u8],
    segments: &[Segment],
    dyn_info: &DynInfo,
    strtab_file_off: Option<u64>,
) -> HashMap<u16, String> {
    let mut map = HashMap::new();
    let (Some(base_vaddr), Some(count), Some(strtab_off)) =
        (dyn_info.verneed_off, dyn_info.verneed_num, strtab_file_off)
    else {
        return map;
    };
    let Some(mut off) = file_offset_of(segments, base_vaddr).map(|o| o as usize) else {
        return map;
    };
    for _ in 0..count {
        let (Some(vn_cnt), Some(vn_aux), Some(vn_next)) = (
            read_u16(bytes, off + 2),
            read_u32(bytes, off + 8),
            read_u32(bytes, off + 12),
        ) else {
            break;
        };
        let mut aux_off = off + vn_aux as usize;
        for _ in 0..vn_cnt {
            let (Some(vna_other), Some(vna_name), Some(vna_next)) = (
                read_u16(bytes, aux_off + 6),
                read_u32(bytes, aux_off + 8),
                read_u32(bytes, aux_off + 12),
            ) else {
                break;
            };
            if let Some(name) = read_cstr(bytes, strtab_off as usize + vna_name as usize) {
                map.insert(vna_other & !VERSYM_HIDDEN, name);
            }
            if vna_next == 0 {
                break;
            }
            aux_off += vna_next as usize;
        }
        if vn_next == 0 {
            break;
        }
        off += vn_next as usize;
    }
    map
}

/// Maps `segments` into this process's address space and returns the base
/// address actually used. For PIE/PIC images (`is_pie`), a fresh range is
/// reserved with an anonymous `PROT_NONE` mapping (letting the kernel pick
/// an unused region) and each segment is then re-mapped `MAP_FIXED` inside
/// that already-owned range — the same two-step "reserve, then place"
/// discipline `ld.so` uses, which avoids ever asking the kernel for
/// `MAP_FIXED` against a guessed, possibly-occupied address. Non-PIE images
/// declare absolute virtual addresses and are placed there directly;
/// `base_hint` is ignored for PIE images and must be `0` for non-PIE ones.
///
/// # Safety
/// Not actually unsafe in the Rust sense (all raw pointer work is
/// encapsulated), but calling this twice for overlapping segment ranges, or
/// for a non-PIE image whose absolute addresses collide with the caller's
/// own mapped segments, will corrupt this process's memory.
fn map_segments(segments: &[Segment], file_bytes: &[u8], is_pie: bool, base_hint: usize) -> Result<usize> {
    if segments.is_empty() {
        return Ok(base_hint);
    }
    let low = segments.iter().map(|s| s.vaddr as usize).min().unwrap();
    let high = segments
        .iter()
        .map(|s| s.vaddr as usize + s.memsz as usize)
        .max()
        .unwrap();
    let span = page_ceil(high) - page_floor(low);

    let base = if is_pie {
        let reservation = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                span,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if reservation == libc::MAP_FAILED {
            return Err(LuciError::ResourceExhausted {
                reason: format!("failed to reserve {span} bytes for image mapping: {}", std::io::Error::last_os_error()),
            });
        }
        reservation as usize - page_floor(low)
    } else {
        base_hint
    };

    for seg in segments {
        let seg_start = base + page_floor(seg.vaddr as usize);
        let seg_end = base + page_ceil(seg.vaddr as usize + seg.memsz as usize);
        let len = seg_end - seg_start;
        let mapped = unsafe {
            libc::mmap(
                seg_start as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(LuciError::ResourceExhausted {
                reason: format!("failed to map segment at {seg_start:#x}: {}", std::io::Error::last_os_error()),
            });
        }

        let dst_off = base + seg.vaddr as usize;
        let src = seg.offset as usize;
        let copy_len = seg.filesz as usize;
        if src + copy_len > file_bytes.len() {
            return Err(LuciError::BadFormat {
                path: PathBuf::new(),
                reason: "segment file range exceeds file size".into(),
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                file_bytes[src..src + copy_len].as_ptr(),
                dst_off as *mut u8,
                copy_len,
            );
        }

        let rc = unsafe { libc::mprotect(seg_start as *mut libc::c_void, len, seg.prot.to_libc()) };
        if rc != 0 {
            return Err(LuciError::ResourceExhausted {
                reason: format!("mprotect({seg_start:#x}) failed: {}", std::io::Error::last_os_error()),
            });
        }
    }

    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_magic_is_rejected() {
        let bytes = vec![0u8; 64];
        let err = Image::parse_bytes(PathBuf::from("bogus"), bytes, 0, None).unwrap_err();
        assert!(matches!(err, LuciError::BadFormat { .. }));
    }

    #[test]
    fn prot_bits_translate_to_libc() {
        let prot = Prot::READ | Prot::EXEC;
        assert_eq!(prot.to_libc(), libc::PROT_READ | libc::PROT_EXEC);
    }
}
