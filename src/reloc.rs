//! Relocation engine: applies and re-applies relocations against the
//! live process image, including the DSU-specific re-relocation protocol
//! that runs when a new version of a dependency is attached.

use crate::errors::{LuciError, Result};
use crate::identity::Identity;
use crate::image::{Image, Prot};
use crate::resolver::{IfuncCache, LookupFlags, ResolutionCache, Scope, UniqueSymbols};
use goblin::elf::reloc::{
    R_X86_64_64, R_X86_64_COPY, R_X86_64_DTPMOD64, R_X86_64_DTPOFF64, R_X86_64_GLOB_DAT,
    R_X86_64_IRELATIVE, R_X86_64_JUMP_SLOT, R_X86_64_PC32, R_X86_64_RELATIVE, R_X86_64_TPOFF64,
};
use std::sync::Arc;

/// A single pending write produced while evaluating relocations for one
/// image, not yet committed to memory. Collecting writes before applying
/// any of them is what gives re-relocation its "publish after all written"
/// semantics (§4.4 step 3).
///
/// `Word` covers every relocation whose result is one pointer-sized store
/// (`RELATIVE`, `GLOB_DAT`, `JUMP_SLOT`, ...). `Copy` is `R_X86_64_COPY`'s
/// own shape: the defining image's object bytes, `size` of them, copied
/// into the destination slot rather than a single word written there.
#[derive(Debug, Clone, Copy)]
pub enum PendingWrite {
    Word { addr: usize, value: usize },
    Copy { addr: usize, src: usize, size: usize },
}

/// Applies the eager (`DT_RELA`) relocation list of `image` against `scope`,
/// dependency-leaves first (the caller is responsible for ordering images
/// themselves; this function only concerns itself with one image's table).
pub fn relocate_image(
    image: &Image,
    self_identity: &Arc<Identity>,
    scope: &Scope,
    cache: &ResolutionCache,
    unique: &UniqueSymbols,
    ifuncs: &IfuncCache,
    lazy_now: bool,
) -> Result<Vec<PendingWrite>> {
    let mut writes = Vec::new();
    for rela in &image.relocs.eager {
        writes.push(apply_one(image, self_identity, scope, cache, unique, ifuncs, rela)?);
    }
    if lazy_now {
        for rela in &image.relocs.lazy {
            writes.push(apply_one(image, self_identity, scope, cache, unique, ifuncs, rela)?);
        }
    }
    Ok(writes)
}

fn apply_one(
    image: &Image,
    self_identity: &Arc<Identity>,
    scope: &Scope,
    cache: &ResolutionCache,
    unique: &UniqueSymbols,
    ifuncs: &IfuncCache,
    rela: &goblin::elf::Rela,
) -> Result<PendingWrite> {
    let addr = image.addr(rela.r_offset);
    let r_type = rela.r_type;
    let r_sym = rela.r_sym;
    let addend = rela.r_addend.unwrap_or(0);

    if r_type == R_X86_64_COPY {
        let sym = image
            .symtab
            .get(r_sym as usize)
            .ok_or_else(|| LuciError::BadFormat {
                path: image.path.clone(),
                reason: "COPY relocation references out-of-range symbol".into(),
            })?;
        let name = image.symbol_name(sym)?;
        let resolution = crate::resolver::lookup(
            scope,
            image,
            name,
            None,
            LookupFlags::empty(),
            cache,
            unique,
        )?;
        return Ok(PendingWrite::Copy {
            addr,
            src: resolution.value,
            size: sym.st_size as usize,
        });
    }

    let value = match r_type {
        R_X86_64_RELATIVE => (image.base as i64 + addend) as usize,
        R_X86_64_IRELATIVE => {
            let resolver_addr = (image.base as i64 + addend) as usize;
            unsafe { ifuncs.resolve(resolver_addr) }
        }
        R_X86_64_64 | R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT | R_X86_64_PC32 => {
            let sym = image
                .symtab
                .get(r_sym as usize)
                .ok_or_else(|| LuciError::BadFormat {
                    path: image.path.clone(),
                    reason: format!("relocation references out-of-range symbol {r_sym}"),
                })?;
            let name = image.symbol_name(sym)?;
            let resolution = crate::resolver::lookup(
                scope,
                image,
                name,
                None,
                LookupFlags::WEAK_OK,
                cache,
                unique,
            );
            let sym_value = match resolution {
                Ok(res) => res.value,
                Err(LuciError::NotFound { .. }) if crate::image::Image::is_weak(sym) => 0,
                Err(e) => return Err(e),
            };
            match r_type {
                R_X86_64_64 => (sym_value as i64 + addend) as usize,
                R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT => sym_value,
                R_X86_64_PC32 => (sym_value as i64 + addend - addr as i64) as usize,
                _ => unreachable!(),
            }
        }
        R_X86_64_DTPMOD64 => {
            let definer_tls = resolve_tls_definer(image, scope, cache, unique, r_sym)?;
            definer_tls
                .map(|(module_id, _)| module_id as usize)
                .unwrap_or_else(|| {
                    self_identity
                        .current_image()
                        .tls
                        .as_ref()
                        .map(|t| t.module_id as usize)
                        .unwrap_or(0)
                })
        }
        R_X86_64_DTPOFF64 => {
            let definer_tls = resolve_tls_definer(image, scope, cache, unique, r_sym)?;
            let sym_offset = definer_tls.map(|(_, offset)| offset).unwrap_or(0);
            (sym_offset + addend) as usize
        }
        R_X86_64_TPOFF64 => {
            let sym = image.symtab.get(r_sym as usize).ok_or_else(|| LuciError::BadFormat {
                path: image.path.clone(),
                reason: "TPOFF64 relocation references out-of-range symbol".into(),
            })?;
            let tls = image.tls.as_ref().ok_or_else(|| LuciError::Conflict {
                reason: "TPOFF64 relocation in image without PT_TLS".into(),
            })?;
            let static_offset = tls.static_offset.ok_or_else(|| LuciError::Conflict {
                reason: "TPOFF64 relocation against a non-static TLS module".into(),
            })?;
            (static_offset as i64 + sym.st_value as i64 + addend) as usize
        }
        other => {
            return Err(LuciError::BadFormat {
                path: image.path.clone(),
                reason: format!("unsupported relocation type {other}"),
            })
        }
    };

    Ok(PendingWrite::Word { addr, value })
}

/// Finds the module id and module-relative offset of the symbol an
/// `R_X86_64_DTPMOD64`/`R_X86_64_DTPOFF64` pair refers to. A symbol defined
/// in `image` itself resolves to `image`'s own TLS block; an undefined
/// reference is resolved through `scope` like any other symbol, so an
/// `extern __thread` variable defined in a different shared object yields
/// that object's module id, not the referencer's.
fn resolve_tls_definer(
    image: &Image,
    scope: &Scope,
    cache: &ResolutionCache,
    unique: &UniqueSymbols,
    r_sym: u32,
) -> Result<Option<(u32, i64)>> {
    if r_sym == 0 {
        return Ok(None);
    }
    let sym = match image.symtab.get(r_sym as usize) {
        Some(s) => s,
        None => return Ok(None),
    };
    if sym.st_shndx != 0 {
        return Ok(image.tls.as_ref().map(|t| (t.module_id, sym.st_value as i64)));
    }
    let name = image.symbol_name(sym)?;
    match crate::resolver::lookup(scope, image, name, None, LookupFlags::WEAK_OK, cache, unique) {
        Ok(res) => Ok(res.tls),
        Err(LuciError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Commits previously-computed writes to memory, remapping RELRO ranges
/// writable first if necessary, then issuing a memory fence so the batch
/// becomes visible as a unit (§4.4 step 3: "publish after all written").
///
/// # Safety
/// `addr` (and, for `Copy`, `src`/`size`) in every `PendingWrite` must
/// denote valid, currently-mapped memory within `image`'s segments (and,
/// for `Copy`, the defining image's segments), non-overlapping.
pub unsafe fn commit_writes(image: &Image, writes: &[PendingWrite]) -> Result<()> {
    let relro_range = image.relro.map(|(vaddr, size)| {
        let start = image.addr(vaddr);
        (start, start + size as usize)
    });

    if let Some((start, end)) = relro_range {
        unprotect_range(start, end - start)?;
    }

    for w in writes {
        match *w {
            PendingWrite::Word { addr, value } => {
                let ptr = addr as *mut usize;
                ptr.write_unaligned(value);
            }
            PendingWrite::Copy { addr, src, size } => {
                apply_copy_reloc(addr, src, size)?;
            }
        }
    }

    // Ensure all writes above are globally visible before any subsequent
    // symbol lookup can observe `current` pointing at the new version.
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);

    if let Some((start, end)) = relro_range {
        reprotect_range(start, end - start, Prot::READ)?;
    }

    Ok(())
}

/// Copies `size` bytes from `src` into `dst`, used for `R_X86_64_COPY`.
/// Size mismatch between the exporting symbol's size at `v_old` and the
/// destination slot's declared size is a conflict, not silently truncated.
///
/// # Safety
/// `src` and `dst` must both denote `size` readable/writable bytes
/// respectively, non-overlapping.
pub unsafe fn apply_copy_reloc(dst: usize, src: usize, size: usize) -> Result<()> {
    if size == 0 {
        return Err(LuciError::Conflict {
            reason: "COPY relocation with zero-sized source symbol".into(),
        });
    }
    std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, size);
    Ok(())
}

fn unprotect_range(addr: usize, len: usize) -> Result<()> {
    mprotect(addr, len, Prot::READ | Prot::WRITE)
}

fn reprotect_range(addr: usize, len: usize, prot: Prot) -> Result<()> {
    mprotect(addr, len, prot)
}

fn mprotect(addr: usize, len: usize, prot: Prot) -> Result<()> {
    let page_size = page_size();
    let aligned_addr = addr & !(page_size - 1);
    let aligned_len = len + (addr - aligned_addr);
    let rc = unsafe {
        libc::mprotect(
            aligned_addr as *mut libc::c_void,
            aligned_len,
            prot.to_libc(),
        )
    };
    if rc != 0 {
        return Err(LuciError::ResourceExhausted {
            reason: format!("mprotect({aligned_addr:#x}, {aligned_len}) failed: {}", std::io::Error::last_os_error()),
        });
    }
    Ok(())
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Re-relocates every currently loaded dependent image `D` that references
/// identity `I`, when `I` attaches a new version. Returns the per-image
/// pending writes so the caller can commit them as one batch per image
/// (§4.4's re-relocation protocol, steps 1-3).
///
/// A relocation slot whose defining function was declared incompatible by
/// the DSU compatibility check (step 4) is excluded from `compatible_syms`
/// by the caller and is therefore left untouched, continuing to point at
/// `v_old`.
pub fn rerelocate_dependents(
    dependents: &[(Arc<Identity>, Arc<Image>)],
    updated_identity: &Arc<Identity>,
    scope_of: impl Fn(&Identity) -> Scope,
    cache: &ResolutionCache,
    unique: &UniqueSymbols,
    ifuncs: &IfuncCache,
    compatible_syms: &dyn Fn(&str) -> bool,
) -> Result<Vec<(Arc<Image>, Vec<PendingWrite>)>> {
    // A fresh version invalidates every cache entry that used to resolve
    // into the updated identity; stale addresses must not survive into the
    // new pending-writes computation.
    cache.invalidate_for(updated_identity);

    let mut results = Vec::new();
    for (dep_identity, dep_image) in dependents {
        if !dep_image
            .needed
            .iter()
            .any(|n| n == updated_identity.path.file_name().and_then(|f| f.to_str()).unwrap_or(""))
        {
            continue;
        }
        let scope = scope_of(dep_identity);
        let mut writes = Vec::new();
        for rela in dep_image
            .relocs
            .eager
            .iter()
            .chain(dep_image.relocs.lazy.iter())
        {
            let sym = dep_image.symtab.get(rela.r_sym as usize);
            let name = match sym.and_then(|s| dep_image.symbol_name(s).ok()) {
                Some(n) => n,
                None => continue,
            };
            if !compatible_syms(name) {
                continue; // keep pointing at v_old, per §4.4 step 4
            }
            let write = apply_one(dep_image, dep_identity, &scope, cache, unique, ifuncs, rela)?;
            writes.push(write);
        }
        if !writes.is_empty() {
            results.push((dep_image.clone(), writes));
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_write_word_carries_addr_and_value() {
        let w = PendingWrite::Word { addr: 0x1000, value: 0x2000 };
        match w {
            PendingWrite::Word { addr, value } => {
                assert_eq!(addr, 0x1000);
                assert_eq!(value, 0x2000);
            }
            PendingWrite::Copy { .. } => panic!("expected Word"),
        }
    }

    #[test]
    fn pending_write_copy_carries_src_and_size() {
        let w = PendingWrite::Copy { addr: 0x1000, src: 0x2000, size: 16 };
        match w {
            PendingWrite::Copy { addr, src, size } => {
                assert_eq!(addr, 0x1000);
                assert_eq!(src, 0x2000);
                assert_eq!(size, 16);
            }
            PendingWrite::Word { .. } => panic!("expected Copy"),
        }
    }

    #[test]
    fn copy_reloc_copies_bytes_not_a_pointer() {
        let src: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
        let mut dst: [u8; 8] = [0; 8];
        unsafe {
            apply_copy_reloc(dst.as_mut_ptr() as usize, src.as_ptr() as usize, 8).unwrap();
        }
        assert_eq!(dst, src);
    }
}
