//! Symbol resolver: scope-aware, versioned, weak-aware lookup across
//! the multi-version chain.

use crate::errors::{LuciError, Result};
use crate::identity::Identity;
use crate::image::Image;
use goblin::elf::Sym;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeMode {
    Global,
    Local,
    Deep,
}

/// An ordered list of Identity references used to resolve a symbol reference.
#[derive(Debug, Default, Clone)]
pub struct Scope {
    pub entries: Vec<(Arc<Identity>, ScopeMode)>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, identity: Arc<Identity>, mode: ScopeMode) {
        self.entries.push((identity, mode));
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LookupFlags: u8 {
        const WEAK_OK          = 0b0001;
        const FIRST_GLOBAL_ONLY = 0b0010;
        const DEEP             = 0b0100;
        const SELF_ONLY        = 0b1000;
    }
}

/// A resolved symbol reference.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub identity: Arc<Identity>,
    pub image_base: usize,
    pub symtab_index: usize,
    pub value: usize,
    pub tls: Option<(u32, i64)>,
}

/// Key for the per-(requester, name, version) resolution cache. Invalidated
/// whenever the callee's chain adds a version (see `ResolutionCache::invalidate_for`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    requester: usize, // Arc<Image> pointer identity
    name: String,
    version: Option<String>,
}

#[derive(Default)]
pub struct ResolutionCache {
    entries: Mutex<HashMap<CacheKey, Resolution>>,
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(requester: &Image, name: &str, version: Option<&str>) -> CacheKey {
        CacheKey {
            requester: requester as *const Image as usize,
            name: name.to_string(),
            version: version.map(str::to_string),
        }
    }

    pub fn get(&self, requester: &Image, name: &str, version: Option<&str>) -> Option<Resolution> {
        self.entries
            .lock()
            .unwrap()
            .get(&Self::key(requester, name, version))
            .cloned()
    }

    pub fn put(&self, requester: &Image, name: &str, version: Option<&str>, res: Resolution) {
        self.entries
            .lock()
            .unwrap()
            .insert(Self::key(requester, name, version), res);
    }

    /// Drops every cache entry whose resolved identity is `identity`,
    /// called whenever that identity's chain grows a new version.
    pub fn invalidate_for(&self, identity: &Identity) {
        self.entries
            .lock()
            .unwrap()
            .retain(|_, res| !std::ptr::eq(res.identity.as_ref(), identity));
    }
}

/// Process-wide registry of `STB_GNU_UNIQUE` definitions: exactly one
/// definition wins process-wide, and every later candidate binds to it.
#[derive(Default)]
pub struct UniqueSymbols {
    winners: Mutex<HashMap<String, Resolution>>,
}

impl UniqueSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the winning resolution for `name`, registering `candidate` as
    /// the winner if none exists yet.
    pub fn resolve(&self, name: &str, candidate: Resolution) -> Resolution {
        let mut winners = self.winners.lock().unwrap();
        winners.entry(name.to_string()).or_insert(candidate).clone()
    }
}

/// Cache of IFUNC resolver results, keyed by the resolved (un-invoked)
/// resolver function address. Invoked once, then treated as immutable.
#[derive(Default)]
pub struct IfuncCache {
    results: Mutex<HashMap<usize, usize>>,
}

impl IfuncCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls `resolver_addr` as a zero-argument function pointer returning
    /// the final address, caching the result. `resolver_addr` must already
    /// point at fully relocated code (every non-`IRELATIVE` relocation of
    /// the defining image having been applied).
    ///
    /// # Safety
    /// `resolver_addr` must be a valid, callable function pointer taking no
    /// arguments and returning a `usize`-sized value.
    pub unsafe fn resolve(&self, resolver_addr: usize) -> usize {
        if let Some(&cached) = self.results.lock().unwrap().get(&resolver_addr) {
            return cached;
        }
        let f: extern "C" fn() -> usize = std::mem::transmute(resolver_addr);
        let value = f();
        self.results.lock().unwrap().insert(resolver_addr, value);
        value
    }
}

/// Resolves `name` against `scope`, applying binding precedence (strong
/// beats weak across scope order) and unique-symbol singleton semantics.
pub fn lookup(
    scope: &Scope,
    requester: &Image,
    name: &str,
    version: Option<&str>,
    flags: LookupFlags,
    cache: &ResolutionCache,
    unique: &UniqueSymbols,
) -> Result<Resolution> {
    if let Some(cached) = cache.get(requester, name, version) {
        return Ok(cached);
    }

    let effective_scope: Vec<(Arc<Identity>, ScopeMode)> = if flags.contains(LookupFlags::DEEP) {
        Vec::new() // caller is expected to have pushed requester's own identity for DEEP lookups
    } else {
        scope.entries.clone()
    };

    let mut weak_candidate: Option<Resolution> = None;

    for (identity, mode) in &effective_scope {
        if flags.contains(LookupFlags::SELF_ONLY) && *mode != ScopeMode::Deep {
            continue;
        }
        let image = identity.current_image();
        if let Some((idx, sym)) = find_symbol_in_image(&image, name, version) {
            if Image::is_unique(&sym) {
                let candidate = Resolution {
                    identity: identity.clone(),
                    image_base: image.base,
                    symtab_index: idx,
                    value: image.addr(sym.st_value),
                    tls: tls_pair(&image, &sym),
                };
                return Ok(unique.resolve(name, candidate));
            }
            let resolution = Resolution {
                identity: identity.clone(),
                image_base: image.base,
                symtab_index: idx,
                value: image.addr(sym.st_value),
                tls: tls_pair(&image, &sym),
            };
            if Image::is_weak(&sym) {
                if !flags.contains(LookupFlags::WEAK_OK) {
                    continue;
                }
                if weak_candidate.is_none() {
                    weak_candidate = Some(resolution);
                }
                continue;
            }
            cache.put(requester, name, version, resolution.clone());
            return Ok(resolution);
        }
        if flags.contains(LookupFlags::FIRST_GLOBAL_ONLY) && *mode == ScopeMode::Global {
            break;
        }
    }

    if let Some(weak) = weak_candidate {
        cache.put(requester, name, version, weak.clone());
        return Ok(weak);
    }

    Err(LuciError::NotFound {
        what: name.to_string(),
    })
}

/// Probes one image's `current` symbol table for `name`, honoring the
/// version matching order: an explicit `version` must match the `verdef`
/// name on that symtab entry exactly (a differently-versioned definition of
/// the same name does not satisfy the lookup); with no `version` requested,
/// the default (non-hidden) definition wins, falling back to whatever
/// definition exists if none is marked default.
fn find_symbol_in_image(image: &Image, name: &str, version: Option<&str>) -> Option<(usize, Sym)> {
    let mut fallback: Option<(usize, Sym)> = None;
    for (idx, sym) in image.symtab.iter().enumerate() {
        if sym.st_shndx == 0 {
            continue; // undefined in this image
        }
        let Ok(sym_name) = image.symbol_name(sym) else {
            continue;
        };
        if sym_name != name {
            continue;
        }
        match version {
            Some(want) => {
                if image.version_name(idx) == Some(want) {
                    return Some((idx, *sym));
                }
                // A differently-versioned definition of the same name must
                // not silently satisfy a version-qualified lookup.
            }
            None => {
                if !image.version_is_hidden(idx) {
                    return Some((idx, *sym));
                }
                if fallback.is_none() {
                    fallback = Some((idx, *sym));
                }
            }
        }
    }
    if version.is_none() {
        fallback
    } else {
        None
    }
}

fn tls_pair(image: &Image, sym: &Sym) -> Option<(u32, i64)> {
    if Image::is_tls(sym) {
        image.tls.as_ref().map(|t| (t.module_id, sym.st_value as i64))
    } else {
        None
    }
}

/// GNU hash function (used to probe `.gnu.hash` buckets before falling back
/// to the SysV `.hash` table).
pub fn gnu_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 5381;
    for &b in name {
        h = h.wrapping_mul(33).wrapping_add(b as u32);
    }
    h
}

/// SysV ELF hash function, used as a fallback when `.gnu.hash` is absent.
pub fn sysv_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &b in name {
        h = (h << 4).wrapping_add(b as u32);
        let g = h & 0xf0000000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gnu_hash_of_empty_is_seed() {
        assert_eq!(gnu_hash(b""), 5381);
    }

    #[test]
    fn gnu_hash_is_deterministic() {
        assert_eq!(gnu_hash(b"printf"), gnu_hash(b"printf"));
        assert_ne!(gnu_hash(b"printf"), gnu_hash(b"scanf"));
    }

    #[test]
    fn sysv_hash_of_empty_is_zero() {
        assert_eq!(sysv_hash(b""), 0);
    }
}
