//! Public API: dynamic open/close/sym/info/addr, namespaces, and
//! `dl_iterate_phdr`.

use crate::entry;
use crate::errors::{LuciError, Result};
use crate::identity::{Identity, IdentityChain};
use crate::image::{Image, ImageState};
use crate::initfini::{self, DepNode};
use crate::loader_lock::LoaderLock;
use crate::reloc;
use crate::resolver::{self, IfuncCache, LookupFlags, Resolution, ResolutionCache, Scope, ScopeMode, UniqueSymbols};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const LAZY     = 0b0000_0001;
        const NOW      = 0b0000_0010;
        const GLOBAL   = 0b0000_0100;
        const LOCAL    = 0b0000_1000;
        const NOLOAD   = 0b0001_0000;
        const NODELETE = 0b0010_0000;
        const DEEPBIND = 0b0100_0000;
    }
}

/// Selects among isolated load sets. `DEFAULT` is the process's global
/// namespace; others are created on demand up to `namespace_limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NamespaceId(pub u32);

impl NamespaceId {
    pub const DEFAULT: NamespaceId = NamespaceId(0);
}

/// An opaque handle bound to a Scope and an Identity, returned by `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u64);

impl Handle {
    /// The handle representing the base executable's own global scope.
    pub const DEFAULT: Handle = Handle(0);
    /// The handle representing "the rest of the global scope after the caller".
    pub const NEXT: Handle = Handle(1);
}

struct HandleEntry {
    identity: Arc<Identity>,
    scope: Scope,
    refcount: u32,
    namespace: NamespaceId,
}

pub enum InfoRequest {
    LinkMapAddr,
    ScopeList,
    SearchPath,
    TlsModuleId,
}

pub enum InfoResponse {
    LinkMapAddr(usize),
    ScopeList(Vec<PathBuf>),
    SearchPath(Vec<PathBuf>),
    TlsModuleId(Option<u32>),
}

/// A snapshot of one image's program headers, handed to `iterate_phdr` callbacks.
pub struct PhdrInfo {
    pub base: usize,
    pub name: PathBuf,
    pub program_headers: Vec<goblin::elf::ProgramHeader>,
    pub tls_module_id: Option<u32>,
}

/// The process-wide public surface: owns the identity chain, the default
/// (global) scope, namespaces, and open handles.
pub struct Loader {
    pub chain: Arc<IdentityChain>,
    pub lock: LoaderLock,
    pub cache: Arc<ResolutionCache>,
    pub unique: Arc<UniqueSymbols>,
    pub ifuncs: Arc<IfuncCache>,
    pub search_path: Mutex<Vec<PathBuf>>,
    default_scope: Mutex<Scope>,
    handles: Mutex<HashMap<u64, HandleEntry>>,
    next_handle: AtomicU64,
    namespace_limit: usize,
    namespaces_created: Mutex<u32>,
}

impl Loader {
    pub fn new(search_path: Vec<PathBuf>, namespace_limit: usize) -> Self {
        Loader {
            chain: Arc::new(IdentityChain::new()),
            lock: LoaderLock::new(),
            cache: Arc::new(ResolutionCache::new()),
            unique: Arc::new(UniqueSymbols::new()),
            ifuncs: Arc::new(IfuncCache::new()),
            search_path: Mutex::new(search_path),
            default_scope: Mutex::new(Scope::new()),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(2), // 0 and 1 are reserved (DEFAULT, NEXT)
            namespace_limit,
            namespaces_created: Mutex::new(0),
        }
    }

    /// Resolves `name` against `search_path` and any `rpath`/`runpath`
    /// recorded on the requesting image, returning the first existing file.
    pub fn resolve_path(&self, name: &str, requester_runpath: &[PathBuf]) -> Result<PathBuf> {
        if name.contains('/') {
            let p = PathBuf::from(name);
            if p.exists() {
                return Ok(p);
            }
            return Err(LuciError::NotFound { what: name.to_string() });
        }
        for dir in requester_runpath
            .iter()
            .chain(self.search_path.lock().unwrap().iter())
        {
            let candidate = dir.join(name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(LuciError::NotFound { what: name.to_string() })
    }

    /// Loads (or, if already loaded and `NOLOAD` isn't forcing a fresh
    /// check, returns) `path`, binding a new handle to a fresh Scope.
    pub fn open(&self, path: &Path, flags: OpenFlags, ns: NamespaceId) -> Result<Handle> {
        let _guard = self.lock.acquire();

        if ns != NamespaceId::DEFAULT {
            let mut created = self.namespaces_created.lock().unwrap();
            if (*created as usize) >= self.namespace_limit {
                return Err(LuciError::ResourceExhausted {
                    reason: "namespace ceiling reached".into(),
                });
            }
            *created += 1;
        }

        let identity = self.chain.intern(path)?;
        let already_loaded = identity.version_count() > 0;

        if !already_loaded && flags.contains(OpenFlags::NOLOAD) {
            return Err(LuciError::NotFound {
                what: format!("{path:?} not already loaded (NOLOAD)"),
            });
        }

        let mut newly_loaded: Vec<Arc<Identity>> = Vec::new();
        if !already_loaded {
            let mut seen = HashSet::new();
            entry::load_closure_recursive(self, path, &mut newly_loaded, &mut seen)?;
        }

        let mut scope = Scope::new();
        let mode = if flags.contains(OpenFlags::LOCAL) {
            ScopeMode::Local
        } else {
            ScopeMode::Global
        };
        scope.push(identity.clone(), mode);
        if flags.contains(OpenFlags::GLOBAL) {
            let mut global = self.default_scope.lock().unwrap();
            global.push(identity.clone(), ScopeMode::Global);
        }

        if !newly_loaded.is_empty() {
            self.relocate_and_init(&newly_loaded, flags.contains(OpenFlags::NOW))?;
        }

        let handle_id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().unwrap().insert(
            handle_id,
            HandleEntry {
                identity,
                scope,
                refcount: 1,
                namespace: ns,
            },
        );
        Ok(Handle(handle_id))
    }

    /// Drives newly-mapped images through relocation and initializer
    /// execution: `MAPPED -> RELOCATING -> INITIALIZING -> READY` per
    /// identity. `order` must be in pre-order (a module before its own
    /// `DT_NEEDED` entries), the shape `entry::load_closure_recursive`
    /// produces; relocation runs leaves-first (the reverse), initializers
    /// in dependency order. None of `order`'s images is ever the initial
    /// process executable, so constructors always run with `is_main = false`.
    fn relocate_and_init(&self, order: &[Arc<Identity>], lazy_now: bool) -> Result<()> {
        let mut scope = Scope::new();
        for identity in self.chain.all() {
            scope.push(identity, ScopeMode::Global);
        }

        for identity in order.iter().rev() {
            let image = identity.current_image();
            image.state.set(ImageState::Relocating);
            let writes = reloc::relocate_image(
                &image,
                identity,
                &scope,
                &self.cache,
                &self.unique,
                &self.ifuncs,
                lazy_now,
            )?;
            unsafe {
                reloc::commit_writes(&image, &writes)?;
            }
        }

        let nodes: Vec<DepNode> = order
            .iter()
            .map(|identity| {
                let image = identity.current_image();
                let needed: Vec<Arc<Identity>> = image
                    .needed
                    .iter()
                    .filter_map(|name| {
                        order
                            .iter()
                            .find(|id| id.path.file_name().and_then(|f| f.to_str()) == Some(name.as_str()))
                            .cloned()
                    })
                    .collect();
                DepNode { identity: identity.clone(), needed }
            })
            .collect();
        let init_order = initfini::topo_order(&nodes);

        for identity in &init_order {
            let image = identity.current_image();
            image.state.set(ImageState::Initializing);
            unsafe {
                initfini::run_constructors(&image, false)?;
            }
            image.state.set(ImageState::Ready);
        }
        Ok(())
    }

    /// Decrements the handle's refcount; at zero its scope entries are
    /// dropped and the caller should run the retirement predicate over any
    /// Identity it uniquely held.
    pub fn close(&self, handle: Handle) -> Result<()> {
        let _guard = self.lock.acquire();
        if handle == Handle::DEFAULT || handle == Handle::NEXT {
            return Ok(());
        }
        let mut handles = self.handles.lock().unwrap();
        let entry = handles
            .get_mut(&handle.0)
            .ok_or_else(|| LuciError::NotFound { what: "handle".into() })?;
        entry.refcount -= 1;
        if entry.refcount == 0 {
            handles.remove(&handle.0);
        }
        Ok(())
    }

    fn scope_for(&self, handle: Handle) -> Result<Scope> {
        if handle == Handle::DEFAULT || handle == Handle::NEXT {
            return Ok(self.default_scope.lock().unwrap().clone());
        }
        let handles = self.handles.lock().unwrap();
        handles
            .get(&handle.0)
            .map(|e| e.scope.clone())
            .ok_or_else(|| LuciError::NotFound { what: "handle".into() })
    }

    pub fn sym(&self, handle: Handle, name: &str) -> Result<Resolution> {
        self.vsym(handle, name, None)
    }

    pub fn vsym(&self, handle: Handle, name: &str, version: Option<&str>) -> Result<Resolution> {
        let _guard = self.lock.acquire();
        let scope = self.scope_for(handle)?;
        let requester_image = scope
            .entries
            .first()
            .map(|(id, _)| id.current_image())
            .ok_or_else(|| LuciError::NotFound { what: "empty scope".into() })?;
        resolver::lookup(
            &scope,
            &requester_image,
            name,
            version,
            LookupFlags::WEAK_OK,
            &self.cache,
            &self.unique,
        )
    }

    pub fn info(&self, handle: Handle, request: InfoRequest) -> Result<InfoResponse> {
        let _guard = self.lock.acquire();
        match request {
            InfoRequest::LinkMapAddr => {
                let scope = self.scope_for(handle)?;
                let identity = scope
                    .entries
                    .first()
                    .map(|(id, _)| id.clone())
                    .ok_or_else(|| LuciError::NotFound { what: "empty scope".into() })?;
                Ok(InfoResponse::LinkMapAddr(identity.link_map.lock().unwrap().l_addr))
            }
            InfoRequest::ScopeList => {
                let scope = self.scope_for(handle)?;
                Ok(InfoResponse::ScopeList(
                    scope.entries.iter().map(|(id, _)| id.path.clone()).collect(),
                ))
            }
            InfoRequest::SearchPath => Ok(InfoResponse::SearchPath(
                self.search_path.lock().unwrap().clone(),
            )),
            InfoRequest::TlsModuleId => {
                let scope = self.scope_for(handle)?;
                let module_id = scope
                    .entries
                    .first()
                    .and_then(|(id, _)| id.current_image().tls.as_ref().map(|t| t.module_id));
                Ok(InfoResponse::TlsModuleId(module_id))
            }
        }
    }

    /// Finds the Identity and nearest exported symbol containing `addr`,
    /// consistent against a single snapshot of the chain taken at entry.
    pub fn addr(&self, addr: usize) -> Result<(Arc<Identity>, Option<String>)> {
        let _guard = self.lock.acquire();
        for identity in self.chain.all() {
            let image = identity.current_image();
            for seg in &image.segments {
                let start = image.addr(seg.vaddr);
                let end = start + seg.memsz as usize;
                if addr >= start && addr < end {
                    let nearest = nearest_symbol(&image, addr);
                    return Ok((identity, nearest));
                }
            }
        }
        Err(LuciError::NotFound {
            what: format!("address {addr:#x}"),
        })
    }

    /// Invokes `callback` once per currently loaded image's program
    /// headers, under a snapshot taken at entry. The callback may itself
    /// call `open`/`close` (the loader lock is reentrant).
    pub fn iterate_phdr(&self, mut callback: impl FnMut(&PhdrInfo) -> bool) {
        let _guard = self.lock.acquire();
        let snapshot: Vec<Arc<Image>> = self
            .chain
            .all()
            .iter()
            .map(|id| id.current_image())
            .collect();
        for image in snapshot {
            let info = PhdrInfo {
                base: image.base,
                name: image.path.clone(),
                program_headers: image.program_headers.clone(),
                tls_module_id: image.tls.as_ref().map(|t| t.module_id),
            };
            if !callback(&info) {
                break;
            }
        }
    }
}

fn nearest_symbol(image: &Image, addr: usize) -> Option<String> {
    let mut best: Option<(u64, &goblin::elf::Sym)> = None;
    for sym in &image.symtab {
        if sym.st_shndx == 0 || sym.st_value == 0 {
            continue;
        }
        let sym_addr = image.addr(sym.st_value);
        if sym_addr <= addr {
            let distance = (addr - sym_addr) as u64;
            if best.map(|(d, _)| distance < d).unwrap_or(true) {
                best = Some((distance, sym));
            }
        }
    }
    best.and_then(|(_, sym)| image.symbol_name(sym).ok().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_default_and_next_are_reserved() {
        assert_eq!(Handle::DEFAULT, Handle(0));
        assert_eq!(Handle::NEXT, Handle(1));
    }

    #[test]
    fn opening_unreadable_path_is_not_found() {
        let loader = Loader::new(vec![], 4);
        let err = loader
            .open(Path::new("/definitely/not/here.so"), OpenFlags::NOW, NamespaceId::DEFAULT)
            .unwrap_err();
        assert!(matches!(err, LuciError::Io(_)));
    }
}
