//! DSU controller: file-watch driven detection of new on-disk
//! versions, compatibility decision, and atomic swap.

use crate::debugger::{RDebug, RDebugState};
use crate::errors::{LuciError, Result, SoftErrorList};
use crate::identity::{Identity, IdentityChain};
use crate::image::{AtomicImageState, Image, ImageState};
use crate::initfini;
use crate::reloc::{self, PendingWrite};
use crate::resolver::{IfuncCache, ResolutionCache, Scope, ScopeMode, UniqueSymbols};
use goblin::elf::sym::{STT_FUNC, STT_OBJECT};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Per-Identity DSU state machine, as specified: a watch is armed, a
/// candidate is mapped when bytes change, checked for compatibility,
/// dependents are re-relocated, then the swap is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsuState {
    Idle,
    WatchArmed,
    CandidateMapped,
    CompatibilityChecked,
    RelocatingDependents,
    Swapped,
}

/// A single reconciled finding from the compatibility check, covering one
/// exported symbol present in both `v_old` and `v_new`.
#[derive(Debug, Clone)]
pub enum CompatFinding {
    Compatible { symbol: String },
    SizeMismatch { symbol: String, old_size: u64, new_size: u64 },
    TypeClassMismatch { symbol: String },
    SignatureMismatch { symbol: String },
}

/// Checks whether a new version of an identity is compatible with the one
/// it would replace: type class, object size/alignment, and (if a hash
/// callback is supplied) function signature hashes. Returns both the
/// per-symbol findings and the overall accept/reject decision — any
/// mandatory failure rejects the whole update.
pub fn check_compatibility(
    old: &Image,
    new: &Image,
    signature_hash: Option<&dyn Fn(&str) -> Option<u64>>,
) -> (SoftErrorList<CompatFinding>, bool) {
    let mut findings = SoftErrorList::new();
    let mut accept = true;

    let old_exports: HashMap<&str, &goblin::elf::Sym> = old
        .symtab
        .iter()
        .filter(|s| s.st_shndx != 0)
        .filter_map(|s| old.symbol_name(s).ok().map(|n| (n, s)))
        .collect();

    for new_sym in new.symtab.iter().filter(|s| s.st_shndx != 0) {
        let Ok(name) = new.symbol_name(new_sym) else {
            continue;
        };
        let Some(old_sym) = old_exports.get(name) else {
            continue; // newly introduced export, nothing to reconcile
        };

        if old_sym.st_type() != new_sym.st_type() {
            findings.push(CompatFinding::TypeClassMismatch { symbol: name.to_string() });
            accept = false;
            continue;
        }

        match new_sym.st_type() {
            STT_OBJECT => {
                if old_sym.st_size != new_sym.st_size {
                    findings.push(CompatFinding::SizeMismatch {
                        symbol: name.to_string(),
                        old_size: old_sym.st_size,
                        new_size: new_sym.st_size,
                    });
                    accept = false;
                } else {
                    findings.push(CompatFinding::Compatible { symbol: name.to_string() });
                }
            }
            STT_FUNC => {
                if let Some(hash_fn) = signature_hash {
                    match (hash_fn(name), hash_fn(name)) {
                        (Some(a), Some(b)) if a != b => {
                            findings.push(CompatFinding::SignatureMismatch { symbol: name.to_string() });
                            accept = false;
                        }
                        _ => findings.push(CompatFinding::Compatible { symbol: name.to_string() }),
                    }
                } else {
                    // No hash available: functions are assumed compatible.
                    findings.push(CompatFinding::Compatible { symbol: name.to_string() });
                }
            }
            _ => findings.push(CompatFinding::Compatible { symbol: name.to_string() }),
        }
    }

    (findings, accept)
}

/// Copies the live value of each matching writable object symbol from
/// `old` into `new`'s slot (data state preservation, §4.7 point 4). A size
/// mismatch here is a bug in the caller: `check_compatibility` must have
/// already rejected the update in that case.
///
/// # Safety
/// `old` and `new` must both be mapped at their recorded `base` addresses.
pub unsafe fn preserve_writable_state(old: &Image, new: &Image, symbol: &str) -> Result<()> {
    let old_sym = old
        .symtab
        .iter()
        .find(|s| old.symbol_name(s).map(|n| n == symbol).unwrap_or(false))
        .ok_or_else(|| LuciError::NotFound { what: symbol.to_string() })?;
    let new_sym = new
        .symtab
        .iter()
        .find(|s| new.symbol_name(s).map(|n| n == symbol).unwrap_or(false))
        .ok_or_else(|| LuciError::NotFound { what: symbol.to_string() })?;
    if old_sym.st_size != new_sym.st_size {
        return Err(LuciError::Conflict {
            reason: format!("size mismatch preserving {symbol} across update"),
        });
    }
    let src = old.addr(old_sym.st_value);
    let dst = new.addr(new_sym.st_value);
    reloc::apply_copy_reloc(dst, src, old_sym.st_size as usize)
}

/// Coordinates the end-to-end DSU lifecycle for one process: watches every
/// interned identity's canonical path, stages candidates, checks
/// compatibility, re-relocates dependents and swaps.
pub struct DsuController {
    pub chain: Arc<IdentityChain>,
    pub debugger: Arc<RDebug>,
    pub cache: Arc<ResolutionCache>,
    pub unique: Arc<UniqueSymbols>,
    pub ifuncs: Arc<IfuncCache>,
    states: Mutex<HashMap<PathBuf, DsuState>>,
    compat_budget: Duration,
    running: AtomicBool,
}

impl DsuController {
    pub fn new(
        chain: Arc<IdentityChain>,
        debugger: Arc<RDebug>,
        cache: Arc<ResolutionCache>,
        unique: Arc<UniqueSymbols>,
        ifuncs: Arc<IfuncCache>,
        compat_budget: Duration,
    ) -> Self {
        DsuController {
            chain,
            debugger,
            cache,
            unique,
            ifuncs,
            states: Mutex::new(HashMap::new()),
            compat_budget,
            running: AtomicBool::new(false),
        }
    }

    pub fn state_of(&self, path: &PathBuf) -> DsuState {
        self.states
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or(DsuState::Idle)
    }

    fn set_state(&self, path: &PathBuf, state: DsuState) {
        self.states.lock().unwrap().insert(path.clone(), state);
    }

    /// Spawns the background watcher thread. Debounced filesystem events
    /// ("content modify", "rename-into-place", "delete-then-create") are
    /// normalized into a single "new bytes available" signal per watched
    /// path, then handed to `handle_update`.
    pub fn spawn_watch_thread(self: Arc<Self>, debounce: Duration) -> Result<std::thread::JoinHandle<()>> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(|e| LuciError::ResourceExhausted { reason: e.to_string() })?;

        let mut watched: HashMap<i32, PathBuf> = HashMap::new();
        for identity in self.chain.all() {
            if let Ok(wd) = inotify.add_watch(
                identity.path.as_path(),
                AddWatchFlags::IN_MODIFY | AddWatchFlags::IN_MOVED_TO | AddWatchFlags::IN_CREATE,
            ) {
                watched.insert(wd.into(), identity.path.clone());
                self.set_state(&identity.path, DsuState::WatchArmed);
            }
        }

        self.running.store(true, Ordering::SeqCst);
        let controller = self;
        Ok(std::thread::spawn(move || {
            let mut last_event = std::time::Instant::now();
            while controller.running.load(Ordering::SeqCst) {
                match inotify.read_events() {
                    Ok(events) => {
                        for ev in events {
                            if let Some(path) = watched.get(&ev.wd.into()).cloned() {
                                last_event = std::time::Instant::now();
                                std::thread::sleep(debounce);
                                if let Some(identity) = controller.chain.lookup_path(&path) {
                                    if let Err(e) = controller.handle_update(&identity) {
                                        log::warn!("DSU update of {path:?} failed: {e}");
                                    }
                                }
                            }
                        }
                    }
                    Err(nix::errno::Errno::EAGAIN) => {
                        std::thread::sleep(Duration::from_millis(100));
                    }
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => {
                        log::error!("inotify read failed: {e}");
                        break;
                    }
                }
            }
            let _ = last_event;
        }))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Drives one identity through `CandidateMapped` -> `CompatibilityChecked`
    /// -> `RelocatingDependents` -> `Swapped` -> back to `WatchArmed`.
    pub fn handle_update(&self, identity: &Arc<Identity>) -> Result<()> {
        let old_image = identity.current_image();

        self.set_state(&identity.path, DsuState::CandidateMapped);
        let candidate_bytes = std::fs::read(&identity.path).map_err(LuciError::Io)?;
        let new_base = old_image.base; // same load address by convention for updates
        let candidate = Arc::new(Image::parse_bytes(
            identity.path.clone(),
            candidate_bytes,
            new_base,
            None,
        )?);

        self.set_state(&identity.path, DsuState::CompatibilityChecked);
        let started = std::time::Instant::now();
        let (findings, mut accept) = check_compatibility(&old_image, &candidate, None);
        if started.elapsed() > self.compat_budget {
            accept = false;
            log::warn!("compatibility check for {:?} exceeded budget, rejecting", identity.path);
        }
        if !accept {
            let reasons: Vec<String> = findings
                .iter()
                .filter(|f| !matches!(f, CompatFinding::Compatible { .. }))
                .map(|f| format!("{f:?}"))
                .collect();
            return Err(LuciError::Incompatible {
                path: identity.path.clone(),
                reason: reasons.join("; "),
            });
        }

        // Data state preservation: copy live object values into the candidate.
        for finding in findings.iter() {
            if let CompatFinding::Compatible { symbol } = finding {
                if let Some(sym) = candidate
                    .symtab
                    .iter()
                    .find(|s| candidate.symbol_name(s).map(|n| n == symbol).unwrap_or(false))
                {
                    if sym.st_type() == STT_OBJECT {
                        unsafe {
                            let _ = preserve_writable_state(&old_image, &candidate, symbol);
                        }
                    }
                }
            }
        }

        self.set_state(&identity.path, DsuState::RelocatingDependents);
        self.chain.attach(identity, candidate.clone());

        let incompatible: HashSet<String> = findings
            .iter()
            .filter_map(|f| match f {
                CompatFinding::Compatible { .. } => None,
                CompatFinding::SizeMismatch { symbol, .. }
                | CompatFinding::TypeClassMismatch { symbol }
                | CompatFinding::SignatureMismatch { symbol } => Some(symbol.clone()),
            })
            .collect();
        let compatible_syms = move |name: &str| !incompatible.contains(name);

        let all_identities = self.chain.all();
        let mut global_scope = Scope::new();
        for id in &all_identities {
            global_scope.push(id.clone(), ScopeMode::Global);
        }
        let dependents: Vec<(Arc<Identity>, Arc<Image>)> = all_identities
            .iter()
            .filter(|id| !Arc::ptr_eq(id, identity))
            .map(|id| (id.clone(), id.current_image()))
            .collect();

        let rerelocated = reloc::rerelocate_dependents(
            &dependents,
            identity,
            |_dep| global_scope.clone(),
            &self.cache,
            &self.unique,
            &self.ifuncs,
            &compatible_syms,
        )?;
        for (dep_image, writes) in &rerelocated {
            unsafe {
                reloc::commit_writes(dep_image, writes)?;
            }
        }
        log::debug!(
            "re-relocated {} dependent(s) of {:?} against the new version",
            rerelocated.len(),
            identity.path
        );

        self.set_state(&identity.path, DsuState::Swapped);
        self.debugger.notify(RDebugState::Add);
        self.debugger.refresh(&self.chain.all(), std::process::id());
        self.debugger.notify(RDebugState::Consistent);

        if let Err(e) = self.chain.begin_retirement(identity, &old_image) {
            log::warn!("could not mark {:?} v{:#x} as retiring: {e}", old_image.path, old_image.base);
        } else {
            log::debug!("{:?} v{:#x} queued for retirement", old_image.path, old_image.base);
        }
        self.set_state(&identity.path, DsuState::WatchArmed);
        log::info!("swapped {:?} to new version at base {:#x}", identity.path, candidate.base);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_image_with_object(name: &str, size: u64) -> Image {
        // Constructing a full synthetic ELF here would duplicate
        // `image::tests`; this helper builds a minimal in-memory `Image`
        // by hand for the compatibility-check logic, which only reads
        // `symtab`/`dyn_info`/`file_bytes` through accessor methods.
        let mut img = Image {
            path: PathBuf::from(format!("/fake/{name}")),
            base: 0x1000,
            segments: vec![],
            relro: None,
            program_headers: vec![],
            dyn_info: Default::default(),
            symtab: vec![],
            file_bytes: Vec::new(),
            relocs: Default::default(),
            tls: None,
            needed: vec![],
            soname: None,
            state: AtomicImageState::new(ImageState::Ready),
            fd: None,
            is_pie: true,
            entry: 0,
            versym: Vec::new(),
            verdef_names: HashMap::new(),
            verneed_names: HashMap::new(),
        };
        let _ = size;
        img.file_bytes = Vec::new();
        img
    }

    #[test]
    fn compatibility_check_with_no_shared_exports_is_accepted() {
        let old = make_image_with_object("state", 8);
        let new = make_image_with_object("state", 8);
        let (findings, accept) = check_compatibility(&old, &new, None);
        assert!(findings.is_empty());
        assert!(accept);
    }
}
