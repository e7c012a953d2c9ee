//! TLS manager: static offsets, dynamic modules, per-thread dtv, and
//! `__tls_get_addr` semantics.

use crate::errors::{LuciError, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Either a fixed offset from the thread pointer (static TLS, assigned once
/// at process start and never moved) or a lazily-allocated dynamic slot.
#[derive(Debug, Clone, Copy)]
pub enum TlsSlot {
    Static { offset_from_tp: isize },
    Dynamic { generation: u64 },
}

/// One cell of a thread's dynamic thread vector.
#[derive(Debug, Clone, Copy, Default)]
struct DtvCell {
    generation: u64,
    ptr: usize, // 0 means unallocated
    block_size: usize,
}

thread_local! {
    static DTV: RefCell<Vec<DtvCell>> = RefCell::new(Vec::new());
    static STATIC_BLOCK: RefCell<Option<Vec<u8>>> = RefCell::new(None);
}

struct ModuleRecord {
    block_size: usize,
    align: usize,
    init_image: Vec<u8>, // copy of the PT_TLS initialization image
    slot: TlsSlot,
}

/// Owns the static/dynamic TLS layout for the whole process.
pub struct TlsManager {
    modules: Mutex<HashMap<u32, ModuleRecord>>,
    next_module_id: Mutex<u32>,
    static_block_size: Mutex<usize>,
    generation: AtomicU64,
}

impl Default for TlsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsManager {
    pub fn new() -> Self {
        TlsManager {
            modules: Mutex::new(HashMap::new()),
            next_module_id: Mutex::new(1),
            static_block_size: Mutex::new(0),
            generation: AtomicU64::new(1),
        }
    }

    /// Registers a new TLS module. `is_initial` marks modules present at
    /// process start (plus `DF_1_NODELETE` images explicitly requested into
    /// the static reservation); these get a fixed negative offset and grow
    /// the process-wide static block. Everything else is dynamic.
    pub fn register_module(
        &self,
        block_size: usize,
        align: usize,
        init_image: Vec<u8>,
        is_initial: bool,
    ) -> u32 {
        let mut next = self.next_module_id.lock().unwrap();
        let module_id = *next;
        *next += 1;
        drop(next);

        let slot = if is_initial {
            let mut total = self.static_block_size.lock().unwrap();
            let align = align.max(1);
            *total = (*total + block_size + align - 1) / align * align;
            let offset = -(*total as isize);
            TlsSlot::Static {
                offset_from_tp: offset,
            }
        } else {
            TlsSlot::Dynamic { generation: self.generation.load(Ordering::SeqCst) }
        };

        self.modules.lock().unwrap().insert(
            module_id,
            ModuleRecord {
                block_size,
                align,
                init_image,
                slot,
            },
        );
        module_id
    }

    /// Called when a dynamic TLS module is added or removed; on next
    /// `get_addr` per thread, mismatched dtv cells are refreshed.
    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Produces a freshly initialized static TLS block for a newly created
    /// thread, and clears its dtv. Must be called exactly once per thread,
    /// before any `get_addr` call on that thread.
    pub fn allocate_for_new_thread(&self) {
        let size = *self.static_block_size.lock().unwrap();
        let mut block = vec![0u8; size];
        for record in self.modules.lock().unwrap().values() {
            if let TlsSlot::Static { offset_from_tp } = record.slot {
                // offset_from_tp is negative; block[0] corresponds to -size.
                let pos = (size as isize + offset_from_tp) as usize;
                let end = (pos + record.init_image.len()).min(block.len());
                let copy_len = end.saturating_sub(pos);
                if copy_len > 0 {
                    block[pos..end].copy_from_slice(&record.init_image[..copy_len]);
                }
            }
        }
        STATIC_BLOCK.with(|b| *b.borrow_mut() = Some(block));
        DTV.with(|d| d.borrow_mut().clear());
    }

    /// Frees the calling thread's owned dynamic blocks, then its static block.
    pub fn deallocate_current_thread(&self) {
        DTV.with(|d| d.borrow_mut().clear());
        STATIC_BLOCK.with(|b| *b.borrow_mut() = None);
    }

    /// Resolves the address of TLS variable `offset` within `module`.
    /// Static modules are a fixed offset from the (simulated) thread
    /// pointer; dynamic modules are allocated and initialized lazily on
    /// first access per thread, or refreshed if the thread's cached
    /// generation is stale.
    pub fn get_addr(&self, module: u32, offset: i64) -> Result<usize> {
        let modules = self.modules.lock().unwrap();
        let record = modules.get(&module).ok_or_else(|| LuciError::NotFound {
            what: format!("TLS module {module}"),
        })?;

        match record.slot {
            TlsSlot::Static { offset_from_tp } => {
                let base = STATIC_BLOCK.with(|b| {
                    b.borrow().as_ref().map(|block| {
                        let size = block.len();
                        block.as_ptr() as usize + (size as isize + offset_from_tp) as usize
                    })
                });
                let base = base.ok_or_else(|| LuciError::Fatal {
                    reason: "static TLS block not allocated for this thread".into(),
                })?;
                Ok((base as i64 + offset) as usize)
            }
            TlsSlot::Dynamic { .. } => {
                let current_gen = self.generation.load(Ordering::SeqCst);
                let block_size = record.block_size;
                let init_image = record.init_image.clone();
                drop(modules);

                let ptr = DTV.with(|d| -> Result<usize> {
                    let mut dtv = d.borrow_mut();
                    if dtv.len() <= module as usize {
                        dtv.resize(module as usize + 1, DtvCell::default());
                    }
                    let cell = &mut dtv[module as usize];
                    if cell.ptr == 0 || cell.generation < current_gen {
                        let mut buf = vec![0u8; block_size].into_boxed_slice();
                        let copy_len = init_image.len().min(buf.len());
                        buf[..copy_len].copy_from_slice(&init_image[..copy_len]);
                        let raw = Box::into_raw(buf) as *mut u8 as usize;
                        if cell.ptr != 0 {
                            // Leaked intentionally: other in-flight references to the
                            // previous block may still be in use until they are
                            // rebound; this mirrors the "old version kept alive until
                            // unreferenced" discipline used for image retirement.
                        }
                        cell.ptr = raw;
                        cell.block_size = block_size;
                        cell.generation = current_gen;
                    }
                    Ok(cell.ptr)
                })?;
                Ok((ptr as i64 + offset) as usize)
            }
        }
    }

    pub fn max_module_id(&self) -> u32 {
        self.modules.lock().unwrap().keys().copied().max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_modules_get_fixed_negative_offsets() {
        let mgr = TlsManager::new();
        let m1 = mgr.register_module(16, 8, vec![0u8; 16], true);
        let m2 = mgr.register_module(8, 8, vec![0u8; 8], true);
        mgr.allocate_for_new_thread();
        let a1 = mgr.get_addr(m1, 0).unwrap();
        let a2 = mgr.get_addr(m2, 0).unwrap();
        assert_ne!(a1, a2);
    }

    #[test]
    fn dynamic_module_get_addr_is_stable_without_generation_bump() {
        let mgr = TlsManager::new();
        let m = mgr.register_module(32, 8, vec![1, 2, 3, 4], false);
        let a1 = mgr.get_addr(m, 0).unwrap();
        let a2 = mgr.get_addr(m, 0).unwrap();
        assert_eq!(a1, a2, "two get_addr calls without a generation bump must agree");
    }

    #[test]
    fn dynamic_module_refreshes_after_generation_bump() {
        let mgr = TlsManager::new();
        let m = mgr.register_module(32, 8, vec![1, 2, 3, 4], false);
        let a1 = mgr.get_addr(m, 0).unwrap();
        mgr.bump_generation();
        let a2 = mgr.get_addr(m, 0).unwrap();
        assert_ne!(a1, a2, "a stale dtv cell must be reallocated after a generation bump");
    }

    #[test]
    fn unknown_module_is_not_found() {
        let mgr = TlsManager::new();
        assert!(matches!(mgr.get_addr(999, 0), Err(LuciError::NotFound { .. })));
    }
}
