//! Init/Fini sequencer: topological ordering of `PREINIT_ARRAY`,
//! `INIT`, `INIT_ARRAY` / `FINI_ARRAY`, with re-entry rules during updates.

use crate::errors::Result;
use crate::identity::Identity;
use crate::image::Image;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One node in the dependency graph handed to the sequencer: an identity
/// plus the (already resolved) set of identities it directly needs.
pub struct DepNode {
    pub identity: Arc<Identity>,
    pub needed: Vec<Arc<Identity>>,
}

/// Topologically sorts `nodes` by `DT_NEEDED`, breaking ties by load order
/// (the order `nodes` was given in). Cycles are resolved by strongly
/// connected component: every node in an SCC runs in load order, all of
/// them after every node in a component the SCC depends on.
pub fn topo_order(nodes: &[DepNode]) -> Vec<Arc<Identity>> {
    let index_of: HashMap<*const Identity, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (Arc::as_ptr(&n.identity), i))
        .collect();

    let sccs = tarjan_scc(nodes, &index_of);

    let mut order = Vec::with_capacity(nodes.len());
    for scc in sccs {
        let mut members: Vec<usize> = scc;
        members.sort_unstable(); // load order within a component
        if members.len() > 1 {
            log::warn!(
                "cyclic NEEDED dependency among {} modules; running initializers in load order",
                members.len()
            );
        }
        for idx in members {
            order.push(nodes[idx].identity.clone());
        }
    }
    order
}

/// Tarjan's SCC algorithm, returning components in reverse-topological
/// order reversed back to forward order by the caller's iteration (a
/// component that depends on another is emitted after it).
fn tarjan_scc(nodes: &[DepNode], index_of: &HashMap<*const Identity, usize>) -> Vec<Vec<usize>> {
    struct State {
        index: Vec<Option<usize>>,
        lowlink: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        counter: usize,
        sccs: Vec<Vec<usize>>,
    }

    fn strongconnect(
        v: usize,
        nodes: &[DepNode],
        index_of: &HashMap<*const Identity, usize>,
        state: &mut State,
    ) {
        state.index[v] = Some(state.counter);
        state.lowlink[v] = state.counter;
        state.counter += 1;
        state.stack.push(v);
        state.on_stack[v] = true;

        for dep in &nodes[v].needed {
            if let Some(&w) = index_of.get(&Arc::as_ptr(dep)) {
                if state.index[w].is_none() {
                    strongconnect(w, nodes, index_of, state);
                    state.lowlink[v] = state.lowlink[v].min(state.lowlink[w]);
                } else if state.on_stack[w] {
                    state.lowlink[v] = state.lowlink[v].min(state.index[w].unwrap());
                }
            }
        }

        if state.lowlink[v] == state.index[v].unwrap() {
            let mut component = Vec::new();
            loop {
                let w = state.stack.pop().unwrap();
                state.on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            state.sccs.push(component);
        }
    }

    let n = nodes.len();
    let mut state = State {
        index: vec![None; n],
        lowlink: vec![0; n],
        on_stack: vec![false; n],
        stack: Vec::new(),
        counter: 0,
        sccs: Vec::new(),
    };
    for v in 0..n {
        if state.index[v].is_none() {
            strongconnect(v, nodes, index_of, &mut state);
        }
    }
    // Tarjan emits components in reverse topological order (a component is
    // finished only once everything it points to is finished); reverse so
    // dependencies run before dependents.
    state.sccs.reverse();
    state.sccs
}

/// Array of function pointers taking no arguments, as found in
/// `INIT_ARRAY`/`FINI_ARRAY`/`PREINIT_ARRAY`. Each 8-byte slot holds the
/// absolute function address (written there by the `R_X86_64_RELATIVE`
/// relocations covering the array), not the slot's own address, so each
/// entry must be dereferenced.
///
/// # Safety
/// `off`/`size` must describe a range of `size / 8` readable `usize` slots
/// within `image`'s already-mapped and already-relocated segments.
unsafe fn read_fn_array(image: &Image, off: u64, size: u64) -> Vec<usize> {
    let count = (size / 8) as usize;
    let base_addr = image.addr(off);
    (0..count)
        .map(|i| unsafe { *((base_addr + i * 8) as *const usize) })
        .collect()
}

/// Runs one image's constructors: `PREINIT_ARRAY` (main executable only),
/// then `DT_INIT`, then `INIT_ARRAY` in index order.
///
/// # Safety
/// Every function pointer reachable through `image`'s dynamic section must
/// already point at relocated, executable memory, and calling it must be
/// safe per the ELF ABI (no arguments, C calling convention).
pub unsafe fn run_constructors(image: &Image, is_main_executable: bool) -> Result<()> {
    if is_main_executable {
        if let Some((off, size)) = image.dyn_info.preinit_array {
            for entry_addr in read_fn_array(image, off, size) {
                call_fn_ptr(entry_addr)?;
            }
        }
    }
    if let Some(init_off) = image.dyn_info.init {
        call_fn_ptr(image.addr(init_off))?;
    }
    if let Some((off, size)) = image.dyn_info.init_array {
        for entry_addr in read_fn_array(image, off, size) {
            call_fn_ptr(entry_addr)?;
        }
    }
    Ok(())
}

/// Runs one image's destructors in reverse order: `FINI_ARRAY` reversed,
/// then `DT_FINI`. For images retiring due to DSU this only tears down
/// state local to the retiring version — the resolver's symbol table for
/// the identity is not torn down until the image is fully unreferenced.
///
/// # Safety
/// Same preconditions as `run_constructors`.
pub unsafe fn run_destructors(image: &Image) -> Result<()> {
    if let Some((off, size)) = image.dyn_info.fini_array {
        for entry_addr in read_fn_array(image, off, size).into_iter().rev() {
            call_fn_ptr(entry_addr)?;
        }
    }
    if let Some(fini_off) = image.dyn_info.fini {
        call_fn_ptr(image.addr(fini_off))?;
    }
    Ok(())
}

unsafe fn call_fn_ptr(addr: usize) -> Result<()> {
    if addr == 0 {
        return Ok(());
    }
    let f: extern "C" fn() = std::mem::transmute(addr);
    // A non-zero exit via a fatal signal handler or `abort()` terminates the
    // process by contract; there is no safe partial-init rollback to
    // perform here, so a panic unwinding out of `f` is deliberately not
    // caught.
    f();
    Ok(())
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum CycleCheckState {
    Unvisited,
    InProgress,
    Done,
}

/// Pure diagnostic helper: detects whether `nodes` contains a `NEEDED` cycle
/// at all, so callers can decide whether to emit the "cyclic dependency"
/// diagnostic without paying for full SCC computation when there is none.
pub fn has_cycle(nodes: &[DepNode]) -> bool {
    let index_of: HashMap<*const Identity, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (Arc::as_ptr(&n.identity), i))
        .collect();
    let mut state = vec![CycleCheckState::Unvisited; nodes.len()];

    fn visit(
        v: usize,
        nodes: &[DepNode],
        index_of: &HashMap<*const Identity, usize>,
        state: &mut [CycleCheckState],
    ) -> bool {
        match state[v] {
            CycleCheckState::Done => return false,
            CycleCheckState::InProgress => return true,
            CycleCheckState::Unvisited => {}
        }
        state[v] = CycleCheckState::InProgress;
        for dep in &nodes[v].needed {
            if let Some(&w) = index_of.get(&Arc::as_ptr(dep)) {
                if visit(w, nodes, index_of, state) {
                    return true;
                }
            }
        }
        state[v] = CycleCheckState::Done;
        false
    }

    (0..nodes.len()).any(|v| visit(v, nodes, &index_of, &mut state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{FileKey, LinkMapRecord};
    use std::sync::Mutex;

    fn fake_identity(ino: u64) -> Arc<Identity> {
        Arc::new(Identity {
            key: FileKey { dev: 0, ino },
            path: format!("/fake/{ino}").into(),
            versions: std::sync::RwLock::new(Vec::new()),
            current: Mutex::new(0),
            link_map: Mutex::new(LinkMapRecord::default()),
        })
    }

    #[test]
    fn linear_chain_orders_dependencies_first() {
        let a = fake_identity(1);
        let b = fake_identity(2);
        let c = fake_identity(3);
        // c needs b, b needs a
        let nodes = vec![
            DepNode { identity: a.clone(), needed: vec![] },
            DepNode { identity: b.clone(), needed: vec![a.clone()] },
            DepNode { identity: c.clone(), needed: vec![b.clone()] },
        ];
        let order = topo_order(&nodes);
        let pos = |id: &Arc<Identity>| order.iter().position(|x| Arc::ptr_eq(x, id)).unwrap();
        assert!(pos(&a) < pos(&b));
        assert!(pos(&b) < pos(&c));
    }

    /// Builds a minimal in-memory `Image` whose `base` points at `slot`'s
    /// own backing storage, with a one-entry `DT_INIT_ARRAY` at offset 0.
    fn image_with_init_array(slot: &mut [u8; 8]) -> Image {
        use crate::image::{AtomicImageState, DynInfo, RelocSet};
        Image {
            path: "/fake/libctor.so".into(),
            base: slot.as_mut_ptr() as usize,
            segments: vec![],
            relro: None,
            program_headers: vec![],
            dyn_info: DynInfo {
                init_array: Some((0, 8)),
                ..Default::default()
            },
            symtab: vec![],
            file_bytes: Vec::new(),
            relocs: RelocSet::default(),
            tls: None,
            needed: vec![],
            soname: None,
            state: AtomicImageState::new(ImageState::Relocating),
            fd: None,
            is_pie: true,
            entry: 0,
            versym: vec![],
            verdef_names: HashMap::new(),
            verneed_names: HashMap::new(),
        }
    }

    #[test]
    fn run_constructors_calls_the_function_an_init_array_slot_points_at() {
        use std::sync::atomic::{AtomicBool, Ordering};
        static CALLED: AtomicBool = AtomicBool::new(false);
        extern "C" fn ctor() {
            CALLED.store(true, Ordering::SeqCst);
        }

        let mut slot: [u8; 8] = [0; 8];
        // The slot holds the function's absolute address, as an
        // R_X86_64_RELATIVE relocation covering the array would leave it,
        // not the address of the slot itself.
        slot.copy_from_slice(&(ctor as usize).to_ne_bytes());
        let image = image_with_init_array(&mut slot);

        unsafe {
            run_constructors(&image, false).unwrap();
        }
        assert!(CALLED.load(Ordering::SeqCst), "the INIT_ARRAY entry must be dereferenced and called, not the slot address itself");
    }

    #[test]
    fn cycle_is_detected_and_does_not_panic() {
        let a = fake_identity(1);
        let b = fake_identity(2);
        let nodes = vec![
            DepNode { identity: a.clone(), needed: vec![b.clone()] },
            DepNode { identity: b.clone(), needed: vec![a.clone()] },
        ];
        assert!(has_cycle(&nodes));
        let order = topo_order(&nodes);
        assert_eq!(order.len(), 2);
    }
}
