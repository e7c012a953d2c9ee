//! Debug notifier: a flat link-map for an external debugger, and the state
//! transitions it publishes around. Follows the conventional `_r_debug`
//! layout (GDB's `r_debug` struct), a no-op `brk` routine debuggers
//! intercept by breakpoint, and two presentation modes for the link-map
//! list.

use crate::identity::Identity;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RDebugState {
    Consistent = 0,
    Add = 1,
    Delete = 2,
}

/// One node of the flat link-map list handed to the debugger.
#[derive(Debug, Clone)]
pub struct LinkMapNode {
    pub l_addr: usize,
    pub l_name: String,
    /// Opaque handle distinguishing distinct versions of the same identity;
    /// not part of the real glibc layout, used internally to detect when a
    /// refresh needs to insert a new node.
    pub version_token: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugMode {
    /// Every version of every Identity appears as a separate node, so a
    /// debugger can set breakpoints on both `v_old` and `v_new`.
    VersionFlat,
    /// Only `current` versions appear.
    CurrentOnly,
}

/// Mirrors the conventional `r_debug` structure consulted by debuggers.
pub struct RDebug {
    pub version: i32,
    pub link_map: Mutex<Vec<LinkMapNode>>,
    pub state: Mutex<RDebugState>,
    pub ld_base: usize,
    mode: DebugMode,
}

impl RDebug {
    pub fn new(mode: DebugMode, ld_base: usize) -> Self {
        RDebug {
            version: 1,
            link_map: Mutex::new(Vec::new()),
            state: Mutex::new(RDebugState::Consistent),
            ld_base,
            mode,
        }
    }

    /// Rebuilds the flat link-map from the current set of identities.
    /// In `VersionFlat` mode every coexisting version gets its own node
    /// (with its mapped `base` and, when backed by an anonymous memfd
    /// rather than a real path, a `/proc/<pid>/fd/<fd>` display name);
    /// in `CurrentOnly` mode only each identity's current version appears.
    pub fn refresh(&self, identities: &[Arc<Identity>], pid: u32) {
        let mut nodes = Vec::new();
        for identity in identities {
            let versions = identity.versions.read().unwrap();
            match self.mode {
                DebugMode::VersionFlat => {
                    for img in versions.iter() {
                        nodes.push(LinkMapNode {
                            l_addr: img.base,
                            l_name: display_name(identity, img, pid),
                            version_token: Arc::as_ptr(img) as usize,
                        });
                    }
                }
                DebugMode::CurrentOnly => {
                    let idx = *identity.current.lock().unwrap();
                    if let Some(img) = versions.get(idx) {
                        nodes.push(LinkMapNode {
                            l_addr: img.base,
                            l_name: display_name(identity, img, pid),
                            version_token: Arc::as_ptr(img) as usize,
                        });
                    }
                }
            }
        }
        *self.link_map.lock().unwrap() = nodes;
    }

    /// Publishes a state transition and invokes the documented no-op
    /// breakpoint routine so an attached debugger can intercept it.
    pub fn notify(&self, state: RDebugState) {
        *self.state.lock().unwrap() = state;
        dl_debug_state();
    }
}

fn display_name(identity: &Identity, img: &crate::image::Image, pid: u32) -> String {
    match img.fd {
        Some(fd) if fd >= 0 => format!("/proc/{pid}/fd/{fd}"),
        _ => identity.path.to_string_lossy().into_owned(),
    }
}

/// Documented no-op breakpoint routine. A debugger sets a breakpoint here;
/// the `asm` volatile barrier keeps the compiler from eliding the call even
/// though it has no observable effect.
#[inline(never)]
pub fn dl_debug_state() {
    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_produces_one_node_per_version_in_flat_mode() {
        let dbg = RDebug::new(DebugMode::VersionFlat, 0);
        assert!(dbg.link_map.lock().unwrap().is_empty());
    }

    #[test]
    fn notify_updates_state() {
        let dbg = RDebug::new(DebugMode::CurrentOnly, 0);
        dbg.notify(RDebugState::Add);
        assert_eq!(*dbg.state.lock().unwrap(), RDebugState::Add);
        dbg.notify(RDebugState::Consistent);
        assert_eq!(*dbg.state.lock().unwrap(), RDebugState::Consistent);
    }
}
