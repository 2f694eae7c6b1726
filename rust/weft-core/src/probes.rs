//! Lifecycle probe hooks for debuggers and tooling.
//!
//! A tooling integration installs function pointers once per process; the
//! runtime then reports every coroutine creation, resumption, and suspension.
//! When nothing is installed the hooks cost one atomic load.

use once_cell::sync::OnceCell;

/// Process-wide probe callbacks.
#[derive(Clone, Copy)]
pub struct ProbeHooks {
    pub on_created: fn(),
    pub on_resumed: fn(),
    pub on_suspended: fn(),
}

static HOOKS: OnceCell<ProbeHooks> = OnceCell::new();

/// Install the probe hooks. Idempotent: the first installation wins and
/// survives for the rest of the process (tests included). Returns `false`
/// when hooks were already installed.
pub fn install(hooks: ProbeHooks) -> bool {
    HOOKS.set(hooks).is_ok()
}

pub(crate) fn on_created() {
    if let Some(hooks) = HOOKS.get() {
        (hooks.on_created)();
    }
}

pub(crate) fn on_resumed() {
    if let Some(hooks) = HOOKS.get() {
        (hooks.on_resumed)();
    }
}

pub(crate) fn on_suspended() {
    if let Some(hooks) = HOOKS.get() {
        (hooks.on_suspended)();
    }
}
