//! Caller context of the request being served on the current thread
//!
//! The native loop enters a scope around every callback; code running
//! inside the callback reads it back without locking or allocation.

use std::cell::Cell;

use crate::filesystem::FuseContext;

thread_local! {
    static CURRENT: Cell<Option<FuseContext>> = const { Cell::new(None) };
}

/// Run `f` with `ctx` installed as the current request context
///
/// The previous context is restored afterwards, including on unwind.
pub fn scope<T>(ctx: FuseContext, f: impl FnOnce() -> T) -> T {
    let previous = CURRENT.with(|slot| slot.replace(Some(ctx)));
    let _restore = scopeguard::guard(previous, |previous| {
        CURRENT.with(|slot| slot.set(previous));
    });
    f()
}

/// Context of the current request, zeroed outside of any request
pub fn current() -> FuseContext {
    CURRENT.with(|slot| slot.get()).unwrap_or_default()
}
