//! Per-thread state: the thread scope of every kernel a thread served.
//!
//! Worker-team threads release their thread scopes from the team's
//! thread-stop hook. Any other thread that resolved a thread-scoped
//! resource releases it when its thread-locals are torn down.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use tracing::{debug, warn};

use crate::descriptor::Scope;
use crate::kernel::KernelShared;
use crate::resource::ResourcePool;
use crate::scope::ScopeContainer;

pub(crate) type Pools = Arc<[Arc<dyn ResourcePool>]>;

struct ThreadEntry {
    container: Arc<ScopeContainer>,
    pools: Pools,
    thread: ThreadId,
}

impl ThreadEntry {
    fn retire(self) {
        self.container.release(None);
        for pool in self.pools.iter() {
            pool.on_worker_thread_exit(self.thread);
        }
    }
}

#[derive(Default)]
struct ThreadScopes {
    entries: HashMap<u64, ThreadEntry>,
}

impl Drop for ThreadScopes {
    fn drop(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.retire();
        }
    }
}

thread_local! {
    static THREAD_SCOPES: RefCell<ThreadScopes> = RefCell::new(ThreadScopes::default());
}

/// The calling thread's scope container for `kernel`, created on first use.
pub(crate) fn thread_scope(kernel: &Arc<KernelShared>) -> Arc<ScopeContainer> {
    let id = kernel.id();
    let found = THREAD_SCOPES.try_with(|scopes| {
        scopes
            .borrow_mut()
            .entries
            .entry(id)
            .or_insert_with(|| {
                debug!(kernel = id, thread = ?thread::current().id(), "Opening thread scope");
                ThreadEntry {
                    container: kernel.scope_container(Scope::Thread),
                    pools: kernel.pools(),
                    thread: thread::current().id(),
                }
            })
            .container
            .clone()
    });
    match found {
        Ok(container) => container,
        Err(_) => {
            warn!(kernel = id, "Thread scope requested during thread teardown");
            kernel.scope_container(Scope::Thread)
        }
    }
}

/// Ends the calling thread's use of `kernel`: releases its thread scope and
/// tells every pool the thread is gone.
pub(crate) fn exit_current_thread(kernel: u64, pools: &[Arc<dyn ResourcePool>]) {
    let entry = THREAD_SCOPES
        .try_with(|scopes| scopes.borrow_mut().entries.remove(&kernel))
        .ok()
        .flatten();
    match entry {
        Some(entry) => entry.retire(),
        None => {
            let thread = thread::current().id();
            for pool in pools {
                pool.on_worker_thread_exit(thread);
            }
        }
    }
}
