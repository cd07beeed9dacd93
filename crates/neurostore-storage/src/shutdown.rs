//! Process-wide shutdown hooks (spec.md §5 "Shutdown hooks", Design Notes
//! §9 "Global singletons").
//!
//! On SIGTERM/SIGINT the engine must flush counts for every live instance.
//! Grounded on the `tokio::signal::ctrl_c` + single `select!` pattern used
//! by the pack's node orchestrator
//! (`ioi-foundation-ioi-network/.../node/src/bin/orchestration.rs`), wired
//! to a process-wide registry the way the teacher's background scheduler
//! (`crates/engine/src/background.rs`) is itself a singleton worker pool.
//! The registry holds weak references only: a dropped [`StorageEngine`]
//! is never kept alive just to be flushed, and a dead weak ref is pruned
//! opportunistically the next time the hook fires.

use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::engine::StorageEngine;

struct Registry {
    engines: Mutex<Vec<Weak<StorageEngine>>>,
    installed: Mutex<bool>,
}

static REGISTRY: Lazy<Registry> = Lazy::new(|| Registry {
    engines: Mutex::new(Vec::new()),
    installed: Mutex::new(false),
});

/// Register `engine` so the process-wide shutdown hook flushes its counts.
///
/// Safe to call once per engine instance; registration is idempotent in
/// effect (a dropped instance is simply never found when the hook walks
/// the list). Installs the signal listener on first call, process-wide,
/// even across many engine instances (Design Notes §9: "shutdown hooks
/// are installed exactly once per process").
pub fn register(engine: &Arc<StorageEngine>) {
    REGISTRY.engines.lock().push(Arc::downgrade(engine));
    install_hook_once();
}

fn install_hook_once() {
    let mut installed = REGISTRY.installed.lock();
    if *installed {
        return;
    }
    *installed = true;
    drop(installed);

    // Only spawn the listener task if a tokio runtime is actually
    // available (unit tests that construct a `StorageEngine` outside an
    // async context must not panic on `register`).
    if tokio::runtime::Handle::try_current().is_ok() {
        tokio::spawn(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!(target: "neurostore::shutdown", "shutdown signal received, flushing counts");
                flush_all().await;
            }
        });
    }
}

/// Flush counts for every currently-live registered engine, pruning dead
/// weak references as it goes. Exposed directly (not just via the signal
/// hook) so `Database::close`/`flush` paths and tests can trigger the same
/// behavior deterministically without sending a real signal.
pub async fn flush_all() {
    let live: Vec<Arc<StorageEngine>> = {
        let mut engines = REGISTRY.engines.lock();
        engines.retain(|w| w.strong_count() > 0);
        engines.iter().filter_map(Weak::upgrade).collect()
    };
    for engine in live {
        if let Err(e) = engine.flush_counts().await {
            tracing::warn!(target: "neurostore::shutdown", error = %e, "failed to flush counts on shutdown");
        }
    }
}

/// Number of currently-live registered engines. Test/diagnostic helper.
pub fn live_count() -> usize {
    let mut engines = REGISTRY.engines.lock();
    engines.retain(|w| w.strong_count() > 0);
    engines.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use neurostore_core::{BranchName, NounId, TypeTag};
    use neurostore_core::noun::Noun;

    fn engine() -> Arc<StorageEngine> {
        Arc::new(StorageEngine::new(Arc::new(MemoryBackend::new()), BranchName::main()))
    }

    #[tokio::test]
    async fn flush_all_flushes_every_live_registered_engine() {
        let before = live_count();
        let engine = engine();
        register(&engine);
        assert_eq!(live_count(), before + 1);

        let n = Noun::new(NounId::new(), vec![1.0, 0.0], TypeTag::unchecked("PERSON"), 1000);
        engine.save_noun(&n).await.unwrap();
        assert!(engine.counts_dirty());

        flush_all().await;
        assert!(!engine.counts_dirty());
    }

    #[tokio::test]
    async fn dropped_engine_is_pruned_from_registry() {
        let before = live_count();
        {
            let engine = engine();
            register(&engine);
            assert_eq!(live_count(), before + 1);
        }
        assert_eq!(live_count(), before);
    }
}
