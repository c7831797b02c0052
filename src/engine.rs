//! # Patch engine
//!
//! Ties the loader, matcher, index, trampoline manager and gateway
//! together behind one process-wide object, and coordinates atomic policy
//! reloads.
//!
//! Concurrency model: a single reader/writer lock guards the current table
//! snapshot, the patch point index, and all match/injection state. Readers
//! are gateway dispatches and region queries; writers are module events
//! and reloads. Injection and removal additionally happen only while the
//! rest of the process is quiesced through the configured
//! [`ThreadSuspender`]. Trampoline memory is allocated before the writer
//! lock is taken, so the arena never nests inside the table lock.
//!
//! Reload never mutates anything until the replacement table has parsed
//! completely; a failed parse leaves the running table authoritative.
//! Replaced tables are not freed while a diverted thread might still hold
//! a pointer derived from them: they move to a retired list that is only
//! drained at the next reload (whose own quiescence proves no reader
//! survives) or at shutdown.

use std::ops::Range;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use log::{info, warn};

use crate::code::x64;
use crate::context::CpuContext;
use crate::gateway::{self, DispatchOutcome};
use crate::index::PatchIndex;
use crate::loader::{self, LoadError};
use crate::matcher::{self, EventOutcome};
use crate::services::{
    EventSink, NoopSuspender, NullSink, ObservedModule, ProviderResolver, ThreadSuspender,
};
use crate::table::{Mode, ObservedSignature, PointId, Table};
use crate::trampoline::TrampolineManager;

/// Everything guarded by the engine's reader/writer lock.
struct EngineState {
    /// Current policy table snapshot.
    table: Arc<Table>,
    /// Index over currently injected patch regions.
    index: PatchIndex,
    /// Modules the host has reported loaded, for reload re-matching.
    modules: Vec<ObservedModule>,
}

/// Construction parameters for [`PatchEngine::initialize`].
pub struct EngineConfig {
    /// Path of the policy definition file.
    pub policy_path: PathBuf,
    /// Path of the mode definition file.
    pub mode_path: PathBuf,
    /// Whole-process quiescence service.
    pub suspender: Box<dyn ThreadSuspender>,
    /// Provider function resolution service.
    pub resolver: Box<dyn ProviderResolver>,
    /// Event notification sink.
    pub sink: Box<dyn EventSink>,
}

impl EngineConfig {
    /// Config with the given definition files, a no-op suspender and a
    /// null sink. Hosts with real threads replace the suspender.
    pub fn new(
        policy_path: impl Into<PathBuf>,
        mode_path: impl Into<PathBuf>,
        resolver: Box<dyn ProviderResolver>,
    ) -> Self {
        EngineConfig {
            policy_path: policy_path.into(),
            mode_path: mode_path.into(),
            suspender: Box::new(NoopSuspender),
            resolver,
            sink: Box::new(NullSink),
        }
    }
}

/// Descriptor returned by address queries.
#[derive(Debug, Clone)]
pub struct PatchDescriptor {
    /// Index-tuple descriptor of the point.
    pub id: PointId,
    /// Owning policy's identifier.
    pub policy_id: String,
    /// Owning policy's mode.
    pub mode: Mode,
    /// Absolute patched address range.
    pub range: Range<usize>,
}

/// The process-wide live patching engine.
pub struct PatchEngine {
    /// Lock-guarded table/index/module state.
    state: RwLock<EngineState>,
    /// Tables replaced by reloads, kept until provably unreferenced.
    retired: Mutex<Vec<Arc<Table>>>,
    /// Serializes concurrent reload requests.
    reload_gate: Mutex<()>,
    /// Quiescence service.
    suspender: Box<dyn ThreadSuspender>,
    /// Provider resolution service.
    resolver: Box<dyn ProviderResolver>,
    /// Event sink.
    sink: Box<dyn EventSink>,
    /// Trampoline builder, wired to the gateway entry.
    trampolines: TrampolineManager,
    /// Policy definition file, re-read on reload.
    policy_path: PathBuf,
    /// Mode definition file, re-read on reload.
    mode_path: PathBuf,
}

/// The engine the raw gateway entry dispatches through.
static GLOBAL: OnceLock<Arc<PatchEngine>> = OnceLock::new();

/// Engine installed for trampoline dispatch, if any.
pub fn global() -> Option<&'static Arc<PatchEngine>> {
    GLOBAL.get()
}

impl PatchEngine {
    /// Creates an engine and loads the initial table.
    ///
    /// On a load failure the engine starts with an empty table (no change
    /// in application behavior, fail open) and the error is returned
    /// alongside it for diagnostics.
    pub fn initialize(config: EngineConfig) -> (Arc<PatchEngine>, Result<(), LoadError>) {
        let engine = Arc::new(PatchEngine {
            state: RwLock::new(EngineState {
                table: Arc::new(Table::empty()),
                index: PatchIndex::new(),
                modules: Vec::new(),
            }),
            retired: Mutex::new(Vec::new()),
            reload_gate: Mutex::new(()),
            suspender: config.suspender,
            resolver: config.resolver,
            sink: config.sink,
            trampolines: TrampolineManager::new(gateway::dispatch_entry as usize),
            policy_path: config.policy_path,
            mode_path: config.mode_path,
        });

        let status = match loader::load_files(&engine.policy_path, &engine.mode_path) {
            Ok(table) => {
                engine.state.write().unwrap().table = Arc::new(table);
                Ok(())
            }
            Err(e) => {
                warn!("initial policy load failed, starting empty: {e}");
                Err(e)
            }
        };

        (engine, status)
    }

    /// Publishes this engine for trampoline dispatch. Only the first
    /// installation takes effect.
    pub fn install_global(self: &Arc<Self>) {
        let _ = GLOBAL.set(self.clone());
    }

    /// Handles a module-load notification from the host's module loader.
    ///
    /// # Safety
    ///
    /// `base` must be the base of a live module whose image stays mapped,
    /// readable, and (at patch points) writable until the matching
    /// [`on_module_unload`](Self::on_module_unload). Module events must be
    /// serialized by the caller, as a real module loader's lock does.
    pub unsafe fn on_module_load(
        &self,
        base: usize,
        signature: ObservedSignature,
    ) -> EventOutcome {
        let mut state = self.state.write().unwrap();
        state.modules.retain(|m| m.base != base);
        state.modules.push(ObservedModule {
            base,
            signature: signature.clone(),
        });

        let table = state.table.clone();
        // classification alone would not need quiescence, but the injection
        // writes that follow a match do
        let threads = self.suspender.suspend_all();
        let outcome =
            matcher::apply_module_load(&table, &mut state.index, &self.trampolines, base, &signature);
        self.suspender.resume_all(threads);
        outcome
    }

    /// Handles a module-unload notification. Every point injected into the
    /// module is removed (the image must still be mapped when the event
    /// arrives) and its entries deregistered.
    ///
    /// # Safety
    ///
    /// Same contract as [`on_module_load`](Self::on_module_load); the
    /// unload event must precede the actual unmapping.
    pub unsafe fn on_module_unload(&self, base: usize) -> EventOutcome {
        let mut state = self.state.write().unwrap();
        state.modules.retain(|m| m.base != base);

        let table = state.table.clone();
        let threads = self.suspender.suspend_all();
        let outcome =
            matcher::apply_module_unload(&table, &mut state.index, &self.trampolines, base);
        self.suspender.resume_all(threads);
        outcome
    }

    /// Re-reads the policy definition file and atomically swaps the table.
    /// Callable from any thread at any time after initialization.
    pub fn reload_policies(&self) -> Result<(), LoadError> {
        self.reload()
    }

    /// Re-reads the mode definition file and atomically swaps the table.
    /// Mode changes rebuild the table through the same protocol as policy
    /// changes.
    pub fn reload_modes(&self) -> Result<(), LoadError> {
        self.reload()
    }

    /// The reload protocol. See the module docs for the ordering
    /// guarantees; in short: parse outside the lock, fail without touching
    /// anything, otherwise quiesce → swap under the writer lock → resume,
    /// and retire (not free) the old table.
    fn reload(&self) -> Result<(), LoadError> {
        let _gate = self.reload_gate.lock().unwrap();

        // parse without holding the table lock: a concurrent module event
        // may be holding it while it waits on the host loader's own lock
        let new_table = Arc::new(loader::load_files(&self.policy_path, &self.mode_path)?);

        let threads = self.suspender.suspend_all();
        {
            let mut state = self.state.write().unwrap();
            let old = state.table.clone();

            // tear down every injection belonging to the old table
            let injected: Vec<PointId> = state.index.iter().map(|e| e.id).collect();
            for id in injected {
                // SAFETY: module memory is live per the on_module_load
                // contract and the process is quiesced
                unsafe { self.trampolines.remove(&old, &mut state.index, id) };
            }
            state.index.clear();

            // install the new table and re-match the modules we know about
            state.table = new_table.clone();
            let modules = state.modules.clone();
            for m in &modules {
                // SAFETY: as above
                unsafe {
                    matcher::apply_module_load(
                        &new_table,
                        &mut state.index,
                        &self.trampolines,
                        m.base,
                        &m.signature,
                    )
                };
            }

            // this quiescence proves no thread still references the tables
            // retired by the previous reload; only now can they go
            let mut retired = self.retired.lock().unwrap();
            retired.clear();
            retired.push(old);
        }
        self.suspender.resume_all(threads);

        info!("policy table reloaded");
        Ok(())
    }

    /// Removes every injection and drops all tables. The engine stays
    /// usable (empty) afterwards.
    pub fn shutdown(&self) {
        let _gate = self.reload_gate.lock().unwrap();
        let threads = self.suspender.suspend_all();
        {
            let mut state = self.state.write().unwrap();
            let table = state.table.clone();
            let injected: Vec<PointId> = state.index.iter().map(|e| e.id).collect();
            for id in injected {
                // SAFETY: module memory is live per the on_module_load
                // contract and the process is quiesced
                unsafe { self.trampolines.remove(&table, &mut state.index, id) };
            }
            state.index.clear();
            state.modules.clear();
            state.table = Arc::new(Table::empty());
            self.retired.lock().unwrap().clear();
        }
        self.suspender.resume_all(threads);
        info!("patch engine shut down");
    }

    /// Whether any injected patch region intersects `range`. Used by hosts
    /// that rewrite code to check for collisions with live patches.
    pub fn does_region_need_patch(&self, range: Range<usize>) -> bool {
        let state = self.state.read().unwrap();
        state.index.overlaps(&range)
    }

    /// Resolves an address to the descriptor of the patch region
    /// containing it.
    pub fn lookup_patch_addr(&self, addr: usize) -> Option<PatchDescriptor> {
        let state = self.state.read().unwrap();
        let entry = state.index.lookup(addr)?;
        let policy = state.table.policy(entry.id)?;
        Some(PatchDescriptor {
            id: entry.id,
            policy_id: policy.id.clone(),
            mode: policy.mode,
            range: entry.range.clone(),
        })
    }

    /// Applies patch-site branches to a host-owned private copy of a code
    /// region instead of the live image.
    ///
    /// `copy` holds the bytes of `orig_start..orig_start + copy.len()` and
    /// will execute at `copy_base`. Branch displacements are computed for
    /// the copy's own address; regions only partially inside the copy are
    /// skipped. Returns the number of patches applied.
    pub fn inject_into_copy(
        &self,
        copy_base: usize,
        copy: &mut [u8],
        orig_start: usize,
    ) -> usize {
        let state = self.state.read().unwrap();
        let orig_range = orig_start..orig_start + copy.len();
        let mut applied = 0;

        for entry in state.index.overlapping(&orig_range) {
            if entry.range.start < orig_start || entry.range.end > orig_range.end {
                continue;
            }
            let Some(trampoline) = state
                .table
                .point(entry.id)
                .and_then(|p| p.runtime.trampoline())
            else {
                continue;
            };
            let off = entry.range.start - orig_start;
            let Some(branch) = x64::jmp_rel32(copy_base + off, trampoline) else {
                warn!(
                    "private copy at {copy_base:#x} out of branch range of \
                     trampoline {trampoline:#x}, patch skipped"
                );
                continue;
            };
            copy[off..off + branch.len()].copy_from_slice(&branch);
            applied += 1;
        }

        applied
    }

    /// Runs the dispatch state machine for the patch site at `address`
    /// under the reader lock. The lock is released before this returns, so
    /// callers acting on [`DispatchOutcome::Redirect`] divert lock-free.
    pub fn dispatch(&self, address: usize, ctx: &mut CpuContext) -> DispatchOutcome {
        let state = self.state.read().unwrap();
        gateway::dispatch(
            &state.table,
            &state.index,
            self.resolver.as_ref(),
            self.sink.as_ref(),
            address,
            ctx,
        )
    }

    /// Renders the current table, match state and counters as a plain-text
    /// report for external tooling.
    pub fn dump(&self) -> String {
        use std::fmt::Write as _;
        use std::sync::atomic::Ordering;

        let state = self.state.read().unwrap();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "patch engine: {} policies ({} points), {} injected points, {} known modules",
            state.table.policies.len(),
            state.table.points().count(),
            state.index.len(),
            state.modules.len()
        );

        for policy in &state.table.policies {
            let _ = writeln!(
                out,
                "policy '{}' mode={} provider={}",
                policy.id, policy.mode, policy.provider.path
            );
            let s = &policy.stats;
            let _ = writeln!(
                out,
                "  detected={} not_detected={} protected={} redirected={} \
                 aborted={} injection_failures={}",
                s.num_detected.load(Ordering::Relaxed),
                s.num_not_detected.load(Ordering::Relaxed),
                s.num_protected.load(Ordering::Relaxed),
                s.num_redirected.load(Ordering::Relaxed),
                s.num_aborted.load(Ordering::Relaxed),
                s.num_injection_failures.load(Ordering::Relaxed),
            );
            for (si, set) in policy.sets.iter().enumerate() {
                for module in &set.modules {
                    if let Some(base) = module.runtime.base() {
                        let _ = writeln!(
                            out,
                            "  set {si}: matched at {base:#x}, {} points ({} injected)",
                            module.points.len(),
                            module
                                .points
                                .iter()
                                .filter(|p| p.runtime.injected())
                                .count()
                        );
                    }
                }
            }
        }

        out
    }

    /// Number of retired tables currently awaiting reclamation.
    pub fn retired_tables(&self) -> usize {
        self.retired.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::services::{ProviderFn, SuspendedThreads};

    /// Resolver that resolves nothing; engine tests exercise bookkeeping,
    /// not provider calls.
    struct NoProviders;

    impl ProviderResolver for NoProviders {
        fn resolve(&self, _path: &str, _hash: &str, _offset: usize) -> Option<ProviderFn> {
            None
        }
    }

    /// Suspender counting balanced suspend/resume pairs, shareable with
    /// the test body.
    #[derive(Default)]
    struct CountingSuspender {
        /// Completed suspend calls.
        suspends: AtomicUsize,
        /// Completed resume calls.
        resumes: AtomicUsize,
    }

    impl ThreadSuspender for Arc<CountingSuspender> {
        fn suspend_all(&self) -> SuspendedThreads {
            self.suspends.fetch_add(1, Ordering::SeqCst);
            SuspendedThreads::default()
        }

        fn resume_all(&self, _threads: SuspendedThreads) {
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Writes policy/mode fixtures and builds an engine over them.
    fn engine_with(
        policy_text: &str,
        mode_text: &str,
    ) -> (Arc<PatchEngine>, tempfile::TempDir, Arc<CountingSuspender>) {
        let dir = tempfile::tempdir().unwrap();
        let policy_path = dir.path().join("policies.def");
        let mode_path = dir.path().join("modes.def");
        std::fs::File::create(&policy_path)
            .unwrap()
            .write_all(policy_text.as_bytes())
            .unwrap();
        std::fs::File::create(&mode_path)
            .unwrap()
            .write_all(mode_text.as_bytes())
            .unwrap();

        let suspender = Arc::new(CountingSuspender::default());
        let mut config = EngineConfig::new(policy_path, mode_path, Box::new(NoProviders));
        config.suspender = Box::new(suspender.clone());
        let (engine, status) = PatchEngine::initialize(config);
        status.unwrap();
        (engine, dir, suspender)
    }

    /// One-policy definition patching the given offset.
    fn policy_text(offset: usize) -> String {
        format!(
            "version 1\npolicies 1\npolicy guard\nprovider libp.so -\nsets 1\nset\n\
             modules 1\nmodule - - - - - -\nhashes 0\npoints 1\npoint {offset:x} 0 10 - -\n"
        )
    }

    #[test]
    /// A bad definition file leaves a usable, empty engine
    fn init_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let policy_path = dir.path().join("policies.def");
        let mode_path = dir.path().join("modes.def");
        std::fs::write(&policy_path, "version 99\n").unwrap();
        std::fs::write(&mode_path, "version 1\nmodes 0\n").unwrap();

        let config = EngineConfig::new(policy_path, mode_path, Box::new(NoProviders));
        let (engine, status) = PatchEngine::initialize(config);

        assert!(status.is_err());
        assert!(!engine.does_region_need_patch(0..usize::MAX));
        assert!(engine.lookup_patch_addr(0x1234).is_none());
    }

    #[test]
    /// Module events inject and retract through the public surface
    fn module_event_round_trip() {
        let (engine, _dir, _susp) = engine_with(&policy_text(0x100), "version 1\nmodes 1\nguard:1\n");
        let mut module = vec![0x90u8; 0x1000];
        let base = module.as_mut_ptr() as usize;

        let outcome = unsafe { engine.on_module_load(base, ObservedSignature::default()) };
        assert_eq!(outcome.injected, 1);

        assert!(engine.does_region_need_patch(base + 0x100..base + 0x101));
        let descriptor = engine.lookup_patch_addr(base + 0x102).unwrap();
        assert_eq!(descriptor.policy_id, "guard");
        assert_eq!(descriptor.mode, Mode::Detect);
        assert_eq!(descriptor.range, base + 0x100..base + 0x105);

        let outcome = unsafe { engine.on_module_unload(base) };
        assert_eq!(outcome.unmatched_points.len(), 1);
        assert!(engine.lookup_patch_addr(base + 0x102).is_none());
        assert_eq!(&module[0x100..0x105], &[0x90; 5]);
    }

    #[test]
    /// Reload swaps tables atomically and retires the old one
    fn reload_swaps_and_retires() {
        let (engine, dir, susp) = engine_with(&policy_text(0x100), "version 1\nmodes 1\nguard:1\n");
        let mut module = vec![0x90u8; 0x1000];
        let base = module.as_mut_ptr() as usize;

        unsafe { engine.on_module_load(base, ObservedSignature::default()) };
        assert!(engine.lookup_patch_addr(base + 0x100).is_some());

        // move the patch point and reload
        std::fs::write(dir.path().join("policies.def"), policy_text(0x180)).unwrap();
        let suspends_before = susp.suspends.load(Ordering::SeqCst);
        engine.reload_policies().unwrap();

        // the swap ran exactly once under quiescence, fully bracketed
        assert_eq!(susp.suspends.load(Ordering::SeqCst), suspends_before + 1);
        assert_eq!(
            susp.suspends.load(Ordering::SeqCst),
            susp.resumes.load(Ordering::SeqCst)
        );

        // old site restored, new site patched, no mixed state
        assert!(engine.lookup_patch_addr(base + 0x100).is_none());
        assert!(engine.lookup_patch_addr(base + 0x180).is_some());
        assert_eq!(&module[0x100..0x105], &[0x90; 5]);
        assert_eq!(module[0x180], 0xe9);
        assert_eq!(engine.retired_tables(), 1);

        // the next reload reclaims the previously retired table
        engine.reload_policies().unwrap();
        assert_eq!(engine.retired_tables(), 1);
    }

    #[test]
    /// A failing reload leaves the current table authoritative
    fn reload_failure_keeps_table() {
        let (engine, dir, _susp) = engine_with(&policy_text(0x100), "version 1\nmodes 1\nguard:1\n");
        let mut module = vec![0x90u8; 0x1000];
        let base = module.as_mut_ptr() as usize;
        unsafe { engine.on_module_load(base, ObservedSignature::default()) };

        std::fs::write(dir.path().join("policies.def"), "version 1\ngarbage\n").unwrap();
        assert!(engine.reload_policies().is_err());

        // nothing moved: the old injection is still live
        assert!(engine.lookup_patch_addr(base + 0x100).is_some());
        assert_eq!(module[0x100], 0xe9);
        assert_eq!(engine.retired_tables(), 0);
    }

    #[test]
    /// Shutdown retracts everything and empties the engine
    fn shutdown_retracts() {
        let (engine, _dir, _susp) = engine_with(&policy_text(0x100), "version 1\nmodes 1\nguard:1\n");
        let mut module = vec![0x90u8; 0x1000];
        let base = module.as_mut_ptr() as usize;
        unsafe { engine.on_module_load(base, ObservedSignature::default()) };

        engine.shutdown();

        assert_eq!(&module[0x100..0x105], &[0x90; 5]);
        assert!(!engine.does_region_need_patch(0..usize::MAX));
        assert_eq!(engine.retired_tables(), 0);
    }

    #[test]
    /// Off-mode policies leave modules untouched end to end
    fn off_mode_is_invisible() {
        let (engine, _dir, _susp) = engine_with(&policy_text(0x100), "version 1\nmodes 1\nguard:0\n");
        let mut module = vec![0x90u8; 0x1000];
        let base = module.as_mut_ptr() as usize;

        let outcome = unsafe { engine.on_module_load(base, ObservedSignature::default()) };
        assert_eq!(outcome.matched_points.len(), 0);
        assert_eq!(&module[0x100..0x105], &[0x90; 5]);
    }

    #[test]
    /// Private copies get branches computed for their own address
    fn private_copy_injection() {
        let (engine, _dir, _susp) = engine_with(&policy_text(0x100), "version 1\nmodes 1\nguard:1\n");
        let mut module = vec![0x90u8; 0x1000];
        let base = module.as_mut_ptr() as usize;
        unsafe { engine.on_module_load(base, ObservedSignature::default()) };

        // a private copy of [base+0x80, base+0x180) executing elsewhere
        let mut copy = vec![0x90u8; 0x100];
        let copy_base = copy.as_mut_ptr() as usize;
        let applied = engine.inject_into_copy(copy_base, &mut copy, base + 0x80);
        assert_eq!(applied, 1);

        // the branch sits at the copied offset and targets the trampoline
        assert_eq!(copy[0x80], 0xe9);
        let disp = i32::from_le_bytes(copy[0x81..0x85].try_into().unwrap());
        let target = (copy_base + 0x80 + 5).wrapping_add(disp as usize);
        let trampoline = engine
            .lookup_patch_addr(base + 0x100)
            .map(|d| d.id)
            .and_then(|id| {
                let state = engine.state.read().unwrap();
                state.table.point(id).and_then(|p| p.runtime.trampoline())
            })
            .unwrap();
        assert_eq!(target, trampoline);
    }

    #[test]
    /// The dump names policies and their live match state
    fn dump_reports_state() {
        let (engine, _dir, _susp) = engine_with(&policy_text(0x100), "version 1\nmodes 1\nguard:1\n");
        let mut module = vec![0x90u8; 0x1000];
        let base = module.as_mut_ptr() as usize;
        unsafe { engine.on_module_load(base, ObservedSignature::default()) };

        let report = engine.dump();
        assert!(report.contains("policy 'guard' mode=detect"));
        assert!(report.contains("1 injected points"));
        assert!(report.contains("1 points (1 injected)"));
    }
}
