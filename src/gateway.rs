//! # Dispatch gateway
//!
//! The runtime entry reached when execution hits a patch site. One
//! invocation walks `ENTER → RESOLVE → DETECT → (PROTECT?) → (REDIRECT |
//! RETURN) → EXIT`: resolve the site back to its policy descriptor, run
//! the detector (and, on a hit in protect mode, the protector) under a
//! fault barrier, then apply whatever the providers asked for.
//!
//! Providers only ever see a pointer to a *copy* of the diverted thread's
//! register state; the copy is written back to the thread only in protect
//! mode. A panic inside a provider is contained by the barrier and
//! converted into [`DispatchOutcome::Aborted`]: a fault inside a provider
//! call terminates that call, never the host thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;

use log::{error, warn};

use crate::code::x64;
use crate::context::CpuContext;
use crate::index::PatchIndex;
use crate::services::{EventSink, ProviderFn, ProviderResolver, ViolationEvent, ViolationKind};
use crate::table::{Mode, PolicyStats, Table};

/// Flag bit a provider sets on its verdict to request an event
/// notification.
pub const VERDICT_LOG_EVENT: i32 = 0x100;

/// Detector verdict: no exploit observed.
pub const DETECT_NOT_DETECTED: i32 = 0;
/// Detector verdict: exploit observed.
pub const DETECT_DETECTED: i32 = 1;
/// Detector verdict: the detector itself failed.
pub const DETECT_ERROR: i32 = 2;

/// Protector verdict: remediated in place.
pub const PROTECT_PROTECTED: i32 = 0;
/// Protector verdict: declined to remediate.
pub const PROTECT_NOT_PROTECTED: i32 = 1;
/// Protector verdict: terminate the current thread.
pub const PROTECT_KILL_THREAD: i32 = 2;
/// Protector verdict: terminate the process.
pub const PROTECT_KILL_PROCESS: i32 = 3;
/// Protector verdict: raise an exception for the application to handle.
pub const PROTECT_RAISE_EXCEPTION: i32 = 4;
/// Protector verdict: divert control to the point's redirect target.
pub const PROTECT_CHANGE_CONTROL_FLOW: i32 = 5;
/// Protector verdict: the protector itself failed.
pub const PROTECT_ERROR: i32 = 6;

/// Terminal outcome of one gateway invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The address resolved to no live patch point; execution continues
    /// untouched (fail-open).
    NoPoint,
    /// Detector saw nothing.
    NotDetected,
    /// Detector hit; mode or configuration called for no protector.
    Detected,
    /// Detector reported its own failure.
    DetectorError,
    /// Protector remediated in place.
    Protected,
    /// Protector declined to remediate.
    NotProtected,
    /// Protector reported its own failure.
    ProtectorError,
    /// Protector requested thread termination.
    KillThread,
    /// Protector requested process termination.
    KillProcess,
    /// Protector requested an exception be raised.
    RaiseException,
    /// Protector requested control transfer to `target` (the point's
    /// trampoline exit slot). The caller must divert and never return.
    Redirect {
        /// Absolute address execution must continue at.
        target: usize,
    },
    /// A provider fault was contained by the barrier.
    Aborted,
}

/// Runs the full dispatch state machine for the patch site at `address`.
///
/// `ctx` is the caller's snapshot of the diverted thread: it is mutated
/// (and should be restored into the thread) only when the policy runs in
/// protect mode. The caller holds the engine's reader lock for the whole
/// call and releases it before acting on [`DispatchOutcome::Redirect`].
pub fn dispatch(
    table: &Table,
    index: &PatchIndex,
    resolver: &dyn ProviderResolver,
    sink: &dyn EventSink,
    address: usize,
    ctx: &mut CpuContext,
) -> DispatchOutcome {
    // RESOLVE. A miss on a live patch site means bookkeeping went wrong;
    // fail open and keep the application running
    let Some(entry) = index.lookup(address) else {
        error!("gateway: no patch point resolves {address:#x}");
        return DispatchOutcome::NoPoint;
    };
    let (Some(policy), Some(point)) = (table.policy(entry.id), table.point(entry.id)) else {
        error!("gateway: dangling descriptor for {address:#x}");
        return DispatchOutcome::NoPoint;
    };

    ctx.rip = address as u64;

    // the provider-visible copy; never a live reference to the thread
    let mut work = *ctx;

    // DETECT
    let Some(detector) =
        resolver.resolve(&policy.provider.path, &policy.provider.hash, point.detector_offset)
    else {
        warn!("policy '{}': detector did not resolve", policy.id);
        PolicyStats::bump(&policy.stats.num_detector_error);
        return DispatchOutcome::DetectorError;
    };

    let raw = match barrier(detector, &mut work) {
        Ok(raw) => raw,
        Err(()) => return abort_dispatch(policy, sink, address, ctx),
    };
    let log_event = raw & VERDICT_LOG_EVENT != 0;

    match raw & !VERDICT_LOG_EVENT {
        DETECT_NOT_DETECTED => {
            PolicyStats::bump(&policy.stats.num_not_detected);
            return DispatchOutcome::NotDetected;
        }
        DETECT_DETECTED => {}
        _ => {
            PolicyStats::bump(&policy.stats.num_detector_error);
            return DispatchOutcome::DetectorError;
        }
    }

    PolicyStats::bump(&policy.stats.num_detected);
    if log_event {
        sink.notify(ViolationEvent {
            kind: ViolationKind::Detected,
            policy_id: policy.id.clone(),
            address,
            context: work,
        });
    }

    let protector = match (policy.mode, point.protector_offset) {
        (Mode::Protect, Some(offset)) => {
            resolver.resolve(&policy.provider.path, &policy.provider.hash, offset)
        }
        _ => return DispatchOutcome::Detected,
    };
    let Some(protector) = protector else {
        warn!("policy '{}': protector did not resolve", policy.id);
        PolicyStats::bump(&policy.stats.num_protector_error);
        return DispatchOutcome::ProtectorError;
    };

    // PROTECT. The detector's mutations stay visible to the protector
    let raw = match barrier(protector, &mut work) {
        Ok(raw) => raw,
        Err(()) => return abort_dispatch(policy, sink, address, ctx),
    };
    let log_event = raw & VERDICT_LOG_EVENT != 0;

    // protect mode writes the (possibly mutated) snapshot back
    *ctx = work;

    let (outcome, counter, kind) = match raw & !VERDICT_LOG_EVENT {
        PROTECT_PROTECTED => (
            DispatchOutcome::Protected,
            &policy.stats.num_protected,
            ViolationKind::Protected,
        ),
        PROTECT_NOT_PROTECTED => (
            DispatchOutcome::NotProtected,
            &policy.stats.num_not_protected,
            ViolationKind::Protected,
        ),
        PROTECT_KILL_THREAD => (
            DispatchOutcome::KillThread,
            &policy.stats.num_kill_thread,
            ViolationKind::Terminated,
        ),
        PROTECT_KILL_PROCESS => (
            DispatchOutcome::KillProcess,
            &policy.stats.num_kill_process,
            ViolationKind::Terminated,
        ),
        PROTECT_RAISE_EXCEPTION => (
            DispatchOutcome::RaiseException,
            &policy.stats.num_raise_exception,
            ViolationKind::Protected,
        ),
        PROTECT_CHANGE_CONTROL_FLOW => {
            let Some(slot) = point.runtime.exit_slot() else {
                // the point carries no redirect target; refusing is the
                // fail-open translation of this configuration error
                error!(
                    "policy '{}': control-flow change without a redirect target",
                    policy.id
                );
                PolicyStats::bump(&policy.stats.num_protector_error);
                return DispatchOutcome::ProtectorError;
            };
            (
                DispatchOutcome::Redirect { target: slot },
                &policy.stats.num_redirected,
                ViolationKind::Redirected,
            )
        }
        _ => (
            DispatchOutcome::ProtectorError,
            &policy.stats.num_protector_error,
            ViolationKind::Protected,
        ),
    };

    PolicyStats::bump(counter);
    if log_event {
        sink.notify(ViolationEvent {
            kind,
            policy_id: policy.id.clone(),
            address,
            context: work,
        });
    }
    outcome
}

/// EXIT path for a contained provider fault: count it, report it once per
/// policy, leave the thread's state untouched.
fn abort_dispatch(
    policy: &crate::table::Policy,
    sink: &dyn EventSink,
    address: usize,
    ctx: &CpuContext,
) -> DispatchOutcome {
    PolicyStats::bump(&policy.stats.num_aborted);
    if !policy.stats.fault_reported.swap(true, Ordering::Relaxed) {
        sink.notify(ViolationEvent {
            kind: ViolationKind::ProviderFault,
            policy_id: policy.id.clone(),
            address,
            context: *ctx,
        });
    }
    warn!("policy '{}': provider fault contained at {address:#x}", policy.id);
    DispatchOutcome::Aborted
}

/// The exception barrier around a provider call: a panic inside the
/// provider unwinds to here and becomes `Err(())` instead of reaching the
/// diverted application thread.
fn barrier(provider: ProviderFn, ctx: &mut CpuContext) -> Result<i32, ()> {
    panic::catch_unwind(AssertUnwindSafe(|| unsafe { provider(ctx as *mut _) }))
        .map_err(|_| ())
}

/// Raw gateway entry called from trampoline prologues.
///
/// `site` is the absolute patch-site address baked into the trampoline;
/// `raw` points at the register block the prologue spilled on the diverted
/// thread's stack. Terminal actions that never return (redirect, process
/// kill, thread kill) are applied here, after the table lock has been
/// released; everything else returns into the trampoline epilogue, which
/// restores the (possibly updated) block and continues with the displaced
/// original code.
///
/// # Safety
///
/// Must only be called from an injected trampoline, with `raw` pointing at
/// a live [`CpuContext`]-shaped spill block.
pub unsafe extern "C" fn dispatch_entry(site: usize, raw: *mut CpuContext) {
    let Some(engine) = crate::engine::global() else {
        // no engine installed: nothing to consult, continue untouched
        return;
    };

    let mut snapshot = *raw;
    snapshot.rip = site as u64;

    match engine.dispatch(site, &mut snapshot) {
        DispatchOutcome::Redirect { target } => {
            snapshot.rip = target as u64;
            // the reader lock was released when dispatch returned
            x64::divert(&snapshot)
        }
        DispatchOutcome::KillProcess => std::process::abort(),
        DispatchOutcome::KillThread => kill_thread(),
        DispatchOutcome::RaiseException => {
            // no portable way to hand the application an exception it can
            // handle; fail open
            error!("gateway: raise-exception not supported, continuing");
            *raw = snapshot;
        }
        _ => {
            *raw = snapshot;
        }
    }
}

/// Terminates only the current thread.
#[cfg(unix)]
fn kill_thread() -> ! {
    unsafe { libc::pthread_exit(std::ptr::null_mut()) }
}

/// Fallback thread termination: without a per-thread primitive, fail
/// closed for the whole process.
#[cfg(not(unix))]
fn kill_thread() -> ! {
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use crate::table::{
        MatchSet, ModuleEntry, ModuleRuntime, ModuleSignature, PatchPoint, Policy, PolicyStats,
        PointId, PointRuntime, ProviderRef,
    };

    /// Detector offset the test resolver maps to a local function.
    const DET: usize = 0x10;
    /// Protector offset the test resolver maps to a local function.
    const PROT: usize = 0x20;

    /// Resolver mapping provider offsets straight to local functions.
    struct MapResolver(HashMap<usize, ProviderFn>);

    impl ProviderResolver for MapResolver {
        fn resolve(&self, _path: &str, _hash: &str, offset: usize) -> Option<ProviderFn> {
            self.0.get(&offset).copied()
        }
    }

    /// Sink recording every delivered event.
    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<ViolationEvent>>);

    impl EventSink for RecordingSink {
        fn notify(&self, event: ViolationEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    /// One-policy, one-point table in the given mode.
    fn table(mode: Mode, protector: bool, redirect: Option<usize>) -> Table {
        Table {
            policies: vec![Policy {
                id: "t".to_string(),
                provider: ProviderRef {
                    path: "p".to_string(),
                    hash: String::new(),
                },
                mode,
                sets: vec![MatchSet {
                    modules: vec![ModuleEntry {
                        signature: ModuleSignature::any(),
                        hash_regions: Vec::new(),
                        points: vec![PatchPoint {
                            offset: 0x100,
                            detector_offset: DET,
                            protector_offset: protector.then_some(PROT),
                            redirect_offset: redirect,
                            precedence: 0,
                            runtime: PointRuntime::default(),
                        }],
                        runtime: ModuleRuntime::default(),
                    }],
                }],
                stats: PolicyStats::default(),
            }],
        }
    }

    /// Marks the table's single point injected at `base` and indexes it.
    fn wire(table: &Table, base: usize, index: &mut PatchIndex) -> PointId {
        let id = PointId {
            policy: 0,
            set: 0,
            module: 0,
            point: 0,
        };
        let module = table.module(id).unwrap();
        module.runtime.set_matched(base);
        let point = table.point(id).unwrap();
        point.runtime.set_injected(0x7000_0000, 0x7000_0080, 5, Some(0x7000_00a0));
        index.insert(point.region(base), id);
        id
    }

    /// Count helper.
    fn count(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    unsafe extern "C-unwind" fn detect_miss(_ctx: *mut CpuContext) -> i32 {
        DETECT_NOT_DETECTED
    }

    unsafe extern "C-unwind" fn detect_hit(_ctx: *mut CpuContext) -> i32 {
        DETECT_DETECTED
    }

    unsafe extern "C-unwind" fn detect_hit_logged(_ctx: *mut CpuContext) -> i32 {
        DETECT_DETECTED | VERDICT_LOG_EVENT
    }

    unsafe extern "C-unwind" fn detect_hit_mutating(ctx: *mut CpuContext) -> i32 {
        (*ctx).rax = 0x42;
        DETECT_DETECTED
    }

    unsafe extern "C-unwind" fn detect_crash(_ctx: *mut CpuContext) -> i32 {
        let absent: Option<u64> = None;
        absent.unwrap() as i32
    }

    unsafe extern "C-unwind" fn protect_redirect(_ctx: *mut CpuContext) -> i32 {
        PROTECT_CHANGE_CONTROL_FLOW
    }

    unsafe extern "C-unwind" fn protect_ok(ctx: *mut CpuContext) -> i32 {
        (*ctx).rbx = 0x77;
        PROTECT_PROTECTED
    }

    /// Resolver with the given detector and protector.
    fn resolver(det: ProviderFn, prot: Option<ProviderFn>) -> MapResolver {
        let mut map = HashMap::new();
        map.insert(DET, det);
        if let Some(p) = prot {
            map.insert(PROT, p);
        }
        MapResolver(map)
    }

    #[test]
    /// A quiet detector yields not-detected and bumps only that counter
    fn detect_only_miss() {
        let table = table(Mode::Detect, false, None);
        let mut index = PatchIndex::new();
        wire(&table, 0x40_0000, &mut index);
        let sink = RecordingSink::default();
        let mut ctx = CpuContext::default();

        let outcome = dispatch(
            &table,
            &index,
            &resolver(detect_miss, None),
            &sink,
            0x40_0100,
            &mut ctx,
        );

        assert_eq!(outcome, DispatchOutcome::NotDetected);
        let stats = &table.policies[0].stats;
        assert_eq!(count(&stats.num_not_detected), 1);
        assert_eq!(count(&stats.num_detected), 0);
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    /// A detector hit in detect mode stops at detection
    fn detect_only_hit() {
        let table = table(Mode::Detect, true, None);
        let mut index = PatchIndex::new();
        wire(&table, 0x40_0000, &mut index);
        let sink = RecordingSink::default();
        let mut ctx = CpuContext::default();

        let outcome = dispatch(
            &table,
            &index,
            &resolver(detect_hit_logged, Some(protect_ok)),
            &sink,
            0x40_0100,
            &mut ctx,
        );

        assert_eq!(outcome, DispatchOutcome::Detected);
        assert_eq!(count(&table.policies[0].stats.num_detected), 1);
        assert_eq!(count(&table.policies[0].stats.num_protected), 0);

        let events = sink.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ViolationKind::Detected);
        assert_eq!(events[0].address, 0x40_0100);
    }

    #[test]
    /// Detector mutations are discarded outside protect mode
    fn detect_mode_discards_mutations() {
        let table = table(Mode::Detect, false, None);
        let mut index = PatchIndex::new();
        wire(&table, 0x40_0000, &mut index);
        let mut ctx = CpuContext::default();

        dispatch(
            &table,
            &index,
            &resolver(detect_hit_mutating, None),
            &RecordingSink::default(),
            0x40_0100,
            &mut ctx,
        );

        assert_eq!(ctx.rax, 0);
    }

    #[test]
    /// Protect mode runs the protector and writes mutations back
    fn protect_mode_copies_back() {
        let table = table(Mode::Protect, true, None);
        let mut index = PatchIndex::new();
        wire(&table, 0x40_0000, &mut index);
        let mut ctx = CpuContext::default();

        let outcome = dispatch(
            &table,
            &index,
            &resolver(detect_hit_mutating, Some(protect_ok)),
            &RecordingSink::default(),
            0x40_0100,
            &mut ctx,
        );

        assert_eq!(outcome, DispatchOutcome::Protected);
        assert_eq!(ctx.rax, 0x42, "detector mutation preserved");
        assert_eq!(ctx.rbx, 0x77, "protector mutation preserved");
        assert_eq!(count(&table.policies[0].stats.num_protected), 1);
    }

    #[test]
    /// Control-flow change resolves to the point's exit slot
    fn protect_redirects_to_exit_slot() {
        let table = table(Mode::Protect, true, Some(0x200));
        let mut index = PatchIndex::new();
        let id = wire(&table, 0x40_0000, &mut index);
        let mut ctx = CpuContext::default();

        let outcome = dispatch(
            &table,
            &index,
            &resolver(detect_hit, Some(protect_redirect)),
            &RecordingSink::default(),
            0x40_0100,
            &mut ctx,
        );

        let slot = table.point(id).unwrap().runtime.exit_slot().unwrap();
        assert_eq!(outcome, DispatchOutcome::Redirect { target: slot });
        assert_eq!(count(&table.policies[0].stats.num_redirected), 1);
    }

    #[test]
    /// A crashing detector is contained: aborted outcome, caller state
    /// intact, one fault report per policy
    fn fault_containment() {
        let table = table(Mode::Protect, true, None);
        let mut index = PatchIndex::new();
        wire(&table, 0x40_0000, &mut index);
        let sink = RecordingSink::default();
        let mut ctx = CpuContext {
            rax: 0xAAAA,
            ..Default::default()
        };

        for _ in 0..2 {
            let outcome = dispatch(
                &table,
                &index,
                &resolver(detect_crash, Some(protect_ok)),
                &sink,
                0x40_0100,
                &mut ctx,
            );
            assert_eq!(outcome, DispatchOutcome::Aborted);
        }

        assert_eq!(ctx.rax, 0xAAAA, "caller snapshot untouched");
        assert_eq!(count(&table.policies[0].stats.num_aborted), 2);

        // the forensic report fires once per policy, not per fault
        let events = sink.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ViolationKind::ProviderFault);
    }

    #[test]
    /// An address with no live point fails open
    fn resolve_miss_fails_open() {
        let table = table(Mode::Detect, false, None);
        let index = PatchIndex::new();
        let mut ctx = CpuContext::default();

        let outcome = dispatch(
            &table,
            &index,
            &resolver(detect_miss, None),
            &RecordingSink::default(),
            0x40_0100,
            &mut ctx,
        );

        assert_eq!(outcome, DispatchOutcome::NoPoint);
    }

    #[test]
    /// An unresolvable provider is a detector error, not a crash
    fn unresolved_provider() {
        let table = table(Mode::Detect, false, None);
        let mut index = PatchIndex::new();
        wire(&table, 0x40_0000, &mut index);
        let mut ctx = CpuContext::default();

        let outcome = dispatch(
            &table,
            &index,
            &MapResolver(HashMap::new()),
            &RecordingSink::default(),
            0x40_0100,
            &mut ctx,
        );

        assert_eq!(outcome, DispatchOutcome::DetectorError);
        assert_eq!(count(&table.policies[0].stats.num_detector_error), 1);
    }
}
