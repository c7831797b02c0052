//! # Patch descriptor table
//!
//! The in-memory representation of all loaded patch policies. A [`Table`] is
//! built once by the [`loader`](crate::loader) and never mutated afterwards;
//! the only fields that change at runtime are the per-module match state and
//! the per-point injection state, which live in dedicated runtime cells so
//! that readers holding a table snapshot never observe a half-built table.

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Size in bytes of the region overwritten at every patch site.
///
/// Large enough to hold a rel32 `jmp`, and fixed so the address index can
/// serve range and single-point lookups with one entry shape.
pub const PATCH_REGION_SIZE: usize = 5;

/// Operating mode of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Policy is loaded but dormant: no matching, no injection.
    Off,
    /// Detector runs at each patch point; no remediation.
    Detect,
    /// Detector runs and, on a hit, the protector may remediate.
    Protect,
}

impl Mode {
    /// Decodes the numeric mode used by the mode definition file.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Mode::Off),
            1 => Some(Mode::Detect),
            2 => Some(Mode::Protect),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Off => write!(f, "off"),
            Mode::Detect => write!(f, "detect"),
            Mode::Protect => write!(f, "protect"),
        }
    }
}

/// One field of a module signature.
///
/// `Ignore` and `Unavailable` are wildcard sentinels: a field carrying either
/// matches any observed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigField<T> {
    /// A literal value that must equal the observed one.
    Value(T),
    /// The policy author does not care about this field.
    Ignore,
    /// The value was not available when the policy was authored.
    Unavailable,
}

impl<T: PartialEq> SigField<T> {
    /// Whether this field accepts the observed value.
    ///
    /// A literal never matches a missing observation; either sentinel
    /// matches anything.
    pub fn matches(&self, observed: Option<&T>) -> bool {
        match self {
            SigField::Ignore | SigField::Unavailable => true,
            SigField::Value(want) => observed.map_or(false, |got| got == want),
        }
    }
}

/// Four-part file version, most significant part first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileVersion(pub u16, pub u16, pub u16, pub u16);

impl fmt::Display for FileVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0, self.1, self.2, self.3)
    }
}

/// The symbolic/binary identity a policy uses to recognize a target module.
#[derive(Debug, Clone)]
pub struct ModuleSignature {
    /// Module file name.
    pub name: SigField<String>,
    /// Image content checksum as reported by the module loader.
    pub checksum: SigField<u32>,
    /// Build timestamp.
    pub timestamp: SigField<u32>,
    /// Total image size in bytes.
    pub image_size: SigField<u32>,
    /// Size of the code section in bytes.
    pub code_size: SigField<u32>,
    /// Four-part file version.
    pub file_version: SigField<FileVersion>,
}

impl ModuleSignature {
    /// A signature that matches any module. Used by tests and as a loader
    /// default before fields are filled in.
    pub fn any() -> Self {
        ModuleSignature {
            name: SigField::Ignore,
            checksum: SigField::Ignore,
            timestamp: SigField::Ignore,
            image_size: SigField::Ignore,
            code_size: SigField::Ignore,
            file_version: SigField::Ignore,
        }
    }

    /// Coarse (metadata-only) comparison against an observed signature.
    pub fn matches(&self, observed: &ObservedSignature) -> bool {
        self.name.matches(observed.name.as_ref())
            && self.checksum.matches(observed.checksum.as_ref())
            && self.timestamp.matches(observed.timestamp.as_ref())
            && self.image_size.matches(observed.image_size.as_ref())
            && self.code_size.matches(observed.code_size.as_ref())
            && self.file_version.matches(observed.file_version.as_ref())
    }
}

/// Signature metadata reported by the module loader for a loaded module.
///
/// `None` means the loader could not produce the field; a policy demanding a
/// literal value will not match it.
#[derive(Debug, Clone, Default)]
pub struct ObservedSignature {
    /// Module file name.
    pub name: Option<String>,
    /// Image content checksum.
    pub checksum: Option<u32>,
    /// Build timestamp.
    pub timestamp: Option<u32>,
    /// Total image size.
    pub image_size: Option<u32>,
    /// Code section size.
    pub code_size: Option<u32>,
    /// Four-part file version.
    pub file_version: Option<FileVersion>,
}

/// A content-hash check over a range of a module's image.
#[derive(Debug, Clone)]
pub struct HashRegion {
    /// Start offset of the region, relative to the module base.
    pub start: usize,
    /// Length of the region in bytes.
    pub len: usize,
    /// Expected SHA-256 digest of the region's pre-patch content.
    pub digest: [u8; 32],
}

/// Reference to the provider module supplying detector/protector functions.
#[derive(Debug, Clone)]
pub struct ProviderRef {
    /// Filesystem path of the provider module.
    pub path: String,
    /// Expected content hash of the provider, hex-encoded; empty when the
    /// policy does not pin the provider build.
    pub hash: String,
}

/// Runtime injection state of a patch point.
///
/// All three cells are either zero (not injected) or non-zero (injected);
/// they are mutated only under the engine's writer lock and read under its
/// reader lock, so plain relaxed atomics are sufficient.
#[derive(Debug, Default)]
pub struct PointRuntime {
    /// Base address of the trampoline, 0 when not injected.
    trampoline: AtomicUsize,
    /// Address of the displaced original instructions inside the trampoline.
    displaced: AtomicUsize,
    /// Number of original bytes displaced into the trampoline.
    displaced_len: AtomicUsize,
    /// Address of the trampoline's patchable exit-branch slot; 0 when the
    /// point has no redirect target.
    exit_slot: AtomicUsize,
}

impl PointRuntime {
    /// Whether the point is currently injected.
    pub fn injected(&self) -> bool {
        self.trampoline.load(Ordering::Relaxed) != 0
    }

    /// Trampoline base address, if injected.
    pub fn trampoline(&self) -> Option<usize> {
        match self.trampoline.load(Ordering::Relaxed) {
            0 => None,
            addr => Some(addr),
        }
    }

    /// Address of the displaced original instructions, if injected.
    pub fn displaced(&self) -> Option<usize> {
        match self.displaced.load(Ordering::Relaxed) {
            0 => None,
            addr => Some(addr),
        }
    }

    /// Number of displaced original bytes, 0 when not injected.
    pub fn displaced_len(&self) -> usize {
        self.displaced_len.load(Ordering::Relaxed)
    }

    /// Address of the dynamic exit-branch slot, if one was emitted.
    pub fn exit_slot(&self) -> Option<usize> {
        match self.exit_slot.load(Ordering::Relaxed) {
            0 => None,
            addr => Some(addr),
        }
    }

    /// Records a completed injection.
    pub fn set_injected(
        &self,
        trampoline: usize,
        displaced: usize,
        displaced_len: usize,
        exit_slot: Option<usize>,
    ) {
        self.trampoline.store(trampoline, Ordering::Relaxed);
        self.displaced.store(displaced, Ordering::Relaxed);
        self.displaced_len.store(displaced_len, Ordering::Relaxed);
        self.exit_slot.store(exit_slot.unwrap_or(0), Ordering::Relaxed);
    }

    /// Clears all injection state. The trampoline buffer itself is parked,
    /// not freed.
    pub fn clear(&self) {
        self.trampoline.store(0, Ordering::Relaxed);
        self.displaced.store(0, Ordering::Relaxed);
        self.displaced_len.store(0, Ordering::Relaxed);
        self.exit_slot.store(0, Ordering::Relaxed);
    }
}

/// A single byte-offset location in a target module where control is
/// diverted.
#[derive(Debug)]
pub struct PatchPoint {
    /// Offset of the patch site, relative to the target module base.
    pub offset: usize,
    /// Offset of the detector function, relative to the provider module.
    pub detector_offset: usize,
    /// Offset of the protector function, relative to the provider module.
    pub protector_offset: Option<usize>,
    /// Optional control-flow redirect target, relative to the target module.
    pub redirect_offset: Option<usize>,
    /// Reserved tie-breaking precedence; parsed and carried but unused.
    pub precedence: u32,
    /// Injection state.
    pub runtime: PointRuntime,
}

impl PatchPoint {
    /// Absolute address range of this point's patch region for a module
    /// loaded at `base`.
    pub fn region(&self, base: usize) -> Range<usize> {
        let start = base + self.offset;
        start..start + PATCH_REGION_SIZE
    }
}

/// Runtime match state of a module entry.
#[derive(Debug, Default)]
pub struct ModuleRuntime {
    /// Whether this entry currently matches a loaded module.
    matched: AtomicBool,
    /// Base address of the matched module; 0 when unmatched.
    base: AtomicUsize,
}

impl ModuleRuntime {
    /// Whether the entry is currently matched.
    pub fn matched(&self) -> bool {
        self.matched.load(Ordering::Relaxed)
    }

    /// Base address of the matched module, if matched.
    pub fn base(&self) -> Option<usize> {
        if self.matched() {
            Some(self.base.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    /// Marks the entry matched at `base`.
    pub fn set_matched(&self, base: usize) {
        self.base.store(base, Ordering::Relaxed);
        self.matched.store(true, Ordering::Relaxed);
    }

    /// Clears the match state.
    pub fn clear(&self) {
        self.matched.store(false, Ordering::Relaxed);
        self.base.store(0, Ordering::Relaxed);
    }
}

/// One module-identity hypothesis: a signature, its content-hash checks, and
/// the patch points to apply when it matches.
#[derive(Debug)]
pub struct ModuleEntry {
    /// Coarse signature for first-stage matching.
    pub signature: ModuleSignature,
    /// Content-hash regions for second-stage verification.
    pub hash_regions: Vec<HashRegion>,
    /// Patch points, in definition order.
    pub points: Vec<PatchPoint>,
    /// Match state.
    pub runtime: ModuleRuntime,
}

/// An ordered list of alternative module hypotheses for one policy. The
/// first module to match wins for the whole policy.
#[derive(Debug)]
pub struct MatchSet {
    /// Alternative module entries, in definition order.
    pub modules: Vec<ModuleEntry>,
}

/// Per-policy terminal-outcome counters.
///
/// Counters are human-readable diagnostics only; they use relaxed atomics
/// and make no cross-counter consistency promise.
#[derive(Debug, Default)]
pub struct PolicyStats {
    /// Detector reported a hit.
    pub num_detected: AtomicU64,
    /// Detector reported no hit.
    pub num_not_detected: AtomicU64,
    /// Detector returned its error verdict.
    pub num_detector_error: AtomicU64,
    /// Protector reported successful remediation.
    pub num_protected: AtomicU64,
    /// Protector declined to remediate.
    pub num_not_protected: AtomicU64,
    /// Protector returned its error verdict.
    pub num_protector_error: AtomicU64,
    /// Protector requested thread termination.
    pub num_kill_thread: AtomicU64,
    /// Protector requested process termination.
    pub num_kill_process: AtomicU64,
    /// Protector requested an exception be raised.
    pub num_raise_exception: AtomicU64,
    /// Protector requested a control-flow change.
    pub num_redirected: AtomicU64,
    /// A provider fault was contained by the dispatch barrier.
    pub num_aborted: AtomicU64,
    /// Injections skipped because the region was unsafe or already hooked.
    pub num_injection_failures: AtomicU64,
    /// Whether this policy's one-time provider-fault report has fired.
    pub fault_reported: AtomicBool,
}

impl PolicyStats {
    /// Relaxed increment helper.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A patch policy: identity, provider, mode, and the ordered module
/// hypotheses it applies to.
#[derive(Debug)]
pub struct Policy {
    /// Identifying name, unique within a table.
    pub id: String,
    /// Provider module supplying this policy's detector/protector.
    pub provider: ProviderRef,
    /// Operating mode.
    pub mode: Mode,
    /// Ordered match sets; the first set with a matched module wins.
    pub sets: Vec<MatchSet>,
    /// Outcome counters.
    pub stats: PolicyStats,
}

impl Policy {
    /// Index of the currently matched set, if any. At most one set per
    /// policy is matched at a time.
    pub fn matched_set(&self) -> Option<usize> {
        self.sets
            .iter()
            .position(|set| set.modules.iter().any(|m| m.runtime.matched()))
    }
}

/// Descriptor tuple resolving a patch point inside a table.
///
/// Index-based so that descriptors stay meaningful across table
/// regeneration without holding pointers into the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PointId {
    /// Policy index in [`Table::policies`].
    pub policy: usize,
    /// Set index within the policy.
    pub set: usize,
    /// Module index within the set.
    pub module: usize,
    /// Point index within the module.
    pub point: usize,
}

/// An immutable, fully-constructed policy table.
#[derive(Debug, Default)]
pub struct Table {
    /// Policies in definition order.
    pub policies: Vec<Policy>,
}

impl Table {
    /// A table with no policies.
    pub fn empty() -> Self {
        Table::default()
    }

    /// Resolves a descriptor to its policy.
    pub fn policy(&self, id: PointId) -> Option<&Policy> {
        self.policies.get(id.policy)
    }

    /// Resolves a descriptor to its module entry.
    pub fn module(&self, id: PointId) -> Option<&ModuleEntry> {
        self.policies
            .get(id.policy)?
            .sets
            .get(id.set)?
            .modules
            .get(id.module)
    }

    /// Resolves a descriptor to its patch point.
    pub fn point(&self, id: PointId) -> Option<&PatchPoint> {
        self.module(id)?.points.get(id.point)
    }

    /// Iterates every `(PointId, &PatchPoint)` in the table.
    pub fn points(&self) -> impl Iterator<Item = (PointId, &PatchPoint)> {
        self.policies.iter().enumerate().flat_map(|(pi, policy)| {
            policy.sets.iter().enumerate().flat_map(move |(si, set)| {
                set.modules.iter().enumerate().flat_map(move |(mi, module)| {
                    module.points.iter().enumerate().map(move |(xi, point)| {
                        (
                            PointId {
                                policy: pi,
                                set: si,
                                module: mi,
                                point: xi,
                            },
                            point,
                        )
                    })
                })
            })
        })
    }
}
