//! # Signature matcher
//!
//! Classifies module load/unload events against the policy table and
//! drives injection/removal for matched modules.
//!
//! Matching is two-stage: a coarse metadata comparison (with
//! ignore/unavailable sentinels as wildcards), then a SHA-256 check over
//! each declared hash region of the live image. Hash computation
//! substitutes the pre-patch original bytes wherever a probed range
//! overlaps an already-injected patch region, so our own (and other
//! policies') in-place patches never corrupt the comparison.
//!
//! A module that passes the coarse match but fails a hash check is simply
//! not matched: that is the designed rejection path for "same name,
//! different build", not an error.

use log::{debug, warn};
use sha2::{Digest, Sha256};

use crate::index::PatchIndex;
use crate::patcher;
use crate::table::{ModuleEntry, ObservedSignature, PointId, PolicyStats, Table, Mode};
use crate::trampoline::TrampolineManager;

/// Result of processing one module event.
#[derive(Debug, Default)]
pub struct EventOutcome {
    /// Points newly registered because their module matched.
    pub matched_points: Vec<PointId>,
    /// Points deregistered because their module unloaded.
    pub unmatched_points: Vec<PointId>,
    /// Points successfully injected.
    pub injected: usize,
    /// Points whose injection was skipped (unsafe region, overlap, ...).
    pub skipped: usize,
}

/// Processes a module-load event: matches every eligible policy against
/// the new module and injects the points of matched modules.
///
/// Policies in off mode are skipped entirely; a policy that already has a
/// matched set is left alone; within a policy, only the first matching
/// set is processed (first-match-wins), and later sets are never
/// consulted once one matches.
///
/// # Safety
///
/// `base` must be the base of a live module whose image is readable for
/// every declared hash region and patch point. The caller serializes
/// module events and holds the engine's writer lock; other threads must be
/// quiesced for the injection writes.
pub unsafe fn apply_module_load(
    table: &Table,
    index: &mut PatchIndex,
    trampolines: &TrampolineManager,
    base: usize,
    signature: &ObservedSignature,
) -> EventOutcome {
    let mut outcome = EventOutcome::default();

    for (pi, policy) in table.policies.iter().enumerate() {
        if policy.mode == Mode::Off {
            continue;
        }
        if policy.matched_set().is_some() {
            continue;
        }

        'sets: for (si, set) in policy.sets.iter().enumerate() {
            for (mi, module) in set.modules.iter().enumerate() {
                if !module.signature.matches(signature) {
                    continue;
                }
                if !hash_regions_match(base, module, index, table) {
                    debug!(
                        "policy '{}': module at {base:#x} passed coarse match \
                         but failed hash check",
                        policy.id
                    );
                    continue;
                }

                module.runtime.set_matched(base);
                debug!(
                    "policy '{}': matched module at {base:#x} (set {si})",
                    policy.id
                );

                for (xi, _point) in module.points.iter().enumerate() {
                    let id = PointId {
                        policy: pi,
                        set: si,
                        module: mi,
                        point: xi,
                    };
                    outcome.matched_points.push(id);
                    match trampolines.inject(table, index, id) {
                        Ok(()) => outcome.injected += 1,
                        Err(e) => {
                            warn!("policy '{}': injection skipped: {e}", policy.id);
                            PolicyStats::bump(&policy.stats.num_injection_failures);
                            outcome.skipped += 1;
                        }
                    }
                }

                // first matching set wins for the whole policy
                break 'sets;
            }
        }
    }

    outcome
}

/// Processes a module-unload event: removes and deregisters every point of
/// every module entry matched at `base`, then clears its match state.
///
/// Off-mode policies cannot be matched, but their entries are still swept
/// so a stale match can never survive an unload.
///
/// # Safety
///
/// The module's code at `base` must still be mapped and writable (the
/// event must arrive before the image is unmapped), and other threads must
/// be quiesced for the restore writes.
pub unsafe fn apply_module_unload(
    table: &Table,
    index: &mut PatchIndex,
    trampolines: &TrampolineManager,
    base: usize,
) -> EventOutcome {
    let mut outcome = EventOutcome::default();

    for (pi, policy) in table.policies.iter().enumerate() {
        for (si, set) in policy.sets.iter().enumerate() {
            for (mi, module) in set.modules.iter().enumerate() {
                if module.runtime.base() != Some(base) {
                    continue;
                }

                for (xi, point) in module.points.iter().enumerate() {
                    let id = PointId {
                        policy: pi,
                        set: si,
                        module: mi,
                        point: xi,
                    };
                    outcome.unmatched_points.push(id);
                    if point.runtime.injected() {
                        trampolines.remove(table, index, id);
                    }
                }

                module.runtime.clear();
                debug!("policy '{}': unmatched module at {base:#x}", policy.id);
            }
        }
    }

    outcome
}

/// Whether every declared hash region of `module` matches the live image
/// at `base`.
///
/// # Safety
///
/// Every declared region of the image must be readable.
unsafe fn hash_regions_match(
    base: usize,
    module: &ModuleEntry,
    index: &PatchIndex,
    table: &Table,
) -> bool {
    module
        .hash_regions
        .iter()
        .all(|region| region_digest(base, region.start, region.len, index, table) == region.digest)
}

/// SHA-256 of a module region as it looked before any patching.
///
/// Bytes covered by an injected patch region are taken from that point's
/// displaced original copy instead of the live (branch-overwritten) image.
///
/// # Safety
///
/// `base + start .. base + start + len` must be readable.
pub unsafe fn region_digest(
    base: usize,
    start: usize,
    len: usize,
    index: &PatchIndex,
    table: &Table,
) -> [u8; 32] {
    let abs = base + start..base + start + len;
    let mut buf = patcher::read_code(abs.start as *const u8, len);

    for entry in index.overlapping(&abs) {
        let Some(displaced) = table.point(entry.id).and_then(|p| p.runtime.displaced()) else {
            continue;
        };
        let lo = abs.start.max(entry.range.start);
        let hi = abs.end.min(entry.range.end);
        let saved = patcher::read_code(
            (displaced + (lo - entry.range.start)) as *const u8,
            hi - lo,
        );
        buf[lo - abs.start..hi - abs.start].copy_from_slice(&saved);
    }

    Sha256::digest(&buf).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{
        HashRegion, MatchSet, Mode, ModuleEntry, ModuleRuntime, ModuleSignature, PatchPoint,
        Policy, PolicyStats, PointRuntime, ProviderRef,
    };

    /// Point constructor shorthand.
    fn point(offset: usize) -> PatchPoint {
        PatchPoint {
            offset,
            detector_offset: 0x10,
            protector_offset: None,
            redirect_offset: None,
            precedence: 0,
            runtime: PointRuntime::default(),
        }
    }

    /// Module entry matching any signature, with the given hash regions and
    /// points.
    fn entry(hash_regions: Vec<HashRegion>, points: Vec<PatchPoint>) -> ModuleEntry {
        ModuleEntry {
            signature: ModuleSignature::any(),
            hash_regions,
            points,
            runtime: ModuleRuntime::default(),
        }
    }

    /// Single-policy table from pre-built sets.
    fn table(mode: Mode, sets: Vec<MatchSet>) -> Table {
        Table {
            policies: vec![Policy {
                id: "t".to_string(),
                provider: ProviderRef {
                    path: "p".to_string(),
                    hash: String::new(),
                },
                mode,
                sets,
                stats: PolicyStats::default(),
            }],
        }
    }

    /// A fake loaded module of NOPs, with its base address.
    fn fake_module() -> (Vec<u8>, usize) {
        let mut module = vec![0x90u8; 0x1000];
        let base = module.as_mut_ptr() as usize;
        (module, base)
    }

    /// SHA-256 of a byte slice.
    fn digest_of(bytes: &[u8]) -> [u8; 32] {
        Sha256::digest(bytes).into()
    }

    #[test]
    /// Load marks the module matched and injects; unload restores all of it
    fn match_unmatch_symmetry() {
        let (module, base) = fake_module();
        let table = table(
            Mode::Detect,
            vec![MatchSet {
                modules: vec![entry(Vec::new(), vec![point(0x100), point(0x200)])],
            }],
        );
        let trampolines = TrampolineManager::new(0xdead_beef);
        let mut index = PatchIndex::new();
        let sig = ObservedSignature::default();

        let outcome = unsafe {
            apply_module_load(&table, &mut index, &trampolines, base, &sig)
        };
        assert_eq!(outcome.matched_points.len(), 2);
        assert_eq!(outcome.injected, 2);
        assert_eq!(index.len(), 2);

        let me = &table.policies[0].sets[0].modules[0];
        assert!(me.runtime.matched());
        assert_eq!(me.runtime.base(), Some(base));

        let outcome = unsafe {
            apply_module_unload(&table, &mut index, &trampolines, base)
        };
        assert_eq!(outcome.unmatched_points.len(), 2);
        assert!(!me.runtime.matched());
        assert_eq!(me.runtime.base(), None);
        assert!(index.is_empty());
        assert_eq!(&module[0x100..0x105], &[0x90; 5]);
        assert_eq!(&module[0x200..0x205], &[0x90; 5]);
    }

    #[test]
    /// Only the first matching set's points are ever injected
    fn first_set_wins() {
        let (_module, base) = fake_module();
        let table = table(
            Mode::Detect,
            vec![
                MatchSet {
                    modules: vec![entry(Vec::new(), vec![point(0x100)])],
                },
                MatchSet {
                    modules: vec![entry(Vec::new(), vec![point(0x300)])],
                },
            ],
        );
        let trampolines = TrampolineManager::new(0xdead_beef);
        let mut index = PatchIndex::new();

        let outcome = unsafe {
            apply_module_load(
                &table,
                &mut index,
                &trampolines,
                base,
                &ObservedSignature::default(),
            )
        };

        assert_eq!(outcome.matched_points.len(), 1);
        assert!(index.lookup(base + 0x100).is_some());
        assert!(index.lookup(base + 0x300).is_none());
        assert!(table.policies[0].sets[0].modules[0].runtime.matched());
        assert!(!table.policies[0].sets[1].modules[0].runtime.matched());

        // a second load event must not fall through to the second set
        let outcome = unsafe {
            apply_module_load(
                &table,
                &mut index,
                &trampolines,
                base,
                &ObservedSignature::default(),
            )
        };
        assert!(outcome.matched_points.is_empty());
        assert!(index.lookup(base + 0x300).is_none());
    }

    #[test]
    /// A corrupted hash region rejects an otherwise matching module
    fn hash_checked_rejection() {
        let (mut module, base) = fake_module();

        // expect the digest of a pristine 0x40-byte region...
        let expected = digest_of(&vec![0x90u8; 0x40]);
        let table = table(
            Mode::Detect,
            vec![MatchSet {
                modules: vec![entry(
                    vec![HashRegion {
                        start: 0x80,
                        len: 0x40,
                        digest: expected,
                    }],
                    vec![point(0x100)],
                )],
            }],
        );
        let trampolines = TrampolineManager::new(0xdead_beef);
        let mut index = PatchIndex::new();

        // ...but corrupt one byte inside it
        module[0x90] = 0x91;
        let outcome = unsafe {
            apply_module_load(
                &table,
                &mut index,
                &trampolines,
                base,
                &ObservedSignature::default(),
            )
        };
        assert!(outcome.matched_points.is_empty());
        assert!(!table.policies[0].sets[0].modules[0].runtime.matched());
        assert!(index.is_empty());

        // restored, the same event matches
        module[0x90] = 0x90;
        let outcome = unsafe {
            apply_module_load(
                &table,
                &mut index,
                &trampolines,
                base,
                &ObservedSignature::default(),
            )
        };
        assert_eq!(outcome.injected, 1);
    }

    #[test]
    /// Hash checks see pre-patch bytes where another policy already patched
    fn hash_substitutes_patched_bytes() {
        let (_module, base) = fake_module();
        let trampolines = TrampolineManager::new(0xdead_beef);
        let mut index = PatchIndex::new();

        // first policy patches 0x100
        let first = table(
            Mode::Detect,
            vec![MatchSet {
                modules: vec![entry(Vec::new(), vec![point(0x100)])],
            }],
        );
        let outcome = unsafe {
            apply_module_load(
                &first,
                &mut index,
                &trampolines,
                base,
                &ObservedSignature::default(),
            )
        };
        assert_eq!(outcome.injected, 1);

        // the live bytes at 0x100 are now a branch, but a digest over the
        // covering region still sees the original NOPs
        let expected = digest_of(&vec![0x90u8; 0x40]);
        let computed = unsafe { region_digest(base, 0xe0, 0x40, &index, &first) };
        assert_eq!(computed, expected);
    }

    #[test]
    /// Off-mode policies never match on load but are swept on unload
    fn off_policy_skipped() {
        let (_module, base) = fake_module();
        let table = table(
            Mode::Off,
            vec![MatchSet {
                modules: vec![entry(Vec::new(), vec![point(0x100)])],
            }],
        );
        let trampolines = TrampolineManager::new(0xdead_beef);
        let mut index = PatchIndex::new();

        let outcome = unsafe {
            apply_module_load(
                &table,
                &mut index,
                &trampolines,
                base,
                &ObservedSignature::default(),
            )
        };
        assert!(outcome.matched_points.is_empty());
        assert!(index.is_empty());

        // a defensively stale match is still cleared by unload
        table.policies[0].sets[0].modules[0].runtime.set_matched(base);
        let outcome = unsafe {
            apply_module_unload(&table, &mut index, &trampolines, base)
        };
        assert_eq!(outcome.unmatched_points.len(), 1);
        assert!(!table.policies[0].sets[0].modules[0].runtime.matched());
    }

    #[test]
    /// A failed injection is skipped and counted, not fatal
    fn injection_failure_counted() {
        let (mut module, base) = fake_module();
        module[0x102] = 0xc3; // ret inside the would-be patch region

        let table = table(
            Mode::Detect,
            vec![MatchSet {
                modules: vec![entry(Vec::new(), vec![point(0x100), point(0x200)])],
            }],
        );
        let trampolines = TrampolineManager::new(0xdead_beef);
        let mut index = PatchIndex::new();

        let outcome = unsafe {
            apply_module_load(
                &table,
                &mut index,
                &trampolines,
                base,
                &ObservedSignature::default(),
            )
        };

        // the unsafe point is skipped, the healthy one still lands
        assert_eq!(outcome.injected, 1);
        assert_eq!(outcome.skipped, 1);
        assert!(index.lookup(base + 0x100).is_none());
        assert!(index.lookup(base + 0x200).is_some());
        assert_eq!(
            table.policies[0]
                .stats
                .num_injection_failures
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }
}
