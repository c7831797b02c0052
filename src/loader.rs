//! # Policy loader
//!
//! Parses the external policy and mode definition files into a
//! [`Table`](crate::table::Table). The format is line-oriented,
//! newline-terminated text: an engine-version line, a declared count of
//! policies, then nested `policy` / `set` / `module` / `hash` / `point`
//! records. Counts are decimal; offsets, sizes, checksums and digests are
//! hex; `-` marks a field the policy ignores and `?` one that was
//! unavailable when the policy was authored. Blank lines and `#` comments
//! are skipped.
//!
//! A load either produces a fully-populated table or fails as a whole:
//! any parse or range violation aborts the load and releases everything
//! built so far. Partially valid tables are never returned.

use std::collections::HashMap;
use std::path::Path;

use log::{debug, info};
use thiserror::Error;

use crate::table::{
    FileVersion, HashRegion, MatchSet, Mode, ModuleEntry, ModuleRuntime, ModuleSignature,
    PatchPoint, Policy, PolicyStats, PointRuntime, ProviderRef, SigField, Table,
    PATCH_REGION_SIZE,
};

/// Version of the definition format this engine understands. A mismatch is
/// a hard load failure; the format is not binary-stable across versions.
pub const ENGINE_VERSION: u32 = 1;

/// Upper bound on policies per table.
pub const MAX_POLICIES: usize = 10_000;
/// Upper bound on sets per policy.
pub const MAX_SETS_PER_POLICY: usize = 16;
/// Upper bound on module hypotheses per set.
pub const MAX_MODULES_PER_SET: usize = 16;
/// Upper bound on hash regions per module.
pub const MAX_HASH_REGIONS: usize = 64;
/// Upper bound on patch points per module.
pub const MAX_POINTS_PER_MODULE: usize = 256;
/// Upper bound on any module-relative offset (maximum supported module
/// size).
pub const MAX_MODULE_OFFSET: usize = 0x1000_0000;
/// Upper bound on a single hash region's length.
pub const MAX_HASH_REGION_LEN: usize = 0x10_0000;
/// Upper bound on a policy id's length in bytes.
pub const MAX_ID_LEN: usize = 64;

/// Errors aborting a policy or mode load.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Reading a definition file failed.
    #[error("failed to read definition file: {0}")]
    Io(#[from] std::io::Error),

    /// The file ended before a required record.
    #[error("line {line}: unexpected end of definitions")]
    UnexpectedEnd {
        /// Line number past the end of input.
        line: usize,
    },

    /// A record did not start with the required keyword or had the wrong
    /// number of fields.
    #[error("line {line}: expected {expected}")]
    Expected {
        /// Line number of the malformed record.
        line: usize,
        /// Human-readable description of what was required.
        expected: &'static str,
    },

    /// A numeric field failed to parse.
    #[error("line {line}: malformed number '{token}'")]
    BadNumber {
        /// Line number of the malformed field.
        line: usize,
        /// The offending token.
        token: String,
    },

    /// The definition file was produced for a different engine version.
    #[error("engine version mismatch: definitions are v{found}, engine is v{expected}")]
    VersionMismatch {
        /// Version declared by the file.
        found: u32,
        /// Version this engine understands.
        expected: u32,
    },

    /// A count or offset exceeded its documented maximum.
    #[error("line {line}: {field} = {value} exceeds maximum {max}")]
    OutOfRange {
        /// Line number of the violating field.
        line: usize,
        /// Which field violated its bound.
        field: &'static str,
        /// Parsed value.
        value: u64,
        /// Documented maximum.
        max: u64,
    },

    /// Two policies share an id.
    #[error("line {line}: duplicate policy id '{id}'")]
    DuplicatePolicy {
        /// Line number of the second definition.
        line: usize,
        /// The duplicated id.
        id: String,
    },

    /// The mode file names a policy the policy file does not define.
    #[error("line {line}: mode for unknown policy '{id}'")]
    UnknownPolicy {
        /// Line number of the orphan mode entry.
        line: usize,
        /// The unknown id.
        id: String,
    },

    /// A mode entry was not `policy_id:mode`.
    #[error("line {line}: malformed mode entry '{token}'")]
    BadMode {
        /// Line number of the malformed entry.
        line: usize,
        /// The offending line.
        token: String,
    },
}

/// Loads and joins the policy and mode definition files into a table.
pub fn load_files(
    policy_path: &Path,
    mode_path: &Path,
) -> Result<Table, LoadError> {
    let policies = std::fs::read_to_string(policy_path)?;
    let modes = std::fs::read_to_string(mode_path)?;
    load_tables(&policies, &modes)
}

/// Parses policy and mode definition text into a table.
///
/// Policies absent from the mode file default to [`Mode::Off`]; mode
/// entries for unknown policies fail the load.
pub fn load_tables(policy_text: &str, mode_text: &str) -> Result<Table, LoadError> {
    let mut policies = parse_policies(policy_text)?;
    let modes = parse_modes(mode_text)?;

    for (id, line) in modes.order.iter() {
        if !policies.iter().any(|p| &p.id == id) {
            return Err(LoadError::UnknownPolicy {
                line: *line,
                id: id.clone(),
            });
        }
    }
    for policy in policies.iter_mut() {
        policy.mode = modes.by_id.get(&policy.id).copied().unwrap_or(Mode::Off);
    }

    info!(
        "loaded {} policies ({} active)",
        policies.len(),
        policies.iter().filter(|p| p.mode != Mode::Off).count()
    );
    Ok(Table { policies })
}

/// Parsed mode assignments, with source lines for error reporting.
struct ModeMap {
    /// Mode per policy id.
    by_id: HashMap<String, Mode>,
    /// Ids in file order with their line numbers.
    order: Vec<(String, usize)>,
}

/// Line cursor over a definition file.
struct Cursor<'a> {
    /// Remaining lines.
    lines: std::str::Lines<'a>,
    /// 1-based number of the last line handed out.
    line: usize,
}

impl<'a> Cursor<'a> {
    /// Creates a cursor at the top of `text`.
    fn new(text: &'a str) -> Self {
        Cursor {
            lines: text.lines(),
            line: 0,
        }
    }

    /// Next non-blank, non-comment line.
    fn next_line(&mut self) -> Result<&'a str, LoadError> {
        loop {
            self.line += 1;
            match self.lines.next() {
                None => return Err(LoadError::UnexpectedEnd { line: self.line }),
                Some(raw) => {
                    let trimmed = raw.trim();
                    if trimmed.is_empty() || trimmed.starts_with('#') {
                        continue;
                    }
                    return Ok(trimmed);
                }
            }
        }
    }

    /// Reads a record line starting with `keyword`, returning its fields.
    fn record(
        &mut self,
        keyword: &'static str,
        expected: &'static str,
    ) -> Result<Vec<&'a str>, LoadError> {
        let line = self.next_line()?;
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some(keyword) {
            return Err(LoadError::Expected {
                line: self.line,
                expected,
            });
        }
        Ok(tokens.collect())
    }

    /// Parses a decimal count record (`<keyword> <n>`), enforcing `max`.
    fn count(
        &mut self,
        keyword: &'static str,
        expected: &'static str,
        field: &'static str,
        max: usize,
    ) -> Result<usize, LoadError> {
        let fields = self.record(keyword, expected)?;
        let &[token] = fields.as_slice() else {
            return Err(LoadError::Expected {
                line: self.line,
                expected,
            });
        };
        let value = self.decimal(token)?;
        if value as usize > max {
            return Err(LoadError::OutOfRange {
                line: self.line,
                field,
                value,
                max: max as u64,
            });
        }
        Ok(value as usize)
    }

    /// Parses a decimal token.
    fn decimal(&self, token: &str) -> Result<u64, LoadError> {
        token.parse().map_err(|_| LoadError::BadNumber {
            line: self.line,
            token: token.to_string(),
        })
    }

    /// Parses a hex token.
    fn hex(&self, token: &str) -> Result<u64, LoadError> {
        u64::from_str_radix(token, 16).map_err(|_| LoadError::BadNumber {
            line: self.line,
            token: token.to_string(),
        })
    }

    /// Parses a hex token bounded by `max`.
    fn hex_bounded(
        &self,
        token: &str,
        field: &'static str,
        max: usize,
    ) -> Result<usize, LoadError> {
        let value = self.hex(token)?;
        if value > max as u64 {
            return Err(LoadError::OutOfRange {
                line: self.line,
                field,
                value,
                max: max as u64,
            });
        }
        Ok(value as usize)
    }

    /// Parses a sentinel-aware hex u32 field.
    fn sig_u32(&self, token: &str) -> Result<SigField<u32>, LoadError> {
        match token {
            "-" => Ok(SigField::Ignore),
            "?" => Ok(SigField::Unavailable),
            _ => {
                let value = self.hex(token)?;
                u32::try_from(value)
                    .map(SigField::Value)
                    .map_err(|_| LoadError::BadNumber {
                        line: self.line,
                        token: token.to_string(),
                    })
            }
        }
    }

    /// Parses a sentinel-aware `a.b.c.d` file version field.
    fn sig_version(&self, token: &str) -> Result<SigField<FileVersion>, LoadError> {
        match token {
            "-" => Ok(SigField::Ignore),
            "?" => Ok(SigField::Unavailable),
            _ => {
                let mut parts = token.split('.');
                let mut next = || -> Result<u16, LoadError> {
                    parts
                        .next()
                        .and_then(|p| p.parse().ok())
                        .ok_or_else(|| LoadError::BadNumber {
                            line: self.line,
                            token: token.to_string(),
                        })
                };
                let version = FileVersion(next()?, next()?, next()?, next()?);
                if parts.next().is_some() {
                    return Err(LoadError::BadNumber {
                        line: self.line,
                        token: token.to_string(),
                    });
                }
                Ok(SigField::Value(version))
            }
        }
    }

    /// Parses a 64-hex-character SHA-256 digest.
    fn digest(&self, token: &str) -> Result<[u8; 32], LoadError> {
        let bytes = token.as_bytes();
        if bytes.len() != 64 {
            return Err(LoadError::BadNumber {
                line: self.line,
                token: token.to_string(),
            });
        }
        let mut digest = [0u8; 32];
        for (i, out) in digest.iter_mut().enumerate() {
            let pair = std::str::from_utf8(&bytes[i * 2..i * 2 + 2]).unwrap_or("");
            *out = u8::from_str_radix(pair, 16).map_err(|_| LoadError::BadNumber {
                line: self.line,
                token: token.to_string(),
            })?;
        }
        Ok(digest)
    }
}

/// Parses the policy definition file. Modes default to `Off` until the mode
/// file is joined in.
pub fn parse_policies(text: &str) -> Result<Vec<Policy>, LoadError> {
    let mut cursor = Cursor::new(text);

    let version = cursor.count("version", "'version <n>'", "version", u32::MAX as usize)?;
    if version as u32 != ENGINE_VERSION {
        return Err(LoadError::VersionMismatch {
            found: version as u32,
            expected: ENGINE_VERSION,
        });
    }

    let num_policies = cursor.count("policies", "'policies <n>'", "policy count", MAX_POLICIES)?;
    let mut policies = Vec::with_capacity(num_policies);

    for _ in 0..num_policies {
        let policy = parse_policy(&mut cursor)?;
        if policies.iter().any(|p: &Policy| p.id == policy.id) {
            return Err(LoadError::DuplicatePolicy {
                line: cursor.line,
                id: policy.id,
            });
        }
        policies.push(policy);
    }

    Ok(policies)
}

/// Parses one `policy` record and its nested sets.
fn parse_policy(cursor: &mut Cursor<'_>) -> Result<Policy, LoadError> {
    let fields = cursor.record("policy", "'policy <id>'")?;
    let &[id] = fields.as_slice() else {
        return Err(LoadError::Expected {
            line: cursor.line,
            expected: "'policy <id>'",
        });
    };
    if id.len() > MAX_ID_LEN {
        return Err(LoadError::OutOfRange {
            line: cursor.line,
            field: "policy id length",
            value: id.len() as u64,
            max: MAX_ID_LEN as u64,
        });
    }
    let id = id.to_string();

    let fields = cursor.record("provider", "'provider <path> <hash|->'")?;
    let &[path, hash] = fields.as_slice() else {
        return Err(LoadError::Expected {
            line: cursor.line,
            expected: "'provider <path> <hash|->'",
        });
    };
    let provider = ProviderRef {
        path: path.to_string(),
        hash: if hash == "-" { String::new() } else { hash.to_string() },
    };

    let num_sets = cursor.count("sets", "'sets <n>'", "set count", MAX_SETS_PER_POLICY)?;
    let mut sets = Vec::with_capacity(num_sets);
    for _ in 0..num_sets {
        cursor.record("set", "'set'")?;
        let num_modules = cursor.count(
            "modules",
            "'modules <n>'",
            "module count",
            MAX_MODULES_PER_SET,
        )?;
        let mut modules = Vec::with_capacity(num_modules);
        for _ in 0..num_modules {
            modules.push(parse_module(cursor)?);
        }
        sets.push(MatchSet { modules });
    }

    debug!("parsed policy '{}' ({} sets)", id, sets.len());
    Ok(Policy {
        id,
        provider,
        mode: Mode::Off,
        sets,
        stats: PolicyStats::default(),
    })
}

/// Parses one `module` record with its hash regions and patch points.
fn parse_module(cursor: &mut Cursor<'_>) -> Result<ModuleEntry, LoadError> {
    let fields = cursor.record(
        "module",
        "'module <name> <checksum> <timestamp> <imagesize> <codesize> <filever>'",
    )?;
    let &[name, checksum, timestamp, image_size, code_size, file_version] = fields.as_slice() else {
        return Err(LoadError::Expected {
            line: cursor.line,
            expected: "'module <name> <checksum> <timestamp> <imagesize> <codesize> <filever>'",
        });
    };

    let signature = ModuleSignature {
        name: match name {
            "-" => SigField::Ignore,
            "?" => SigField::Unavailable,
            _ => SigField::Value(name.to_string()),
        },
        checksum: cursor.sig_u32(checksum)?,
        timestamp: cursor.sig_u32(timestamp)?,
        image_size: cursor.sig_u32(image_size)?,
        code_size: cursor.sig_u32(code_size)?,
        file_version: cursor.sig_version(file_version)?,
    };

    let num_hashes = cursor.count("hashes", "'hashes <n>'", "hash region count", MAX_HASH_REGIONS)?;
    let mut hash_regions = Vec::with_capacity(num_hashes);
    for _ in 0..num_hashes {
        let fields = cursor.record("hash", "'hash <start> <len> <sha256>'")?;
        let &[start, len, digest] = fields.as_slice() else {
            return Err(LoadError::Expected {
                line: cursor.line,
                expected: "'hash <start> <len> <sha256>'",
            });
        };
        let start = cursor.hex_bounded(start, "hash region start", MAX_MODULE_OFFSET)?;
        let len = cursor.hex_bounded(len, "hash region length", MAX_HASH_REGION_LEN)?;
        if start + len > MAX_MODULE_OFFSET {
            return Err(LoadError::OutOfRange {
                line: cursor.line,
                field: "hash region end",
                value: (start + len) as u64,
                max: MAX_MODULE_OFFSET as u64,
            });
        }
        hash_regions.push(HashRegion {
            start,
            len,
            digest: cursor.digest(digest)?,
        });
    }

    let num_points = cursor.count("points", "'points <n>'", "point count", MAX_POINTS_PER_MODULE)?;
    let mut points = Vec::with_capacity(num_points);
    for _ in 0..num_points {
        let fields = cursor.record(
            "point",
            "'point <offset> <precedence> <detector> <protector|-> <redirect|->'",
        )?;
        let &[offset, precedence, detector, protector, redirect] = fields.as_slice() else {
            return Err(LoadError::Expected {
                line: cursor.line,
                expected: "'point <offset> <precedence> <detector> <protector|-> <redirect|->'",
            });
        };

        let offset = cursor.hex_bounded(
            offset,
            "patch offset",
            MAX_MODULE_OFFSET - PATCH_REGION_SIZE,
        )?;
        let precedence = cursor.decimal(precedence)? as u32;
        let detector_offset = cursor.hex_bounded(detector, "detector offset", MAX_MODULE_OFFSET)?;
        let protector_offset = match protector {
            "-" => None,
            _ => Some(cursor.hex_bounded(protector, "protector offset", MAX_MODULE_OFFSET)?),
        };
        let redirect_offset = match redirect {
            "-" => None,
            _ => Some(cursor.hex_bounded(redirect, "redirect offset", MAX_MODULE_OFFSET)?),
        };

        points.push(PatchPoint {
            offset,
            detector_offset,
            protector_offset,
            redirect_offset,
            precedence,
            runtime: PointRuntime::default(),
        });
    }

    Ok(ModuleEntry {
        signature,
        hash_regions,
        points,
        runtime: ModuleRuntime::default(),
    })
}

/// Parses the mode definition file.
fn parse_modes(text: &str) -> Result<ModeMap, LoadError> {
    let mut cursor = Cursor::new(text);

    let version = cursor.count("version", "'version <n>'", "version", u32::MAX as usize)?;
    if version as u32 != ENGINE_VERSION {
        return Err(LoadError::VersionMismatch {
            found: version as u32,
            expected: ENGINE_VERSION,
        });
    }

    let num_modes = cursor.count("modes", "'modes <n>'", "mode count", MAX_POLICIES)?;
    let mut map = ModeMap {
        by_id: HashMap::new(),
        order: Vec::new(),
    };
    for _ in 0..num_modes {
        let line = cursor.next_line()?;
        let (id, code) = line.split_once(':').ok_or_else(|| LoadError::BadMode {
            line: cursor.line,
            token: line.to_string(),
        })?;
        let code: u32 = code.trim().parse().map_err(|_| LoadError::BadMode {
            line: cursor.line,
            token: line.to_string(),
        })?;
        let mode = Mode::from_code(code).ok_or_else(|| LoadError::BadMode {
            line: cursor.line,
            token: line.to_string(),
        })?;
        map.by_id.insert(id.trim().to_string(), mode);
        map.order.push((id.trim().to_string(), cursor.line));
    }

    Ok(map)
}
