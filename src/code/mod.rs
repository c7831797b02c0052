//! # Machine code primitives
//!
//! Branch encodings and the low-level control-transfer primitive used by
//! trampolines. Only x86-64 is implemented.

pub mod x64;
