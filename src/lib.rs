#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod alloc;
pub mod code;
pub mod context;
pub mod engine;
pub mod gateway;
pub mod index;
pub mod loader;
pub mod matcher;
pub mod patcher;
pub mod services;
pub mod table;
pub mod trampoline;

pub use context::CpuContext;
pub use engine::{EngineConfig, PatchDescriptor, PatchEngine};
pub use gateway::DispatchOutcome;
pub use table::{Mode, PointId, Table, PATCH_REGION_SIZE};
