//! Device-generated commands.
//!
//! An application fills a buffer of fixed-stride input records on the GPU; the generator turns
//! every record into a command sequence for the graphics (and, for task shaders, compute)
//! engine without a CPU round trip. This crate holds every host-side piece of that pipeline:
//!
//! - [`layout`]: validated [`IndirectCommandLayout`]s describing what each record contains.
//! - [`cost`] and [`plan`]: the size model and the output buffer region layout.
//! - [`packer`] and [`params`]: the scalar parameters and blob a generation uploads.
//! - [`generator`]: the generator program and the dispatch seam that runs it.
//! - [`execution_set`]: GPU-resident pipeline tables for per-sequence pipeline switches.
//! - [`replay`]: a command processor model used to check generated streams.
//!
//! [`DgcService`] ties them together.

pub mod arena;
pub mod config;
pub mod cost;
pub mod error;
pub mod execution_set;
pub mod generator;
pub mod layout;
pub mod memory;
pub mod metadata;
pub mod packer;
pub mod params;
pub mod plan;
pub mod predication;
pub mod replay;
pub mod service;
pub mod stats;
pub mod token;

pub use arena::{BufferArena, LinearAllocator, UploadAllocation};
pub use config::{DeviceRules, DgcConfig, Engine, EngineRules};
pub use cost::{sequence_cost, CostContext, SequenceCost};
pub use error::{DgcError, LayoutError};
pub use execution_set::{ExecutionSetDesc, ExecutionSetKind, IndirectExecutionSet};
pub use generator::{ComputeDispatch, CpuDispatch, GeneratorProgram, ProgramId, ThreadOrder};
pub use layout::{IndirectCommandLayout, IndirectCommandLayoutDesc, LayoutKind, TokenDesc};
pub use memory::{DeviceMemory, MemoryError, VecDeviceMemory};
pub use metadata::{GridSizeForm, PipelineMetadata, ShaderStage, StageFlags, StageMetadata};
pub use packer::{BoundState, IndexBinding, VertexBinding};
pub use plan::{CmdbufLayout, Region, RegionKind, Stream};
pub use predication::{Predication, PredicationGate};
pub use replay::{CommandProcessor, ReplayError, ReplayEvent};
pub use service::{
    Continuation, DgcService, EntryPoint, GeneratedCommands, GenerationRequest, MemoryRequirements,
};
pub use stats::{DgcStats, DgcStatsSnapshot};
pub use token::{IndexType, IndexTypeMode, TokenSet};
