//! Entry point tying layouts, sizing, packing and the generator dispatch together.

use dgc_packets::packet::IB_SIZE_MASK;
use dgc_packets::{PacketEmitter, JUMP_PACKET_BYTES};

use crate::arena::LinearAllocator;
use crate::config::{DeviceRules, DgcConfig, Engine};
use crate::cost::{sequence_cost, CostContext};
use crate::error::DgcError;
use crate::execution_set::{ExecutionSetKind, IndirectExecutionSet};
use crate::generator::{workgroup_count, ComputeDispatch, ProgramArena};
use crate::layout::{IndirectCommandLayout, IndirectCommandLayoutDesc, LayoutKind};
use crate::memory::DeviceMemory;
use crate::metadata::{PipelineMetadata, StageFlags};
use crate::packer::{pack_parameters, BoundState, PackInputs};
use crate::plan::{self, CmdbufLayout, Stream};
use crate::predication::Predication;
use crate::stats::{DgcStats, DgcStatsSnapshot};

/// A command stream to jump to once a generated stream finishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Continuation {
    pub address: u64,
    pub size_dw: u32,
}

/// One generation: where the records are, how many, and where the commands go.
#[derive(Clone, Copy, Debug)]
pub struct GenerationRequest<'a> {
    pub max_sequence_count: u32,
    /// GPU counter clamping the sequence count at generation time.
    pub count_address: Option<u64>,
    pub input_address: u64,
    pub input_stride: u32,
    pub output_address: u64,
    pub output_size: u64,
    pub predication: Option<Predication>,
    pub execution_set: Option<&'a IndirectExecutionSet>,
    pub primary_engine: Engine,
    pub continuation: Option<Continuation>,
    pub secondary_continuation: Option<Continuation>,
}

impl<'a> GenerationRequest<'a> {
    pub fn new(
        input_address: u64,
        input_stride: u32,
        max_sequence_count: u32,
        output_address: u64,
        output_size: u64,
    ) -> Self {
        Self {
            max_sequence_count,
            count_address: None,
            input_address,
            input_stride,
            output_address,
            output_size,
            predication: None,
            execution_set: None,
            primary_engine: Engine::Graphics,
            continuation: None,
            secondary_continuation: None,
        }
    }

    pub fn with_count_address(mut self, address: u64) -> Self {
        self.count_address = Some(address);
        self
    }

    pub fn with_predication(mut self, predication: Predication) -> Self {
        self.predication = Some(predication);
        self
    }

    pub fn with_execution_set(mut self, set: &'a IndirectExecutionSet) -> Self {
        self.execution_set = Some(set);
        self
    }

    pub fn with_primary_engine(mut self, engine: Engine) -> Self {
        self.primary_engine = engine;
        self
    }

    pub fn with_continuation(mut self, continuation: Continuation) -> Self {
        self.continuation = Some(continuation);
        self
    }

    pub fn with_secondary_continuation(mut self, continuation: Continuation) -> Self {
        self.secondary_continuation = Some(continuation);
        self
    }
}

/// Output buffer size and alignment needed for a layout and maximum count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
}

/// Where an engine starts executing a generated stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryPoint {
    pub address: u64,
    pub size_dw: u32,
}

/// Result of [`DgcService::generate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GeneratedCommands {
    pub plan: CmdbufLayout,
    pub output_address: u64,
    pub primary_engine: Engine,
    pub primary: EntryPoint,
    pub secondary: Option<EntryPoint>,
    pub primary_trailer: u64,
    pub secondary_trailer: Option<u64>,
}

impl GeneratedCommands {
    pub fn entry(&self, stream: Stream) -> Option<EntryPoint> {
        match stream {
            Stream::Primary => Some(self.primary),
            Stream::Secondary => self.secondary,
        }
    }

    pub fn engine(&self, stream: Stream) -> Engine {
        match stream {
            Stream::Primary => self.primary_engine,
            Stream::Secondary => Engine::Compute,
        }
    }
}

#[derive(Debug)]
struct ServiceState {
    rules: DeviceRules,
    config: DgcConfig,
    programs: ProgramArena,
    stats: DgcStats,
}

/// Device-generated commands service of one device.
///
/// Created empty; [`DgcService::init`] brings it up on first use and [`DgcService::teardown`]
/// drops every compiled program.
#[derive(Debug, Default)]
pub struct DgcService {
    state: Option<ServiceState>,
}

impl DgcService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialise the service. A second call keeps the existing state.
    pub fn init(&mut self, rules: DeviceRules, config: DgcConfig) -> Result<(), DgcError> {
        if self.state.is_some() {
            tracing::debug!("DGC service already initialised");
            return Ok(());
        }
        if !rules.is_valid() {
            return Err(DgcError::InvalidRequest("device alignment rules are not powers of two"));
        }
        if config.threads_per_group == 0 {
            return Err(DgcError::InvalidRequest("threads_per_group must be non-zero"));
        }
        tracing::debug!(?rules, ?config, "DGC service initialised");
        self.state = Some(ServiceState {
            rules,
            config,
            programs: ProgramArena::new(),
            stats: DgcStats::new(),
        });
        Ok(())
    }

    pub fn teardown(&mut self) {
        if let Some(state) = self.state.take() {
            tracing::debug!(programs = state.programs.len(), "DGC service torn down");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    fn state(&self) -> Result<&ServiceState, DgcError> {
        self.state.as_ref().ok_or(DgcError::NotInitialized)
    }

    fn state_mut(&mut self) -> Result<&mut ServiceState, DgcError> {
        self.state.as_mut().ok_or(DgcError::NotInitialized)
    }

    pub fn config(&self) -> Result<&DgcConfig, DgcError> {
        Ok(&self.state()?.config)
    }

    pub fn rules(&self) -> Result<&DeviceRules, DgcError> {
        Ok(&self.state()?.rules)
    }

    pub fn stats(&self) -> Result<DgcStatsSnapshot, DgcError> {
        Ok(self.state()?.stats.snapshot())
    }

    pub fn program_count(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.programs.len())
    }

    /// Validate `desc` and attach the generator program for its shape.
    pub fn create_layout(
        &mut self,
        desc: &IndirectCommandLayoutDesc,
    ) -> Result<IndirectCommandLayout, DgcError> {
        let state = self.state_mut()?;
        let mut layout = IndirectCommandLayout::new(desc)?;
        let (id, hit) = state.programs.get_or_compile(layout.shape())?;
        layout.program = Some(id);

        state.stats.inc_layouts_created();
        state.stats.record_program_lookup(hit);
        tracing::debug!(
            tokens = ?layout.tokens(),
            kind = ?layout.kind(),
            stride = layout.input_stride(),
            program = id.0,
            cached = hit,
            "created indirect command layout"
        );
        Ok(layout)
    }

    /// Worst-case output size for up to `max_sequence_count` sequences.
    pub fn memory_requirements(
        &self,
        layout: &IndirectCommandLayout,
        context: &CostContext<'_>,
        max_sequence_count: u32,
        primary_engine: Engine,
    ) -> Result<MemoryRequirements, DgcError> {
        let state = self.state()?;
        let cost = sequence_cost(layout.shape(), context, state.config.trace_markers);
        let plan = CmdbufLayout::plan(&cost, max_sequence_count, true, &state.rules, primary_engine);
        Ok(MemoryRequirements {
            size: plan.total_size,
            alignment: plan.alignment,
        })
    }

    /// Plan the output, upload the parameters and run the generator program.
    pub fn generate(
        &self,
        layout: &IndirectCommandLayout,
        request: &GenerationRequest<'_>,
        bound: &BoundState,
        allocator: &mut dyn LinearAllocator,
        memory: &dyn DeviceMemory,
        dispatcher: &mut dyn ComputeDispatch,
    ) -> Result<GeneratedCommands, DgcError> {
        let state = self.state()?;
        let program = layout
            .program()
            .and_then(|id| state.programs.get(id))
            .filter(|p| p.shape() == layout.shape())
            .ok_or(DgcError::InvalidRequest("layout was not created by this service"))?;

        if request.input_stride != layout.input_stride() {
            return Err(DgcError::InvalidRequest("input stride does not match the layout"));
        }
        if request.primary_engine == Engine::Compute && !layout.kind().is_compute() {
            return Err(DgcError::InvalidRequest("graphics work cannot run on the compute engine"));
        }

        let context = cost_context(layout, request, bound)?;
        let cost = sequence_cost(layout.shape(), &context, state.config.trace_markers);
        let max = request.max_sequence_count;
        let use_preamble = plan::use_preamble(request.count_address.is_some(), max, &state.config);
        let plan = CmdbufLayout::plan(&cost, max, use_preamble, &state.rules, request.primary_engine);

        if plan.total_size > request.output_size {
            return Err(DgcError::OutputTooSmall {
                required: plan.total_size,
                provided: request.output_size,
            });
        }
        if request.output_address % plan.alignment != 0 {
            return Err(DgcError::InvalidRequest(
                "output address is not aligned for the target engines",
            ));
        }
        let limit = u64::from(IB_SIZE_MASK) * 4;
        if plan.main.size > limit || plan.secondary.size > limit {
            return Err(DgcError::InvalidRequest(
                "generated stream exceeds the indirect buffer size limit",
            ));
        }

        if let Some(set) = request.execution_set {
            validate_execution_set_indices(layout, request, set, memory)?;
        }

        let packed = pack_parameters(
            &PackInputs {
                layout,
                request,
                state: bound,
                plan: &plan,
                rules: &state.rules,
                config: &state.config,
            },
            allocator,
            memory,
        )?;

        if max == 0 {
            tracing::warn!("generating commands with a zero maximum sequence count");
        }
        let threads_per_group = state.config.threads_per_group;
        let workgroups = workgroup_count(max, threads_per_group);
        dispatcher.dispatch(program, &packed.params, workgroups, threads_per_group, memory)?;

        let upload_bytes = packed.blob.map_or(0, |b| b.size) + plan.upload.size;
        state.stats.record_generation(max, upload_bytes);
        tracing::debug!(
            max_sequences = max,
            total_size = plan.total_size,
            primary_stride = plan.primary_stride,
            secondary_stride = plan.secondary_stride,
            use_preamble,
            workgroups,
            "generated commands"
        );

        let entry = |stream: Stream| {
            let region = plan.entry(stream);
            EntryPoint {
                address: request.output_address + region.offset,
                size_dw: (region.size / 4) as u32,
            }
        };
        Ok(GeneratedCommands {
            plan,
            output_address: request.output_address,
            primary_engine: request.primary_engine,
            primary: entry(Stream::Primary),
            secondary: plan.has_secondary().then(|| entry(Stream::Secondary)),
            primary_trailer: request.output_address + plan.main_trailer.offset,
            secondary_trailer: plan
                .has_secondary()
                .then(|| request.output_address + plan.secondary_trailer.offset),
        })
    }

    /// Point the trailer of `stream` at `continuation` after generation.
    ///
    /// Only chaining engines reach their trailer.
    pub fn chain_trailer(
        &self,
        memory: &dyn DeviceMemory,
        generated: &GeneratedCommands,
        stream: Stream,
        continuation: Continuation,
    ) -> Result<(), DgcError> {
        let state = self.state()?;
        if state.rules.engine(generated.engine(stream)).supports_nesting {
            return Err(DgcError::InvalidRequest("nesting engines never execute the trailer"));
        }
        let trailer = generated.plan.trailer(stream);
        if trailer.is_empty() {
            return Err(DgcError::InvalidRequest("layout has no secondary stream"));
        }

        let mut buf = vec![0u8; trailer.size as usize];
        let mut em = PacketEmitter::new(&mut buf);
        em.pad_to((trailer.size - u64::from(JUMP_PACKET_BYTES)) as usize);
        em.indirect_buffer(continuation.address, continuation.size_dw, true);
        memory.write(generated.output_address + trailer.offset, &buf)?;
        tracing::trace!(?stream, address = continuation.address, "chained trailer");
        Ok(())
    }
}

/// Pipeline information a generation is sized against.
fn cost_context<'a>(
    layout: &IndirectCommandLayout,
    request: &GenerationRequest<'_>,
    bound: &'a BoundState,
) -> Result<CostContext<'a>, DgcError> {
    match (layout.shape().uses_execution_set(), request.execution_set) {
        (true, Some(set)) => {
            if !set.is_alive() {
                return Err(DgcError::InvalidRequest("execution set was destroyed"));
            }
            let want = if layout.kind().is_compute() {
                ExecutionSetKind::Compute
            } else {
                ExecutionSetKind::Graphics
            };
            if set.desc().kind != want {
                return Err(DgcError::ExecutionSetMismatch {
                    reason: "execution set kind does not match the layout",
                });
            }
            Ok(CostContext::ExecutionSet(set.bounds()))
        }
        (true, None) => Err(DgcError::InvalidRequest(
            "layout switches pipelines but no execution set was given",
        )),
        (false, Some(_)) => Err(DgcError::InvalidRequest(
            "execution set given to a layout without a pipeline switch",
        )),
        (false, None) => {
            let pipeline = bound
                .pipeline
                .as_ref()
                .ok_or(DgcError::InvalidRequest("no pipeline bound and no execution set"))?;
            check_required_stages(layout, pipeline)?;
            Ok(CostContext::Pipeline(pipeline))
        }
    }
}

fn check_required_stages(
    layout: &IndirectCommandLayout,
    pipeline: &PipelineMetadata,
) -> Result<(), DgcError> {
    let required = match layout.kind() {
        LayoutKind::Dispatch | LayoutKind::RayTrace => StageFlags::COMPUTE,
        LayoutKind::Graphics { .. } => StageFlags::VERTEX,
        LayoutKind::MeshOnly { task: false } => StageFlags::MESH,
        LayoutKind::MeshOnly { task: true } => StageFlags::MESH | StageFlags::TASK,
    };
    match required.stages().find(|s| pipeline.stage(*s).is_none()) {
        Some(stage) => Err(DgcError::MissingStage { stage }),
        None => Ok(()),
    }
}

/// Reject any candidate record selecting an entry the set does not have.
///
/// Every record below the maximum is checked, since the GPU count may reveal any of them.
fn validate_execution_set_indices(
    layout: &IndirectCommandLayout,
    request: &GenerationRequest<'_>,
    set: &IndirectExecutionSet,
    memory: &dyn DeviceMemory,
) -> Result<(), DgcError> {
    let Some(offset) = layout.execution_set_offset() else {
        return Ok(());
    };
    for sequence in 0..request.max_sequence_count {
        let record = request.input_address + u64::from(sequence) * u64::from(request.input_stride);
        let index = memory.read_u32(record + u64::from(offset))?;
        if index >= set.entry_count() {
            return Err(DgcError::ExecutionSetIndexOutOfRange {
                sequence,
                index,
                entry_count: set.entry_count(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::BufferArena;
    use crate::generator::CpuDispatch;
    use crate::layout::TokenDesc;
    use crate::memory::VecDeviceMemory;
    use crate::metadata::{ShaderStage, StageMetadata};
    use crate::token::IndexTypeMode;

    fn dispatch_desc(stride: u32) -> IndirectCommandLayoutDesc {
        IndirectCommandLayoutDesc {
            stages: StageFlags::COMPUTE,
            input_stride: stride,
            tokens: vec![TokenDesc::Dispatch { offset: 0 }],
            index_type_mode: IndexTypeMode::Vulkan,
        }
    }

    fn ready() -> DgcService {
        let mut service = DgcService::new();
        service
            .init(DeviceRules::default(), DgcConfig::default())
            .unwrap();
        service
    }

    #[test]
    fn uninitialised_service_refuses_work() {
        let mut service = DgcService::new();
        assert_eq!(
            service.create_layout(&dispatch_desc(12)).unwrap_err(),
            DgcError::NotInitialized
        );
        assert_eq!(service.stats().unwrap_err(), DgcError::NotInitialized);
    }

    #[test]
    fn init_is_idempotent_and_teardown_drops_programs() {
        let mut service = ready();
        service.create_layout(&dispatch_desc(12)).unwrap();
        let config = DgcConfig {
            trace_markers: true,
            ..DgcConfig::default()
        };
        service.init(DeviceRules::chaining_only(), config).unwrap();
        assert_eq!(service.rules().unwrap(), &DeviceRules::default());
        assert_eq!(service.program_count(), 1);

        service.teardown();
        assert!(!service.is_initialized());
        assert_eq!(service.program_count(), 0);
    }

    #[test]
    fn layouts_with_one_shape_share_a_program() {
        let mut service = ready();
        let a = service.create_layout(&dispatch_desc(12)).unwrap();
        let b = service.create_layout(&dispatch_desc(32)).unwrap();
        assert_eq!(a.program(), b.program());

        let stats = service.stats().unwrap();
        assert_eq!(stats.layouts_created, 2);
        assert_eq!(stats.program_cache_misses, 1);
        assert_eq!(stats.program_cache_hits, 1);
    }

    #[test]
    fn missing_compute_stage_is_reported() {
        let mut service = ready();
        let layout = service.create_layout(&dispatch_desc(12)).unwrap();
        let bound = BoundState::new().with_pipeline(
            PipelineMetadata::new().with_stage(ShaderStage::Vertex, StageMetadata::default()),
        );
        let mem = VecDeviceMemory::new(0x1000, 0x1000);
        let mut arena = BufferArena::new(0x1000, 0x1000);
        let request = GenerationRequest::new(0x1000, 12, 1, 0x1400, 0x800);
        let err = service
            .generate(&layout, &request, &bound, &mut arena, &mem, &mut CpuDispatch::new())
            .unwrap_err();
        assert_eq!(
            err,
            DgcError::MissingStage {
                stage: ShaderStage::Compute
            }
        );
    }

    #[test]
    fn stride_mismatch_is_rejected() {
        let mut service = ready();
        let layout = service.create_layout(&dispatch_desc(12)).unwrap();
        let bound = BoundState::new().with_pipeline(
            PipelineMetadata::new().with_stage(ShaderStage::Compute, StageMetadata::default()),
        );
        let mem = VecDeviceMemory::new(0x1000, 0x1000);
        let mut arena = BufferArena::new(0x1000, 0x1000);
        let request = GenerationRequest::new(0x1000, 16, 1, 0x1400, 0x800);
        let err = service
            .generate(&layout, &request, &bound, &mut arena, &mem, &mut CpuDispatch::new())
            .unwrap_err();
        assert!(matches!(err, DgcError::InvalidRequest(_)));
    }

    #[test]
    fn memory_requirements_cover_the_preamble() {
        let mut service = ready();
        let layout = service.create_layout(&dispatch_desc(12)).unwrap();
        let pipeline =
            PipelineMetadata::new().with_stage(ShaderStage::Compute, StageMetadata::default());
        let reqs = service
            .memory_requirements(&layout, &CostContext::Pipeline(&pipeline), 8, Engine::Graphics)
            .unwrap();

        let cost = sequence_cost(layout.shape(), &CostContext::Pipeline(&pipeline), false);
        let without = CmdbufLayout::plan(&cost, 8, false, &DeviceRules::default(), Engine::Graphics);
        assert!(reqs.size >= without.total_size);
        assert_eq!(reqs.alignment, 32);
        assert_eq!(reqs.size % reqs.alignment, 0);
    }
}
