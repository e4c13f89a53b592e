mod common;

use common::*;
use dgc::layout::TokenDesc;
use dgc::token::{DispatchArgs, DrawArgs};
use dgc::{
    BoundState, CommandProcessor, Continuation, CpuDispatch, DeviceMemory, DeviceRules, DgcError,
    Engine, GeneratedCommands, GenerationRequest, IndexTypeMode, IndirectCommandLayoutDesc,
    PipelineMetadata, ReplayError, ReplayEvent, ShaderStage, StageFlags, StageMetadata, Stream,
};
use pretty_assertions::assert_eq;

const SUBMISSION: u64 = CONTINUATION + 0x8000;

fn marker_dispatch(x: u32) -> ReplayEvent {
    ReplayEvent::Dispatch {
        x,
        y: 1,
        z: 1,
        initiator: 0,
    }
}

fn draw_layout_desc() -> IndirectCommandLayoutDesc {
    IndirectCommandLayoutDesc {
        stages: StageFlags::VERTEX | StageFlags::FRAGMENT,
        input_stride: 16,
        tokens: vec![TokenDesc::Draw { offset: 0 }],
        index_type_mode: IndexTypeMode::Vulkan,
    }
}

fn draw_state() -> BoundState {
    BoundState::new().with_pipeline(
        PipelineMetadata::new()
            .with_stage(
                ShaderStage::Vertex,
                StageMetadata {
                    vertex_offset_reg: Some(0x20),
                    ..StageMetadata::default()
                },
            )
            .with_stage(ShaderStage::Fragment, StageMetadata::default()),
    )
}

/// Generate `max` draws of `vertex_count = i + 1`.
fn generate_draws(h: &mut Harness, request: &GenerationRequest<'_>) -> GeneratedCommands {
    let layout = h.service.create_layout(&draw_layout_desc()).unwrap();
    for i in 0..request.max_sequence_count {
        h.write_field(
            i,
            16,
            0,
            &DrawArgs {
                vertex_count: i + 1,
                instance_count: 1,
                first_vertex: 0,
                first_instance: 0,
            },
        );
    }
    h.service
        .generate(&layout, request, &draw_state(), &mut h.arena, &h.mem, &mut CpuDispatch::new())
        .unwrap()
}

fn vertex_counts(events: &[ReplayEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            ReplayEvent::Draw { vertex_count, .. } => Some(*vertex_count),
            _ => None,
        })
        .collect()
}

#[test]
fn nesting_engine_returns_to_the_caller() {
    let mut h = Harness::new(DeviceRules::nesting_graphics());
    let request = GenerationRequest::new(INPUT, 16, 3, OUTPUT, OUTPUT_SIZE);
    let generated = generate_draws(&mut h, &request);
    let entry = generated.primary;

    // A submission calls the generated buffer and keeps going afterwards.
    h.write_words(
        SUBMISSION,
        &encode(16, |em| {
            em.indirect_buffer(entry.address, entry.size_dw, false);
            em.dispatch_direct(9, 1, 1, 0);
        }),
    );
    let events = CommandProcessor::for_engine(&h.rules, Engine::Graphics)
        .run(&h.mem, SUBMISSION, 16)
        .unwrap();

    assert_eq!(jumps(&events), vec![(entry.address, false)]);
    assert_eq!(vertex_counts(&events), vec![1, 2, 3]);
    assert_eq!(events.last(), Some(&marker_dispatch(9)));
}

#[test]
fn chaining_engine_reaches_trailer_and_continuation() {
    let mut h = Harness::new(DeviceRules::chaining_only());
    h.write_words(CONTINUATION, &encode(8, |em| em.dispatch_direct(5, 1, 1, 0)));
    let request = GenerationRequest::new(INPUT, 16, 4, OUTPUT, OUTPUT_SIZE).with_continuation(Continuation {
        address: CONTINUATION,
        size_dw: 8,
    });
    let generated = generate_draws(&mut h, &request);

    let events = h.replay(Engine::Graphics, generated.primary);
    assert_eq!(vertex_counts(&events), vec![1, 2, 3, 4]);
    assert_eq!(
        jumps(&events),
        vec![(generated.primary_trailer, true), (CONTINUATION, true)]
    );
    assert_eq!(events.last(), Some(&marker_dispatch(5)));
}

#[test]
fn preamble_skips_unused_slots_on_a_chaining_engine() {
    let mut h = Harness::new(DeviceRules::chaining_only());
    h.write_words(CONTINUATION, &encode(8, |em| em.dispatch_direct(5, 1, 1, 0)));
    h.mem.write_u32(SIDEBAND, 5).unwrap();
    let request = GenerationRequest::new(INPUT, 16, 64, OUTPUT, OUTPUT_SIZE)
        .with_count_address(SIDEBAND)
        .with_continuation(Continuation {
            address: CONTINUATION,
            size_dw: 8,
        });
    let generated = generate_draws(&mut h, &request);
    let plan = generated.plan;
    assert!(plan.use_preamble);
    assert_eq!(plan.primary_stride, 36);

    let events = h.replay(Engine::Graphics, generated.primary);
    let body = OUTPUT + plan.main.offset;
    // align(5 * 36 + 16, 32) bytes of the body run.
    assert_eq!(
        events[0],
        ReplayEvent::Jump {
            from: OUTPUT + plan.main_preamble.offset + 16,
            address: body,
            size_dw: 224 / 4,
            chain: true,
        }
    );
    assert_eq!(vertex_counts(&events), vec![1, 2, 3, 4, 5]);
    assert_eq!(
        jumps(&events),
        vec![
            (body, true),
            (generated.primary_trailer, true),
            (CONTINUATION, true)
        ]
    );
    let to_trailer = events
        .iter()
        .find_map(|e| match e {
            ReplayEvent::Jump { from, address, .. } if *address == generated.primary_trailer => Some(*from),
            _ => None,
        })
        .unwrap();
    assert_eq!(to_trailer, body + 224 - 16);
}

#[test]
fn empty_request_still_links_to_the_trailer() {
    let mut h = Harness::new(DeviceRules::chaining_only());
    h.write_words(CONTINUATION, &encode(8, |em| em.dispatch_direct(5, 1, 1, 0)));
    let request = GenerationRequest::new(INPUT, 16, 0, OUTPUT, OUTPUT_SIZE).with_continuation(Continuation {
        address: CONTINUATION,
        size_dw: 8,
    });
    let generated = generate_draws(&mut h, &request);
    assert_eq!(generated.plan.main.size, 32);

    let events = h.replay(Engine::Graphics, generated.primary);
    assert_eq!(work(&events), vec![marker_dispatch(5)]);
    assert_eq!(
        jumps(&events),
        vec![(generated.primary_trailer, true), (CONTINUATION, true)]
    );
}

#[test]
fn trailer_can_be_chained_after_generation() {
    let mut h = Harness::new(DeviceRules::chaining_only());
    let request = GenerationRequest::new(INPUT, 16, 2, OUTPUT, OUTPUT_SIZE);
    let generated = generate_draws(&mut h, &request);

    let events = h.replay(Engine::Graphics, generated.primary);
    assert_eq!(jumps(&events), vec![(generated.primary_trailer, true)]);
    assert_eq!(vertex_counts(&events), vec![1, 2]);

    h.write_words(CONTINUATION, &encode(8, |em| em.dispatch_direct(6, 1, 1, 0)));
    h.service
        .chain_trailer(
            &h.mem,
            &generated,
            Stream::Primary,
            Continuation {
                address: CONTINUATION,
                size_dw: 8,
            },
        )
        .unwrap();

    let events = h.replay(Engine::Graphics, generated.primary);
    assert_eq!(
        jumps(&events),
        vec![(generated.primary_trailer, true), (CONTINUATION, true)]
    );
    assert_eq!(events.last(), Some(&marker_dispatch(6)));
}

#[test]
fn chain_trailer_is_refused_where_the_trailer_never_runs() {
    let mut h = Harness::new(DeviceRules::nesting_graphics());
    let request = GenerationRequest::new(INPUT, 16, 2, OUTPUT, OUTPUT_SIZE);
    let generated = generate_draws(&mut h, &request);
    let continuation = Continuation {
        address: CONTINUATION,
        size_dw: 8,
    };

    let err = h
        .service
        .chain_trailer(&h.mem, &generated, Stream::Primary, continuation)
        .unwrap_err();
    assert!(matches!(err, DgcError::InvalidRequest(_)));

    // No task shader, so there is no secondary trailer to patch either.
    let err = h
        .service
        .chain_trailer(&h.mem, &generated, Stream::Secondary, continuation)
        .unwrap_err();
    assert!(matches!(err, DgcError::InvalidRequest(_)));
}

#[test]
fn secondary_trailer_chains_on_the_compute_engine() {
    let mut h = Harness::new(DeviceRules::nesting_graphics());
    let layout = h
        .service
        .create_layout(&IndirectCommandLayoutDesc {
            stages: StageFlags::TASK | StageFlags::MESH,
            input_stride: 12,
            tokens: vec![TokenDesc::DrawMeshTasks { offset: 0 }],
            index_type_mode: IndexTypeMode::Vulkan,
        })
        .unwrap();
    let bound = BoundState::new().with_pipeline(
        PipelineMetadata::new()
            .with_stage(ShaderStage::Task, StageMetadata::default())
            .with_stage(ShaderStage::Mesh, StageMetadata::default()),
    );
    h.write_field(0, 12, 0, &DispatchArgs { x: 2, y: 2, z: 2 });

    let request = GenerationRequest::new(INPUT, 12, 1, OUTPUT, OUTPUT_SIZE);
    let generated = h
        .service
        .generate(&layout, &request, &bound, &mut h.arena, &h.mem, &mut CpuDispatch::new())
        .unwrap();
    let trailer = generated.secondary_trailer.unwrap();

    h.write_words(CONTINUATION, &encode(8, |em| em.dispatch_direct(4, 1, 1, 0)));
    h.service
        .chain_trailer(
            &h.mem,
            &generated,
            Stream::Secondary,
            Continuation {
                address: CONTINUATION,
                size_dw: 8,
            },
        )
        .unwrap();

    let events = h.replay(Engine::Compute, generated.secondary.unwrap());
    assert_eq!(
        work(&events),
        vec![
            ReplayEvent::TaskMeshAce {
                x: 2,
                y: 2,
                z: 2,
                ring_entry_reg: 0,
            },
            marker_dispatch(4),
        ]
    );
    assert_eq!(jumps(&events), vec![(trailer, true), (CONTINUATION, true)]);
}

#[test]
fn replay_rejects_calls_on_a_chaining_engine() {
    let h = Harness::new(DeviceRules::chaining_only());
    h.write_words(CONTINUATION, &encode(8, |em| em.dispatch_direct(1, 1, 1, 0)));
    h.write_words(
        SUBMISSION,
        &encode(8, |em| em.indirect_buffer(CONTINUATION, 8, false)),
    );

    let err = CommandProcessor::for_engine(&h.rules, Engine::Compute)
        .run(&h.mem, SUBMISSION, 8)
        .unwrap_err();
    assert_eq!(err, ReplayError::NestedCallOnChainingEngine { address: SUBMISSION });
}
