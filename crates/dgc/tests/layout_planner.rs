use dgc::config::{DeviceRules, Engine, EngineRules};
use dgc::cost::SequenceCost;
use dgc::plan::{CmdbufLayout, RegionKind, Stream};
use dgc_packets::JUMP_PACKET_BYTES;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;

const MAX_SEQUENCES: u32 = 4096;

fn engine_rules_strategy() -> impl Strategy<Value = EngineRules> {
    (0u32..=8, 0u32..=5, any::<bool>()).prop_map(|(align_log2, pad_log2, supports_nesting)| {
        EngineRules {
            ib_alignment: 1 << align_log2,
            pad_dw_mask: (1 << pad_log2) - 1,
            supports_nesting,
        }
    })
}

fn rules_strategy() -> impl Strategy<Value = DeviceRules> {
    prop_oneof![
        2 => Just(DeviceRules::nesting_graphics()),
        2 => Just(DeviceRules::chaining_only()),
        3 => (engine_rules_strategy(), engine_rules_strategy())
            .prop_map(|(graphics, compute)| DeviceRules { graphics, compute }),
    ]
}

fn cost_strategy() -> impl Strategy<Value = SequenceCost> {
    let dwords = 1u32..=256;
    let secondary = prop_oneof![Just(0u32), 1u32..=64];
    let upload = prop_oneof![Just(0u32), (1u32..=32).prop_map(|n| n * 16)];
    (dwords, secondary, upload).prop_map(|(primary, secondary, upload_stride)| SequenceCost {
        primary_stride: primary * 4,
        secondary_stride: secondary * 4,
        upload_stride,
    })
}

fn engine_strategy() -> impl Strategy<Value = Engine> {
    prop_oneof![Just(Engine::Graphics), Just(Engine::Compute)]
}

fn check_regions(plan: &CmdbufLayout) -> TestCaseResult {
    let mut cursor = 0u64;
    for (kind, region) in plan.regions() {
        prop_assert_eq!(region.offset, cursor, "{:?} does not start where the previous ends", kind);
        prop_assert_eq!(region.offset % plan.alignment, 0, "{:?} offset unaligned", kind);
        prop_assert_eq!(region.size % plan.alignment, 0, "{:?} size unaligned", kind);
        cursor = region.end();
    }
    prop_assert_eq!(plan.total_size, cursor);

    let regions = plan.regions();
    for (i, (a_kind, a)) in regions.iter().enumerate() {
        for (b_kind, b) in &regions[i + 1..] {
            if !a.is_empty() && !b.is_empty() {
                prop_assert!(!a.overlaps(b), "{:?} overlaps {:?}", a_kind, b_kind);
            }
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_regions_are_disjoint_aligned_and_gap_free(
        cost in cost_strategy(),
        count in 0u32..=MAX_SEQUENCES,
        use_preamble in any::<bool>(),
        rules in rules_strategy(),
        engine in engine_strategy(),
    ) {
        let plan = CmdbufLayout::plan(&cost, count, use_preamble, &rules, engine);
        check_regions(&plan)?;

        let jump = u64::from(JUMP_PACKET_BYTES);
        prop_assert!(plan.main.size >= u64::from(count) * u64::from(cost.primary_stride) + jump);
        prop_assert!(plan.main_trailer.size >= jump);
        prop_assert_eq!(plan.main_preamble.is_empty(), !use_preamble);
        prop_assert!(plan.upload.size >= u64::from(count) * u64::from(cost.upload_stride));

        if cost.has_secondary() {
            prop_assert!(plan.secondary.size >= u64::from(count) * u64::from(cost.secondary_stride) + jump);
            prop_assert!(plan.secondary_trailer.size >= jump);
            prop_assert!(plan.alignment >= rules.compute.region_alignment());
        } else {
            prop_assert!(plan.secondary_trailer.is_empty());
            prop_assert!(plan.secondary_preamble.is_empty());
            prop_assert!(plan.secondary.is_empty());
        }
        prop_assert!(plan.alignment >= rules.engine(engine).region_alignment());
    }

    #[test]
    fn prop_planning_is_deterministic(
        cost in cost_strategy(),
        count in 0u32..=MAX_SEQUENCES,
        use_preamble in any::<bool>(),
        rules in rules_strategy(),
        engine in engine_strategy(),
    ) {
        let a = CmdbufLayout::plan(&cost, count, use_preamble, &rules, engine);
        let b = CmdbufLayout::plan(&cost, count, use_preamble, &rules, engine);
        prop_assert_eq!(a, b);
    }

    #[test]
    fn prop_size_is_monotonic_in_count(
        cost in cost_strategy(),
        count in 0u32..MAX_SEQUENCES,
        extra in 1u32..=64,
        use_preamble in any::<bool>(),
        rules in rules_strategy(),
    ) {
        let small = CmdbufLayout::plan(&cost, count, use_preamble, &rules, Engine::Graphics);
        let large = CmdbufLayout::plan(&cost, count + extra, use_preamble, &rules, Engine::Graphics);
        prop_assert!(small.total_size <= large.total_size);
        prop_assert!(small.main.size <= large.main.size);
        prop_assert_eq!(small.main_trailer, large.main_trailer);
        prop_assert_eq!(small.main_preamble, large.main_preamble);

        // Secondary regions keep their sizes but sit after the main body, so they move with it.
        prop_assert_eq!(small.secondary_trailer.size, large.secondary_trailer.size);
        prop_assert_eq!(small.secondary_preamble.size, large.secondary_preamble.size);
        prop_assert!(small.secondary.size <= large.secondary.size);
        prop_assert_eq!(
            large.secondary_trailer.offset - small.secondary_trailer.offset,
            large.main.size - small.main.size
        );
    }

    #[test]
    fn prop_executed_size_never_exceeds_the_body(
        cost in cost_strategy(),
        count in 0u32..=MAX_SEQUENCES,
        effective in 0u32..=MAX_SEQUENCES,
        rules in rules_strategy(),
    ) {
        let plan = CmdbufLayout::plan(&cost, count, true, &rules, Engine::Graphics);
        let executed = plan.executed_size(Stream::Primary, effective);
        prop_assert!(executed <= plan.main.size);
        prop_assert!(executed >= u64::from(JUMP_PACKET_BYTES));
        prop_assert_eq!(executed % plan.alignment, 0);
        prop_assert!(plan.tail_start(Stream::Primary, effective) + u64::from(JUMP_PACKET_BYTES) <= executed);
    }
}

#[test]
fn zero_sequences_still_has_room_for_the_jumps() {
    let cost = SequenceCost {
        primary_stride: 40,
        secondary_stride: 44,
        upload_stride: 16,
    };
    let rules = DeviceRules::default();
    let plan = CmdbufLayout::plan(&cost, 0, false, &rules, Engine::Graphics);

    assert_eq!(plan.main_trailer.size, 32);
    assert_eq!(plan.main.size, 32);
    assert_eq!(plan.secondary_trailer.size, 32);
    assert_eq!(plan.secondary.size, 32);
    assert_eq!(plan.upload.size, 0);
    assert_eq!(plan.total_size, 128);
    assert_eq!(plan.tail_start(Stream::Primary, 0), 0);
}

#[test]
fn secondary_regions_only_depend_on_the_secondary_stride() {
    let rules = DeviceRules::default();
    let small = SequenceCost {
        primary_stride: 16,
        secondary_stride: 44,
        upload_stride: 0,
    };
    let large = SequenceCost {
        primary_stride: 400,
        ..small
    };
    let a = CmdbufLayout::plan(&small, 10, false, &rules, Engine::Graphics);
    let b = CmdbufLayout::plan(&large, 10, false, &rules, Engine::Graphics);

    assert_eq!(a.secondary.size, b.secondary.size);
    assert_eq!(a.secondary_trailer.size, b.secondary_trailer.size);
    assert!(a.main.size < b.main.size);
    let kinds: Vec<_> = a.regions().iter().map(|(k, _)| *k).collect();
    assert_eq!(
        kinds,
        vec![
            RegionKind::MainTrailer,
            RegionKind::MainPreamble,
            RegionKind::Main,
            RegionKind::SecondaryTrailer,
            RegionKind::SecondaryPreamble,
            RegionKind::Secondary,
            RegionKind::Upload,
        ]
    );
}
