#![allow(dead_code)]

use bytemuck::Pod;
use dgc::plan::Region;
use dgc::{
    BufferArena, CommandProcessor, DeviceMemory, DeviceRules, DgcConfig, DgcService, Engine,
    EntryPoint, ReplayEvent, VecDeviceMemory,
};

pub const BASE: u64 = 0x10_0000;
pub const MEMORY_SIZE: usize = 0x10_0000;

/// Input records.
pub const INPUT: u64 = BASE;
/// Generated commands.
pub const OUTPUT: u64 = BASE + 0x4_0000;
pub const OUTPUT_SIZE: u64 = 0x8_0000;
/// Upload arena for parameter blobs and execution sets.
pub const UPLOAD: u64 = BASE + 0xC_0000;
pub const UPLOAD_SIZE: u64 = 0x2_0000;
/// Continuation streams written by tests.
pub const CONTINUATION: u64 = BASE + 0xE_0000;
/// Counters and predicates.
pub const SIDEBAND: u64 = BASE + 0xF_0000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub struct Harness {
    pub mem: VecDeviceMemory,
    pub arena: BufferArena,
    pub service: DgcService,
    pub rules: DeviceRules,
}

impl Harness {
    pub fn new(rules: DeviceRules) -> Self {
        Self::with_config(rules, DgcConfig::default())
    }

    pub fn with_config(rules: DeviceRules, config: DgcConfig) -> Self {
        init_tracing();
        let mut service = DgcService::new();
        service.init(rules, config).unwrap();
        Self {
            mem: VecDeviceMemory::new(BASE, MEMORY_SIZE),
            arena: BufferArena::new(UPLOAD, UPLOAD_SIZE),
            service,
            rules,
        }
    }

    /// Write `value` at `offset` inside record `index`.
    pub fn write_field<T: Pod>(&self, index: u32, stride: u32, offset: u32, value: &T) {
        let address = INPUT + u64::from(index) * u64::from(stride) + u64::from(offset);
        self.mem.write(address, bytemuck::bytes_of(value)).unwrap();
    }

    pub fn write_words(&self, address: u64, words: &[u32]) {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.mem.write(address, &bytes).unwrap();
    }

    pub fn output(&self, region: Region) -> Vec<u8> {
        self.mem
            .read_vec(OUTPUT + region.offset, region.size as usize)
            .unwrap()
    }

    pub fn replay(&self, engine: Engine, entry: EntryPoint) -> Vec<ReplayEvent> {
        CommandProcessor::for_engine(&self.rules, engine)
            .run(&self.mem, entry.address, entry.size_dw)
            .unwrap()
    }
}

pub fn work(events: &[ReplayEvent]) -> Vec<ReplayEvent> {
    events.iter().filter(|e| e.is_work()).cloned().collect()
}

pub fn jumps(events: &[ReplayEvent]) -> Vec<(u64, bool)> {
    events
        .iter()
        .filter_map(|e| match e {
            ReplayEvent::Jump { address, chain, .. } => Some((*address, *chain)),
            _ => None,
        })
        .collect()
}

/// Values of every `SET_SH_REG` targeting `reg`, in stream order.
pub fn sh_writes(events: &[ReplayEvent], reg: u16) -> Vec<Vec<u32>> {
    events
        .iter()
        .filter_map(|e| match e {
            ReplayEvent::SetShReg { reg: r, values } if *r == reg => Some(values.clone()),
            _ => None,
        })
        .collect()
}

/// Encode a small packet sequence into words, for continuation streams and pipeline blobs.
pub fn encode(dwords: usize, f: impl FnOnce(&mut dgc_packets::PacketEmitter<'_>)) -> Vec<u32> {
    let mut buf = vec![0u8; dwords * 4];
    let mut em = dgc_packets::PacketEmitter::new(&mut buf);
    f(&mut em);
    em.pad_to_end();
    buf.chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
