//! Indirect command layouts.
//!
//! A layout describes what every record of the application's input buffer contains and is fixed
//! at creation time. Validation happens once here so the generator can trust every offset.

use crate::error::LayoutError;
use crate::generator::ProgramId;
use crate::metadata::StageFlags;
use crate::token::{
    args_size, DispatchArgs, DrawArgs, DrawCountArgs, DrawIndexedArgs, ExecutionSetArgs,
    IndexBufferArgs, IndexTypeMode, TokenSet, TraceRaysArgs, VertexBufferArgs,
};

/// Largest push-constant block, in bytes.
pub const MAX_PUSH_CONSTANT_SIZE: u32 = 256;
pub const MAX_PUSH_WORDS: usize = (MAX_PUSH_CONSTANT_SIZE / 4) as usize;
pub const MAX_VERTEX_BINDINGS: u32 = 32;

/// One token of a layout descriptor. `offset` is the byte offset inside each input record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenDesc {
    Draw { offset: u32 },
    DrawIndexed { offset: u32 },
    DrawCount { offset: u32, indexed: bool },
    Dispatch { offset: u32 },
    DrawMeshTasks { offset: u32 },
    TraceRays { offset: u32 },
    VertexBuffer { offset: u32, binding: u32 },
    IndexBuffer { offset: u32 },
    /// Copies `size` bytes from the record into the push-constant block at `range_offset`.
    PushConstant { offset: u32, range_offset: u32, size: u32 },
    /// Writes the sequence index into the push-constant word at `range_offset`.
    SequenceIndex { range_offset: u32 },
    ExecutionSet { offset: u32 },
}

impl TokenDesc {
    pub fn kind(&self) -> TokenSet {
        match self {
            TokenDesc::Draw { .. } => TokenSet::DRAW,
            TokenDesc::DrawIndexed { .. } => TokenSet::DRAW_INDEXED,
            TokenDesc::DrawCount { .. } => TokenSet::DRAW_COUNT,
            TokenDesc::Dispatch { .. } => TokenSet::DISPATCH,
            TokenDesc::DrawMeshTasks { .. } => TokenSet::DRAW_MESH_TASKS,
            TokenDesc::TraceRays { .. } => TokenSet::TRACE_RAYS,
            TokenDesc::VertexBuffer { .. } => TokenSet::VERTEX_BUFFER,
            TokenDesc::IndexBuffer { .. } => TokenSet::INDEX_BUFFER,
            TokenDesc::PushConstant { .. } => TokenSet::PUSH_CONSTANT,
            TokenDesc::SequenceIndex { .. } => TokenSet::SEQUENCE_INDEX,
            TokenDesc::ExecutionSet { .. } => TokenSet::EXECUTION_SET,
        }
    }

    /// Bytes this token reads from each input record, if any.
    fn input_range(&self) -> Option<(u32, u32)> {
        match *self {
            TokenDesc::Draw { offset } => Some((offset, args_size::<DrawArgs>())),
            TokenDesc::DrawIndexed { offset } => Some((offset, args_size::<DrawIndexedArgs>())),
            TokenDesc::DrawCount { offset, .. } => Some((offset, args_size::<DrawCountArgs>())),
            TokenDesc::Dispatch { offset } | TokenDesc::DrawMeshTasks { offset } => {
                Some((offset, args_size::<DispatchArgs>()))
            }
            TokenDesc::TraceRays { offset } => Some((offset, args_size::<TraceRaysArgs>())),
            TokenDesc::VertexBuffer { offset, .. } => Some((offset, args_size::<VertexBufferArgs>())),
            TokenDesc::IndexBuffer { offset } => Some((offset, args_size::<IndexBufferArgs>())),
            TokenDesc::PushConstant { offset, size, .. } => Some((offset, size)),
            TokenDesc::SequenceIndex { .. } => None,
            TokenDesc::ExecutionSet { offset } => Some((offset, args_size::<ExecutionSetArgs>())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndirectCommandLayoutDesc {
    /// Shader stages the generated commands target.
    pub stages: StageFlags,
    pub input_stride: u32,
    pub tokens: Vec<TokenDesc>,
    pub index_type_mode: IndexTypeMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DrawShape {
    Draw,
    DrawIndexed,
    DrawCount { indexed: bool },
}

impl DrawShape {
    pub fn indexed(self) -> bool {
        matches!(self, DrawShape::DrawIndexed | DrawShape::DrawCount { indexed: true })
    }
}

/// What kind of work one sequence performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LayoutKind {
    Dispatch,
    Graphics { shape: DrawShape },
    /// Mesh shading; `task` splits every sequence across the graphics and compute engines.
    MeshOnly { task: bool },
    RayTrace,
}

impl LayoutKind {
    pub fn is_compute(self) -> bool {
        matches!(self, LayoutKind::Dispatch | LayoutKind::RayTrace)
    }
}

/// Everything that selects a generator program. Layouts that agree on the shape share one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LayoutShape {
    pub tokens: TokenSet,
    pub kind: LayoutKind,
    pub stages: StageFlags,
}

impl LayoutShape {
    pub fn has_secondary(&self) -> bool {
        matches!(self.kind, LayoutKind::MeshOnly { task: true })
    }

    /// Stages whose registers are written by the primary stream.
    pub fn primary_stages(&self) -> StageFlags {
        if self.has_secondary() {
            self.stages - StageFlags::TASK
        } else {
            self.stages
        }
    }

    /// Stages whose registers are written by the secondary (compute) stream.
    pub fn secondary_stages(&self) -> StageFlags {
        if self.has_secondary() {
            self.stages & StageFlags::TASK
        } else {
            StageFlags::empty()
        }
    }

    pub fn updates_push_constants(&self) -> bool {
        self.tokens.updates_push_constants()
    }

    pub fn uses_execution_set(&self) -> bool {
        self.tokens.contains(TokenSet::EXECUTION_SET)
    }
}

/// Where one push-constant word comes from when a sequence is generated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PushWordSource {
    /// Bound push-constant bytes of the command buffer.
    #[default]
    Base,
    /// Byte offset inside the input record.
    Input(u32),
    SequenceIndex,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushWordTable {
    words: [PushWordSource; MAX_PUSH_WORDS],
}

impl Default for PushWordTable {
    fn default() -> Self {
        Self {
            words: [PushWordSource::Base; MAX_PUSH_WORDS],
        }
    }
}

impl PushWordTable {
    pub fn source(&self, word: usize) -> PushWordSource {
        self.words[word]
    }

    pub fn input_mask(&self) -> u64 {
        self.mask(|s| matches!(s, PushWordSource::Input(_)))
    }

    pub fn sequence_index_mask(&self) -> u64 {
        self.mask(|s| s == PushWordSource::SequenceIndex)
    }

    /// Input byte offset per word, zero for words not sourced from the input record.
    pub fn input_offsets(&self) -> [u32; MAX_PUSH_WORDS] {
        let mut out = [0u32; MAX_PUSH_WORDS];
        for (dst, src) in out.iter_mut().zip(self.words.iter()) {
            if let PushWordSource::Input(offset) = *src {
                *dst = offset;
            }
        }
        out
    }

    fn mask(&self, pred: impl Fn(PushWordSource) -> bool) -> u64 {
        self.words
            .iter()
            .enumerate()
            .filter(|(_, s)| pred(**s))
            .fold(0u64, |acc, (i, _)| acc | (1u64 << i))
    }

    fn assign(&mut self, word: u32, source: PushWordSource) -> Result<(), LayoutError> {
        let slot = &mut self.words[word as usize];
        if *slot != PushWordSource::Base {
            return Err(LayoutError::PushConstantOverlap { word });
        }
        *slot = source;
        Ok(())
    }
}

fn check_push_range(range_offset: u32, size: u32) -> Result<(), LayoutError> {
    let end = range_offset.saturating_add(size);
    if size == 0 || range_offset % 4 != 0 || size % 4 != 0 || end > MAX_PUSH_CONSTANT_SIZE {
        return Err(LayoutError::PushConstantRange {
            offset: range_offset,
            end,
            max: MAX_PUSH_CONSTANT_SIZE,
        });
    }
    Ok(())
}

/// Validated, immutable indirect command layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndirectCommandLayout {
    shape: LayoutShape,
    input_stride: u32,
    index_type_mode: IndexTypeMode,
    action_offset: u32,
    index_buffer_offset: Option<u32>,
    execution_set_offset: Option<u32>,
    push_words: PushWordTable,
    vertex_inputs: [Option<u32>; MAX_VERTEX_BINDINGS as usize],
    pub(crate) program: Option<ProgramId>,
}

impl IndirectCommandLayout {
    pub fn new(desc: &IndirectCommandLayoutDesc) -> Result<Self, LayoutError> {
        let stride = desc.input_stride;
        if stride == 0 || stride % 4 != 0 {
            return Err(LayoutError::InvalidStride { stride });
        }

        let mut tokens = TokenSet::empty();
        let mut actions = Vec::new();
        for token in &desc.tokens {
            let kind = token.kind();
            // Vertex buffers and push constants may repeat; their targets are checked below.
            let repeatable = kind.intersects(TokenSet::VERTEX_BUFFER | TokenSet::PUSH_CONSTANT);
            if tokens.contains(kind) && !repeatable {
                return Err(LayoutError::DuplicateToken { token: kind });
            }
            tokens |= kind;
            if TokenSet::ACTIONS.contains(kind) {
                actions.push(*token);
            }

            if let Some((offset, size)) = token.input_range() {
                if offset % 4 != 0 {
                    return Err(LayoutError::UnalignedTokenOffset { token: kind, offset });
                }
                if offset.checked_add(size).map_or(true, |end| end > stride) {
                    return Err(LayoutError::TokenOutOfBounds {
                        token: kind,
                        offset,
                        size,
                        stride,
                    });
                }
            }
        }

        let [action] = actions[..] else {
            return Err(LayoutError::ActionTokenCount {
                found: actions.len(),
            });
        };

        let (kind, action_offset) = match action {
            TokenDesc::Draw { offset } => (LayoutKind::Graphics { shape: DrawShape::Draw }, offset),
            TokenDesc::DrawIndexed { offset } => (
                LayoutKind::Graphics {
                    shape: DrawShape::DrawIndexed,
                },
                offset,
            ),
            TokenDesc::DrawCount { offset, indexed } => (
                LayoutKind::Graphics {
                    shape: DrawShape::DrawCount { indexed },
                },
                offset,
            ),
            TokenDesc::Dispatch { offset } => (LayoutKind::Dispatch, offset),
            TokenDesc::DrawMeshTasks { offset } => (
                LayoutKind::MeshOnly {
                    task: desc.stages.contains(StageFlags::TASK),
                },
                offset,
            ),
            TokenDesc::TraceRays { offset } => (LayoutKind::RayTrace, offset),
            _ => unreachable!("non-action token classified as action"),
        };

        let stages_ok = match kind {
            LayoutKind::Dispatch | LayoutKind::RayTrace => desc.stages == StageFlags::COMPUTE,
            LayoutKind::Graphics { .. } => {
                desc.stages.contains(StageFlags::VERTEX)
                    && !desc
                        .stages
                        .intersects(StageFlags::COMPUTE | StageFlags::TASK | StageFlags::MESH)
            }
            LayoutKind::MeshOnly { .. } => {
                desc.stages.contains(StageFlags::MESH)
                    && !desc.stages.intersects(StageFlags::COMPUTE | StageFlags::VERTEX)
            }
        };
        if !stages_ok {
            return Err(LayoutError::StageMismatch {
                stages: desc.stages.bits(),
            });
        }

        if tokens.contains(TokenSet::VERTEX_BUFFER) && !matches!(kind, LayoutKind::Graphics { .. }) {
            return Err(LayoutError::TokenNotAllowed {
                token: TokenSet::VERTEX_BUFFER,
            });
        }
        let indexed = matches!(kind, LayoutKind::Graphics { shape } if shape.indexed());
        if tokens.contains(TokenSet::INDEX_BUFFER) && !indexed {
            return Err(LayoutError::TokenNotAllowed {
                token: TokenSet::INDEX_BUFFER,
            });
        }

        let mut push_words = PushWordTable::default();
        let mut vertex_inputs = [None; MAX_VERTEX_BINDINGS as usize];
        let mut index_buffer_offset = None;
        let mut execution_set_offset = None;
        for token in &desc.tokens {
            match *token {
                TokenDesc::PushConstant {
                    offset,
                    range_offset,
                    size,
                } => {
                    check_push_range(range_offset, size)?;
                    for i in 0..size / 4 {
                        push_words.assign(range_offset / 4 + i, PushWordSource::Input(offset + i * 4))?;
                    }
                }
                TokenDesc::SequenceIndex { range_offset } => {
                    check_push_range(range_offset, 4)?;
                    push_words.assign(range_offset / 4, PushWordSource::SequenceIndex)?;
                }
                TokenDesc::VertexBuffer { offset, binding } => {
                    if binding >= MAX_VERTEX_BINDINGS {
                        return Err(LayoutError::VertexBindingOutOfRange {
                            slot: binding,
                            max: MAX_VERTEX_BINDINGS,
                        });
                    }
                    let slot = &mut vertex_inputs[binding as usize];
                    if slot.is_some() {
                        return Err(LayoutError::DuplicateVertexBinding { slot: binding });
                    }
                    *slot = Some(offset);
                }
                TokenDesc::IndexBuffer { offset } => index_buffer_offset = Some(offset),
                TokenDesc::ExecutionSet { offset } => execution_set_offset = Some(offset),
                _ => {}
            }
        }

        Ok(Self {
            shape: LayoutShape {
                tokens,
                kind,
                stages: desc.stages,
            },
            input_stride: stride,
            index_type_mode: desc.index_type_mode,
            action_offset,
            index_buffer_offset,
            execution_set_offset,
            push_words,
            vertex_inputs,
            program: None,
        })
    }

    pub fn shape(&self) -> &LayoutShape {
        &self.shape
    }

    pub fn tokens(&self) -> TokenSet {
        self.shape.tokens
    }

    pub fn kind(&self) -> LayoutKind {
        self.shape.kind
    }

    pub fn stages(&self) -> StageFlags {
        self.shape.stages
    }

    pub fn input_stride(&self) -> u32 {
        self.input_stride
    }

    pub fn index_type_mode(&self) -> IndexTypeMode {
        self.index_type_mode
    }

    pub fn action_offset(&self) -> u32 {
        self.action_offset
    }

    pub fn index_buffer_offset(&self) -> Option<u32> {
        self.index_buffer_offset
    }

    pub fn execution_set_offset(&self) -> Option<u32> {
        self.execution_set_offset
    }

    pub fn push_words(&self) -> &PushWordTable {
        &self.push_words
    }

    /// Input offset of the vertex buffer record patching `slot`, if the layout rebinds it.
    pub fn vertex_input_offset(&self, slot: u32) -> Option<u32> {
        self.vertex_inputs.get(slot as usize).copied().flatten()
    }

    /// Generator program compiled for this layout, once attached by the service.
    pub fn program(&self) -> Option<ProgramId> {
        self.program
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn desc(stages: StageFlags, stride: u32, tokens: Vec<TokenDesc>) -> IndirectCommandLayoutDesc {
        IndirectCommandLayoutDesc {
            stages,
            input_stride: stride,
            tokens,
            index_type_mode: IndexTypeMode::Vulkan,
        }
    }

    #[test]
    fn indexed_draw_layout_records_offsets() {
        let layout = IndirectCommandLayout::new(&desc(
            StageFlags::VERTEX | StageFlags::FRAGMENT,
            64,
            vec![
                TokenDesc::PushConstant {
                    offset: 0,
                    range_offset: 8,
                    size: 8,
                },
                TokenDesc::SequenceIndex { range_offset: 0 },
                TokenDesc::VertexBuffer {
                    offset: 8,
                    binding: 3,
                },
                TokenDesc::IndexBuffer { offset: 24 },
                TokenDesc::DrawIndexed { offset: 40 },
            ],
        ))
        .unwrap();

        assert_eq!(
            layout.kind(),
            LayoutKind::Graphics {
                shape: DrawShape::DrawIndexed
            }
        );
        assert_eq!(layout.action_offset(), 40);
        assert_eq!(layout.index_buffer_offset(), Some(24));
        assert_eq!(layout.vertex_input_offset(3), Some(8));
        assert_eq!(layout.vertex_input_offset(0), None);
        assert_eq!(layout.push_words().source(2), PushWordSource::Input(0));
        assert_eq!(layout.push_words().source(3), PushWordSource::Input(4));
        assert_eq!(layout.push_words().input_mask(), 0b1100);
        assert_eq!(layout.push_words().sequence_index_mask(), 0b1);
        assert!(!layout.shape().has_secondary());
    }

    #[test]
    fn exactly_one_action_is_required() {
        let none = desc(StageFlags::COMPUTE, 16, vec![TokenDesc::SequenceIndex { range_offset: 0 }]);
        assert_eq!(
            IndirectCommandLayout::new(&none),
            Err(LayoutError::ActionTokenCount { found: 0 })
        );

        let two = desc(
            StageFlags::VERTEX,
            32,
            vec![TokenDesc::Draw { offset: 0 }, TokenDesc::DrawIndexed { offset: 0 }],
        );
        assert_eq!(
            IndirectCommandLayout::new(&two),
            Err(LayoutError::ActionTokenCount { found: 2 })
        );
    }

    #[test]
    fn graphics_tokens_rejected_in_compute_layouts() {
        let d = desc(
            StageFlags::COMPUTE,
            32,
            vec![
                TokenDesc::VertexBuffer {
                    offset: 0,
                    binding: 0,
                },
                TokenDesc::Dispatch { offset: 16 },
            ],
        );
        assert_eq!(
            IndirectCommandLayout::new(&d),
            Err(LayoutError::TokenNotAllowed {
                token: TokenSet::VERTEX_BUFFER
            })
        );

        let d = desc(
            StageFlags::VERTEX,
            32,
            vec![TokenDesc::IndexBuffer { offset: 0 }, TokenDesc::Draw { offset: 16 }],
        );
        assert_eq!(
            IndirectCommandLayout::new(&d),
            Err(LayoutError::TokenNotAllowed {
                token: TokenSet::INDEX_BUFFER
            })
        );
    }

    #[test]
    fn bounds_and_alignment_are_checked() {
        assert_eq!(
            IndirectCommandLayout::new(&desc(StageFlags::COMPUTE, 6, vec![TokenDesc::Dispatch { offset: 0 }])),
            Err(LayoutError::InvalidStride { stride: 6 })
        );
        assert_eq!(
            IndirectCommandLayout::new(&desc(StageFlags::COMPUTE, 16, vec![TokenDesc::Dispatch { offset: 8 }])),
            Err(LayoutError::TokenOutOfBounds {
                token: TokenSet::DISPATCH,
                offset: 8,
                size: 12,
                stride: 16
            })
        );
        let too_big = desc(
            StageFlags::COMPUTE,
            512,
            vec![
                TokenDesc::PushConstant {
                    offset: 16,
                    range_offset: 200,
                    size: 64,
                },
                TokenDesc::Dispatch { offset: 0 },
            ],
        );
        assert!(matches!(
            IndirectCommandLayout::new(&too_big),
            Err(LayoutError::PushConstantRange { .. })
        ));
        let slot = desc(
            StageFlags::VERTEX,
            32,
            vec![
                TokenDesc::VertexBuffer {
                    offset: 0,
                    binding: 32,
                },
                TokenDesc::Draw { offset: 16 },
            ],
        );
        assert_eq!(
            IndirectCommandLayout::new(&slot),
            Err(LayoutError::VertexBindingOutOfRange { slot: 32, max: 32 })
        );
    }

    #[test]
    fn overlapping_push_words_are_rejected() {
        let d = desc(
            StageFlags::COMPUTE,
            32,
            vec![
                TokenDesc::PushConstant {
                    offset: 12,
                    range_offset: 0,
                    size: 8,
                },
                TokenDesc::SequenceIndex { range_offset: 4 },
                TokenDesc::Dispatch { offset: 0 },
            ],
        );
        assert_eq!(
            IndirectCommandLayout::new(&d),
            Err(LayoutError::PushConstantOverlap { word: 1 })
        );
    }

    #[test]
    fn mesh_layout_with_task_has_secondary_stream() {
        let layout = IndirectCommandLayout::new(&desc(
            StageFlags::TASK | StageFlags::MESH | StageFlags::FRAGMENT,
            12,
            vec![TokenDesc::DrawMeshTasks { offset: 0 }],
        ))
        .unwrap();
        assert_eq!(layout.kind(), LayoutKind::MeshOnly { task: true });
        assert!(layout.shape().has_secondary());
        assert_eq!(layout.shape().secondary_stages(), StageFlags::TASK);
        assert_eq!(
            layout.shape().primary_stages(),
            StageFlags::MESH | StageFlags::FRAGMENT
        );

        let err = IndirectCommandLayout::new(&desc(
            StageFlags::VERTEX | StageFlags::MESH,
            12,
            vec![TokenDesc::DrawMeshTasks { offset: 0 }],
        ));
        assert!(matches!(err, Err(LayoutError::StageMismatch { .. })));
    }
}
