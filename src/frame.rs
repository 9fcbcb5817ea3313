use std::fmt::{Display, Formatter};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Longest supported run of consecutive B-frames; the cost tables carry two
/// extra rows/columns for the surrounding reference frames.
pub const BFRAME_MAX: usize = 16;

/// Cost-estimate table indexed by [temporal offset][reference index].
/// -1 marks an unmeasured entry.
pub type CostTable = [[i32; BFRAME_MAX + 2]; BFRAME_MAX + 2];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrameType {
    /// Not yet decided by the analyzer.
    #[default]
    Auto,
    Idr,
    I,
    P,
    BRef,
    B,
    Keyframe,
}

impl FrameType {
    /// Intra types that start a new prediction chain.
    pub fn is_intra(self) -> bool {
        matches!(self, FrameType::Idr | FrameType::I)
    }

    pub fn is_b(self) -> bool {
        matches!(self, FrameType::B | FrameType::BRef)
    }
}

/// Base-to-dependent frame type assignment for dual-track output.
/// Types without an entry fall back to P.
pub const DEPENDENT_TYPE_MAP: [(FrameType, FrameType); 3] = [
    (FrameType::P, FrameType::P),
    (FrameType::B, FrameType::B),
    (FrameType::BRef, FrameType::BRef),
];

pub fn dependent_type(base: FrameType) -> FrameType {
    DEPENDENT_TYPE_MAP
        .iter()
        .find(|(from, _)| *from == base)
        .map(|(_, to)| *to)
        .unwrap_or(FrameType::P)
}

/// A video frame plus the bookkeeping the lookahead reads and writes. The
/// pixel payload is opaque to this crate; only the analyzer interprets it.
pub struct Frame {
    /// Display/ingest order tag.
    pub frame_num: i64,
    pub pts: i64,
    pub frame_type: FrameType,
    /// Trailing B-frames between this reference frame and the next one.
    pub bframes: i32,
    pub cost_est: CostTable,
    pub cost_est_aq: CostTable,
    pub cpb_duration: i64,
    pub cpb_delay: i64,
    pub dpb_output_delay: i64,
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            frame_num: 0,
            pts: 0,
            frame_type: FrameType::Auto,
            bframes: 0,
            cost_est: [[-1; BFRAME_MAX + 2]; BFRAME_MAX + 2],
            cost_est_aq: [[-1; BFRAME_MAX + 2]; BFRAME_MAX + 2],
            cpb_duration: 0,
            cpb_delay: 0,
            dpb_output_delay: 0,
            data: Bytes::new(),
            width: 0,
            height: 0,
        }
    }
}

impl Frame {
    /// Copies the decision metadata a dependent frame inherits from its base
    /// frame: both cost tables over the full index range plus the CPB/DPB
    /// timing values. Type assignment is separate (see `dependent_type`).
    pub fn copy_lookahead_metadata(&mut self, base: &Frame) {
        self.cost_est = base.cost_est;
        self.cost_est_aq = base.cost_est_aq;
        self.cpb_duration = base.cpb_duration;
        self.cpb_delay = base.cpb_delay;
        self.dpb_output_delay = base.dpb_output_delay;
    }

    fn reset(&mut self) {
        *self = Frame::default();
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "Frame num: {}, type: {:?}, bframes: {}, pts: {}, data_len: {}, size: {}x{}",
            self.frame_num,
            self.frame_type,
            self.bframes,
            self.pts,
            self.data.len(),
            self.width,
            self.height
        )
    }
}

/// Shared handle to a frame. Queues move the handle, never the buffer;
/// cloning it is the reference-count increment of the ownership contract.
#[derive(Clone)]
pub struct FrameHandle(Arc<RwLock<Frame>>);

impl FrameHandle {
    pub fn new(frame: Frame) -> Self {
        Self(Arc::new(RwLock::new(frame)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Frame> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Frame> {
        self.0.write()
    }

    /// Outstanding references to this frame, the handle itself included.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

/// Free list of spare frames. Frames cycle between the pool and the queues
/// for the lifetime of the encoder instead of being reallocated per picture.
pub struct FramePool {
    spare: Mutex<Vec<FrameHandle>>,
}

impl FramePool {
    pub fn new() -> Self {
        Self {
            spare: Mutex::new(Vec::new()),
        }
    }

    /// Hands out a spare frame with reset bookkeeping, or a fresh one when
    /// the free list is empty.
    pub fn get(&self) -> FrameHandle {
        if let Some(handle) = self.spare.lock().pop() {
            handle.write().reset();
            return handle;
        }
        FrameHandle::new(Frame::default())
    }

    /// Releases one reference. Only the last outstanding reference returns
    /// the frame to the free list; earlier releases just drop their clone.
    pub fn put_unused(&self, handle: FrameHandle) {
        if handle.ref_count() == 1 {
            self.spare.lock().push(handle);
        }
    }

    pub fn spare_len(&self) -> usize {
        self.spare.lock().len()
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new()
    }
}
