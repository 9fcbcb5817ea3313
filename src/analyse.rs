use crate::frame::{FrameHandle, FrameType};

/// Slice-type decision seam. Implementations mutate frame type, trailing-B
/// counts and cost tables in place through the window handles; the pipeline
/// never interprets the pixel payload itself.
pub trait Analyzer: Send {
    /// Decides types and costs for the current window. On return the head
    /// frame must carry a decided (non-Auto) type and its trailing-B count.
    fn decide(&mut self, window: &[FrameHandle]);

    /// Extra cost-propagation pass over the window. With `analyse_only` set,
    /// existing type decisions are kept and only costs are refreshed (used
    /// for keyframes whose ordinary decision pass skipped full-cost
    /// analysis).
    fn analyse(&mut self, window: &[FrameHandle], analyse_only: bool);

    /// Allocates per-thread working storage before the dedicated worker
    /// starts. Called once from `Lookahead::new` in threaded mode; a failure
    /// fails construction.
    fn prepare_worker(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Deterministic fixed-GOP analyzer: a keyframe every `gop_size` frames and
/// runs of `max_bframes` B-frames after each reference frame. A stand-in for
/// a real cost-based decision, used by the demo binary and tests; encoders
/// supply their own `Analyzer`.
pub struct GopPattern {
    gop_size: u64,
    max_bframes: u32,
}

impl GopPattern {
    pub fn new(gop_size: u64, max_bframes: u32) -> Self {
        Self {
            gop_size: gop_size.max(1),
            max_bframes,
        }
    }

    fn type_for(&self, frame_num: i64) -> FrameType {
        let pos = frame_num.rem_euclid(self.gop_size as i64) as u64;
        if pos == 0 {
            FrameType::Idr
        } else if self.max_bframes == 0 || pos % (self.max_bframes as u64 + 1) == 0 {
            FrameType::P
        } else {
            FrameType::B
        }
    }

    /// Cheap payload statistic standing in for a SATD-style cost.
    fn payload_cost(handle: &FrameHandle) -> i32 {
        let frame = handle.read();
        frame.data.iter().map(|&b| b as i32).sum()
    }
}

impl Analyzer for GopPattern {
    fn decide(&mut self, window: &[FrameHandle]) {
        let Some(head) = window.first() else {
            return;
        };

        for handle in window {
            let cost = Self::payload_cost(handle);
            let mut frame = handle.write();
            if frame.frame_type == FrameType::Auto {
                frame.frame_type = self.type_for(frame.frame_num);
            }
            frame.cost_est[0][0] = cost;
            frame.cost_est_aq[0][0] = cost;
        }

        // Trailing-B run: consecutive B frames directly behind the head,
        // clamped to what the window currently holds.
        let mut run = 0i32;
        for handle in &window[1..] {
            if handle.read().frame_type.is_b() {
                run += 1;
            } else {
                break;
            }
        }
        head.write().bframes = run;
    }

    fn analyse(&mut self, window: &[FrameHandle], _analyse_only: bool) {
        for handle in window {
            let cost = Self::payload_cost(handle);
            let mut frame = handle.write();
            frame.cost_est[0][0] = cost;
            frame.cost_est_aq[0][0] = cost;
        }
    }
}
