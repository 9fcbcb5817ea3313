/// Lookahead pipeline configuration. Builder-style setters; all fields have
/// working defaults.
#[derive(Debug, Clone)]
pub struct LookaheadConfig {
    /// Ingest buffer depth in frames. 0 disables the dedicated worker thread
    /// and runs the decision inline on the consumer thread.
    pub sync_lookahead: usize,
    /// Encoder frame-reordering delay (maximum consecutive B-frames).
    pub delay: usize,
    /// Independently evolving sequence tracks: 1, or 2 for base + dependent
    /// (e.g. stereo pairs interleaved on input).
    pub track_count: usize,
    /// Variable-frame-rate input adds one frame of window slack.
    pub vfr_input: bool,
    /// Maximum keyframe interval.
    pub keyint_max: i64,
    /// Macroblock-tree rate control.
    pub mb_tree: bool,
    /// VBV buffer size in kbit; 0 = unconstrained.
    pub vbv_buffer_size: u32,
    /// Rate-control lookahead depth in frames.
    pub rc_lookahead: usize,
    /// Reading first-pass stats skips the keyframe cost analysis.
    pub stat_read: bool,
}

impl Default for LookaheadConfig {
    fn default() -> Self {
        Self {
            sync_lookahead: 0,
            delay: 3,
            track_count: 1,
            vfr_input: false,
            keyint_max: 250,
            mb_tree: true,
            vbv_buffer_size: 0,
            rc_lookahead: 40,
            stat_read: false,
        }
    }
}

impl LookaheadConfig {
    pub fn with_sync_lookahead(mut self, depth: usize) -> Self {
        self.sync_lookahead = depth;
        self
    }

    pub fn with_delay(mut self, delay: usize) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_tracks(mut self, count: usize) -> Self {
        self.track_count = count;
        self
    }

    pub fn with_vfr_input(mut self, vfr: bool) -> Self {
        self.vfr_input = vfr;
        self
    }

    pub fn with_keyint_max(mut self, keyint: i64) -> Self {
        self.keyint_max = keyint;
        self
    }

    pub fn with_mb_tree(mut self, enabled: bool) -> Self {
        self.mb_tree = enabled;
        self
    }

    pub fn with_vbv_buffer_size(mut self, kbit: u32) -> Self {
        self.vbv_buffer_size = kbit;
        self
    }

    pub fn with_rc_lookahead(mut self, depth: usize) -> Self {
        self.rc_lookahead = depth;
        self
    }

    pub fn with_stat_read(mut self, enabled: bool) -> Self {
        self.stat_read = enabled;
        self
    }

    pub fn dual_track(&self) -> bool {
        self.track_count == 2
    }

    pub fn threaded(&self) -> bool {
        self.sync_lookahead > 0
    }

    /// Keyframes need their own propagation pass when a rate-control mode
    /// consumes propagated costs and no cached stats are available.
    pub fn analyse_keyframe(&self) -> bool {
        (self.mb_tree || (self.vbv_buffer_size > 0 && self.rc_lookahead > 0)) && !self.stat_read
    }

    /// Extra window slack for variable-frame-rate input.
    pub fn window_slack(&self) -> usize {
        usize::from(self.vfr_input)
    }
}
