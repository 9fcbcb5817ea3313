use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::analyse::Analyzer;
use crate::config::LookaheadConfig;
use crate::frame::{FrameHandle, FramePool, dependent_type};
use crate::queue::{FrameQueue, QueueGuard, shift};

/// Per-track bookkeeping: the most recent non-B frame handed to the output,
/// kept alive as a long-lived reference until replaced.
struct TrackState {
    last_nonb: Option<FrameHandle>,
}

impl TrackState {
    fn new() -> Self {
        Self { last_nonb: None }
    }

    /// Ownership transfer: the previous handle goes back to the pool, a
    /// clone of the new head is retained.
    fn replace(&mut self, pool: &FramePool, new_nonb: &FrameHandle) {
        if let Some(prev) = self.last_nonb.take() {
            pool.put_unused(prev);
        }
        self.last_nonb = Some(new_nonb.clone());
    }

    fn release(&mut self, pool: &FramePool) {
        if let Some(prev) = self.last_nonb.take() {
            pool.put_unused(prev);
        }
    }
}

/// Scheduler states of the worker loop. Cancellation is only observed at
/// the transitions between them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkerState {
    /// Move what fits from the ingest buffer into the window(s).
    Drain,
    /// Window not full enough; sleep until more input arrives.
    Wait,
    /// Run the slice-type decision over the current window.
    Decide,
    /// Exit requested: drain everything, decide until the windows are empty.
    Flush,
    Done,
}

struct Shared {
    cfg: LookaheadConfig,
    /// Window target length; the decision only runs once a window grows
    /// past this plus the VFR slack.
    slicetype_length: usize,
    analyse_keyframe: bool,
    /// Display order of the last forced keyframe. Starts one full keyframe
    /// interval in the past so the first frame is always eligible.
    last_keyframe: AtomicI64,
    // Queue lock order is fixed: ofbuf -> next -> next_dep -> ifbuf.
    // Multi-queue operations only ever take locks forward of those held.
    ifbuf: FrameQueue,
    next: FrameQueue,
    next_dep: FrameQueue,
    ofbuf: FrameQueue,
    exit: AtomicBool,
    active: AtomicBool,
    tracks: Mutex<[TrackState; 2]>,
    analyzer: Mutex<Box<dyn Analyzer>>,
    pool: Arc<FramePool>,
    /// Ingest parity for the inline dual-track split.
    ingest_count: AtomicU64,
}

impl Shared {
    fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    fn window_below_target(&self) -> bool {
        let target = self.slicetype_length + self.cfg.window_slack();
        if self.next.len() <= target {
            return true;
        }
        self.cfg.dual_track() && self.next_dep.len() <= target
    }

    /// One pass of ingest-buffer draining, bounded by the window free space.
    /// Dual-track input is interleaved base/dependent, so both windows
    /// advance in lock-step one frame at a time.
    fn drain_pass(&self) {
        let mut next = self.next.lock();
        let mut next_dep = self.next_dep.lock();
        let mut ifbuf = self.ifbuf.lock();
        if !self.cfg.dual_track() {
            let count = next.free().min(ifbuf.len());
            shift(&mut next, &mut ifbuf, count);
        } else {
            let pairs = next.free().min(next_dep.free()).min(ifbuf.len() / 2);
            for _ in 0..pairs {
                shift(&mut next, &mut ifbuf, 1);
                shift(&mut next_dep, &mut ifbuf, 1);
            }
        }
    }

    fn drain(&self) -> WorkerState {
        self.drain_pass();
        if self.exit_requested() {
            WorkerState::Flush
        } else if self.window_below_target() {
            WorkerState::Wait
        } else {
            WorkerState::Decide
        }
    }

    fn wait_for_input(&self) -> WorkerState {
        {
            let mut ifbuf = self.ifbuf.lock();
            ifbuf.wait_fill_while(|| !self.exit_requested());
        }
        if self.exit_requested() {
            WorkerState::Flush
        } else {
            WorkerState::Drain
        }
    }

    /// Final drain: everything still buffered goes through the decision so
    /// no frame is dropped. Repeats the drain/decide cycle so a backlog
    /// larger than a window also clears without breaching queue capacity.
    fn flush(&self) -> WorkerState {
        loop {
            self.drain_pass();
            while !self.next.is_empty() {
                self.decide_step();
            }
            let leftover = if self.cfg.dual_track() {
                self.ifbuf.len() / 2
            } else {
                self.ifbuf.len()
            };
            if leftover == 0 {
                return WorkerState::Done;
            }
        }
    }

    /// The decision step: run the opaque analysis, update per-track
    /// last-non-B bookkeeping, then promote the decided head group to the
    /// output queue.
    fn decide_step(&self) {
        let window = self.next.lock().snapshot();
        let Some(head) = window.first() else {
            return;
        };
        self.analyzer.lock().decide(&window);

        {
            let mut tracks = self.tracks.lock();
            tracks[0].replace(&self.pool, head);
            if self.cfg.dual_track() {
                let dep_head = self.next_dep.lock().front().cloned();
                if let Some(dep_head) = dep_head {
                    tracks[1].replace(&self.pool, &dep_head);
                }
            }
        }

        // One reference frame plus its trailing B-run leaves together.
        let group = (head.read().bframes + 1).max(1) as usize;

        let mut ofbuf = self.ofbuf.lock();
        if !self.cfg.dual_track() {
            ofbuf.wait_room(group);
            let mut next = self.next.lock();
            let count = group.min(next.len());
            shift(&mut ofbuf, &mut next, count);
        } else {
            // Each base frame is followed by its paired dependent frame, so
            // the output needs room for both sides of the group.
            ofbuf.wait_room(group * 2);
            let mut next = self.next.lock();
            let mut next_dep = self.next_dep.lock();
            for _ in 0..group {
                let (Some(base), Some(dep)) = (next.front().cloned(), next_dep.front().cloned())
                else {
                    break;
                };
                {
                    let base = base.read();
                    let mut dep = dep.write();
                    dep.copy_lookahead_metadata(&base);
                    dep.frame_type = dependent_type(base.frame_type);
                }
                shift(&mut ofbuf, &mut next, 1);
                shift(&mut ofbuf, &mut next_dep, 1);
            }
        }

        // MB-tree and VBV lookahead need propagated costs on keyframes too;
        // the ordinary decision pass may have skipped their full analysis.
        if self.analyse_keyframe && self.last_nonb_is_intra() {
            let window = self.next.lock().snapshot();
            self.analyzer.lock().analyse(&window, true);
        }
    }

    fn last_nonb_is_intra(&self) -> bool {
        let tracks = self.tracks.lock();
        tracks[0]
            .last_nonb
            .as_ref()
            .map(|handle| handle.read().frame_type.is_intra())
            .unwrap_or(false)
    }

    /// Moves the decided head group from the output queue into the
    /// consumer's ready set and signals the freed room.
    fn ready_shift(&self, ofbuf: &mut QueueGuard<'_>, ready: &mut Vec<FrameHandle>) {
        let Some(head) = ofbuf.front() else {
            return;
        };
        let group = (head.read().bframes + 1).max(1) as usize * self.cfg.track_count;
        let count = group.min(ofbuf.len());
        for _ in 0..count {
            if let Some(frame) = ofbuf.pop_front() {
                ready.push(frame);
            }
        }
        ofbuf.notify_room();
    }
}

fn worker_loop(shared: &Shared) {
    log::debug!(
        "lookahead worker started: tracks={} target={}",
        shared.cfg.track_count,
        shared.slicetype_length
    );
    let mut state = WorkerState::Drain;
    loop {
        log::trace!("lookahead worker state: {:?}", state);
        state = match state {
            WorkerState::Drain => shared.drain(),
            WorkerState::Wait => shared.wait_for_input(),
            WorkerState::Decide => {
                shared.decide_step();
                if shared.exit_requested() {
                    WorkerState::Flush
                } else {
                    WorkerState::Drain
                }
            }
            WorkerState::Flush => shared.flush(),
            WorkerState::Done => {
                let ofbuf = shared.ofbuf.lock();
                shared.active.store(false, Ordering::Release);
                ofbuf.notify_fill();
                break;
            }
        };
    }
    log::debug!("lookahead worker finished");
}

/// The lookahead pipeline: ingest buffer, per-track working windows, output
/// buffer, and (optionally) the dedicated decision worker.
pub struct Lookahead {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Lookahead {
    /// Builds the queues and, when `sync_lookahead > 0`, spawns the worker.
    /// `window_target` is the window length below which the worker keeps
    /// waiting for input instead of deciding (the encoder's reordering
    /// delay plus slack). Any failure unwinds everything built so far.
    pub fn new(
        cfg: LookaheadConfig,
        mut analyzer: Box<dyn Analyzer>,
        pool: Arc<FramePool>,
        window_target: usize,
    ) -> anyhow::Result<Self> {
        if cfg.track_count == 0 || cfg.track_count > 2 {
            anyhow::bail!("unsupported track count: {}", cfg.track_count);
        }

        if cfg.threaded() {
            // The worker's private working storage is its own clearly-owned
            // allocation, requested up front so failures surface here.
            analyzer
                .prepare_worker()
                .map_err(|e| anyhow::anyhow!("lookahead worker storage: {:#}", e))?;
        }

        let window_capacity = cfg.delay + 3;
        let shared = Arc::new(Shared {
            slicetype_length: window_target,
            analyse_keyframe: cfg.analyse_keyframe(),
            last_keyframe: AtomicI64::new(-cfg.keyint_max),
            ifbuf: FrameQueue::new(cfg.sync_lookahead + 3),
            next: FrameQueue::new(window_capacity),
            next_dep: FrameQueue::new(window_capacity),
            ofbuf: FrameQueue::new(window_capacity * cfg.track_count),
            exit: AtomicBool::new(false),
            active: AtomicBool::new(false),
            tracks: Mutex::new([TrackState::new(), TrackState::new()]),
            analyzer: Mutex::new(analyzer),
            pool,
            ingest_count: AtomicU64::new(0),
            cfg,
        });

        let mut worker = None;
        if shared.cfg.threaded() {
            shared.active.store(true, Ordering::Release);
            let worker_shared = Arc::clone(&shared);
            match std::thread::Builder::new()
                .name("lookahead".to_string())
                .spawn(move || worker_loop(&worker_shared))
            {
                Ok(handle) => worker = Some(handle),
                Err(e) => {
                    shared.active.store(false, Ordering::Release);
                    return Err(anyhow::anyhow!("spawn lookahead worker: {}", e));
                }
            }
        }

        log::info!(
            "lookahead started: tracks={} sync_lookahead={} window_target={}",
            shared.cfg.track_count,
            shared.cfg.sync_lookahead,
            window_target
        );
        Ok(Self {
            shared,
            worker: Mutex::new(worker),
        })
    }

    /// Hands a frame to the pipeline. With a worker the track split happens
    /// later during draining; inline dual-track splits here by ingest
    /// parity.
    pub fn put_frame(&self, frame: FrameHandle) {
        let shared = &self.shared;
        if shared.cfg.threaded() {
            shared.ifbuf.push(frame);
            return;
        }
        if !shared.cfg.dual_track() {
            shared.next.push(frame);
        } else {
            let n = shared.ingest_count.fetch_add(1, Ordering::Relaxed);
            if n & 1 == 1 {
                shared.next_dep.push(frame);
            } else {
                shared.next.push(frame);
            }
        }
    }

    /// Transfers currently-available decided frames into `ready`. Threaded
    /// mode may block until the worker produces a group (or goes inactive);
    /// inline mode runs the decision on this thread. Dual-track releases
    /// only complete base/dependent pairs.
    pub fn pull_ready(&self, ready: &mut Vec<FrameHandle>) {
        if self.shared.cfg.threaded() {
            self.pull_threaded(ready);
        } else {
            self.pull_inline(ready);
        }
    }

    fn pull_threaded(&self, ready: &mut Vec<FrameHandle>) {
        let shared = &self.shared;
        let mut ofbuf = shared.ofbuf.lock();
        if !shared.cfg.dual_track() {
            ofbuf.wait_fill_while(|| shared.active.load(Ordering::Acquire));
            shared.ready_shift(&mut ofbuf, ready);
            return;
        }

        // Paired release: only commit to waiting once two frames exist
        // system-wide, otherwise report nothing and let the producer push
        // the partner frame first.
        let in_flight = {
            let next = shared.next.lock();
            let next_dep = shared.next_dep.lock();
            let ifbuf = shared.ifbuf.lock();
            next.len() + next_dep.len() + ifbuf.len() + ofbuf.len()
        };
        if in_flight < 2 {
            return;
        }
        ofbuf.wait_len_while(2, || shared.active.load(Ordering::Acquire));
        shared.ready_shift(&mut ofbuf, ready);
    }

    /// No worker: run the decision on the spot. Nothing blocks here, there
    /// is only one thread.
    fn pull_inline(&self, ready: &mut Vec<FrameHandle>) {
        let shared = &self.shared;
        if !ready.is_empty() || shared.next.is_empty() {
            return;
        }

        let window = shared.next.lock().snapshot();
        let Some(head) = window.first() else {
            return;
        };
        shared.analyzer.lock().decide(&window);
        shared.tracks.lock()[0].replace(&shared.pool, head);

        let group = (head.read().bframes + 1).max(1) as usize;
        {
            let mut ofbuf = shared.ofbuf.lock();
            let mut next = shared.next.lock();
            let count = group.min(next.len());
            shift(&mut ofbuf, &mut next, count);
        }

        if shared.analyse_keyframe && shared.last_nonb_is_intra() {
            let window = shared.next.lock().snapshot();
            shared.analyzer.lock().analyse(&window, true);
        }

        let mut ofbuf = shared.ofbuf.lock();
        shared.ready_shift(&mut ofbuf, ready);
    }

    /// True iff the windows and the output queue are all empty. The three
    /// locks are taken in the fixed global order (output, base window,
    /// dependent window); preserving that order is a correctness
    /// requirement, not an optimization.
    pub fn is_idle(&self) -> bool {
        let shared = &self.shared;
        let ofbuf = shared.ofbuf.lock();
        let next = shared.next.lock();
        let next_dep = shared.next_dep.lock();
        ofbuf.is_empty() && next.is_empty() && next_dep.is_empty()
    }

    /// Display order of the last forced keyframe, maintained by the encoder
    /// driving loop.
    pub fn last_keyframe(&self) -> i64 {
        self.shared.last_keyframe.load(Ordering::Acquire)
    }

    pub fn mark_keyframe(&self, frame_num: i64) {
        self.shared.last_keyframe.store(frame_num, Ordering::Release);
    }

    /// Cooperative teardown: the worker drains and processes everything
    /// still buffered before exiting, so no frame is dropped. Idempotent;
    /// also invoked by `Drop`.
    pub fn shutdown(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            {
                let ifbuf = self.shared.ifbuf.lock();
                self.shared.exit.store(true, Ordering::Release);
                ifbuf.notify_fill();
            }
            if handle.join().is_err() {
                log::error!("lookahead worker panicked during shutdown");
            }
        }
        let mut tracks = self.shared.tracks.lock();
        for track in tracks.iter_mut() {
            track.release(&self.shared.pool);
        }
    }
}

impl Drop for Lookahead {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[path = "lookahead_test.rs"]
mod lookahead_test;
