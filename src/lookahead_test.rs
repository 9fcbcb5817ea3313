use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::analyse::Analyzer;
use crate::config::LookaheadConfig;
use crate::frame::{DEPENDENT_TYPE_MAP, FrameHandle, FramePool, FrameType, dependent_type};
use crate::lookahead::Lookahead;

/// Assigns types and trailing-B counts from a fixed per-frame plan and
/// stamps recognizable decision metadata, so tests can verify what the
/// pipeline moved and replicated. Records `analyse` invocations.
struct ScriptedAnalyzer {
    plan: HashMap<i64, (FrameType, i32)>,
    analyse_calls: Arc<Mutex<Vec<bool>>>,
}

impl ScriptedAnalyzer {
    fn new(plan: &[(i64, FrameType, i32)]) -> (Self, Arc<Mutex<Vec<bool>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let analyzer = Self {
            plan: plan
                .iter()
                .map(|&(num, ty, bframes)| (num, (ty, bframes)))
                .collect(),
            analyse_calls: calls.clone(),
        };
        (analyzer, calls)
    }
}

impl Analyzer for ScriptedAnalyzer {
    fn decide(&mut self, window: &[FrameHandle]) {
        for handle in window {
            let mut frame = handle.write();
            if let Some(&(ty, bframes)) = self.plan.get(&frame.frame_num) {
                frame.frame_type = ty;
                frame.bframes = bframes;
            }
            frame.cost_est[1][2] = (frame.frame_num * 100 + 7) as i32;
            frame.cost_est_aq[1][2] = (frame.frame_num * 100 + 9) as i32;
            frame.cpb_duration = 1000 + frame.frame_num;
            frame.cpb_delay = 2000 + frame.frame_num;
            frame.dpb_output_delay = 3000 + frame.frame_num;
        }
    }

    fn analyse(&mut self, _window: &[FrameHandle], analyse_only: bool) {
        self.analyse_calls.lock().push(analyse_only);
    }
}

fn make_frame(pool: &FramePool, num: i64) -> FrameHandle {
    let handle = pool.get();
    {
        let mut frame = handle.write();
        frame.frame_num = num;
        frame.pts = num;
        frame.width = 320;
        frame.height = 240;
        frame.data = Bytes::from(vec![(num % 251) as u8; 16]);
    }
    handle
}

/// Pulls until the pipeline reports nothing more, returning frames in
/// consumption order.
fn drain_ready(lookahead: &Lookahead) -> Vec<FrameHandle> {
    let mut collected = Vec::new();
    loop {
        let mut ready = Vec::new();
        lookahead.pull_ready(&mut ready);
        if ready.is_empty() {
            break;
        }
        collected.append(&mut ready);
    }
    collected
}

/// Window target 2, trailing-B counts [2,0,0]: the first decision promotes
/// all three frames to the output in one step.
#[test]
fn test_bframe_run_promotes_as_one_group() -> anyhow::Result<()> {
    let pool = Arc::new(FramePool::new());
    let (analyzer, _) = ScriptedAnalyzer::new(&[
        (0, FrameType::P, 2),
        (1, FrameType::B, 0),
        (2, FrameType::B, 0),
    ]);
    let cfg = LookaheadConfig::default()
        .with_sync_lookahead(4)
        .with_delay(3);
    let lookahead = Lookahead::new(cfg, Box::new(analyzer), pool.clone(), 2)?;

    for num in 0..3 {
        lookahead.put_frame(make_frame(&pool, num));
    }

    let mut ready = Vec::new();
    lookahead.pull_ready(&mut ready);
    assert_eq!(ready.len(), 3, "reference plus both B-frames in one step");
    let nums: Vec<i64> = ready.iter().map(|h| h.read().frame_num).collect();
    assert_eq!(nums, vec![0, 1, 2]);
    assert_eq!(ready[0].read().frame_type, FrameType::P);
    assert_eq!(ready[0].read().bframes, 2);

    lookahead.shutdown();
    assert!(lookahead.is_idle());
    Ok(())
}

/// Dual track, 4 frames alternating base/dependent with no B-frames: the
/// output interleaves base0, dep0, base1, dep1 and every dependent frame
/// carries the mapped type and the base frame's decision metadata.
#[test]
fn test_dual_track_output_pairs_and_replicates_metadata() -> anyhow::Result<()> {
    let pool = Arc::new(FramePool::new());
    let (analyzer, _) = ScriptedAnalyzer::new(&[(0, FrameType::Idr, 0), (2, FrameType::P, 0)]);
    let cfg = LookaheadConfig::default()
        .with_sync_lookahead(4)
        .with_delay(3)
        .with_tracks(2);
    let lookahead = Lookahead::new(cfg, Box::new(analyzer), pool.clone(), 0)?;

    for num in 0..4 {
        lookahead.put_frame(make_frame(&pool, num));
    }

    let collected = drain_ready(&lookahead);
    let nums: Vec<i64> = collected.iter().map(|h| h.read().frame_num).collect();
    assert_eq!(nums, vec![0, 1, 2, 3], "base, dependent, base, dependent");

    // Dependent types come from the mapping table (Idr has no entry -> P).
    assert_eq!(collected[0].read().frame_type, FrameType::Idr);
    assert_eq!(collected[1].read().frame_type, FrameType::P);
    assert_eq!(collected[2].read().frame_type, FrameType::P);
    assert_eq!(collected[3].read().frame_type, FrameType::P);

    // Decision metadata is replicated from the paired base frame, not
    // recomputed: frame 1 carries frame 0's stamps.
    {
        let base = collected[0].read();
        let dep = collected[1].read();
        assert_eq!(dep.cost_est[1][2], base.cost_est[1][2]);
        assert_eq!(dep.cost_est_aq[1][2], base.cost_est_aq[1][2]);
        assert_eq!(dep.cpb_duration, base.cpb_duration);
        assert_eq!(dep.cpb_delay, base.cpb_delay);
        assert_eq!(dep.dpb_output_delay, base.dpb_output_delay);
        assert_eq!(dep.cpb_duration, 1000, "stamped on the base head only");
    }

    // Both sides contributed the same number of frames.
    let base_count = nums.iter().filter(|&&n| n % 2 == 0).count();
    let dep_count = nums.iter().filter(|&&n| n % 2 == 1).count();
    assert_eq!(base_count, dep_count);

    lookahead.shutdown();
    assert!(lookahead.is_idle());
    Ok(())
}

/// Every ingested frame crosses the output exactly once across a shutdown:
/// the worker drains and decides everything before exiting.
#[test]
fn test_shutdown_drains_all_frames_exactly_once() -> anyhow::Result<()> {
    let pool = Arc::new(FramePool::new());
    let plan: Vec<(i64, FrameType, i32)> = (0..5).map(|num| (num, FrameType::P, 0)).collect();
    let (analyzer, _) = ScriptedAnalyzer::new(&plan);
    let cfg = LookaheadConfig::default()
        .with_sync_lookahead(4)
        .with_delay(3);
    let lookahead = Lookahead::new(cfg, Box::new(analyzer), pool.clone(), 2)?;

    for num in 0..5 {
        lookahead.put_frame(make_frame(&pool, num));
    }
    lookahead.shutdown();

    let collected = drain_ready(&lookahead);
    let mut nums: Vec<i64> = collected.iter().map(|h| h.read().frame_num).collect();
    nums.sort_unstable();
    assert_eq!(nums, vec![0, 1, 2, 3, 4], "no loss, no duplication");
    assert!(lookahead.is_idle());
    Ok(())
}

/// With the worker inactive and all queues empty, pulling is a no-op: it
/// neither blocks nor changes state.
#[test]
fn test_pull_on_idle_pipeline_is_a_no_op() -> anyhow::Result<()> {
    let pool = Arc::new(FramePool::new());

    // Inline mode, nothing ingested.
    let (analyzer, _) = ScriptedAnalyzer::new(&[]);
    let inline = Lookahead::new(
        LookaheadConfig::default(),
        Box::new(analyzer),
        pool.clone(),
        2,
    )?;
    let mut ready = Vec::new();
    inline.pull_ready(&mut ready);
    assert!(ready.is_empty());
    assert!(inline.is_idle());

    // Threaded mode after shutdown.
    let (analyzer, _) = ScriptedAnalyzer::new(&[]);
    let cfg = LookaheadConfig::default().with_sync_lookahead(4);
    let threaded = Lookahead::new(cfg, Box::new(analyzer), pool.clone(), 2)?;
    threaded.shutdown();
    threaded.pull_ready(&mut ready);
    assert!(ready.is_empty());
    assert!(threaded.is_idle());
    Ok(())
}

/// The inline path decides on the consumer thread and releases the group
/// directly.
#[test]
fn test_inline_path_decides_without_worker() -> anyhow::Result<()> {
    let pool = Arc::new(FramePool::new());
    let (analyzer, _) = ScriptedAnalyzer::new(&[
        (0, FrameType::P, 1),
        (1, FrameType::B, 0),
        (2, FrameType::P, 0),
    ]);
    let cfg = LookaheadConfig::default();
    let lookahead = Lookahead::new(cfg, Box::new(analyzer), pool.clone(), 2)?;

    for num in 0..3 {
        lookahead.put_frame(make_frame(&pool, num));
    }

    let mut ready = Vec::new();
    lookahead.pull_ready(&mut ready);
    let nums: Vec<i64> = ready.iter().map(|h| h.read().frame_num).collect();
    assert_eq!(nums, vec![0, 1], "head group only");

    // An unconsumed ready set suppresses further decisions.
    lookahead.pull_ready(&mut ready);
    assert_eq!(ready.len(), 2);

    ready.clear();
    lookahead.pull_ready(&mut ready);
    let nums: Vec<i64> = ready.iter().map(|h| h.read().frame_num).collect();
    assert_eq!(nums, vec![2]);

    lookahead.shutdown();
    assert!(lookahead.is_idle());
    Ok(())
}

/// When MB-tree (or VBV lookahead) is active, an intra last-non-B triggers
/// the extra analyse-only propagation pass; a P head does not.
#[test]
fn test_keyframe_propagation_pass() -> anyhow::Result<()> {
    let pool = Arc::new(FramePool::new());

    // Inline path, intra head.
    let (analyzer, calls) = ScriptedAnalyzer::new(&[(0, FrameType::Idr, 0)]);
    let cfg = LookaheadConfig::default().with_mb_tree(true);
    let lookahead = Lookahead::new(cfg, Box::new(analyzer), pool.clone(), 2)?;
    lookahead.put_frame(make_frame(&pool, 0));
    let mut ready = Vec::new();
    lookahead.pull_ready(&mut ready);
    assert_eq!(ready.len(), 1);
    assert_eq!(calls.lock().as_slice(), &[true]);
    lookahead.shutdown();

    // Inline path, non-intra head: no extra pass.
    let (analyzer, calls) = ScriptedAnalyzer::new(&[(0, FrameType::P, 0)]);
    let cfg = LookaheadConfig::default().with_mb_tree(true);
    let lookahead = Lookahead::new(cfg, Box::new(analyzer), pool.clone(), 2)?;
    lookahead.put_frame(make_frame(&pool, 0));
    let mut ready = Vec::new();
    lookahead.pull_ready(&mut ready);
    assert_eq!(ready.len(), 1);
    assert!(calls.lock().is_empty());
    lookahead.shutdown();

    // Worker path, intra head.
    let (analyzer, calls) = ScriptedAnalyzer::new(&[(0, FrameType::Idr, 0)]);
    let cfg = LookaheadConfig::default()
        .with_sync_lookahead(4)
        .with_mb_tree(true);
    let lookahead = Lookahead::new(cfg, Box::new(analyzer), pool.clone(), 2)?;
    lookahead.put_frame(make_frame(&pool, 0));
    lookahead.shutdown();
    let collected = drain_ready(&lookahead);
    assert_eq!(collected.len(), 1);
    assert_eq!(calls.lock().as_slice(), &[true]);
    Ok(())
}

/// Disabling every propagation consumer (or reading cached stats) turns the
/// keyframe pass off entirely.
#[test]
fn test_keyframe_pass_disabled_without_consumers() -> anyhow::Result<()> {
    let pool = Arc::new(FramePool::new());
    let (analyzer, calls) = ScriptedAnalyzer::new(&[(0, FrameType::Idr, 0)]);
    let cfg = LookaheadConfig::default()
        .with_mb_tree(false)
        .with_vbv_buffer_size(0);
    let lookahead = Lookahead::new(cfg, Box::new(analyzer), pool.clone(), 2)?;
    lookahead.put_frame(make_frame(&pool, 0));
    let mut ready = Vec::new();
    lookahead.pull_ready(&mut ready);
    assert_eq!(ready.len(), 1);
    assert!(calls.lock().is_empty());

    // Cached first-pass stats suppress the pass even with MB-tree on.
    let (analyzer, calls) = ScriptedAnalyzer::new(&[(0, FrameType::Idr, 0)]);
    let cfg = LookaheadConfig::default()
        .with_mb_tree(true)
        .with_stat_read(true);
    let lookahead = Lookahead::new(cfg, Box::new(analyzer), pool.clone(), 2)?;
    lookahead.put_frame(make_frame(&pool, 0));
    let mut ready = Vec::new();
    lookahead.pull_ready(&mut ready);
    assert_eq!(ready.len(), 1);
    assert!(calls.lock().is_empty());
    Ok(())
}

/// The keyframe marker starts one full interval in the past and follows
/// whatever the driving loop records.
#[test]
fn test_last_keyframe_marker() -> anyhow::Result<()> {
    let pool = Arc::new(FramePool::new());
    let (analyzer, _) = ScriptedAnalyzer::new(&[]);
    let cfg = LookaheadConfig::default().with_keyint_max(250);
    let lookahead = Lookahead::new(cfg, Box::new(analyzer), pool, 2)?;
    assert_eq!(lookahead.last_keyframe(), -250);
    lookahead.mark_keyframe(24);
    assert_eq!(lookahead.last_keyframe(), 24);
    Ok(())
}

#[test]
fn test_dependent_type_mapping_table() {
    assert_eq!(DEPENDENT_TYPE_MAP.len(), 3);
    assert_eq!(dependent_type(FrameType::P), FrameType::P);
    assert_eq!(dependent_type(FrameType::B), FrameType::B);
    assert_eq!(dependent_type(FrameType::BRef), FrameType::BRef);
    // Everything else falls back to P.
    assert_eq!(dependent_type(FrameType::I), FrameType::P);
    assert_eq!(dependent_type(FrameType::Idr), FrameType::P);
    assert_eq!(dependent_type(FrameType::Keyframe), FrameType::P);
    assert_eq!(dependent_type(FrameType::Auto), FrameType::P);
}

/// The last-non-B reference keeps its frame out of the pool until the
/// pipeline releases it at shutdown.
#[test]
fn test_last_nonb_reference_defers_pool_reuse() -> anyhow::Result<()> {
    let pool = Arc::new(FramePool::new());
    let (analyzer, _) = ScriptedAnalyzer::new(&[(0, FrameType::P, 0)]);
    let lookahead = Lookahead::new(
        LookaheadConfig::default(),
        Box::new(analyzer),
        pool.clone(),
        2,
    )?;

    lookahead.put_frame(make_frame(&pool, 0));
    let mut ready = Vec::new();
    lookahead.pull_ready(&mut ready);
    assert_eq!(ready.len(), 1);

    // The consumer is done, but the last-non-B clone is still live.
    pool.put_unused(ready.pop().expect("frame present"));
    assert_eq!(pool.spare_len(), 0);

    // Shutdown releases the reference; now the frame is recyclable.
    lookahead.shutdown();
    assert_eq!(pool.spare_len(), 1);
    Ok(())
}

#[test]
fn test_rejects_unsupported_track_count() {
    let pool = Arc::new(FramePool::new());
    let (analyzer, _) = ScriptedAnalyzer::new(&[]);
    let cfg = LookaheadConfig::default().with_tracks(3);
    assert!(Lookahead::new(cfg, Box::new(analyzer), pool, 2).is_err());
}

/// A failing worker-storage allocation fails construction before any
/// thread is spawned.
#[test]
fn test_worker_storage_failure_fails_init() {
    struct FailingPrepare;
    impl Analyzer for FailingPrepare {
        fn decide(&mut self, _window: &[FrameHandle]) {}
        fn analyse(&mut self, _window: &[FrameHandle], _analyse_only: bool) {}
        fn prepare_worker(&mut self) -> anyhow::Result<()> {
            anyhow::bail!("no memory for macroblock cache")
        }
    }

    let pool = Arc::new(FramePool::new());
    let cfg = LookaheadConfig::default().with_sync_lookahead(4);
    let result = Lookahead::new(cfg, Box::new(FailingPrepare), pool, 2);
    assert!(result.is_err());
}
