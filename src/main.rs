use std::sync::Arc;

use bytes::Bytes;
use lookahead_bus::analyse::GopPattern;
use lookahead_bus::config::LookaheadConfig;
use lookahead_bus::frame::{FrameHandle, FramePool};
use lookahead_bus::lookahead::Lookahead;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .init();
}

fn synthetic_frame(pool: &FramePool, num: i64) -> FrameHandle {
    let handle = pool.get();
    {
        let mut frame = handle.write();
        frame.frame_num = num;
        frame.pts = num;
        frame.width = 320;
        frame.height = 240;
        frame.data = Bytes::from(vec![(num % 251) as u8; 64]);
    }
    handle
}

fn main() -> anyhow::Result<()> {
    init_logging();

    const TOTAL: usize = 40;
    let pool = Arc::new(FramePool::new());
    let cfg = LookaheadConfig::default()
        .with_sync_lookahead(8)
        .with_delay(3);
    let analyzer = Box::new(GopPattern::new(25, 2));
    let lookahead = Lookahead::new(cfg, analyzer, pool.clone(), 4)?;

    std::thread::scope(|scope| {
        let consumer_pool = pool.clone();
        let consumer = scope.spawn({
            let lookahead = &lookahead;
            move || {
                let mut collected = 0usize;
                let mut ready = Vec::new();
                while collected < TOTAL {
                    lookahead.pull_ready(&mut ready);
                    for handle in ready.drain(..) {
                        {
                            let frame = handle.read();
                            println!(
                                "decided frame {}: type {:?}, trailing B {}",
                                frame.frame_num, frame.frame_type, frame.bframes
                            );
                        }
                        collected += 1;
                        consumer_pool.put_unused(handle);
                    }
                }
            }
        });

        for num in 0..TOTAL as i64 {
            lookahead.put_frame(synthetic_frame(&pool, num));
        }
        // Flushes the tail of the window through the decision.
        lookahead.shutdown();

        consumer.join().expect("consumer thread");
    });

    log::info!("demo done, {} spare frames pooled", pool.spare_len());
    Ok(())
}
