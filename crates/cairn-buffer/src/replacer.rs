//! Page replacement policy for the buffer pool.

use parking_lot::Mutex;

use crate::frame::FrameId;
use cairn_common::{CairnError, Result};

/// What the replacement sweep observed when probing a frame.
///
/// For `Referenced`, the probe is expected to have cleared the frame's
/// reference bit as a side effect (the clock's second chance).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameProbe {
    /// The frame holds no page and can be taken without eviction.
    Empty,
    /// The reference bit was set; it has been cleared, sweep on.
    Referenced,
    /// The frame is pinned and cannot be evicted.
    Pinned,
    /// The frame holds an unpinned, unreferenced page.
    Evictable,
}

/// Victim selection policy over the frame directory.
pub trait Replacer: Send + Sync {
    /// Selects a victim frame, driving `probe` once per visited frame.
    ///
    /// Fails with `BufferExceeded` when every frame is pinned.
    fn pick_victim(&self, probe: &mut dyn FnMut(FrameId) -> FrameProbe) -> Result<FrameId>;
}

/// Clock replacement.
///
/// A hand sweeps the frame directory one step at a time. Empty frames
/// are taken immediately; referenced frames lose their bit and get a
/// second chance; pinned frames are skipped. A run of N consecutive
/// pinned observations means one full revolution saw only pinned
/// frames, so the pool is exhausted. The sweep is bounded by 2N steps:
/// the first revolution may do nothing but clear reference bits, the
/// second must find a frame unless all are pinned.
pub struct ClockReplacer {
    num_frames: usize,
    hand: Mutex<usize>,
}

impl ClockReplacer {
    /// Creates a clock replacer for `num_frames` frames.
    ///
    /// The hand starts on the last frame so the first advance lands on
    /// frame 0.
    pub fn new(num_frames: usize) -> Self {
        assert!(num_frames > 0, "buffer pool needs at least one frame");
        Self {
            num_frames,
            hand: Mutex::new(num_frames - 1),
        }
    }

    /// Returns the number of frames the hand sweeps over.
    pub fn capacity(&self) -> usize {
        self.num_frames
    }
}

impl Replacer for ClockReplacer {
    fn pick_victim(&self, probe: &mut dyn FnMut(FrameId) -> FrameProbe) -> Result<FrameId> {
        let n = self.num_frames;
        let mut hand = self.hand.lock();
        let mut pinned_run = 0usize;

        for _ in 0..(2 * n) {
            *hand = (*hand + 1) % n;
            let frame_id = FrameId(*hand as u32);

            match probe(frame_id) {
                FrameProbe::Empty | FrameProbe::Evictable => return Ok(frame_id),
                FrameProbe::Referenced => pinned_run = 0,
                FrameProbe::Pinned => {
                    pinned_run += 1;
                    // N consecutive pinned observations cover every frame.
                    if pinned_run == n {
                        return Err(CairnError::BufferExceeded);
                    }
                }
            }
        }

        Err(CairnError::BufferExceeded)
    }
}
