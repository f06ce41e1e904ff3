//! Frame-skip and result-cache policy shared by live capture and video files.

use crate::types::RecognitionResult;

/// Decides which frames get recognized and how long results are reused.
#[derive(Debug)]
pub struct FrameScheduler {
    frame_skip: u64,
    cache_frames: u64,
    counter: u64,
    cache: Vec<RecognitionResult>,
    age: u64,
}

impl FrameScheduler {
    pub fn new(frame_skip: u64, cache_frames: u64) -> Self {
        Self {
            frame_skip: frame_skip.max(1),
            cache_frames,
            counter: 0,
            cache: Vec::new(),
            age: 0,
        }
    }

    /// Count a new frame; true when it should be recognized.
    pub fn tick(&mut self) -> bool {
        self.counter += 1;
        self.counter % self.frame_skip == 0
    }

    pub fn refresh(&mut self, results: Vec<RecognitionResult>) {
        self.cache = results;
        self.age = 0;
    }

    /// Age the cache by one frame, dropping it once past its lifetime.
    pub fn reuse(&mut self) {
        self.age += 1;
        if self.age > self.cache_frames {
            self.cache.clear();
        }
    }

    pub fn cached(&self) -> &[RecognitionResult] {
        &self.cache
    }

    pub fn frame_number(&self) -> u64 {
        self.counter
    }

    #[cfg(test)]
    pub fn age(&self) -> u64 {
        self.age
    }
}
