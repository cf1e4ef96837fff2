//! Per-frame render statistics.

/// Counters for one recorded frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameStats {
    /// Frame number
    pub frame: u64,
    /// Frame slot the frame was recorded in
    pub slot: usize,
    /// CPU time spent recording and submitting (ms)
    pub cpu_ms: f32,
    /// Passes recorded
    pub passes: u32,
    /// Total draw calls
    pub draw_calls: u32,
    /// Instances across all draws
    pub instances: u64,
    /// Image barriers issued
    pub barriers: u32,
    /// Descriptor slots rewritten
    pub descriptor_writes: u32,
}

impl FrameStats {
    pub fn new(frame: u64, slot: usize) -> Self {
        Self {
            frame,
            slot,
            ..Default::default()
        }
    }

    pub fn record_draw(&mut self, instances: u32) {
        self.draw_calls += 1;
        self.instances += u64::from(instances);
    }

    /// Format as compact string
    pub fn format_compact(&self) -> String {
        format!(
            "frame {} | {:.2}ms | {} passes | {} draws | {} barriers",
            self.frame, self.cpu_ms, self.passes, self.draw_calls, self.barriers
        )
    }
}

/// Running totals across frames.
#[derive(Debug, Clone, Default)]
pub struct StatsCollector {
    last: FrameStats,
    frames: u64,
    skipped: u64,
    total_draw_calls: u64,
    avg_cpu_ms: f32,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&mut self, stats: FrameStats) {
        self.frames += 1;
        self.total_draw_calls += u64::from(stats.draw_calls);
        // Exponential moving average
        self.avg_cpu_ms = if self.frames == 1 {
            stats.cpu_ms
        } else {
            self.avg_cpu_ms * 0.9 + stats.cpu_ms * 0.1
        };
        self.last = stats;
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    pub fn last(&self) -> &FrameStats {
        &self.last
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn total_draw_calls(&self) -> u64 {
        self.total_draw_calls
    }

    pub fn average_cpu_ms(&self) -> f32 {
        self.avg_cpu_ms
    }
}
