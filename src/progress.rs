//! Progress reporting
//!
//! The bootloader client reports through [ProgressCallbacks]; user facing
//! code implements [ProgressSink]. [ClampedProgress] sits between the two and
//! holds the displayed percentage below 100 until the write has actually
//! succeeded.

/// Highest percentage shown while a transfer is still running
pub const PROGRESS_CEILING: u8 = 99;

/// Progress update callbacks invoked by a [Loader](crate::interface::Loader)
pub trait ProgressCallbacks {
    /// Initialize some progress report
    fn init(&mut self, addr: u32, total: usize);
    /// Update some progress report
    fn update(&mut self, current: usize);
    /// Finish some progress report
    fn finish(&mut self);
}

/// A snapshot of a running transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub file_index: usize,
    pub bytes_written: usize,
    pub bytes_total: usize,
}

impl ProgressEvent {
    /// Raw percentage of bytes written, without the ceiling applied
    pub fn percent(&self) -> u8 {
        if self.bytes_total == 0 {
            return 0;
        }

        let percent = self.bytes_written.min(self.bytes_total) * 100 / self.bytes_total;
        percent as u8
    }
}

/// Receiver of progress updates for a single flash attempt
pub trait ProgressSink {
    /// Called whenever the displayed percentage may have changed
    fn on_progress(&mut self, event: &ProgressEvent, percent: u8);

    /// Called once, after the transfer was acknowledged by the device
    fn on_finish(&mut self) {}
}

/// Sink which discards every update
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&mut self, _event: &ProgressEvent, _percent: u8) {}
}

/// Adapts loader callbacks into monotonic, clamped [ProgressSink] updates
pub struct ClampedProgress<'a> {
    sink: &'a mut dyn ProgressSink,
    file_index: usize,
    started: bool,
    last: ProgressEvent,
    percent: u8,
    completed: bool,
}

impl<'a> ClampedProgress<'a> {
    pub fn new(sink: &'a mut dyn ProgressSink) -> Self {
        ClampedProgress {
            sink,
            file_index: 0,
            started: false,
            last: ProgressEvent {
                file_index: 0,
                bytes_written: 0,
                bytes_total: 0,
            },
            percent: 0,
            completed: false,
        }
    }

    /// Last percentage handed to the sink
    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Bytes the loader has reported as written so far
    pub fn bytes_written(&self) -> usize {
        self.last.bytes_written
    }

    /// Report 100%; only the first call has an effect
    pub fn complete(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;

        self.last.bytes_written = self.last.bytes_total;
        self.percent = 100;
        self.sink.on_progress(&self.last, 100);
        self.sink.on_finish();
    }

    fn emit(&mut self, event: ProgressEvent) {
        self.last = event;

        let percent = event.percent().min(PROGRESS_CEILING).max(self.percent);
        self.percent = percent;
        self.sink.on_progress(&event, percent);
    }
}

impl ProgressCallbacks for ClampedProgress<'_> {
    fn init(&mut self, _addr: u32, total: usize) {
        if self.started {
            self.file_index += 1;
        }
        self.started = true;

        self.emit(ProgressEvent {
            file_index: self.file_index,
            bytes_written: 0,
            bytes_total: total,
        });
    }

    fn update(&mut self, current: usize) {
        let event = ProgressEvent {
            file_index: self.file_index,
            bytes_written: current.max(self.last.bytes_written),
            bytes_total: self.last.bytes_total,
        };
        self.emit(event);
    }

    // The loader finishing its last block is not success yet; the device
    // still has to acknowledge the end of the write.
    fn finish(&mut self) {}
}
