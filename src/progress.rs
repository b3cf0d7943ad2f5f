/// Transfer progress sink. The engine calls into this at chunk boundaries;
/// binaries decide how to render it.
pub trait Progress {
    /// A transfer is starting. `total` is in bytes when known; plain DFU
    /// uploads are open-ended and pass `None`.
    fn start_task(&mut self, total: Option<u64>);

    /// `n` more bytes have been transferred.
    fn advance(&mut self, n: u64);

    fn finish(&mut self);
}

/// Sink that discards all progress events.
#[derive(Default)]
pub struct NullProgress;

impl Progress for NullProgress {
    fn start_task(&mut self, _total: Option<u64>) {}
    fn advance(&mut self, _n: u64) {}
    fn finish(&mut self) {}
}

#[cfg(test)]
pub(crate) struct CountingProgress {
    pub started: Option<Option<u64>>,
    pub advanced: u64,
    pub finished: bool,
}

#[cfg(test)]
impl CountingProgress {
    pub fn new() -> Self {
        Self {
            started: None,
            advanced: 0,
            finished: false,
        }
    }
}

#[cfg(test)]
impl Progress for CountingProgress {
    fn start_task(&mut self, total: Option<u64>) {
        self.started = Some(total);
    }

    fn advance(&mut self, n: u64) {
        self.advanced += n;
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}
