/// Default chunk size for a single channel read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;
/// Default number of stream events retained per subscriber before it lags.
pub const DEFAULT_STREAM_CAPACITY: usize = 1024;
/// Default upper bound on bytes buffered for one incomplete inbound value.
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 64 * 1024 * 1024;

/// Tunables for a [`crate::Session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Chunk size used by the read loop when `run` does not override it.
    pub read_buffer_size: usize,
    /// Ring size of the inbound stream. A subscriber that falls further behind than this observes
    /// a lag event instead of stalling the read loop.
    pub stream_capacity: usize,
    /// Largest incomplete value the read loop will buffer before failing the session.
    pub max_buffered_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            stream_capacity: DEFAULT_STREAM_CAPACITY,
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
        }
    }
}

impl SessionConfig {
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    pub fn with_stream_capacity(mut self, capacity: usize) -> Self {
        self.stream_capacity = capacity.max(1);
        self
    }

    pub fn with_max_buffered_bytes(mut self, limit: usize) -> Self {
        self.max_buffered_bytes = limit;
        self
    }

    /// Returns a copy with zero sizes clamped to one.
    pub(crate) fn normalized(&self) -> Self {
        Self {
            read_buffer_size: self.read_buffer_size.max(1),
            stream_capacity: self.stream_capacity.max(1),
            max_buffered_bytes: self.max_buffered_bytes,
        }
    }
}
