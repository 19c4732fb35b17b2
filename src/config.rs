use std::{fmt, sync::Arc, time::Duration};

use crate::writer::TimeProvider;

/// Default interval between background flushes.
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(250);

/// Default bound on bytes waiting to be flushed.
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 16 * 1024 * 1024;

/// Settings for a [`DataLog`](crate::DataLog), fixed at creation.
#[derive(Clone)]
pub struct DataLogConfig {
    /// How often the background thread drains the buffer.
    pub period: Duration,
    /// Free-form text stored in every segment's file header.
    pub extra_header: String,
    /// Data records that would grow the unflushed buffer past this are dropped.
    pub max_buffered_bytes: usize,
    /// Clock used when a caller passes timestamp 0. Defaults to a monotonic
    /// microsecond clock started when the log is created.
    pub time_provider: Option<Arc<dyn TimeProvider>>,
}

impl Default for DataLogConfig {
    fn default() -> Self {
        DataLogConfig {
            period: DEFAULT_PERIOD,
            extra_header: String::new(),
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
            time_provider: None,
        }
    }
}

impl DataLogConfig {
    #[must_use]
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    #[must_use]
    pub fn with_extra_header(mut self, extra_header: impl Into<String>) -> Self {
        self.extra_header = extra_header.into();
        self
    }

    #[must_use]
    pub fn with_max_buffered_bytes(mut self, max_buffered_bytes: usize) -> Self {
        self.max_buffered_bytes = max_buffered_bytes;
        self
    }

    #[must_use]
    pub fn with_time_provider(mut self, time_provider: impl TimeProvider + 'static) -> Self {
        self.time_provider = Some(Arc::new(time_provider));
        self
    }
}

impl fmt::Debug for DataLogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataLogConfig")
            .field("period", &self.period)
            .field("extra_header", &self.extra_header)
            .field("max_buffered_bytes", &self.max_buffered_bytes)
            .field("time_provider", &self.time_provider.is_some())
            .finish()
    }
}
