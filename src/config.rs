//! Configuration types

use std::time::Duration;

/// Engine and backend configuration.
///
/// This contains settings that may relate to only one specific backend, so a
/// single value can configure an engine regardless of which backend the
/// platform selects at runtime.
///
/// ```rust
/// # use std::time::Duration;
/// # use watchtree::Config;
/// let config = Config::default()
///     .with_poll_interval(Duration::from_millis(200))
///     .with_follow_symlinks(false);
/// ```
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct Config {
    /// See [`Config::with_poll_interval`]
    poll_interval: Duration,

    /// See [`Config::with_follow_symlinks`]
    follow_symlinks: bool,

    /// See [`Config::with_buffer_capacity`]
    buffer_capacity: usize,
}

impl Config {
    /// For the [`PollWatcher`](crate::PollWatcher) backend.
    ///
    /// Interval between re-scan attempts. Scanning can be expensive for large
    /// file trees, so it is recommended to measure and tune accordingly.
    ///
    /// The default poll frequency is 30 seconds.
    pub fn with_poll_interval(mut self, dur: Duration) -> Self {
        self.poll_interval = dur;
        self
    }

    /// Returns current setting
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Determine whether symbolic links are followed when walking directories
    /// for recursive watches.
    ///
    /// On by default.
    pub fn with_follow_symlinks(mut self, follow_symlinks: bool) -> Self {
        self.follow_symlinks = follow_symlinks;
        self
    }

    /// Returns current setting
    pub fn follow_symlinks(&self) -> bool {
        self.follow_symlinks
    }

    /// Capacity of the bounded channel between a backend's native reader and
    /// the dispatcher.
    ///
    /// When the dispatcher falls behind by more than this many events, further
    /// native events are dropped rather than blocking the reader. 128 by
    /// default.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity.max(1);
        self
    }

    /// Returns current setting
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            follow_symlinks: true,
            buffer_capacity: 128,
        }
    }
}
