//! Cross-platform filesystem notification with shared, tree-multiplexed
//! watches.
//!
//! Subscribers attach a [`crossbeam_channel::Sender`] to a filesystem path
//! for a set of portable change kinds ([`Event::CREATE`], [`Event::REMOVE`],
//! [`Event::WRITE`], [`Event::RENAME`]). Overlapping and nested
//! subscriptions share a single native watch per directory: a path-indexed
//! tree keeps the union of all requested masks and issues the minimal
//! install/rewatch/unwatch transitions against the platform backend.
//!
//! A path ending in a `...` component is watched recursively. On platforms
//! whose native facility only watches single directories (inotify, the
//! polling fallback) recursion is emulated by watching every subdirectory
//! and extending the set as directories appear.
//!
//! # Examples
//!
//! ```no_run
//! use crossbeam_channel::unbounded;
//! use watchtree::{Engine, Event};
//!
//! fn main() -> watchtree::Result<()> {
//!     let engine = Engine::new()?;
//!     let (tx, rx) = unbounded();
//!
//!     // Watch a directory tree recursively for creations and writes.
//!     engine.watch("/var/log/...", tx, Event::CREATE | Event::WRITE)?;
//!
//!     for ei in rx {
//!         println!("{ei}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! The process-wide default engine behind [`watch`]/[`stop`] covers the
//! common case of a single engine per process.
//!
//! # Delivery semantics
//!
//! Delivery is best-effort by design: a subscriber whose channel is full has
//! that one event dropped rather than stalling the dispatcher, and events
//! for different watched paths are not ordered relative to each other. Size
//! the channel for the expected burst rate. The engine never closes
//! subscriber channels; their ownership stays with the caller.
//!
//! # Features
//!
//! - `serde` for serialization of [`Event`] and [`EventInfo`]

#![deny(missing_docs)]

pub use crate::config::Config;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::event::{Event, EventInfo};
pub use crate::paths::RECURSIVE_MARKER;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use crate::inotify::InotifyWatcher;
pub use crate::poll::PollWatcher;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod inotify;
pub mod poll;

mod config;
mod error;
mod event;
mod node;
mod paths;
mod tree;
mod watchpoint;


use crossbeam_channel::{Receiver, Sender};
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// The contract between a watch coordinator and a platform backend that
/// watches single paths.
///
/// A backend owns one native watch per path, in one of two states: not
/// watched, or watched with a mask. [`Watcher::watch`] installs, fails with
/// [`ErrorKind::AlreadyWatched`] for a path that already has a watch;
/// [`Watcher::rewatch`] atomically swaps the mask of an existing watch and
/// guards against racing callers by failing with
/// [`ErrorKind::InvalidEventSet`] when `old` is not the installed mask;
/// [`Watcher::unwatch`] removes. OS errors propagate verbatim.
///
/// Decoded events are delivered on the bounded channel handed out by the
/// backend's constructor. A mid-stream native failure is surfaced as one
/// terminal `Err` on that channel, after which it closes.
pub trait Watcher {
    /// Installs a native watch for `path` with the given event mask.
    fn watch(&mut self, path: &Path, events: Event) -> Result<()>;

    /// Atomically swaps the active mask of the watch for `path` from `old`
    /// to `new`.
    fn rewatch(&mut self, path: &Path, old: Event, new: Event) -> Result<()>;

    /// Removes the native watch for `path`.
    fn unwatch(&mut self, path: &Path) -> Result<()>;

    /// Releases every native resource and closes the event channel.
    /// Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// The extended contract for backends whose native facility can watch a
/// whole subtree with a single watch (FSEvents, `ReadDirectoryChangesW`).
pub trait RecursiveWatcher: Watcher {
    /// Installs a native watch reporting changes anywhere under `path`.
    fn recursive_watch(&mut self, path: &Path, events: Event) -> Result<()>;

    /// Removes the recursive watch rooted at `path`.
    fn recursive_unwatch(&mut self, path: &Path) -> Result<()>;

    /// Relocates and/or re-masks a recursive watch region in one call:
    /// the region rooted at `old_path` with mask `old` becomes one rooted
    /// at `new_path` with mask `new`. Used when subscription changes merge,
    /// split or re-root regions.
    fn recursive_rewatch(
        &mut self,
        old_path: &Path,
        new_path: &Path,
        old: Event,
        new: Event,
    ) -> Result<()>;
}

/// A filesystem notification engine: one watch tree bound to one platform
/// backend.
///
/// [`Engine::new`] selects the platform's native backend. The capability
/// constructors [`Engine::non_recursive`] and [`Engine::recursive`] bind a
/// caller-supplied backend to the matching coordinator.
///
/// Dropping the engine closes it; pending subscriptions stop receiving
/// events but their channels stay open and owned by their creators.
pub struct Engine {
    tree: Arc<dyn tree::Tree>,
}

impl Engine {
    /// Creates an engine over the recommended backend for this platform:
    /// inotify on Linux and Android, stat polling elsewhere.
    pub fn new() -> Result<Engine> {
        Self::with_config(Config::default())
    }

    /// Creates the platform-recommended engine with the given configuration.
    pub fn with_config(config: Config) -> Result<Engine> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            let (watcher, events) = InotifyWatcher::new(&config)?;
            Engine::non_recursive(watcher, events, config)
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            let (watcher, events) = PollWatcher::new(&config)?;
            Engine::non_recursive(watcher, events, config)
        }
    }

    /// Creates an engine over a backend that watches single directories.
    /// Recursive subscriptions are emulated with one native watch per
    /// subdirectory.
    pub fn non_recursive<W>(
        watcher: W,
        events: Receiver<Result<EventInfo>>,
        config: Config,
    ) -> Result<Engine>
    where
        W: Watcher + Send + Sync + 'static,
    {
        Ok(Engine {
            tree: tree::NonRecursiveTree::spawn(watcher, events, &config)?,
        })
    }

    /// Creates an engine over a backend with native recursive watching.
    pub fn recursive<W>(
        watcher: W,
        events: Receiver<Result<EventInfo>>,
        config: Config,
    ) -> Result<Engine>
    where
        W: RecursiveWatcher + Send + Sync + 'static,
    {
        Ok(Engine {
            tree: tree::RecursiveTree::spawn(watcher, events, &config)?,
        })
    }

    /// Subscribes `tx` to changes of `path` for the given event set.
    ///
    /// `path` may end in a `...` component to request recursive watching.
    /// `events` must contain at least one event flag. Subscribing the same
    /// channel to the same path again widens the subscription; when nothing
    /// new is requested, no native call is made.
    pub fn watch(&self, path: impl AsRef<Path>, tx: Sender<EventInfo>, events: Event) -> Result<()> {
        let path = path.as_ref();
        let events = events.strip_internal();
        if events.is_empty() {
            return Err(Error::invalid_event_set().add_path(path.to_path_buf()));
        }
        self.tree.watch(path, tx, events)
    }

    /// Removes every subscription registered under `tx`, narrowing or
    /// removing the underlying native watches.
    ///
    /// Teardown failures are accumulated and reported together; the removal
    /// itself always completes. The channel is not closed.
    pub fn stop(&self, tx: &Sender<EventInfo>) -> Result<()> {
        self.tree.stop(tx)
    }

    /// Shuts the engine down: stops the native reader, releases every
    /// tracked watch and closes the backend's event stream. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.tree.close()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(err) = self.tree.close() {
            log::warn!("error closing engine: {err}");
        }
    }
}

static DEFAULT: OnceLock<Engine> = OnceLock::new();

fn default_engine() -> Result<&'static Engine> {
    if let Some(engine) = DEFAULT.get() {
        return Ok(engine);
    }
    // Built outside the guard so construction errors reach the caller; a
    // racing duplicate is simply dropped.
    let engine = Engine::new()?;
    Ok(DEFAULT.get_or_init(|| engine))
}

/// Subscribes `tx` on the process-wide default engine.
/// See [`Engine::watch`].
pub fn watch(path: impl AsRef<Path>, tx: Sender<EventInfo>, events: Event) -> Result<()> {
    default_engine()?.watch(path, tx, events)
}

/// Removes every subscription of `tx` from the process-wide default engine.
/// See [`Engine::stop`].
pub fn stop(tx: &Sender<EventInfo>) -> Result<()> {
    default_engine()?.stop(tx)
}
