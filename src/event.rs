//! The portable `Event` bitmask and the `EventInfo` record delivered to
//! subscribers.
//!
//! The four portable flags are defined per platform so that they alias the
//! native event vocabulary where one exists: on Linux `CREATE` *is*
//! `IN_CREATE | IN_MOVED_TO`, so masks pass to and from the kernel without a
//! translation table, and native extension flags can coexist with portable
//! ones in a single word.

use std::{any::Any, fmt, fs, io, path::Path, path::PathBuf, sync::Arc};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg(any(target_os = "linux", target_os = "android"))]
mod imp {
    //! Portable bit values for inotify platforms.
    //!
    //! The portable flags are unions of the inotify bits they subsume. The
    //! control bits sit in the 0x10000..0x800000 gap, which the inotify mask
    //! vocabulary leaves unused.
    pub const CREATE: u32 = libc::IN_CREATE | libc::IN_MOVED_TO;
    pub const REMOVE: u32 = libc::IN_DELETE | libc::IN_DELETE_SELF;
    pub const WRITE: u32 = libc::IN_MODIFY;
    pub const RENAME: u32 = libc::IN_MOVED_FROM | libc::IN_MOVE_SELF;
    pub const RECURSIVE: u32 = 0x0001_0000;
    pub const OMIT: u32 = 0x0002_0000;
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod imp {
    //! Portable bit values for platforms without an aliased native vocabulary.
    pub const CREATE: u32 = 0x0000_0001;
    pub const REMOVE: u32 = 0x0000_0002;
    pub const WRITE: u32 = 0x0000_0004;
    pub const RENAME: u32 = 0x0000_0008;
    pub const RECURSIVE: u32 = 0x0001_0000;
    pub const OMIT: u32 = 0x0002_0000;
}

bitflags::bitflags! {
    /// A bitmask of filesystem change kinds.
    ///
    /// The four portable flags are available on every platform. Their concrete
    /// bit values differ by OS so that platform-native flags can share the
    /// word; masks must therefore never be persisted or exchanged between
    /// machines as raw bits.
    pub struct Event: u32 {
        /// A file or directory was created, or moved into the watched scope.
        const CREATE = imp::CREATE;

        /// A file or directory was removed.
        const REMOVE = imp::REMOVE;

        /// The data content of a file was changed.
        const WRITE = imp::WRITE;

        /// A file or directory was renamed, or moved out of the watched scope.
        const RENAME = imp::RENAME;

        /// Union of the four portable flags.
        const ALL = Self::CREATE.bits | Self::REMOVE.bits | Self::WRITE.bits | Self::RENAME.bits;

        #[doc(hidden)]
        const RECURSIVE = imp::RECURSIVE;

        #[doc(hidden)]
        const OMIT = imp::OMIT;

        /// A file was accessed (read).
        #[cfg(any(target_os = "linux", target_os = "android"))]
        const IN_ACCESS = libc::IN_ACCESS;

        /// Metadata (permissions, timestamps, ownership) changed.
        #[cfg(any(target_os = "linux", target_os = "android"))]
        const IN_ATTRIB = libc::IN_ATTRIB;

        /// A file opened for writing was closed.
        #[cfg(any(target_os = "linux", target_os = "android"))]
        const IN_CLOSE_WRITE = libc::IN_CLOSE_WRITE;

        /// A file not opened for writing was closed.
        #[cfg(any(target_os = "linux", target_os = "android"))]
        const IN_CLOSE_NOWRITE = libc::IN_CLOSE_NOWRITE;

        /// A file was written to.
        #[cfg(any(target_os = "linux", target_os = "android"))]
        const IN_MODIFY = libc::IN_MODIFY;

        /// A file or directory was opened.
        #[cfg(any(target_os = "linux", target_os = "android"))]
        const IN_OPEN = libc::IN_OPEN;

        /// An entry was moved out of the watched directory.
        #[cfg(any(target_os = "linux", target_os = "android"))]
        const IN_MOVED_FROM = libc::IN_MOVED_FROM;

        /// An entry was moved into the watched directory.
        #[cfg(any(target_os = "linux", target_os = "android"))]
        const IN_MOVED_TO = libc::IN_MOVED_TO;

        /// An entry was created within the watched directory.
        #[cfg(any(target_os = "linux", target_os = "android"))]
        const IN_CREATE = libc::IN_CREATE;

        /// An entry was deleted from the watched directory.
        #[cfg(any(target_os = "linux", target_os = "android"))]
        const IN_DELETE = libc::IN_DELETE;

        /// The watched file or directory itself was deleted.
        #[cfg(any(target_os = "linux", target_os = "android"))]
        const IN_DELETE_SELF = libc::IN_DELETE_SELF;

        /// The watched file or directory itself was moved.
        #[cfg(any(target_os = "linux", target_os = "android"))]
        const IN_MOVE_SELF = libc::IN_MOVE_SELF;
    }
}

impl Default for Event {
    fn default() -> Self {
        Event::empty()
    }
}

impl Event {
    /// Engine-internal control bits, never part of a native mask.
    pub(crate) fn internal() -> Event {
        Event::RECURSIVE | Event::OMIT
    }

    /// The mask with the internal control bits stripped.
    pub(crate) fn strip_internal(self) -> Event {
        self - Event::internal()
    }
}

/// Names of the flags known on this platform, portable kinds first.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn known_flags() -> &'static [(Event, &'static str)] {
    &[
        (Event::CREATE, "create"),
        (Event::REMOVE, "remove"),
        (Event::WRITE, "write"),
        (Event::RENAME, "rename"),
        (Event::IN_ACCESS, "in_access"),
        (Event::IN_ATTRIB, "in_attrib"),
        (Event::IN_CLOSE_WRITE, "in_close_write"),
        (Event::IN_CLOSE_NOWRITE, "in_close_nowrite"),
        (Event::IN_OPEN, "in_open"),
    ]
}

/// Names of the flags known on this platform.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn known_flags() -> &'static [(Event, &'static str)] {
    &[
        (Event::CREATE, "create"),
        (Event::REMOVE, "remove"),
        (Event::WRITE, "write"),
        (Event::RENAME, "rename"),
    ]
}

impl fmt::Display for Event {
    /// Renders the names of every matched flag, `|`-separated.
    ///
    /// A portable name is rendered when any of its platform bits are present,
    /// so a raw `IN_CREATE` decodes as `"create"`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        let mut rendered = Event::empty();
        for &(flag, name) in known_flags() {
            if self.intersects(flag) && !rendered.contains(*self & flag) {
                write!(f, "{sep}{name}")?;
                sep = "|";
                rendered.insert(flag);
            }
        }
        if sep.is_empty() {
            write!(f, "0x{:x}", self.bits())?;
        }
        Ok(())
    }
}

#[cfg(feature = "serde")]
impl Serialize for Event {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u32::deserialize(deserializer).map(Event::from_bits_truncate)
    }
}

/// A single observed filesystem change.
///
/// Values are created by a backend when it decodes a native notification and
/// are read-only from then on; cloning is cheap so one event can fan out to
/// many subscribers.
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EventInfo {
    path: PathBuf,
    event: Event,
    #[cfg_attr(feature = "serde", serde(skip))]
    dir: Option<bool>,
    #[cfg_attr(feature = "serde", serde(skip))]
    sys: Option<Arc<dyn Any + Send + Sync>>,
}

impl EventInfo {
    /// Creates a new record for the given absolute path and event mask.
    pub fn new(path: impl Into<PathBuf>, event: Event) -> Self {
        Self {
            path: path.into(),
            event,
            dir: None,
            sys: None,
        }
    }

    /// Records whether the path is a directory, when the native notification
    /// already carries that information.
    pub fn with_dir_hint(mut self, dir: bool) -> Self {
        self.dir = Some(dir);
        self
    }

    /// Attaches the platform-native record behind [`EventInfo::sys`].
    pub fn with_sys(mut self, sys: Arc<dyn Any + Send + Sync>) -> Self {
        self.sys = Some(sys);
        self
    }

    /// The resolved absolute path the change was observed at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The observed change mask.
    pub fn event(&self) -> Event {
        self.event
    }

    /// Whether the path is a directory.
    ///
    /// Answered from the native notification when possible, otherwise by
    /// asking the filesystem, which can fail if the entry is already gone.
    pub fn is_dir(&self) -> io::Result<bool> {
        match self.dir {
            Some(dir) => Ok(dir),
            None => fs::metadata(&self.path).map(|m| m.is_dir()),
        }
    }

    /// The platform-native record this event was decoded from, if the backend
    /// exposes one (e.g. [`crate::inotify::InotifySysEvent`] on Linux).
    pub fn sys(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.sys.as_deref()
    }
}

impl fmt::Debug for EventInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventInfo")
            .field("path", &self.path)
            .field("event", &format_args!("{}", self.event))
            .field("dir", &self.dir)
            .field("sys", &self.sys.is_some())
            .finish()
    }
}

impl fmt::Display for EventInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.event, self.path)
    }
}
