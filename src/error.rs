//! Error types.

use std::{error::Error as StdError, fmt, io, path::PathBuf};

/// Type alias to use this library's `Error` type in a `Result`.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds.
#[derive(Debug)]
pub enum ErrorKind {
    /// Generic error.
    ///
    /// May be used in cases where a platform specific error is mapped to this type, or for opaque
    /// internal errors.
    Generic(String),

    /// I/O errors.
    Io(io::Error),

    /// A path does not exist.
    PathNotFound,

    /// Attempted to remove or modify a watch that does not exist.
    WatchNotFound,

    /// Attempted to install a second native watch for a path that already has one.
    ///
    /// Watch widening must go through `rewatch` instead.
    AlreadyWatched,

    /// An empty or unsupported set of event flags was requested, or the expected
    /// previous event set of a `rewatch` call did not match the installed one.
    InvalidEventSet,

    /// OS-level limit on the number of watches was reached.
    MaxFilesWatch,

    /// One or more errors collected while tearing watches down.
    ///
    /// Teardown visits every remaining watch even when some removals fail; the
    /// failures are accumulated here rather than masking one another.
    Teardown(Vec<Error>),
}

/// Notification error.
#[derive(Debug)]
pub struct Error {
    /// Kind of the error.
    pub kind: ErrorKind,
    /// Relevant paths to the error, if any.
    pub paths: Vec<PathBuf>,
}

impl Error {
    /// Creates a new Error with new paths.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            paths: Vec::new(),
        }
    }

    /// Creates a new generic Error from a message.
    pub fn generic(msg: &str) -> Self {
        Self::new(ErrorKind::Generic(msg.into()))
    }

    /// Creates a new i/o Error from a stdlib `io::Error`.
    pub fn io(err: io::Error) -> Self {
        Self::new(ErrorKind::Io(err))
    }

    /// Creates a new "path not found" error.
    pub fn path_not_found() -> Self {
        Self::new(ErrorKind::PathNotFound)
    }

    /// Creates a new "watch not found" error.
    pub fn watch_not_found() -> Self {
        Self::new(ErrorKind::WatchNotFound)
    }

    /// Creates a new "already watched" error.
    pub fn already_watched() -> Self {
        Self::new(ErrorKind::AlreadyWatched)
    }

    /// Creates a new "invalid event set" error.
    pub fn invalid_event_set() -> Self {
        Self::new(ErrorKind::InvalidEventSet)
    }

    /// Folds a set of teardown failures into a single error.
    ///
    /// Returns `Ok(())` for an empty set and the error itself when only one
    /// failure was collected.
    pub fn teardown(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::new(ErrorKind::Teardown(errors))),
        }
    }

    /// Adds a path to the error.
    pub fn add_path(mut self, path: PathBuf) -> Self {
        self.paths.push(path);
        self
    }

    /// Sets the paths of the error.
    pub fn set_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.paths = paths;
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let error = match &self.kind {
            ErrorKind::PathNotFound => "No path was found.".into(),
            ErrorKind::WatchNotFound => "No watch was found.".into(),
            ErrorKind::AlreadyWatched => "The path is already watched.".into(),
            ErrorKind::InvalidEventSet => "Invalid or mismatched event set.".into(),
            ErrorKind::MaxFilesWatch => "OS file watch limit reached.".into(),
            ErrorKind::Io(err) => err.to_string(),
            ErrorKind::Generic(err) => err.clone(),
            ErrorKind::Teardown(errs) => format!(
                "{} errors while tearing down watches: [{}]",
                errs.len(),
                errs.iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        };

        if self.paths.is_empty() {
            write!(f, "{error}")
        } else {
            write!(f, "{error} about {:?}", self.paths)
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match &self.kind {
            ErrorKind::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io(err)
    }
}
