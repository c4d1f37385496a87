//! Path normalization for watch requests.

use std::{env, fs, io, path::Path, path::PathBuf};

use crate::error::{Error, Result};

/// The trailing path component requesting a recursive watch, e.g.
/// `/var/log/...`.
pub const RECURSIVE_MARKER: &str = "...";

/// Resolves a watch request path to an absolute, symlink-free form and
/// reports whether it carried the trailing [`RECURSIVE_MARKER`] component.
///
/// Fails with a path error when the path does not exist; a watch for a
/// missing path could never observe anything.
pub(crate) fn cleanpath(path: &Path) -> Result<(PathBuf, bool)> {
    let (base, recursive) = match path.file_name() {
        Some(name) if name == RECURSIVE_MARKER => {
            (path.parent().unwrap_or_else(|| Path::new(".")), true)
        }
        _ => (path, false),
    };

    let abs = if base.as_os_str().is_empty() {
        env::current_dir().map_err(Error::io)?
    } else if base.is_absolute() {
        base.to_path_buf()
    } else {
        env::current_dir().map_err(Error::io)?.join(base)
    };

    let real = fs::canonicalize(&abs).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            Error::path_not_found().add_path(abs.clone())
        } else {
            Error::io(e).add_path(abs.clone())
        }
    })?;

    Ok((real, recursive))
}
