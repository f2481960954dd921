use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Removes whatever sits at `path`; a missing entry is not an error.
pub fn remove_stale_entry(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed stale socket entry");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Resolves a socket path below `root` and clears the way for binding it.
///
/// When `relative` nests the socket two or more directories deep (for
/// example `tmp/.vortek/V0`) the enclosing directory is wiped and recreated
/// so no leftovers from a previous session survive. Otherwise only a stale
/// entry at the socket path itself is removed.
pub fn prepare_socket_path(root: &Path, relative: &Path) -> io::Result<PathBuf> {
    let socket_path = root.join(relative);
    let parent = relative.parent().unwrap_or_else(|| Path::new(""));

    if parent.components().count() > 1 {
        let socket_dir = root.join(parent);
        match fs::remove_dir_all(&socket_dir) {
            Ok(()) => debug!(dir = %socket_dir.display(), "cleared socket directory"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        fs::create_dir_all(&socket_dir)?;
    } else {
        remove_stale_entry(&socket_path)?;
    }

    Ok(socket_path)
}
