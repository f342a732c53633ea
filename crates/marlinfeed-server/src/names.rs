//! File-name hygiene for the upload directory.

use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

/// Replaces anything outside `[A-Za-z0-9_+.,-]` (non-ASCII is left
/// alone) with `_`, so an uploaded name cannot traverse directories or
/// smuggle shell metacharacters.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if !c.is_ascii() || c.is_ascii_alphanumeric() || "_-+.,".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn digit_suffix(digit: u8) -> String {
    String::from(char::from(b'0' + digit)).repeat(4)
}

/// Creates a fresh file `<prefix><d><d><d><d>` in `dir`, trying the
/// digits 0 through 9 for the suffix.
pub fn create_numbered_file(dir: &Path, prefix: &str) -> io::Result<(PathBuf, std::fs::File)> {
    for digit in 0..=9u8 {
        let path = dir.join(format!("{}{}", prefix, digit_suffix(digit)));
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(&path)
        {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "all temporary names taken",
    ))
}

/// Creates a fresh directory `<prefix><d><d><d><d>`, same naming scheme.
pub fn create_numbered_dir(prefix: &str) -> io::Result<PathBuf> {
    let mut builder = std::fs::DirBuilder::new();
    builder.mode(0o700);
    for digit in 0..=9u8 {
        let path = PathBuf::from(format!("{}{}", prefix, digit_suffix(digit)));
        match builder.create(&path) {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "all temporary names taken",
    ))
}
