//! Small helpers for the plain files kept in a work directory. None of these
//! take a lock; callers hold the lock for the file they touch.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::Path,
};

use crate::error::{FarmError, Result};

/// Contents of `path`, or `None` if it does not exist yet.
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FarmError::io(path, e)),
    }
}

/// Replaces `path` via a sibling temporary file and a rename, so readers
/// never observe a half-written file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".tmp{}", std::process::id()));
    let tmp = Path::new(&tmp);

    let mut file = fs::File::create(tmp).map_err(|e| FarmError::io(tmp, e))?;
    file.write_all(contents).map_err(|e| FarmError::io(tmp, e))?;
    file.sync_all().map_err(|e| FarmError::io(tmp, e))?;
    fs::rename(tmp, path).map_err(|e| FarmError::io(path, e))
}

pub fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| FarmError::io(path, e))?;
    writeln!(file, "{}", line).map_err(|e| FarmError::io(path, e))?;
    file.sync_data().map_err(|e| FarmError::io(path, e))
}
