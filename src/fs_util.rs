//! Write-to-temporary-then-rename helpers for every durable output.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

fn tmp_path_for(path: &Path) -> io::Result<PathBuf> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid output path: {}", path.display()),
            )
        })?;
    Ok(path.with_file_name(format!("{file_name}.tmp")))
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    write_atomic_with(path, |file| file.write_all(bytes))
}

/// Streams into `<path>.tmp`, syncs, then renames over `path`.
pub(crate) fn write_atomic_with<E>(
    path: &Path,
    write: impl FnOnce(&mut fs::File) -> Result<(), E>,
) -> Result<(), E>
where
    E: From<io::Error>,
{
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = tmp_path_for(path)?;

    {
        let mut file = fs::File::create(&tmp_path)?;
        if let Err(err) = write(&mut file) {
            drop(file);
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn replaces_existing_file_and_leaves_no_temp() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("out.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert!(!tmp_path_for(&path).unwrap().exists());
    }

    #[test]
    fn failed_write_keeps_previous_contents() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("out.csv");
        write_atomic(&path, b"good").unwrap();

        let err = write_atomic_with(&path, |_file| {
            Err::<(), io::Error>(io::Error::new(io::ErrorKind::Other, "interrupted"))
        })
        .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert_eq!(fs::read(&path).unwrap(), b"good");
        assert!(!tmp_path_for(&path).unwrap().exists());
    }
}
