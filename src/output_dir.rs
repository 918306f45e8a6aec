use crate::{EngineError, Result};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Resolves, creates and write-probes the destination folder of a job.
///
/// Returns the canonical path. Failures are either "cannot be created"
/// (`OutputDirEmpty`, `OutputDirNotADirectory`, `OutputDirNotCreatable`) or
/// `OutputDirNotWritable`.
pub fn prepare_output_dir(requested: &Path) -> Result<PathBuf> {
    let raw = requested.to_string_lossy();
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(EngineError::OutputDirEmpty);
    }

    let mut dir = PathBuf::from(trimmed);
    if !dir.is_absolute() {
        dir = std::env::current_dir()?.join(dir);
    }

    if dir.exists() && !dir.is_dir() {
        return Err(EngineError::OutputDirNotADirectory { path: dir });
    }
    std::fs::create_dir_all(&dir).map_err(|source| {
        if dir.exists() && !dir.is_dir() {
            return EngineError::OutputDirNotADirectory { path: dir.clone() };
        }
        EngineError::OutputDirNotCreatable {
            path: dir.clone(),
            source,
        }
    })?;

    let canonical = std::fs::canonicalize(&dir).map_err(|source| EngineError::OutputDirNotCreatable {
        path: dir.clone(),
        source,
    })?;

    probe_writable(&canonical)?;
    Ok(canonical)
}

fn probe_writable(dir: &Path) -> Result<()> {
    let probe = dir.join(format!(".tubeconv_write_probe_{}", Uuid::new_v4().simple()));
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&probe)
        .map_err(|source| EngineError::OutputDirNotWritable {
            path: dir.to_path_buf(),
            source,
        })?;
    std::fs::remove_file(&probe).map_err(|source| EngineError::OutputDirNotWritable {
        path: dir.to_path_buf(),
        source,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_missing_parents_and_leaves_no_probe_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("music").join("2024");
        let resolved = prepare_output_dir(&target).expect("prepare");
        assert!(resolved.is_absolute());
        assert!(resolved.is_dir());
        assert_eq!(std::fs::read_dir(&resolved).expect("read_dir").count(), 0);
    }

    #[test]
    fn existing_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("not_a_folder.txt");
        std::fs::write(&file, "x").expect("write");
        let err = prepare_output_dir(&file).expect_err("file must be rejected");
        assert!(matches!(err, EngineError::OutputDirNotADirectory { .. }));

        let nested = file.join("child");
        assert!(prepare_output_dir(&nested).is_err());
    }

    #[test]
    fn blank_path_is_rejected() {
        let err = prepare_output_dir(Path::new("   ")).expect_err("blank");
        assert!(matches!(err, EngineError::OutputDirEmpty));
    }

    #[cfg(unix)]
    #[test]
    fn read_only_folder_is_not_writable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let locked = dir.path().join("locked");
        std::fs::create_dir(&locked).expect("mkdir");
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).expect("chmod");

        // Privileged users bypass mode bits; nothing to assert there.
        let bypass = std::fs::write(locked.join("probe"), b"").is_ok();
        let outcome = prepare_output_dir(&locked);
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).expect("chmod back");
        if bypass {
            return;
        }
        assert!(matches!(outcome, Err(EngineError::OutputDirNotWritable { .. })));
    }
}
