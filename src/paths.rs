use std::path::{Path, PathBuf};

const WORKER_PROGRAM_NAME: &str = "tubeconv-worker";

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn engine_config_path(&self) -> PathBuf {
        self.config_dir().join("engine.json")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.base_dir.join("tools")
    }

    pub fn worker_dir(&self) -> PathBuf {
        self.tools_dir().join("worker")
    }

    pub fn bundled_worker_path(&self) -> PathBuf {
        let mut path = self.worker_dir().join(WORKER_PROGRAM_NAME);
        if cfg!(windows) {
            path.set_extension("exe");
        }
        path
    }

    /// Bundled worker when installed, otherwise the bare name so `PATH` lookup applies.
    pub fn worker_cmd(&self) -> PathBuf {
        let path = self.bundled_worker_path();
        if path.exists() {
            path
        } else {
            PathBuf::from(WORKER_PROGRAM_NAME)
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.worker_dir())?;
        Ok(())
    }

    pub fn normalize_base_dir(base_dir: &Path) -> PathBuf {
        if base_dir.is_absolute() {
            return base_dir.to_path_buf();
        }
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(base_dir),
            Err(_) => base_dir.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_cmd_falls_back_to_path_lookup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        assert_eq!(paths.worker_cmd(), PathBuf::from(WORKER_PROGRAM_NAME));

        paths.ensure_dirs().expect("dirs");
        std::fs::write(paths.bundled_worker_path(), b"").expect("write worker");
        assert_eq!(paths.worker_cmd(), paths.bundled_worker_path());
    }
}
