use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const APP_NAME: &str = "docsync";
const ENV_DATA_DIR: &str = "DOCSYNC_DATA_DIR";

/// On-disk layout:
///
/// ```text
/// <root>/config.redb                          resources, aliases, settings
/// <root>/indices/<index>/                     one tantivy index each
/// <root>/events/<resource>/<producer>/*.jsonl pending event batches
/// ```
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// First match wins: `explicit` (from `--data-dir`), then
    /// `DOCSYNC_DATA_DIR`, then `$XDG_DATA_HOME/docsync`.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = match explicit {
            Some(path) => path.to_path_buf(),
            None => match std::env::var_os(ENV_DATA_DIR) {
                Some(val) => PathBuf::from(val),
                None => xdg::BaseDirectories::with_prefix(APP_NAME)
                    .get_data_home()
                    .ok_or_else(|| {
                        Error::Config(
                            "could not determine XDG data home directory"
                                .into(),
                        )
                    })?,
            },
        };
        ensure_dir(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_db(&self) -> PathBuf {
        self.root.join("config.redb")
    }

    pub fn indices_dir(&self) -> Result<PathBuf> {
        let path = self.root.join("indices");
        ensure_dir(&path)?;
        Ok(path)
    }

    pub fn events_dir(&self) -> Result<PathBuf> {
        let path = self.root.join("events");
        ensure_dir(&path)?;
        Ok(path)
    }
}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|_| Error::DataDir(path.to_path_buf()))
}
