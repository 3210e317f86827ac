use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum StorageError {
    UnsupportedEngine {
        engine: String,
    },
    HomeDirectoryUnavailable,
    CreateDataDir {
        path: PathBuf,
        source: std::io::Error,
    },
    SerializeTask(serde_json::Error),
    DeserializeTask(serde_json::Error),
    Sled(sled::Error),
    UnknownStatusInIndex {
        key: String,
    },
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedEngine { engine } => write!(
                f,
                "unsupported storage.engine '{engine}'; allowed values: sled, file"
            ),
            Self::HomeDirectoryUnavailable => {
                write!(f, "cannot resolve storage path because HOME is not set")
            }
            Self::CreateDataDir { path, source } => write!(
                f,
                "failed to create storage data directory '{}': {source}",
                path.display()
            ),
            Self::SerializeTask(source) => {
                write!(f, "failed to serialize task record for storage: {source}")
            }
            Self::DeserializeTask(source) => {
                write!(f, "failed to deserialize task record from storage: {source}")
            }
            Self::Sled(source) => write!(f, "sled storage error: {source}"),
            Self::UnknownStatusInIndex { key } => {
                write!(f, "status index key '{key}' does not name a known status")
            }
            Self::ReadFile { path, source } => {
                write!(f, "failed to read storage file '{}': {source}", path.display())
            }
            Self::WriteFile { path, source } => {
                write!(
                    f,
                    "failed to write storage file '{}': {source}",
                    path.display()
                )
            }
        }
    }
}

impl std::error::Error for StorageError {}
