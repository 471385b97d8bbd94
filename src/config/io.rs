use std::env::current_exe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use directories_next::ProjectDirs;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json;
use fd_lock::{RwLock, RwLockWriteGuard};
use log::{info, warn};
use std::fs::OpenOptions;
use std::str;

use crate::config::types::Config;
use crate::error::ConfigError;

const WEIGHT_FILE_NAME: &str = "scale-link.weight.json";

// creates a path to a json file named like the executable, in the same directory as the executable
// this could be useful for usb sticks
fn get_portable_config_path() -> Option<PathBuf> {
    match current_exe() {
        Ok(mut path) => {
            // F:\scale-link.exe => F:\scale-link.json
            if !path.set_extension("json") {
                warn!("current exe has no filename: {}", path.to_string_lossy());
                return None
            }

            Some(path)
        },
        Err(err) => {
            warn!("failed to get current exe path: {:?}", err);
            None
        },
    }
}

// creates a path to scale-link.json in an os dependent standard directory, such as %AppData% on
// windows.
fn get_local_config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "btlearninglab", "scale-link").map(|dirs| {
        dirs.config_dir().join("scale-link.json")
    })
}

pub fn get_config_path() -> Result<PathBuf, ConfigError> {
    let portable = get_portable_config_path();
    if let Some(path) = portable {
        let attr = std::fs::metadata(&path);
        match attr {
            Ok(attr) => {
                if attr.is_file() {
                    return Ok(path);
                }
            }
            Err(err) => {
                info!("Could not read metadata of: {}; Using local path instead. ({:?})", path.to_string_lossy(), err);
            },
        }

    }

    match get_local_config_path() {
        None => Err(ConfigError::NoConfigPath),
        Some(path) => Ok(path),
    }
}

/// The latest weight is kept next to the config file.
pub fn get_weight_path(config_path: &Path) -> PathBuf {
    config_path.with_file_name(WEIGHT_FILE_NAME)
}

pub struct FileLocker {
    rw_lock: RwLock<std::fs::File>,
}

impl FileLocker {
    pub fn lock(&mut self) -> Result<RwLockWriteGuard<std::fs::File>, ConfigError> {
        match self.rw_lock.try_write() {
            Ok(guard) => Ok(guard),
            Err(source) =>{
                return Err(ConfigError::CanNotLock { source });
            },
        }
    }
}

/// A json document on disk, shared between tasks.
#[derive(Clone)]
pub struct JsonFile {
    path: PathBuf,
    file: Arc<Mutex<std::fs::File>>,
}

impl JsonFile {
    pub fn open(path: PathBuf) -> Result<Self, ConfigError> {
        if let Some(directory) = path.parent() {
            std::fs::create_dir_all(directory)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(false)
            .append(false)
            .create(true)
            .open(&path)?;

        Ok(JsonFile { path, file: Arc::new(Mutex::new(file)) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// An exclusive file lock, so that the file is used by only one instance of this application.
    pub fn locker(&self) -> Result<FileLocker, ConfigError> {
        let file = self.file.lock().expect("Failed to lock JsonFile inner");

        Ok(FileLocker {
            rw_lock: RwLock::new(file.try_clone()?),
        })
    }

    // The File returned from here should never be closed!
    fn get_file(&self) -> Result<File, ConfigError> {
        let file = self.file.lock().expect("Failed to lock JsonFile inner");
        let file = file.try_clone()?; // std File
        Ok(File::from_std(file)) // tokio File
    }

    /// An empty file reads as `T::default()`.
    pub async fn read<T: DeserializeOwned + Default>(&self) -> Result<T, ConfigError> {
        let mut file = self.get_file()?;
        file.rewind().await?;

        let mut content = vec![];
        file.read_to_end(&mut content).await?;

        if content.is_empty() {
            return Ok(T::default());
        }

        let content = str::from_utf8(&content)?;
        Ok(serde_json::from_str(content)?)
    }

    pub async fn save<T: Serialize>(&self, value: &T) -> Result<(), ConfigError> {
        let mut file = self.get_file()?;

        let content = serde_json::to_string_pretty(value)?;
        file.rewind().await?;
        file.set_len(0).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct ConfigIO {
    file: JsonFile,
}

impl ConfigIO {
    pub fn new_sync() -> Result<Self, ConfigError> {
        ConfigIO::open(get_config_path()?)
    }

    pub fn open(path: PathBuf) -> Result<Self, ConfigError> {
        info!("Using config file {}", path.to_string_lossy());
        Ok(ConfigIO { file: JsonFile::open(path)? })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn locker(&self) -> Result<FileLocker, ConfigError> {
        self.file.locker()
    }

    pub async fn read(&self) -> Result<Config, ConfigError> {
        info!("Reading config file");
        self.file.read().await
    }

    pub async fn save(&self, config: &Config) -> Result<(), ConfigError> {
        info!("Saving config");
        self.file.save(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_file_reads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let config_io = ConfigIO::open(dir.path().join("nested").join("scale-link.json")).unwrap();

        assert_eq!(config_io.read().await.unwrap(), Config::default());
        assert!(dir.path().join("nested").is_dir());
    }

    #[tokio::test]
    async fn saved_config_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let config_io = ConfigIO::open(dir.path().join("scale-link.json")).unwrap();

        let mut config = Config::default();
        config.save_device("AA:BB:CC:DD:EE:FF");
        config.scan_timeout_ms = 5_000;
        config_io.save(&config).await.unwrap();

        // a shorter document must not leave a tail of the previous one behind
        config.clear_saved_device();
        config_io.save(&config).await.unwrap();

        assert_eq!(config_io.read().await.unwrap(), config);
    }

    #[tokio::test]
    async fn invalid_json_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scale-link.json");
        std::fs::write(&path, "{ not json").unwrap();

        let config_io = ConfigIO::open(path).unwrap();
        assert!(matches!(config_io.read().await, Err(ConfigError::JsonError { .. })));
    }

    #[test]
    fn weight_file_sits_next_to_config() {
        let path = get_weight_path(Path::new("/tmp/app/scale-link.json"));
        assert_eq!(path, PathBuf::from("/tmp/app/scale-link.weight.json"));
    }
}
