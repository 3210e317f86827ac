mod backend;
mod engine;
mod error;
mod facade;
mod file_backend;
mod path;
mod sled_backend;

pub use backend::{StorageStatistics, TaskStore};
pub use engine::StorageEngine;
pub use error::StorageError;
pub use facade::StorageFacade;
pub use file_backend::JsonFileTaskStore;
use path::expand_home_path;
pub use sled_backend::SledTaskStore;
