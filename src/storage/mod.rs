pub mod file_manager;
pub mod hash;

pub use file_manager::FileManager;
pub use hash::HashUtils;
