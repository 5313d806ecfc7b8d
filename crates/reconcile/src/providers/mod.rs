//! Built-in providers

mod local_file;
mod module;
mod null;

pub use local_file::LocalFileProvider;
pub use module::ModuleProvider;
pub use null::NullProvider;
