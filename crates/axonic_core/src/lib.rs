pub mod config;
pub mod device;
pub mod error;
pub mod layout;
pub mod refcount;
