pub mod backend;
pub mod config;
pub mod dispatch;
pub mod format;
pub mod store;
pub mod supervisor;
pub mod trigger;
pub mod worker;
