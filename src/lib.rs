pub mod archive;
pub mod config;
pub mod convert;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod layout;
pub mod logging;
pub mod manifest;
pub mod output;
pub mod progress;
pub mod reconcile;
pub mod session;
pub mod xnat;
