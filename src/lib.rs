// All API endpoints must be async
#[allow(clippy::unused_async)]
pub mod api;
pub mod clap;
mod config;
// Results in large capacity if set to a negative number, caller's fault really :P
#[allow(clippy::cast_sign_loss)]
mod database;
mod domain;
// `self` is required for easy access to methods
#[allow(clippy::unused_self)]
mod service;
mod utils;

pub use config::Config;
pub use database::Database;
pub use service::Services;
pub use utils::error::{Error, Result};
