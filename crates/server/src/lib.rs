#[macro_use]
extern crate rocket;

pub mod app;
pub mod args;
pub mod cors;
pub mod error;
pub mod generation;
pub mod loader;
pub mod logging;
pub mod models;
pub mod routes;
pub mod state;

pub use app::{build_rocket, serve};
pub use args::ServerArgs;
pub use error::ApiError;
pub use loader::{ProgramOpener, load_runner};
pub use state::{AppState, DynBackend, RequestDefaults, SharedSlot};
