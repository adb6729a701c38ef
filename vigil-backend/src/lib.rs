pub mod app;
pub mod config_helpers;
pub mod error;
pub mod handlers;
pub mod state;

pub use app::build_router;
