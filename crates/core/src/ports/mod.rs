mod chain_api;
mod plugin;
mod repository;

pub use chain_api::*;
pub use plugin::*;
pub use repository::*;
