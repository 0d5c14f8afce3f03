//! Administrative surface for the aesync chain mirror.
//!
//! - GraphQL at `/graphql`: `syncHealth`, `plugins`, mutation `runPluginUpgrade`
//! - `GET /health`: health report, 200 or 503
//!
//! # Usage
//!
//! ```ignore
//! let schema = build_schema(AdminContext { repositories, health: health.clone(), registry, upgrades });
//! serve_with_shutdown(schema, health, ServerConfig { port, ..Default::default() }, shutdown).await?;
//! ```

mod schema;
mod server;

pub use schema::{
    AdminContext, AdminMutation, AdminQuery, AdminSchema, MAX_QUERY_COMPLEXITY, MAX_QUERY_DEPTH,
    build_schema,
};
pub use server::{ServerConfig, router, serve_with_shutdown};
