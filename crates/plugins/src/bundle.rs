//! Plugin bundle trait definition.

use std::sync::Arc;

use aesync_core::ports::Plugin;

/// A self-contained bundle of plugins.
///
/// Each bundle can:
/// - Define its own database schema via migrations
/// - Provide one or more plugin instances
/// - Declare the tables it owns for `--purge`
///
/// # Example
///
/// ```ignore
/// pub struct MyBundle { /* ... */ }
///
/// impl PluginBundle for MyBundle {
///     fn name(&self) -> &'static str { "my_bundle" }
///
///     fn plugins(&self) -> Vec<Arc<dyn Plugin>> {
///         vec![Arc::new(MyPlugin::new())]
///     }
///
///     fn migrations(&self) -> &'static [&'static str] {
///         &["CREATE TABLE my_rows (tx_hash TEXT PRIMARY KEY)"]
///     }
/// }
/// ```
pub trait PluginBundle: Send + Sync {
    /// Unique name identifying this bundle.
    ///
    /// Used for logging and migration tracking.
    fn name(&self) -> &'static str;

    /// Plugin instances provided by this bundle.
    fn plugins(&self) -> Vec<Arc<dyn Plugin>>;

    /// SQL migration statements for this bundle's schema, applied in order
    /// and tracked in `plugin_migrations`.
    fn migrations(&self) -> &'static [&'static str] {
        &[]
    }

    /// Priority for bundle initialization (higher = earlier).
    fn priority(&self) -> i32 {
        0
    }

    /// Called after all migrations of the bundle have been run.
    fn on_initialized(&self) {}

    /// Tables owned by this bundle that are truncated by `--purge`.
    fn tables_to_purge(&self) -> &'static [&'static str] {
        &[]
    }
}
