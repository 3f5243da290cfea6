//! Marketplace data: tenants, accounts, catalog, orders, content and assets.
//!
//! All state lives in one SQLite database owned by [`db::MarketDb`]; every
//! table follows the same audit and soft-delete convention.

pub mod assets;
pub mod content;
pub mod db;
pub mod license;
pub mod models;
pub mod orders;
pub mod tenant;
pub mod validate;

pub use assets::AssetStore;
pub use db::{DbHandle, MarketDb, Table};
pub use tenant::TenantResolver;
