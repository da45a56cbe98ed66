pub mod db;
pub mod models;

pub use db::{MetadataStore, StoreHandle};
pub use models::*;
