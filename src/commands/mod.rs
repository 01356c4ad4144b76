//! Command implementations

pub mod apply;
pub mod resource;
pub mod schema;
