//! HTTP handlers for table CRUD.

pub mod entity;
pub use entity::*;
