//! Schema introspection: catalog → `TableDescriptor`, cached per ledger stamp.

mod cache;
mod introspect;
mod types;

pub use cache::{SchemaCache, TableMap};
pub(crate) use introspect::ledger_version;
pub use introspect::{Introspector, LedgerStamp, SchemaSnapshot};
pub use types::*;
