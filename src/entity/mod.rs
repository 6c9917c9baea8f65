//! Entity layer: identifiers, records, validity-checked handles and the live
//! cache.

mod cache;
mod handle;
mod id;
mod record;
mod value;

pub use cache::{EntityCache, EntityResolver};
pub use handle::EntityRef;
pub use id::{EntityId, Field, Flag, SiteId};
pub use record::Entity;
pub use value::{IdValue, Value};
