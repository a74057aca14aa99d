mod attributes;
mod cache;
mod scope;

pub use attributes::{AttributeMap, AttributeMapView, AttributeValue, ObjectRef};
pub use cache::MemCache;
pub use scope::ScopeType;
