pub mod cache;
pub mod normalize;
pub mod registry;

pub use cache::{EntityKind, NameCache};
pub use registry::ResolveOutcome;
