pub mod context;
pub mod error;
pub mod policy;

pub use context::{SecurityContext, SecurityCtxExtractor, UserIdentity};
pub use error::SecurityError;
pub use policy::{AdminPolicy, Capability};
