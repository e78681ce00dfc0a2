pub mod error;
pub mod prelude;
pub mod registry;
pub mod strng;
pub mod types;
pub mod varctx;

pub use error::{GatewayError, RejectReason};
pub use registry::{Event, Factory, Registry};
pub use strng::{RouteId, Strng};
pub use varctx::VarCtx;
