pub use crate::error::{GatewayError, RejectReason};
pub use crate::registry::{Factory, Registry};
pub use crate::strng;
pub use crate::strng::{RouteId, Strng};
pub use crate::varctx::VarCtx;
pub use bytes::Bytes;
pub use std::pin::Pin;
pub use std::sync::{Arc, Mutex};
pub use std::task::{Context, Poll, ready};
pub use std::time::{Duration, Instant};
pub use tokio::sync::Mutex as AsyncMutex;
pub use tracing::{debug, error, info, trace, warn};
