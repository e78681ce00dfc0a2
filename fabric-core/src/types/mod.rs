pub mod route;

pub use route::{Backend, BackendHealth, MatchKind, Route, RouteMatch};
