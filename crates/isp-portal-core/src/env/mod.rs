//! Runtime environment detection.
//!
//! The router looks at the serving origin once, decides whether API calls go
//! straight to the API root or through the origin's `/api` proxy, and hands
//! the resulting `EnvironmentDescriptor` to every component that needs it.

pub mod router;

pub use router::{
    DeploymentKind, EnvironmentDescriptor, EnvironmentRouter, RoutingMode, RoutingPolicy,
    RuntimeContext, DEFAULT_DIRECT_API_ROOT, PROXY_BASE_ADDRESS,
};
