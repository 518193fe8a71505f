//! Rate limiting logic and state management.

mod backend;
mod counter;
mod distributed;
mod identifier;
mod local;
mod policy;
mod redis_store;

pub use backend::{BackendKind, RateLimitBackend, RateLimitResult};
pub use counter::WindowCounter;
pub use distributed::{DistributedRateLimiter, SharedStore, DEFAULT_STORE_TIMEOUT};
pub use identifier::{ClientIdentifier, FORWARDED_FOR_HEADER, REAL_IP_HEADER, UNKNOWN_CLIENT};
pub use local::{LocalRateLimiter, DEFAULT_SWEEP_INTERVAL};
pub use policy::{Policy, PolicyName, PolicyOverride, PolicyRegistry, TimeUnit};
pub use redis_store::RedisSortedSetStore;
