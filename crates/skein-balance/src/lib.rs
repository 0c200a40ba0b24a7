//! Skein Load Balancing
//!
//! Picks one provider address out of the candidates discovery returned.
//!
//! - [`RoundRobinBalancer`]: cycles through candidates per service key
//! - [`LeastActiveBalancer`]: prefers the addresses with the fewest
//!   in-flight requests, as counted by an [`ActiveRequestRecorder`]
//!
//! Both are registered as `load-balancer` extensions (`roundRobin`,
//! `leastActive`) through [`register_builtin_balancers`].

pub mod load_balancer;
pub mod recorder;

pub use load_balancer::{
    register_builtin_balancers, LeastActiveBalancer, LoadBalancer, RoundRobinBalancer,
};
pub use recorder::{ActiveGuard, ActiveRequestRecorder};
