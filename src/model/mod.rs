pub mod builder;
pub mod capsule;
pub mod config;
pub mod core;
pub mod kernel_routing;
pub mod layers;
pub mod metric;
pub mod nin_routing;
pub mod ops;
pub mod routing;
pub mod transform;
pub mod variables;

// Réexportations principales
pub use builder::ModelBuilder;
pub use config::{NetworkConfig, RoutingConfig};
pub use self::core::{CapsuleNetwork, NetworkOutput};
pub use kernel_routing::{kernel_routing, kernel_routing_with_prior};
pub use nin_routing::nin_routing;
pub use routing::{
    HyperSimplifiedRoutingProcedure, Routing, RoutingProcedure, SimplifiedRoutingProcedure,
};
