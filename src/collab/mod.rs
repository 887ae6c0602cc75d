//! Collaborators the engine drives but does not implement
//!
//! - `traits`: connectivity, state query/reset and disruption actuator seams
//! - `http`: HTTP/JSON node RPC adapter
//! - `docker`: disruption actuator backed by the Docker CLI

pub mod docker;
pub mod http;
pub mod traits;

pub use docker::DockerActuator;
pub use http::{HttpConnector, HttpNode};
pub use traits::{DisruptionActuator, NodeConnector, NodeRpc};
