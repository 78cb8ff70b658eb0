#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod entity;
pub mod forwarder;
pub mod location;
pub mod nat;
pub mod net;
pub mod throttle;

pub use forwarder::{PortForwarder, PortForwarderClient};
pub use location::{LocationConfig, SubnetLocation};
pub use throttle::{Admission, Clock, ObtainThrottle, TokioClock};
