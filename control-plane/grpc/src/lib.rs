#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod ext_authz;
pub mod metrics;
pub mod proto;

pub use self::ext_authz::{Decision, DenyReason, ExtAuthzServer};
