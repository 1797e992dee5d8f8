#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use gateway_control_plane_core as core;
pub use gateway_control_plane_grpc as grpc;
pub use gateway_control_plane_xds as xds;

mod admin;
mod args;
mod discovery;
mod log;
mod server;
mod services_file;

pub use self::{
    args::Args,
    log::LogFormat,
    services_file::{Credentials, FileAuthorizer, FileSource},
};
