#[macro_use]
extern crate common;

pub mod bson;
pub mod wire;
pub mod error;
pub mod conn;
pub mod server;
pub mod cluster;
pub mod planner;
pub mod reply;
pub mod pool;
pub mod client;

pub use crate::client::{DocDbClient, DocDbClientOptions};
