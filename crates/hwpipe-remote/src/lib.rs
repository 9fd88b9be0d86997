#![doc = include_str!("../README.md")]

pub mod client;
pub mod proto;
pub mod server;

pub use client::{RemoteAccelerator, RemoteStage};
pub use proto::{PROTOCOL_VERSION, ProtoError, TransferMode};
pub use server::StageServer;
