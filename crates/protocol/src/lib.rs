//! Wire types for the enginelink RPC protocol.
//!
//! This crate contains the serde-serializable types used for communication
//! between the controlling process and a remote engine process over a single
//! ordered byte stream. These types represent the "protocol layer" - the
//! shapes of data as they appear on the wire.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! - **Pure data**: No behavior beyond serialization/deserialization
//! - **1:1 with protocol**: Match the wire schema exactly
//! - **Stable**: Changes only when the wire protocol changes
//!
//! The runtime (connection, dispatch tree, launcher) is built on top of these
//! types in `enginelink-runtime`.

pub mod message;
pub mod options;

pub use message::*;
pub use options::*;
