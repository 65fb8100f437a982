//! Client-facing library: a socket-like API over the connectivity broker.
//!
//! A [`Connection`] either goes straight to the backend over TCP (preamble
//! framing, optional LZ4) or through the local Broker Socket (control-frame
//! framing over the shared-memory rings), decided per backend by its
//! `use_tcp` flag. Backends use [`Listener`] to receive connections either
//! way.

mod conn;
mod error;

pub use conn::{COMPRESSION_CUTOFF, Connection, Listener};
pub use error::ConnError;
