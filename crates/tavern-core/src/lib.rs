//! # tavern-core
//!
//! Foundation types, wire framing, and utilities for the Tavern connection server.
//!
//! This crate provides the transport-agnostic building blocks every other
//! Tavern crate depends on:
//!
//! - **Framing**: [`framing::FrameCodec`], a `u32` big-endian length-prefixed codec
//! - **Chunking**: [`chunk::ChunkAssembler`] for transports with a per-message size cap
//! - **Compression**: [`compression::PayloadCodec`] (deflate) applied to every payload
//! - **Outbound queues**: [`outbound::OutboundQueue`], per-channel FIFOs drained round-robin
//! - **Backoff**: [`retry::ReconnectState`] for bounded, doubling reconnect delays
//! - **Errors**: [`errors::FrameError`], [`errors::CompressionError`]
//! - **Logging**: subscriber setup and log capture for tests

#![deny(unsafe_code)]

pub mod chunk;
pub mod compression;
pub mod constants;
pub mod errors;
pub mod framing;
pub mod logging;
pub mod outbound;
pub mod retry;
