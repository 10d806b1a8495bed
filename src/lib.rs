//! The core connection, wire-protocol, and session layer of a driver for a
//! document-oriented database.
//!
//! This crate contains the internal machinery a full driver is built on: a
//! bounded per-server connection pool with background maintenance and
//! generational invalidation, a pipelined op-message wire connection with
//! per-operation deadlines, logical server sessions with causal-consistency
//! bookkeeping, and the command-monitoring event surface. Public CRUD
//! builders, codecs, and cursors are out of scope and live in higher layers.

#![warn(rust_2018_idioms)]
#![allow(clippy::derive_partial_eq_without_eq)]

pub mod auth;
mod bson_util;
pub(crate) mod compression;
mod conn;
pub mod error;
pub mod event;
mod executor;
mod handshake;
pub mod operation;
pub mod options;
mod pool;
pub(crate) mod runtime;
pub mod session;
pub mod sync;

pub use crate::compression::Compressor;
pub(crate) use crate::conn::wire::next_request_id;
pub use crate::{
    conn::{
        Command, CommandResponse, ConnectionDescription, ConnectionInfo, InternalConnection,
        PooledConnection,
    },
    error::{Error, Result},
    executor::CommandExecutor,
    handshake::{metadata::ClientMetadata, HandshakerOptions},
    operation::OperationContext,
    pool::{ConnectionPool, ConnectionPoolOptions, EstablisherOptions, PoolGenerationSubscriber},
    session::{
        ClientSession, ClusterClock, ClusterTime, ServerSession, ServerSessionPool,
        TransactionContext,
    },
};
