// src/error.rs
//! Error types shared by the codec, the agent and the client.

use std::io;

use thiserror::Error;

/// Result type for STUN operations.
pub type StunResult<T> = Result<T, StunError>;

/// Errors produced by the message codec, the transaction agent and the
/// client lifecycle.
#[derive(Error, Debug)]
pub enum StunError {
    /// `ClientOptions.connection` was not set.
    #[error("no connection provided")]
    NoConnection,

    /// The client is closed.
    #[error("client is closed")]
    ClientClosed,

    /// The client lost its internal delivery machinery before the
    /// transaction resolved.
    #[error("client not initialized")]
    ClientNotInitialized,

    /// The agent is closed.
    #[error("agent is closed")]
    AgentClosed,

    /// A transaction with the same ID is already registered.
    #[error("transaction exists with same id")]
    TransactionExists,

    /// No transaction is registered under the given ID.
    #[error("transaction not exists")]
    TransactionNotExists,

    /// The transaction was stopped before it resolved.
    #[error("transaction is stopped")]
    TransactionStopped,

    /// The transaction deadline passed without a response.
    #[error("transaction is timed out")]
    TransactionTimedOut,

    /// The requested attribute is not present in the message.
    #[error("attribute not found")]
    AttributeNotFound,

    /// An attribute payload has an invalid size.
    #[error("attribute size is invalid")]
    AttributeSizeInvalid,

    /// An address attribute carries a payload that matches neither the
    /// IPv4 nor the IPv6 layout.
    #[error("invalid length of IP value")]
    BadIpLength,

    /// Header bytes 4..8 do not contain the magic cookie.
    #[error("magic cookie check failed")]
    InvalidMagicCookie,

    /// The two most significant bits of the message type are not zero.
    #[error("invalid message type")]
    InvalidMessageType,

    /// Transport I/O failure.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// Stopping a transaction failed while handling `cause`.
    #[error("error while stopping due to {cause}: {err}")]
    Stop {
        err: Box<StunError>,
        cause: Box<StunError>,
    },

    /// Client shutdown failed in the agent, the connection, or both.
    #[error("failed to close: agent: {agent:?}, connection: {connection:?}")]
    Close {
        agent: Option<Box<StunError>>,
        connection: Option<Box<StunError>>,
    },
}
