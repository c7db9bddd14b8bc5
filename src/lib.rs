//! STUN (Session Traversal Utilities for NAT, RFC 5389) client core.
//!
//! Three layers build on each other:
//!
//! - [`Message`] and the typed attribute codecs: bit-exact
//!   encode/decode of the 20-byte header and TLV attributes, including
//!   the XOR address obfuscation keyed by the magic cookie and the
//!   transaction ID.
//! - [`Agent`]: the transaction registry that matches responses to
//!   requests and expires the ones whose deadline passed.
//! - [`Client`]: binds an injectable [`Connection`] to the agent, runs
//!   the background reader and collector, and retransmits requests on
//!   exponential intervals until a response arrives or the send budget
//!   runs out.
//!
//! ```no_run
//! use std::sync::Arc;
//! use stun_client::{Client, ClientOptions, Event, Message};
//!
//! # async fn run() -> stun_client::StunResult<()> {
//! let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
//! socket.connect("203.0.113.9:3478").await?;
//!
//! let client = Client::new(ClientOptions {
//!     connection: Some(Arc::new(socket)),
//!     ..Default::default()
//! })?;
//!
//! let mut request = Message::new();
//! request.add_software("stun-client")?;
//! request.write_header();
//!
//! if let Event::Success { message, .. } = client.request(&request).await? {
//!     println!("mapped address: {}", message.get_xor_mapped_address()?);
//! }
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod attributes;
pub mod client;
pub mod clock;
pub mod error;
pub mod message;

pub use agent::{Agent, ClientAgent, Event, Handler};
pub use attributes::{AttributeType, Attributes, RawAttribute, MAX_SOFTWARE_LEN};
pub use client::{
    Client, ClientOptions, Connection, DEFAULT_MAX_ATTEMPTS, DEFAULT_RTO, DEFAULT_TIMEOUT_RATE,
};
pub use clock::{Clock, SystemClock};
pub use error::{StunError, StunResult};
pub use message::{
    Message, MessageClass, MessageType, Method, TransactionId, HEADER_SIZE, MAGIC_COOKIE,
    TRANSACTION_ID_SIZE,
};
