#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::default_trait_access
    )
)]

//! Push Stream Client - Session Core
//!
//! A client library maintaining a long-lived, recoverable session with a
//! push server that delivers real-time data over a line-oriented text
//! protocol, carried on a persistent WebSocket or on HTTP
//! streaming/polling exchanges.
//!
//! # Layers (inside → outside)
//!
//! - **Session core**: the state machine of one session attempt, the
//!   transport-selection policy ("stream-sense"), and the manager driving
//!   creation, recovery and transport switches
//!   - `session`: session states, stream-sense, manager, retry backoff
//!   - `scheduler`: the single-threaded session task and the events task
//!
//! - **Domain managers**: long-lived state re-bound to each new session
//!   - `subscription`: subscriptions, COMMAND-mode rows, reconciliation
//!   - `message`: sequenced message pipeline with retry and discard
//!
//! - **Edges**: protocol text and byte transport
//!   - `protocol`: request encoding, notification decoding, escaping
//!   - `transport`: WebSocket and HTTP providers behind one contract
//!   - `client`: the public façade and listener traits
//!
//! # Data Flow
//!
//! ```text
//! application ──► PushClient ──► command queue ──┐
//!                                                ▼
//!                                        session thread
//!                                   (sessions, subs, messages)
//!                                     ▲               │
//!                    decoded lines ───┘               ▼
//!                  WS / HTTP transport ◄── encoded requests
//!
//!                 listener callbacks ◄── events thread
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use pushstream_client::{PushClient, Subscription, SubscriptionMode};
//!
//! # async fn example() -> Result<(), pushstream_client::ClientError> {
//! let client = PushClient::new("https://push.example.com", "DEMO")?;
//! let quotes = Subscription::with_item_list(
//!     SubscriptionMode::Merge,
//!     &["item1", "item2"],
//!     &["bid", "ask"],
//! )?;
//! client.subscribe(&quotes)?;
//! client.connect();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

/// Public façade and listener traits.
pub mod client;

/// Connection details and runtime options.
pub mod config;

/// Process-wide cookie storage and TLS policy.
pub mod environment;

/// Error taxonomy.
pub mod error;

/// Wire protocol codec.
pub mod protocol;

/// Subscriptions and item updates.
pub mod subscription;

/// Transport providers and their contracts.
pub mod transport;

pub(crate) mod message;
pub(crate) mod scheduler;
pub(crate) mod session;

pub use client::{
    ClientListener, ClientStatus, MessageListener, PushClient, SubscriptionListener,
};
pub use config::{ConnectionDetails, ConnectionOptions, ForcedTransport};
pub use environment::{EnvironmentConfig, TlsPolicy, configure};
pub use error::{ClientError, ServerError};
pub use subscription::{ItemUpdate, Subscription, SubscriptionMode, UpdateCommand};
