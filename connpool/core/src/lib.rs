//! Connpool Core - Route-Partitioned Connection Pooling for HTTP/1.x Clients
//!
//! This crate provides the connection-management and message-framing core of
//! a blocking HTTP/1.x client: a capacity-bounded pool of reusable
//! connections keyed by destination route, and the byte-exact body framing
//! that decides when a response is complete and its connection can go back
//! to the pool.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Request Executor                         │
//! └──────┬─────────────────────────────┬─────────────────────────────┘
//!        │ acquire(route, wait)        │ ResponseHead + RequestContext
//!        ▼                             ▼
//! ┌──────────────────────┐     ┌──────────────────────────────────────┐
//! │  ConnectionManager   │     │               policy                 │
//! │  ┌────────────────┐  │     │  framing + keep-alive disposition    │
//! │  │ free lists     │  │     └──────────────────┬───────────────────┘
//! │  │ per route (MRU)│  │                        ▼
//! │  ├────────────────┤  │     ┌──────────────────────────────────────┐
//! │  │ FIFO waiters   │  │◄────┤            ResponseBody              │
//! │  │ route + global │  │     │  AutoReleaseReader<FramedBody<..>>   │
//! │  └────────────────┘  │     │  chunked │ length │ until-close      │
//! └──────────┬───────────┘     └──────────────────────────────────────┘
//!            │ open (outside the lock)
//!            ▼
//!     TransportFactory ──► Transport (TCP or caller supplied)
//! ```
//!
//! # Key Types
//!
//! - [`PoolingConnectionManager`]: bounded, route-partitioned pool
//! - [`SingleConnectionManager`]: single reusable connection
//! - [`Connection`]: a leased, route-bound connection handle
//! - [`Route`]: destination key (host, port, proxy, scheme)
//! - [`ResponseBody`]: framed body that releases its connection exactly once
//! - [`ChunkedEncoder`] / [`ChunkedDecoder`]: chunked transfer coding
//! - [`ContentLengthReader`]: Content-Length delimited bodies
//!
//! # Quick Start
//!
//! ```no_run
//! use std::io::{Read, Write};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use connpool_core::{
//!     ConnectionManager, PoolConfig, PoolingConnectionManager, RequestContext, ResponseBody,
//!     ResponseHead, Route, TcpTransportFactory, WaitPolicy,
//! };
//!
//! let manager: Arc<dyn ConnectionManager> =
//!     Arc::new(PoolingConnectionManager::new(PoolConfig::default()));
//! let route = Route::http("example.com", 80);
//!
//! let mut connection = manager.acquire_connected(
//!     &route,
//!     WaitPolicy::from_millis(5_000),
//!     &TcpTransportFactory::new(),
//!     Duration::from_secs(10),
//! )?;
//! connection.write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")?;
//!
//! let head = ResponseHead::read_from(&mut connection)?;
//! let ctx = RequestContext::for_route("GET", &route);
//! let mut body = ResponseBody::new(connection, &head, &ctx, Arc::clone(&manager));
//! let mut text = String::new();
//! body.read_to_string(&mut text)?; // connection is back in the pool here
//! # Ok::<(), connpool_core::Error>(())
//! ```
//!
//! # Module Overview
//!
//! - [`route`]: destination routes
//! - [`connection`]: connections, transports and transport factories
//! - [`pool`]: connection managers, wait policies, registry and reaper
//! - [`framing`]: line/header parsing, chunked, length and auto-release readers
//! - [`policy`]: body framing and keep-alive decisions
//! - [`body`]: response bodies wired to a manager
//! - [`config`]: pool configuration, TOML loading and environment overrides
//! - [`error`]: error types

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod body;
pub mod config;
pub mod connection;
pub mod error;
pub mod framing;
pub mod policy;
pub mod pool;
pub mod route;

// Re-exports for convenience
pub use body::{FramedBody, ResponseBody};
pub use connection::{
    Connection, ConnectionId, ConnectionState, ManagerId, TcpTransport, TcpTransportFactory,
    Transport, TransportFactory,
};
pub use error::{ConnectError, Error, FramingError, PoolError, Result};
pub use route::{ProxyHop, Route};

// Framing exports
pub use framing::{
    AutoReleaseReader, ChunkedDecoder, ChunkedEncoder, ContentLengthReader, Header, ReleaseOutcome,
};

// Policy exports
pub use policy::{BodyFraming, Disposition, HttpVersion, RequestContext, ResponseHead};

// Pool exports
pub use pool::{
    ConnectionManager, IdleConnectionReaper, InterruptToken, ManagerRegistry, PoolStats,
    PoolingConnectionManager, ReaperSettings, RouteStats, SingleConnectionManager, WaitPolicy,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, load_config_with_overrides,
    ConfigError, ConfigOverrides, ConfigSource, LoadedConfig, PoolConfig, PoolToml, RouteLimit,
};
