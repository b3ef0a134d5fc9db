//! Reactor-pattern TCP networking for high-concurrency servers and clients.
//!
//! Each [`EventLoop`] multiplexes readiness events for many descriptors plus
//! cross-thread work items. [`Acceptor`], [`Connector`], and [`TcpServer`]
//! layer connection intake on top; [`Connection`] carries the per-socket
//! read/write pipeline with back-pressure, and [`TimingWheel`] expires idle
//! connections in O(1).

pub mod acceptor;
pub mod addr;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod event_loop;
pub mod logging;
pub mod selector;
pub mod server;
pub mod time;
pub mod timer;
pub mod wheel;

pub use acceptor::{Acceptor, NewConnectionCallback};
pub use buffer::{ByteBuffer, CircularBuffer};
pub use channel::{Channel, SelectionCallback};
pub use config::{Config, LogFormat, LoggingConfig, WorkerConfig};
pub use connection::{
    Connection, ConnectionCallback, EstablishedCallback, ReadMessageCallback, State,
};
pub use connector::{ConnectedCallback, Connector};
pub use error::Error;
pub use event_loop::{Callback, EventLoop};
pub use selector::{SelectionKey, Selector, OP_ERROR, OP_READ, OP_WRITE};
pub use server::TcpServer;
pub use time::Timestamp;
pub use timer::{Timer, TimerCallback};
pub use wheel::{ConnectionEntry, TimingWheel};
