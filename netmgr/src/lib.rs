#![cfg_attr(docsrs, feature(doc_cfg))]

//! # netmgr - single-threaded readiness-polling network layer
//!
//! netmgr drives non-blocking TCP/UDP sockets from one
//! [`NetManager::process`] call that the embedding application makes once
//! per iteration of its own main loop. On top of the manager sit
//! asynchronous name resolution, a client connection state machine that
//! walks every resolved address, and a listener that binds every wildcard
//! address of a service.
//!
//! ## Features
//! - **One entry point**: readiness, timers, resolver results and deferred
//!   callbacks are all dispatched from [`NetManager::process`].
//! - **Never re-entrant by surprise**: close callbacks and lookup results
//!   are delivered on a later pass, never inside the call that caused
//!   them.
//! - **Explicit ownership**: every handle is reference counted and closed
//!   by its owner; freeing something that still holds resources panics.
//!
//! *Note:* everything here is single-threaded. Handles are `!Send`; only
//! [`Waker`] crosses threads.
//!
//! ## Platform support
//!
//! | Platform   | Backend                        | Model         |
//! |------------|--------------------------------|---------------|
//! | Linux      | `select(2)` (default), `epoll` | poll set      |
//! | Other Unix | `select(2)`                    | poll set      |
//! | Windows    | `WSAEventSelect`               | event objects |
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use netmgr::{ConnectFlags, NetManager, Protocol, connect_host_by_name};
//!
//! fn main() -> std::io::Result<()> {
//!   let manager = NetManager::init();
//!
//!   let _state = connect_host_by_name(
//!     &manager,
//!     "example.org",
//!     "80",
//!     Protocol::Tcp,
//!     &ConnectFlags::default(),
//!     |state, nd, peer| {
//!       println!("connected to {peer}");
//!       state.close();
//!       nd.close();
//!     },
//!     |state, err| {
//!       eprintln!("giving up: {err}");
//!       state.close();
//!     },
//!   )?;
//!
//!   loop {
//!     let mut timeout = Duration::from_millis(100);
//!     manager.process(&mut timeout)?;
//!   }
//! }
//! ```
//!
//! ## Error Handling
//!
//! Socket-level calls return [`std::io::Result`] with the native error
//! code. Asynchronous outcomes come back through exactly one of two
//! callbacks per operation, with [`ConnectError`], [`ListenError`] or
//! [`ResolveError`]. Contract violations (closing twice, freeing an
//! unclosed state, a callback that doesn't close what it was handed)
//! panic.

#[macro_use]
mod macros;

pub mod connect;
mod descriptor;
pub mod errors;
pub mod listen;
pub mod manager;
mod net_utils;
pub mod resolve;
pub mod socket;

#[doc(hidden)]
pub mod test_utils;

pub use connect::{ConnectFlags, ConnectPhase, ConnectState, connect_host_by_name};
pub use descriptor::NetDescriptor;
pub use errors::{
  ConnectError, ListenError, NewDescriptorError, ResolveError, TryInitError,
};
pub use listen::{ListenFlags, ListenPhase, ListenState, listen_port};
pub use manager::{
  AlarmId, Backend, CallbackId, Interest, NetManager, NetManagerConfig, Waker,
};
pub use resolve::{
  AddrInfo, AddrInfoHints, AddrInfoList, ResolveFlags, ResolveMode,
  ResolvePhase, ResolveState, get_addr_info_async, split_addr_info_on_family,
};
pub use socket::{Protocol, ProtocolFamily, Socket, SocketType};
