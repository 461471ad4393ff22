#![deny(unsafe_op_in_unsafe_fn)]
//! Single-threaded reactor with asynchronous TCP, UDP, TLS and DTLS
//! transports, plus files and directories served from the same loop.
//!
//! Everything created from an [`EventLoop`] lives on that loop's thread.
//! Callbacks run on the loop thread only; [`LoopRemote`] is the one handle
//! that may cross threads.
//!
//! ```rust,no_run
//! use horizon_io::{DataChunk, Endpoint, EventLoop, Transport, UdpPeer, UdpServer};
//!
//! let lp = EventLoop::new().unwrap();
//! let server = UdpServer::new(&lp);
//! server
//!     .start_receive(Endpoint::new("127.0.0.1", 9000), |peer: &UdpPeer, chunk: DataChunk| {
//!         peer.send(chunk.into_bytes());
//!     })
//!     .unwrap();
//! lp.run().unwrap();
//! ```

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub mod config;
        pub mod raw; // OS-level socket helpers
        pub mod error;
        pub mod endpoint;
        pub mod data_chunk;
        pub mod buffer_pool;
        mod user_data;
        pub mod removable;
        pub mod event_loop;
        pub mod timer;
        mod backlog;
        pub mod transport;
        pub mod tcp;
        pub mod tcp_server;
        pub mod udp;
        pub mod udp_server;
        pub mod secure;
        pub mod tls;
        pub mod dtls;
        pub mod fs;
    } else {
        compile_error!("horizon_io supports unix targets only");
    }
}

/// Convenience re-exports
pub use config::NetConfig;
pub use data_chunk::DataChunk;
pub use dtls::{DtlsClient, DtlsConnectedClient, DtlsServer};
pub use endpoint::Endpoint;
pub use error::{Error, StatusCode};
pub use event_loop::{CycleHandle, EventLoop, LoopRemote};
pub use fs::{Dir, DirectoryEntry, DirectoryEntryType, File};
pub use removable::{Removable, RemovalPhase};
pub use secure::{DtlsVersion, DtlsVersionRange, SecureContext, TlsVersion, TlsVersionRange};
pub use tcp::TcpClient;
pub use tcp_server::{TcpConnectedClient, TcpServer, DEFAULT_BACKLOG};
pub use timer::Timer;
pub use tls::{TlsClient, TlsConnectedClient, TlsServer};
pub use transport::Transport;
pub use udp::{SenderFilter, UdpClient};
pub use udp_server::{UdpPeer, UdpServer};
