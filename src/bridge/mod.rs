//! Socket bridge between front-facing clients and worker servers
//!
//! - `socket`: listener setup, backend addresses, connects and stream types
//! - `stream_pump`: one direction of a splice
//! - `connection_pair`: a client/backend pair spliced in both directions
//! - `address_map`: backend-local address -> client address bookkeeping

pub mod address_map;
pub mod connection_pair;
pub mod socket;
pub mod stream_pump;

pub use address_map::{AddressLease, AddressMap, ProxySocketAddressInfo};
pub use connection_pair::{BridgeSettings, ConnectionPair, SpliceSummary};
pub use socket::{BackendAddress, ServiceListener, SocketStream};
pub use stream_pump::{Direction, StreamPump};
