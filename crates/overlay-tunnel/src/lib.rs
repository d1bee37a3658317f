//! overlay-tunnel: the WebSocket + yamux tunnel plane (§4.5, §9).
//!
//! Layers, bottom to top: [`ws`] dials/accepts the WebSocket and adapts
//! it to a plain byte stream; [`mux`] layers yamux logical streams over
//! that byte stream; [`bind`] runs the symmetric toLocal/toRemote
//! handlers that splice those logical streams into the Intranet;
//! [`agent_client`] fetches a peer's declared agent URL over a logical
//! stream; [`backoff`] is the forever-retry helper Access/Relay use to
//! keep re-dialing a Hub.

pub mod agent_client;
pub mod backoff;
pub mod bind;
pub mod mux;
pub mod ws;

pub use agent_client::fetch_agent_url;
pub use backoff::retry_forever;
pub use bind::{bind, Policy};
pub use mux::{new_session, MuxStream, SessionAccept, SessionControl};
pub use ws::{connect_client, from_raw_socket, wrap_as_byte_stream};
