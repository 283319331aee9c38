//! The event names and payload types that we use. They are used consistent across
//! the server and the client.
//!
//! A message on the socket is a JSON object `{"event": <name>, "data": <payload>}`.
//! The inbound direction is modelled as one tagged enum ([`ClientEvent`]) so the
//! server dispatches on a closed vocabulary instead of raw strings; the outbound
//! direction ([`ServerEvent`]) mirrors that. Both sides also agree on the gameplay
//! constants in [`consts`] and the stable error codes in [`ErrorCode`].

pub mod consts;
pub mod error;
pub mod events;
pub mod wire;

pub use error::ErrorCode;
pub use events::{ClientEvent, RateLimit, ServerEvent};
