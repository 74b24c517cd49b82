//! # IsoWire
//!
//! The wire protocol spoken between isolated contexts.
//!
//! ## Architecture
//!
//! Every message is a JSON object with a `type` discriminator and a typed
//! payload. Contexts never share memory, so everything in here is plain,
//! structurally serializable data: no handles, no callbacks.
//!
//! - `ident`: service identifiers, roles, subscription keys.
//! - `frame`: the message kinds (`call`, `call-response`, `ping`, ...).
//! - `error`: protocol errors and the serialized form of remote failures.
//! - `codec`: bytes in, bytes out, plus argument list helpers.

pub mod codec;
pub mod error;
pub mod frame;
pub mod ident;

pub use codec::decode;
pub use codec::encode;
pub use codec::from_args;
pub use codec::from_value;
pub use codec::to_args;
pub use codec::to_value;
pub use error::Error;
pub use error::ErrorPayload;
pub use error::FaultKind;
pub use error::Result;
pub use frame::Complete;
pub use frame::Message;
pub use frame::MessageKind;
pub use frame::Ping;
pub use frame::Pong;
pub use frame::Request;
pub use frame::Response;
pub use frame::SubjectRef;
pub use frame::ValueUpdate;
pub use ident::Identifier;
pub use ident::Role;
pub use ident::subject_key;
