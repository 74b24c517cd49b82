//! # Codec
//!
//! The translation layer between frames and bytes, and between Rust argument
//! tuples and the positional `args` list of a `call`.
//!
//! ## Invariants
//! - Decoding never panics on foreign input; every path returns `Result`.
//! - An argument tuple `(a, b)` travels as `[a, b]`; `()` travels as `[]`.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Error;
use crate::error::Result;
use crate::frame::Message;

/// Encodes a frame into its JSON bytes.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    serde_json::to_vec(message).map_err(|e| Error::Encode(e.to_string()))
}

/// Decodes a frame from JSON bytes.
pub fn decode(bytes: &[u8]) -> Result<Message> {
    serde_json::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))
}

/// Flattens a Rust argument value into a positional argument list.
///
/// Tuples and sequences spread into the list, `()` becomes an empty list,
/// and any other value becomes a single argument.
pub fn to_args<A: Serialize>(args: &A) -> Result<Vec<Value>> {
    let value = serde_json::to_value(args).map_err(|e| Error::Convert(e.to_string()))?;
    Ok(match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    })
}

/// Reads a positional argument list back into a Rust value, usually a tuple.
pub fn from_args<A: DeserializeOwned>(args: Vec<Value>) -> Result<A> {
    let empty = args.is_empty();
    match serde_json::from_value(Value::Array(args)) {
        Ok(parsed) => Ok(parsed),
        // unit arguments are spelled `[]` on the wire but `null` in serde
        Err(_) if empty => from_value(Value::Null),
        Err(e) => Err(Error::Convert(e.to_string())),
    }
}

/// Reads a single JSON value into a Rust value.
pub fn from_value<R: DeserializeOwned>(value: Value) -> Result<R> {
    serde_json::from_value(value).map_err(|e| Error::Convert(e.to_string()))
}

/// Writes a Rust value as a single JSON value.
pub fn to_value<R: Serialize>(value: &R) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::Convert(e.to_string()))
}
