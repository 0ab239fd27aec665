//! Servers and clients over a framed byte stream.
//!
//! Both ends are symmetric once connected: either side may host protocols,
//! call the other, and subscribe to the other's feeds.

pub mod client;
pub mod server;

use crate::protocol::{Protocol, RegistryError};
use std::collections::{hash_map::Entry, HashMap};

/// Adds a protocol to a builder's set, rejecting a reused id.
fn add_protocol(
    protocols: &mut HashMap<u64, Protocol>,
    protocol_id: u64,
    protocol: Protocol,
) -> Result<(), RegistryError> {
    match protocols.entry(protocol_id) {
        Entry::Occupied(_) => Err(RegistryError::ProtocolExists { protocol_id }),
        Entry::Vacant(slot) => {
            slot.insert(protocol);
            Ok(())
        }
    }
}
