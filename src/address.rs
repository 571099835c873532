//! Bluetooth device addresses and resolvable private address generation.

use std::fmt::{Debug, Display, Formatter};

use async_trait::async_trait;
use rand::RngCore;

/// A 6-byte Bluetooth device address, stored in the same byte order it
/// travels on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RawAddress {
    pub val: [u8; 6],
}

impl RawAddress {
    pub const EMPTY: RawAddress = RawAddress { val: [0; 6] };

    pub fn is_empty(&self) -> bool {
        self.val == [0; 6]
    }
}

impl Display for RawAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.val[0], self.val[1], self.val[2], self.val[3], self.val[4], self.val[5]
        )
    }
}

impl Debug for RawAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// Source of fresh resolvable private addresses.
///
/// Address generation is asynchronous because the production generator
/// derives the hash part with controller assistance. The manager only ever
/// asks for a new address; resolution is a peer-side concern.
#[async_trait]
pub trait RpaGenerator: Send + Sync {
    async fn generate_rpa(&self) -> RawAddress;
}

/// Host-software generator. Produces addresses in resolvable format (top
/// two bits of the most significant byte set to 0b01) from the system RNG.
#[derive(Default)]
pub struct SoftwareRpaGenerator;

#[async_trait]
impl RpaGenerator for SoftwareRpaGenerator {
    async fn generate_rpa(&self) -> RawAddress {
        let mut val = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut val);
        val[0] = (val[0] & 0x3f) | 0x40;
        RawAddress { val }
    }
}
