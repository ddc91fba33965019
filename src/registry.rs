//! Master side bookkeeping of known Slaves
//!
//! Two bounded tables: the last known function state per Slave address, and
//! the list of Slaves that completed the BiDi handshake.

use heapless::{LinearMap, Vec};

use crate::Error;

/// Maximum number of Slaves tracked by a Master
pub const MAX_SLAVES: usize = 16;

/// Known Slaves of one Master
pub struct Registry {
    functions: LinearMap<u8, u32, MAX_SLAVES>,
    bidi: Vec<u8, MAX_SLAVES>,
}

impl Registry {
    /// Create an empty registry
    pub const fn new() -> Self {
        Self {
            functions: LinearMap::new(),
            bidi: Vec::new(),
        }
    }

    /// Forget everything
    pub fn reset(&mut self) {
        self.functions.clear();
        self.bidi.clear();
    }

    /// Record a function change that was acknowledged by `address`
    ///
    /// Does nothing if the Slave is unknown and there is no room left.
    pub fn record_function(&mut self, address: u8, function: u8, on: bool) {
        let mask = 1u32 << (function & 0x1F);
        if let Some(bits) = self.functions.get_mut(&address) {
            if on {
                *bits |= mask;
            } else {
                *bits &= !mask;
            }
            return;
        }
        let bits = if on { mask } else { 0 };
        if self.functions.insert(address, bits).is_err() {
            susi_debug!("Function table full, not caching {=u8}", address);
        }
    }

    /// The last known state of `function` on `address`
    pub fn function(&self, address: u8, function: u8) -> bool {
        self.functions
            .get(&address)
            .map(|bits| (bits >> (function & 0x1F)) & 1 != 0)
            .unwrap_or(false)
    }

    /// Number of Slaves with a cached function state
    pub fn known_slaves(&self) -> usize {
        self.functions.len()
    }

    /// Add a BiDi capable Slave
    pub fn add_bidi(&mut self, address: u8) -> Result<(), Error> {
        if self.bidi.contains(&address) {
            return Err(Error::SlaveAlreadyExists);
        }
        self.bidi.push(address).map_err(|_| Error::SlaveListFull)
    }

    /// All BiDi capable Slaves, in handshake order
    pub fn bidi_slaves(&self) -> &[u8] {
        &self.bidi
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
