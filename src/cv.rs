//! CV Store
//!
//! A small table of Configuration Variables, keyed by their wire address
//! (`cv - 1`). Every successful write is also forwarded to a [CvPersistence]
//! backend, using this layout:
//!
//! | offset                 | size            | contents                      |
//! | ---------------------- | --------------- | ----------------------------- |
//! | [MAGIC_OFFSET]         | 1               | [MAGIC]                       |
//! | [COUNT_OFFSET]         | 1               | number of entries             |
//! | [ENTRIES_OFFSET]       | 3 * [MAX_CVS]   | `(key: u16 LE, value: u8)`    |
//! | [BANK_SELECT_OFFSET]   | 1               | bank select register          |
//!
//! A few CVs are synthetic: they are answered from the Slave configuration
//! or live state instead of the table.

use heapless::Vec;

use crate::slave::SlaveConfig;

/// Maximum number of stored CVs
pub const MAX_CVS: usize = 32;

/// Size of one CV bank window, as transferred by a bank read
pub const BANK_WINDOW: usize = 40;

/// CV 897, the SUSI module number. Reads return the Slave address.
pub const CV_MODULE_NUMBER: u16 = 897 - 1;
/// CV 900, manufacturer ID, or hardware ID when the bank select register is 1
pub const CV_MANUFACTURER_ID: u16 = 900 - 1;
/// CV 901, version number
pub const CV_VERSION: u16 = 901 - 1;
/// CV 1020, the accumulated status bits
pub const CV_STATUS_BITS: u16 = 1020 - 1;
/// CV 1021, the CV banking selector
pub const CV_BANK_SELECT: u16 = 1021 - 1;

/// Marks an initialized persistence area
pub const MAGIC: u8 = 0xA5;
/// Offset of [MAGIC]
pub const MAGIC_OFFSET: usize = 0;
/// Offset of the entry count
pub const COUNT_OFFSET: usize = 1;
/// Offset of the first entry
pub const ENTRIES_OFFSET: usize = 2;
/// Size of one persisted entry
pub const ENTRY_SIZE: usize = 3;
/// Offset of the bank select register
pub const BANK_SELECT_OFFSET: usize = ENTRIES_OFFSET + MAX_CVS * ENTRY_SIZE;
/// Number of bytes used in the persistence area
pub const PERSIST_SIZE: usize = BANK_SELECT_OFFSET + 1;

/// A byte addressed, non-volatile store, such as an EEPROM
pub trait CvPersistence {
    /// Read one byte
    fn read_byte(&mut self, addr: usize) -> u8;

    /// Write one byte
    fn write_byte(&mut self, addr: usize, value: u8);

    /// Read `buf.len()` bytes starting at `addr`
    fn get(&mut self, addr: usize, buf: &mut [u8]) {
        buf.iter_mut()
            .enumerate()
            .for_each(|(i, b)| *b = self.read_byte(addr + i));
    }

    /// Write `data` starting at `addr`
    fn put(&mut self, addr: usize, data: &[u8]) {
        data.iter()
            .enumerate()
            .for_each(|(i, b)| self.write_byte(addr + i, *b));
    }
}

impl<T: CvPersistence + ?Sized> CvPersistence for &mut T {
    fn read_byte(&mut self, addr: usize) -> u8 {
        T::read_byte(self, addr)
    }

    fn write_byte(&mut self, addr: usize, value: u8) {
        T::write_byte(self, addr, value)
    }
}

/// RAM backed persistence, erased to `0xFF` like a fresh EEPROM
///
/// Useful for Slaves without non-volatile memory, and for testing.
pub struct RamPersistence<const N: usize = PERSIST_SIZE> {
    data: [u8; N],
}

impl<const N: usize> RamPersistence<N> {
    /// Create a new, erased store
    pub const fn new() -> Self {
        Self { data: [0xFF; N] }
    }

    /// Borrow the raw contents
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutably borrow the raw contents
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl<const N: usize> Default for RamPersistence<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> CvPersistence for RamPersistence<N> {
    fn read_byte(&mut self, addr: usize) -> u8 {
        self.data.get(addr).copied().unwrap_or(0xFF)
    }

    fn write_byte(&mut self, addr: usize, value: u8) {
        if let Some(b) = self.data.get_mut(addr) {
            *b = value;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct CvEntry {
    key: u16,
    value: u8,
}

/// The CV table of one Slave
pub struct CvStore<P: CvPersistence> {
    persist: P,
    entries: Vec<CvEntry, MAX_CVS>,
    bank_select: u8,
    status: u8,
    config: SlaveConfig,
}

impl<P: CvPersistence> CvStore<P> {
    /// Create a new, empty store
    ///
    /// Call [CvStore::load()] to restore persisted entries.
    pub fn new(persist: P, config: SlaveConfig) -> Self {
        Self {
            persist,
            entries: Vec::new(),
            bank_select: 0,
            status: 0,
            config,
        }
    }

    /// Restore all entries from the persistence backend
    ///
    /// An uninitialized or corrupt backend is reset to empty.
    pub fn load(&mut self) {
        if self.persist.read_byte(MAGIC_OFFSET) != MAGIC {
            susi_info!("No CV table found, initializing");
            self.reset();
            return;
        }
        let count = usize::from(self.persist.read_byte(COUNT_OFFSET));
        if count > MAX_CVS {
            susi_warn!("Corrupt CV count {=usize}, resetting", count);
            self.reset();
            return;
        }

        self.entries.clear();
        for i in 0..count {
            let mut raw = [0u8; ENTRY_SIZE];
            self.persist.get(ENTRIES_OFFSET + i * ENTRY_SIZE, &mut raw);
            let entry = CvEntry {
                key: u16::from_le_bytes([raw[0], raw[1]]),
                value: raw[2],
            };
            if self.entries.push(entry).is_err() {
                break;
            }
        }
        self.bank_select = self.persist.read_byte(BANK_SELECT_OFFSET);
        susi_debug!("Loaded {=usize} CVs", self.entries.len());
    }

    /// Erase all entries, in memory and in the backend
    pub fn reset(&mut self) {
        self.entries.clear();
        self.bank_select = 0;
        self.persist.write_byte(MAGIC_OFFSET, MAGIC);
        self.persist.write_byte(COUNT_OFFSET, 0);
        self.persist.write_byte(BANK_SELECT_OFFSET, 0);
    }

    /// Read the CV at wire address `key`
    ///
    /// Returns 0 for CVs that were never written.
    pub fn read(&self, key: u16) -> u8 {
        match key {
            CV_MODULE_NUMBER => self.config.address,
            CV_MANUFACTURER_ID => {
                let id = if self.bank_select == 1 {
                    self.config.hardware_id
                } else {
                    self.config.manufacturer_id
                };
                id.to_le_bytes()[0]
            }
            CV_VERSION => self.config.version.to_be_bytes()[0],
            CV_STATUS_BITS => self.status,
            CV_BANK_SELECT => self.bank_select,
            _ => self
                .entries
                .iter()
                .find(|e| e.key == key)
                .map(|e| e.value)
                .unwrap_or(0),
        }
    }

    /// Write the CV at wire address `key`
    ///
    /// Existing entries are updated in place. New entries are appended if
    /// there is room, and silently dropped otherwise. The read-only synthetic
    /// CVs ignore writes.
    pub fn write(&mut self, key: u16, value: u8) {
        match key {
            CV_BANK_SELECT => {
                self.set_bank_select(value);
                return;
            }
            CV_MODULE_NUMBER | CV_MANUFACTURER_ID | CV_VERSION | CV_STATUS_BITS => {
                susi_debug!("Ignoring write to read-only CV {=u16}", key + 1);
                return;
            }
            _ => {}
        }

        if let Some(idx) = self.entries.iter().position(|e| e.key == key) {
            self.entries[idx].value = value;
            self.persist_entry(idx);
            return;
        }

        if self.entries.push(CvEntry { key, value }).is_err() {
            susi_warn!("CV table full, dropping write to {=u16}", key);
            return;
        }
        let idx = self.entries.len() - 1;
        self.persist_entry(idx);
        self.persist
            .write_byte(COUNT_OFFSET, self.entries.len() as u8);
    }

    fn persist_entry(&mut self, idx: usize) {
        let e = self.entries[idx];
        let [lo, hi] = e.key.to_le_bytes();
        self.persist
            .put(ENTRIES_OFFSET + idx * ENTRY_SIZE, &[lo, hi, e.value]);
    }

    /// Fill `out` with bank window `bank`, starting at `bank * BANK_WINDOW`
    pub fn read_bank(&self, bank: u8, out: &mut [u8; BANK_WINDOW]) {
        let base = u16::from(bank) * BANK_WINDOW as u16;
        out.iter_mut()
            .enumerate()
            .for_each(|(i, b)| *b = self.read(base + i as u16));
    }

    /// The bank select register
    pub fn bank_select(&self) -> u8 {
        self.bank_select
    }

    /// Set the bank select register
    pub fn set_bank_select(&mut self, value: u8) {
        self.bank_select = value;
        self.persist.write_byte(BANK_SELECT_OFFSET, value);
    }

    /// OR `bits` into the status bits
    pub fn raise_status(&mut self, bits: u8) {
        self.status |= bits;
    }

    /// The current status bits
    pub fn status(&self) -> u8 {
        self.status
    }

    /// Take the current status bits, clearing them
    pub fn take_status(&mut self) -> u8 {
        core::mem::take(&mut self.status)
    }

    /// The Slave configuration used for synthetic CVs
    pub fn config(&self) -> &SlaveConfig {
        &self.config
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Are there no stored entries?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
