//! Persistent configuration: checksum-protected blocks and the device table.
//!
//! Every device owns one block of [`CONFIG_BLOCK_SIZE`] bytes keyed by its id.
//! Byte 0 holds the 8-bit wrapping sum of the remaining bytes, the first ten
//! bytes are reserved and device fields start at [`CONFIG_FIELDS_OFFSET`].
//! Key 0 holds the device table, a list of ids with their enabled flag.

use crate::device::{DeviceId, ParamText};
use heapless::FnvIndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CONFIG_BLOCK_SIZE: usize = 512;
pub const CONFIG_FIELDS_OFFSET: usize = 10;
pub const CHECKSUM_OFFSET: usize = 0;

pub const DEVICE_TABLE_KEY: u16 = 0;
pub const DEVICE_TABLE_MARKER: u16 = 0xcafe;
pub const DEVICE_TABLE_ENTRIES: usize = 63;
pub const DEVICE_ENABLED_FLAG: u16 = 0x8000;

/// Blocks a [`MemoryStore`] can hold. Must be a power of two.
pub const MEMORY_STORE_BLOCKS: usize = 32;

pub type ConfigBlock = [u8; CONFIG_BLOCK_SIZE];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("configuration store is full")]
    Full,
    #[error("block {key:#06x} has {len} bytes, expected {}", CONFIG_BLOCK_SIZE)]
    BlockSize { key: u16, len: usize },
    #[error("device table is full")]
    TableFull,
    #[error("snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration stored for {0:#06x}")]
    Missing(u16),
    #[error("checksum mismatch in block {key:#06x}: stored {stored:#04x}, computed {computed:#04x}")]
    ChecksumMismatch { key: u16, stored: u8, computed: u8 },
    #[error("offset {0} is outside the configuration block")]
    OutOfBounds(usize),
    #[error("invalid value '{value}' for parameter {key}")]
    InvalidValue { key: ParamText, value: ParamText },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Key/value block storage, the board's EEPROM.
pub trait ConfigStore {
    fn load_block(&self, key: u16) -> Option<ConfigBlock>;
    fn store_block(&mut self, key: u16, block: &ConfigBlock) -> Result<(), StoreError>;
}

/// 8-bit wrapping sum over everything but the checksum byte.
pub fn compute_checksum(block: &ConfigBlock) -> u8 {
    block[CHECKSUM_OFFSET + 1..].iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Typed access to one device's configuration block.
#[derive(Debug, Clone)]
pub struct PrefHandler {
    key: u16,
    block: ConfigBlock,
}

impl PrefHandler {
    pub fn new(key: u16) -> Self {
        Self { key, block: [0; CONFIG_BLOCK_SIZE] }
    }

    /// Load and validate the block stored under `key`.
    pub fn load(store: &dyn ConfigStore, key: u16) -> Result<Self, ConfigError> {
        let block = store.load_block(key).ok_or(ConfigError::Missing(key))?;
        let prefs = Self { key, block };
        let computed = compute_checksum(&prefs.block);
        let stored = prefs.block[CHECKSUM_OFFSET];
        if stored != computed {
            return Err(ConfigError::ChecksumMismatch { key, stored, computed });
        }
        Ok(prefs)
    }

    pub fn key(&self) -> u16 {
        self.key
    }

    pub fn read_u8(&self, offset: usize) -> Result<u8, ConfigError> {
        Ok(self.field::<1>(offset)?[0])
    }

    pub fn read_u16(&self, offset: usize) -> Result<u16, ConfigError> {
        Ok(u16::from_le_bytes(self.field::<2>(offset)?))
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, ConfigError> {
        Ok(u32::from_le_bytes(self.field::<4>(offset)?))
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) -> Result<(), ConfigError> {
        self.write_bytes(offset, &[value])
    }

    pub fn write_u16(&mut self, offset: usize, value: u16) -> Result<(), ConfigError> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<(), ConfigError> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn checksum_valid(&self) -> bool {
        self.block[CHECKSUM_OFFSET] == compute_checksum(&self.block)
    }

    pub fn save_checksum(&mut self) {
        self.block[CHECKSUM_OFFSET] = compute_checksum(&self.block);
    }

    /// Update the checksum and write the block back.
    pub fn save(&mut self, store: &mut dyn ConfigStore) -> Result<(), StoreError> {
        self.save_checksum();
        store.store_block(self.key, &self.block)
    }

    pub fn block(&self) -> &ConfigBlock {
        &self.block
    }

    fn field<const N: usize>(&self, offset: usize) -> Result<[u8; N], ConfigError> {
        self.block
            .get(offset..offset + N)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(ConfigError::OutOfBounds(offset))
    }

    fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<(), ConfigError> {
        if offset < CONFIG_FIELDS_OFFSET {
            return Err(ConfigError::OutOfBounds(offset));
        }
        let target = self
            .block
            .get_mut(offset..offset + bytes.len())
            .ok_or(ConfigError::OutOfBounds(offset))?;
        target.copy_from_slice(bytes);
        Ok(())
    }
}

/// A device configuration record with a fixed block layout.
pub trait PersistentConfig: Default {
    fn read(prefs: &PrefHandler) -> Result<Self, ConfigError>;
    fn write(&self, prefs: &mut PrefHandler) -> Result<(), ConfigError>;
}

/// Load the configuration of `id`, falling back to (and persisting) defaults
/// when the block is missing or corrupt.
pub fn load_or_default<C: PersistentConfig>(store: &mut dyn ConfigStore, id: DeviceId) -> C {
    match PrefHandler::load(store, id.0).and_then(|prefs| C::read(&prefs)) {
        Ok(config) => config,
        Err(err) => {
            info!(device = %id, "{}, using default configuration", err);
            let config = C::default();
            if let Err(err) = save_config(store, id, &config) {
                warn!(device = %id, "unable to store default configuration: {}", err);
            }
            config
        }
    }
}

pub fn save_config<C: PersistentConfig>(
    store: &mut dyn ConfigStore,
    id: DeviceId,
    config: &C,
) -> Result<(), ConfigError> {
    let mut prefs = PrefHandler::load(store, id.0).unwrap_or_else(|_| PrefHandler::new(id.0));
    config.write(&mut prefs)?;
    prefs.save(store)?;
    debug!(device = %id, "configuration saved");
    Ok(())
}

/// Registered devices and whether each one is enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTable {
    entries: heapless::Vec<(DeviceId, bool), DEVICE_TABLE_ENTRIES>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when the store was never initialized (no marker).
    pub fn load(store: &dyn ConfigStore) -> Option<Self> {
        store.load_block(DEVICE_TABLE_KEY).and_then(|block| Self::decode(&block))
    }

    pub fn save(&self, store: &mut dyn ConfigStore) -> Result<(), StoreError> {
        store.store_block(DEVICE_TABLE_KEY, &self.encode())
    }

    pub fn decode(block: &ConfigBlock) -> Option<Self> {
        let marker = u16::from_le_bytes([block[0], block[1]]);
        if marker != DEVICE_TABLE_MARKER {
            return None;
        }

        let mut table = Self::new();
        for raw in block[2..2 + DEVICE_TABLE_ENTRIES * 2].chunks_exact(2) {
            let raw = u16::from_le_bytes([raw[0], raw[1]]);
            let id = raw & !DEVICE_ENABLED_FLAG;
            if id == 0 {
                continue;
            }
            // 63 slots in the block, 63 entries in the table
            let _ = table.entries.push((DeviceId(id), raw & DEVICE_ENABLED_FLAG != 0));
        }
        Some(table)
    }

    pub fn encode(&self) -> ConfigBlock {
        let mut block = [0u8; CONFIG_BLOCK_SIZE];
        block[0..2].copy_from_slice(&DEVICE_TABLE_MARKER.to_le_bytes());
        for (i, (id, enabled)) in self.entries.iter().enumerate() {
            let raw = if *enabled { id.0 | DEVICE_ENABLED_FLAG } else { id.0 };
            block[2 + i * 2..4 + i * 2].copy_from_slice(&raw.to_le_bytes());
        }
        block
    }

    pub fn is_enabled(&self, id: DeviceId) -> Option<bool> {
        self.entries.iter().find(|(entry, _)| *entry == id).map(|(_, enabled)| *enabled)
    }

    pub fn set_enabled(&mut self, id: DeviceId, enabled: bool) -> Result<(), StoreError> {
        if let Some(entry) = self.entries.iter_mut().find(|(entry, _)| *entry == id) {
            entry.1 = enabled;
            return Ok(());
        }
        self.entries.push((id, enabled)).map_err(|_| StoreError::TableFull)
    }

    pub fn entries(&self) -> &[(DeviceId, bool)] {
        &self.entries
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredBlock {
    key: u16,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    blocks: Vec<StoredBlock>,
}

/// RAM-backed [`ConfigStore`], optionally seeded from a JSON snapshot.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: FnvIndexMap<u16, ConfigBlock, MEMORY_STORE_BLOCKS>,
    writes: u32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        let snapshot: Snapshot = serde_json::from_str(json)?;
        let mut store = Self::new();
        for stored in snapshot.blocks {
            let block: ConfigBlock = stored
                .data
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::BlockSize { key: stored.key, len: stored.data.len() })?;
            store.blocks.insert(stored.key, block).map_err(|_| StoreError::Full)?;
        }
        Ok(store)
    }

    pub fn to_json(&self) -> Result<String, StoreError> {
        let snapshot = Snapshot {
            blocks: self
                .blocks
                .iter()
                .map(|(key, block)| StoredBlock { key: *key, data: block.to_vec() })
                .collect(),
        };
        Ok(serde_json::to_string(&snapshot)?)
    }

    /// Flip one byte of a block without fixing its checksum.
    pub fn corrupt(&mut self, key: u16, offset: usize) -> bool {
        match self.blocks.get_mut(&key).and_then(|block| block.get_mut(offset)) {
            Some(byte) => {
                *byte ^= 0xff;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn writes(&self) -> u32 {
        self.writes
    }
}

impl ConfigStore for MemoryStore {
    fn load_block(&self, key: u16) -> Option<ConfigBlock> {
        self.blocks.get(&key).copied()
    }

    fn store_block(&mut self, key: u16, block: &ConfigBlock) -> Result<(), StoreError> {
        self.blocks.insert(key, *block).map_err(|_| StoreError::Full)?;
        self.writes = self.writes.wrapping_add(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Sample {
        pin: u8,
        factor: u16,
    }

    impl PersistentConfig for Sample {
        fn read(prefs: &PrefHandler) -> Result<Self, ConfigError> {
            Ok(Self { pin: prefs.read_u8(10)?, factor: prefs.read_u16(11)? })
        }

        fn write(&self, prefs: &mut PrefHandler) -> Result<(), ConfigError> {
            prefs.write_u8(10, self.pin)?;
            prefs.write_u16(11, self.factor)
        }
    }

    #[test]
    fn test_checksum_round_trip() {
        let mut store = MemoryStore::new();
        let mut prefs = PrefHandler::new(0x5003);
        prefs.write_u16(10, 0x1234).unwrap();
        prefs.save(&mut store).unwrap();

        let loaded = PrefHandler::load(&store, 0x5003).unwrap();
        assert!(loaded.checksum_valid());
        assert_eq!(loaded.read_u16(10).unwrap(), 0x1234);
    }

    #[test]
    fn test_corrupt_block_is_rejected() {
        let mut store = MemoryStore::new();
        PrefHandler::new(7).save(&mut store).unwrap();
        assert!(store.corrupt(7, 42));
        assert!(matches!(PrefHandler::load(&store, 7), Err(ConfigError::ChecksumMismatch { key: 7, .. })));
    }

    #[test]
    fn test_header_bytes_are_reserved() {
        let mut prefs = PrefHandler::new(1);
        assert!(matches!(prefs.write_u8(3, 1), Err(ConfigError::OutOfBounds(3))));
        assert!(matches!(prefs.write_u32(CONFIG_BLOCK_SIZE - 2, 1), Err(ConfigError::OutOfBounds(_))));
    }

    #[test]
    fn test_load_or_default_persists_defaults() {
        let mut store = MemoryStore::new();
        let id = DeviceId(0x5004);
        let config: Sample = load_or_default(&mut store, id);
        assert_eq!(config, Sample::default());
        // defaults were written back with a valid checksum
        assert!(PrefHandler::load(&store, id.0).is_ok());

        save_config(&mut store, id, &Sample { pin: 9, factor: 450 }).unwrap();
        let config: Sample = load_or_default(&mut store, id);
        assert_eq!(config, Sample { pin: 9, factor: 450 });
    }

    #[test]
    fn test_device_table_encoding() {
        let mut table = DeviceTable::new();
        table.set_enabled(DeviceId(0x5001), true).unwrap();
        table.set_enabled(DeviceId(0x5003), false).unwrap();

        let block = table.encode();
        assert_eq!(&block[0..2], &[0xfe, 0xca]);
        assert_eq!(u16::from_le_bytes([block[2], block[3]]), 0xd001);
        assert_eq!(u16::from_le_bytes([block[4], block[5]]), 0x5003);

        let decoded = DeviceTable::decode(&block).unwrap();
        assert_eq!(decoded, table);
        assert_eq!(decoded.is_enabled(DeviceId(0x5001)), Some(true));
        assert_eq!(decoded.is_enabled(DeviceId(0x5003)), Some(false));
        assert_eq!(decoded.is_enabled(DeviceId(0x5002)), None);
    }

    #[test]
    fn test_missing_marker_means_uninitialized() {
        let block = [0u8; CONFIG_BLOCK_SIZE];
        assert!(DeviceTable::decode(&block).is_none());
    }

    #[test]
    fn test_json_snapshot() {
        let mut store = MemoryStore::new();
        let mut prefs = PrefHandler::new(0x5005);
        prefs.write_u16(10, 270).unwrap();
        prefs.save(&mut store).unwrap();

        let json = store.to_json().unwrap();
        let restored = MemoryStore::from_json(&json).unwrap();
        assert_eq!(PrefHandler::load(&restored, 0x5005).unwrap().read_u16(10).unwrap(), 270);

        let bad = r#"{"blocks":[{"key":1,"data":[1,2,3]}]}"#;
        assert!(matches!(MemoryStore::from_json(bad), Err(StoreError::BlockSize { key: 1, len: 3 })));
    }
}
