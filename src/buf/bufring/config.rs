use std::sync::Arc;

use super::{Bgid, MAX_RING_ENTRIES};
use crate::buf::{BufSource, HeapSource};
use crate::error::ConfigError;

/// Describes one buffer group: its id, how many slots it has, how long each slot is, where the
/// slot memory comes from, and an optional low watermark.
///
/// A `RingConfig` is immutable once built. Use [`RingConfig::builder`] to create one.
#[derive(Debug, Clone)]
pub struct RingConfig {
    bgid: Bgid,
    capacity: u16,
    slot_len: usize,
    source: Arc<dyn BufSource>,
    watermark: Option<u16>,
    notify_replenished: bool,
}

impl RingConfig {
    /// Shorthand for a ring of `capacity` slots of `slot_len` bytes from the heap.
    pub fn new(bgid: Bgid, capacity: u16, slot_len: usize) -> Result<RingConfig, ConfigError> {
        RingConfig::builder(bgid)
            .capacity(capacity)
            .slot_len(slot_len)
            .build()
    }

    /// Create a new builder with the given buffer group id and defaults.
    pub fn builder(bgid: Bgid) -> RingConfigBuilder {
        RingConfigBuilder::new(bgid)
    }

    pub fn bgid(&self) -> Bgid {
        self.bgid
    }

    /// Number of slots in the ring.
    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Byte length of every slot in the ring.
    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    pub fn source(&self) -> &Arc<dyn BufSource> {
        &self.source
    }

    pub fn watermark(&self) -> Option<u16> {
        self.watermark
    }

    pub fn notify_replenished(&self) -> bool {
        self.notify_replenished
    }

    /// The number of kernel ring entries backing this ring, the capacity rounded up to a power
    /// of two as the kernel requires.
    pub fn ring_entries(&self) -> u16 {
        self.capacity.next_power_of_two()
    }
}

/// Build the arguments to create a [`RingConfig`].
///
/// Refer to the methods descriptions for details.
#[derive(Debug, Clone)]
pub struct RingConfigBuilder {
    bgid: Bgid,
    capacity: u32,
    slot_len: usize,
    source: Option<Arc<dyn BufSource>>,
    watermark: Option<u16>,
    notify_replenished: bool,
}

impl RingConfigBuilder {
    /// Create a new builder with the given buffer group id and defaults.
    ///
    /// The user is responsible for picking a bgid that does not conflict with other buffer
    /// groups registered with the same engine.
    pub fn new(bgid: Bgid) -> RingConfigBuilder {
        RingConfigBuilder {
            bgid,
            capacity: 128,
            slot_len: 4096,
            source: None,
            watermark: None,
            notify_replenished: false,
        }
    }

    /// The number of slots to allocate. Defaults to 128.
    ///
    /// The kernel ring is sized to the next power of two, with a maximum of 2^15 (32768).
    pub fn capacity(mut self, capacity: u16) -> RingConfigBuilder {
        self.capacity = capacity as u32;
        self
    }

    /// The length of each slot. Defaults to 4096.
    pub fn slot_len(mut self, slot_len: usize) -> RingConfigBuilder {
        self.slot_len = slot_len;
        self
    }

    /// Where slot memory and fallback buffers are allocated from. Defaults to [`HeapSource`].
    pub fn source(mut self, source: Arc<dyn BufSource>) -> RingConfigBuilder {
        self.source = Some(source);
        self
    }

    /// Free slot count at or below which the ring proactively drains pending releases and
    /// reports [`super::RingEvent::LowWatermark`]. Must be below the capacity.
    pub fn watermark(mut self, watermark: u16) -> RingConfigBuilder {
        self.watermark = Some(watermark);
        self
    }

    /// Also report [`super::RingEvent::Replenished`] when an exhausted ring gets a slot back.
    pub fn notify_replenished(mut self, notify: bool) -> RingConfigBuilder {
        self.notify_replenished = notify;
        self
    }

    pub fn build(self) -> Result<RingConfig, ConfigError> {
        let RingConfigBuilder {
            bgid,
            capacity,
            slot_len,
            source,
            watermark,
            notify_replenished,
        } = self;

        if capacity == 0 || capacity > MAX_RING_ENTRIES {
            return Err(ConfigError::InvalidCapacity { bgid, capacity });
        }
        let capacity = capacity as u16;

        if slot_len == 0 || u32::try_from(slot_len).is_err() {
            return Err(ConfigError::InvalidSlotLength { bgid, slot_len });
        }

        if let Some(watermark) = watermark {
            if watermark >= capacity {
                return Err(ConfigError::InvalidWatermark {
                    bgid,
                    watermark,
                    capacity,
                });
            }
        }

        Ok(RingConfig {
            bgid,
            capacity,
            slot_len,
            source: source.unwrap_or_else(|| Arc::new(HeapSource)),
            watermark,
            notify_replenished,
        })
    }
}

/// The ordered set of rings attached to one engine before it starts.
///
/// Group ids are unique within the set.
#[derive(Debug, Clone, Default)]
pub struct EngineRingSet {
    configs: Vec<RingConfig>,
}

impl EngineRingSet {
    pub fn new() -> EngineRingSet {
        EngineRingSet::default()
    }

    /// Attach a ring. Fails if the set already holds a ring with the same group id.
    pub fn add(&mut self, config: RingConfig) -> Result<&mut EngineRingSet, ConfigError> {
        if self.contains(config.bgid()) {
            return Err(ConfigError::DuplicateGroup(config.bgid()));
        }
        self.configs.push(config);
        Ok(self)
    }

    pub fn contains(&self, bgid: Bgid) -> bool {
        self.configs.iter().any(|c| c.bgid() == bgid)
    }

    pub fn get(&self, bgid: Bgid) -> Option<&RingConfig> {
        self.configs.iter().find(|c| c.bgid() == bgid)
    }

    /// Configs in the order they were added.
    pub fn iter(&self) -> impl Iterator<Item = &RingConfig> {
        self.configs.iter()
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

impl IntoIterator for EngineRingSet {
    type Item = RingConfig;
    type IntoIter = std::vec::IntoIter<RingConfig>;

    fn into_iter(self) -> Self::IntoIter {
        self.configs.into_iter()
    }
}

impl<'a> IntoIterator for &'a EngineRingSet {
    type Item = &'a RingConfig;
    type IntoIter = std::slice::Iter<'a, RingConfig>;

    fn into_iter(self) -> Self::IntoIter {
        self.configs.iter()
    }
}
