use crate::config::{Config, ConfigError};
use crate::directory::DirLine;
use crate::{address, mem_event::MemEvent};
use std::sync::Arc;

/// A data-array slot. Slots are a separate, usually smaller, set-associative
/// array: a directory line with no slot is tracked but uncached.
#[derive(Debug, Default, Clone)]
pub struct DataSlot {
    /// Block address the bytes belong to, `None` when free.
    pub addr: Option<address>,
    /// Back reference to the directory line holding this slot.
    pub line: Option<usize>,
    pub bytes: Vec<u8>,
    pub last_access: u64,
}

/// Directory array plus data array, with lookup, replacement-candidate
/// selection and install/replace operations.
#[derive(Debug)]
pub struct CacheArray {
    config: Arc<Config>,
    lines: Vec<DirLine>,
    slots: Vec<DataSlot>,
    /// Monotonic access counter driving LRU ordering.
    clock: u64,
}

impl CacheArray {
    pub fn new(config: Arc<Config>) -> Result<Self, ConfigError> {
        config.validate()?;
        let lines = (0..config.dir_sets * config.dir_assoc)
            .map(|_| DirLine::default())
            .collect();
        let slots = (0..config.data_sets * config.data_assoc)
            .map(|_| DataSlot::default())
            .collect();
        Ok(Self {
            config,
            lines,
            slots,
            clock: 0,
        })
    }

    #[inline]
    #[must_use]
    fn dir_set(&self, addr: address) -> usize {
        let block = self.config.block_addr(addr);
        ((block >> self.config.line_size.trailing_zeros()) as usize) % self.config.dir_sets
    }

    #[inline]
    #[must_use]
    fn data_set(&self, addr: address) -> usize {
        let block = self.config.block_addr(addr);
        ((block >> self.config.line_size.trailing_zeros()) as usize) % self.config.data_sets
    }

    fn dir_set_range(&self, addr: address) -> std::ops::Range<usize> {
        let set = self.dir_set(addr);
        set * self.config.dir_assoc..(set + 1) * self.config.dir_assoc
    }

    fn data_set_range(&self, addr: address) -> std::ops::Range<usize> {
        let set = self.data_set(addr);
        set * self.config.data_assoc..(set + 1) * self.config.data_assoc
    }

    /// Find the directory line tracking `addr`. `update_replacement` bumps
    /// the LRU ordering of the line (and its data slot, if any); profiling
    /// lookups and replays pass `false`.
    pub fn lookup(&mut self, addr: address, update_replacement: bool) -> Option<usize> {
        let block = self.config.block_addr(addr);
        let idx = self
            .dir_set_range(addr)
            .find(|&i| self.lines[i].base_addr() == block)?;
        if update_replacement {
            self.clock += 1;
            self.lines[idx].last_access = self.clock;
            if let Some(slot) = self.lines[idx].data_slot {
                self.slots[slot].last_access = self.clock;
            }
        }
        Some(idx)
    }

    #[inline]
    #[must_use]
    pub fn line(&self, idx: usize) -> &DirLine {
        &self.lines[idx]
    }

    #[inline]
    #[must_use]
    pub fn line_mut(&mut self, idx: usize) -> &mut DirLine {
        &mut self.lines[idx]
    }

    /// Pick the directory line to give up for a new address: an invalid line
    /// if the set has one, the least recently used line otherwise.
    #[must_use]
    pub fn find_replacement_candidate(&self, addr: address) -> usize {
        let range = self.dir_set_range(addr);
        range
            .clone()
            .find(|&i| !self.lines[i].is_valid())
            .unwrap_or_else(|| {
                range
                    .min_by_key(|&i| self.lines[i].last_access)
                    .expect("directory set is never empty")
            })
    }

    /// Pick the data slot to give up for `addr`: a free slot if the data set
    /// has one (no victim line), otherwise the least recently used slot and
    /// the directory line it is bound to.
    #[must_use]
    pub fn find_data_victim(&self, addr: address) -> (usize, Option<usize>) {
        let range = self.data_set_range(addr);
        if let Some(free) = range.clone().find(|&i| self.slots[i].addr.is_none()) {
            return (free, None);
        }
        let victim = range
            .min_by_key(|&i| self.slots[i].last_access)
            .expect("data set is never empty");
        (victim, self.slots[victim].line)
    }

    /// Install `addr` at the replaced directory line. Any data slot the old
    /// line held is freed; `slot` optionally binds one to the new line.
    pub fn replace(&mut self, addr: address, idx: usize, slot: Option<usize>) {
        let block = self.config.block_addr(addr);
        log::trace!(
            "cache_array::replace(addr={block:#x}, evicting={:#x})",
            self.lines[idx].base_addr()
        );
        self.detach_data(idx);
        self.lines[idx].reset(block);
        self.clock += 1;
        self.lines[idx].last_access = self.clock;
        if let Some(slot) = slot {
            self.attach_data(idx, slot);
        }
    }

    /// Bind a data slot to a directory line, detaching it from whatever line
    /// held it before. The slot's previous bytes are dropped lazily here.
    pub fn attach_data(&mut self, idx: usize, slot: usize) {
        if let Some(prev) = self.slots[slot].line {
            self.lines[prev].data_slot = None;
        }
        self.detach_data(idx);
        self.slots[slot] = DataSlot {
            addr: Some(self.lines[idx].base_addr()),
            line: Some(idx),
            bytes: Vec::new(),
            last_access: self.clock,
        };
        self.lines[idx].data_slot = Some(slot);
    }

    /// Release the line's data slot back to the pool. The bytes survive in
    /// the slot until reallocation (lazy deallocation).
    pub fn detach_data(&mut self, idx: usize) {
        if let Some(slot) = self.lines[idx].data_slot.take() {
            self.slots[slot].addr = None;
            self.slots[slot].line = None;
        }
    }

    #[must_use]
    pub fn is_cached(&self, idx: usize) -> bool {
        self.lines[idx].data_slot.is_some()
    }

    #[must_use]
    pub fn data(&self, idx: usize) -> Option<&Vec<u8>> {
        let slot = self.lines[idx].data_slot?;
        Some(&self.slots[slot].bytes)
    }

    /// Write payload bytes into the line's data slot, if it has one.
    pub fn set_data(&mut self, idx: usize, bytes: &[u8]) -> bool {
        match self.lines[idx].data_slot {
            Some(slot) => {
                self.slots[slot].bytes = bytes.to_vec();
                true
            }
            None => false,
        }
    }

    /// Profiling helper: the line an incoming event refers to.
    #[must_use]
    pub fn lookup_for(&self, ev: &MemEvent) -> Option<&DirLine> {
        let block = self.config.block_addr(ev.base_addr);
        self.dir_set_range(ev.base_addr)
            .map(|i| &self.lines[i])
            .find(|line| line.base_addr() == block)
    }
}

#[cfg(test)]
mod tests {
    use super::CacheArray;
    use crate::config::Config;
    use crate::directory::State;
    use std::sync::Arc;

    fn small_array() -> CacheArray {
        let config = Config {
            dir_sets: 2,
            dir_assoc: 2,
            data_sets: 1,
            data_assoc: 2,
            line_size: 64,
            ..Config::default()
        };
        CacheArray::new(Arc::new(config)).unwrap()
    }

    #[test]
    fn install_then_lookup() {
        let mut array = small_array();
        let idx = array.find_replacement_candidate(0x40);
        array.replace(0x40, idx, None);
        assert_eq!(array.lookup(0x47, true), Some(idx));
        assert_eq!(array.line(idx).base_addr(), 0x40);
        assert!(!array.is_cached(idx));
    }

    #[test]
    fn candidate_prefers_invalid_lines() {
        let mut array = small_array();
        let a = array.find_replacement_candidate(0x40);
        array.replace(0x40, a, None);
        array.line_mut(a).set_state(State::S);
        // 0x140 maps to the same set (2 sets x 64B lines)
        let b = array.find_replacement_candidate(0x140);
        assert_ne!(a, b);
    }

    #[test]
    fn candidate_falls_back_to_lru() {
        let mut array = small_array();
        for addr in [0x40u64, 0x140] {
            let idx = array.find_replacement_candidate(addr);
            array.replace(addr, idx, None);
            array.line_mut(idx).set_state(State::S);
        }
        let old = array.lookup(0x40, false).unwrap();
        // touch 0x40 so 0x140 becomes least recently used
        array.lookup(0x140, true);
        array.lookup(0x40, true);
        let victim = array.find_replacement_candidate(0x240);
        assert_ne!(victim, old);
        assert_eq!(array.line(victim).base_addr(), 0x140);
    }

    #[test]
    fn data_slots_attach_and_steal() {
        let mut array = small_array();
        let a = array.find_replacement_candidate(0x40);
        array.replace(0x40, a, None);
        array.line_mut(a).set_state(State::S);

        let (slot, victim) = array.find_data_victim(0x40);
        assert!(victim.is_none());
        array.attach_data(a, slot);
        assert!(array.set_data(a, &[0xAA; 64]));
        assert_eq!(array.data(a).unwrap()[0], 0xAA);

        // fill the second slot, then a third line must steal one
        let b = array.find_replacement_candidate(0x140);
        array.replace(0x140, b, None);
        array.line_mut(b).set_state(State::S);
        let (slot_b, _) = array.find_data_victim(0x140);
        array.attach_data(b, slot_b);

        let c = array.find_replacement_candidate(0x80);
        array.replace(0x80, c, None);
        let (stolen, victim) = array.find_data_victim(0x80);
        assert!(victim.is_some());
        array.attach_data(c, stolen);
        let victim = victim.unwrap();
        assert!(!array.is_cached(victim));
        assert!(array.is_cached(c));
    }

    #[test]
    fn replace_frees_the_old_slot() {
        let mut array = small_array();
        let a = array.find_replacement_candidate(0x40);
        array.replace(0x40, a, None);
        let (slot, _) = array.find_data_victim(0x40);
        array.attach_data(a, slot);
        array.replace(0x240, a, None);
        assert!(!array.is_cached(a));
        assert_eq!(array.line(a).base_addr(), 0x240);
    }
}
