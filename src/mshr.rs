use crate::address;
use crate::mem_event::MemEvent;
use std::collections::{HashMap, VecDeque};

/// A queued piece of deferred work.
///
/// `Pointer` links a replacement candidate that could not be evicted (it was
/// in transition) to the address whose allocation is waiting on it; the
/// deferred eviction fires when the in-flight work completes.
#[derive(Debug)]
pub enum Entry {
    Event { ev: MemEvent, blocked: bool },
    Pointer(address),
}

/// Per-address miss status register: the FIFO of pending events plus the
/// counters that gate their replay.
#[derive(Debug, Default)]
pub struct Register {
    entries: VecDeque<Entry>,
    acks_needed: u32,
    /// Holds in-flight data when the line has no data-array slot.
    data_buffer: Option<Vec<u8>>,
    /// Set between emitting a Put* and receiving its AckPut.
    pending_writeback: bool,
}

impl Register {
    fn is_empty(&self) -> bool {
        self.entries.is_empty()
            && self.acks_needed == 0
            && self.data_buffer.is_none()
            && !self.pending_writeback
    }
}

/// Miss status holding registers, keyed by block address.
///
/// Serializes event ordering per address: stalled events replay in FIFO
/// order, blocked events wait behind the event that blocks them.
#[derive(Debug)]
pub struct Mshr {
    registers: HashMap<address, Register>,
    max_entries: usize,
    queued: usize,
}

impl Mshr {
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            registers: HashMap::new(),
            max_entries,
            queued: 0,
        }
    }

    /// No more events can be queued.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.queued >= self.max_entries
    }

    /// A register exists for this address (events, acks, buffered data, or a
    /// pending writeback).
    #[must_use]
    pub fn is_hit(&self, addr: address) -> bool {
        self.registers.contains_key(&addr)
    }

    /// At least one event is queued for this address.
    #[must_use]
    pub fn exists(&self, addr: address) -> bool {
        self.registers
            .get(&addr)
            .is_some_and(|reg| reg.entries.iter().any(|e| matches!(e, Entry::Event { .. })))
    }

    pub fn insert(&mut self, addr: address, ev: MemEvent) {
        log::trace!("mshr::insert(addr={addr:#x}, ev={ev})");
        self.registers
            .entry(addr)
            .or_default()
            .entries
            .push_back(Entry::Event { ev, blocked: false });
        self.queued += 1;
    }

    /// Queue an event that must wait behind the current head rather than
    /// becoming the head itself.
    pub fn insert_blocked(&mut self, addr: address, ev: MemEvent) {
        log::trace!("mshr::insert_blocked(addr={addr:#x}, ev={ev})");
        self.registers
            .entry(addr)
            .or_default()
            .entries
            .push_back(Entry::Event { ev, blocked: true });
        self.queued += 1;
    }

    pub fn insert_pointer(&mut self, addr: address, target: address) {
        log::trace!("mshr::insert_pointer(addr={addr:#x}, target={target:#x})");
        self.registers
            .entry(addr)
            .or_default()
            .entries
            .push_back(Entry::Pointer(target));
    }

    /// The event at the head of the queue, if it is replayable.
    #[must_use]
    pub fn lookup_front(&self, addr: address) -> Option<&MemEvent> {
        match self.registers.get(&addr)?.entries.front()? {
            Entry::Event { ev, blocked: false } => Some(ev),
            _ => None,
        }
    }

    #[must_use]
    pub fn lookup_front_mut(&mut self, addr: address) -> Option<&mut MemEvent> {
        match self.registers.get_mut(&addr)?.entries.front_mut()? {
            Entry::Event { ev, blocked: false } => Some(ev),
            _ => None,
        }
    }

    /// Pop the head event. The next queued event, if any, becomes eligible
    /// for replay: a blocked successor is unblocked because its blocker has
    /// now completed.
    pub fn remove_front(&mut self, addr: address) -> Option<MemEvent> {
        let reg = self.registers.get_mut(&addr)?;
        let ev = match reg.entries.front() {
            Some(Entry::Event { blocked: false, .. }) => {
                let Some(Entry::Event { ev, .. }) = reg.entries.pop_front() else {
                    unreachable!()
                };
                self.queued -= 1;
                ev
            }
            _ => return None,
        };
        if let Some(Entry::Event { blocked, .. }) = reg.entries.front_mut() {
            *blocked = false;
        }
        log::trace!("mshr::remove_front(addr={addr:#x}) -> {ev}");
        self.prune(addr);
        Some(ev)
    }

    /// Drain deferred-eviction pointers queued behind this address.
    pub fn take_pointers(&mut self, addr: address) -> Vec<address> {
        let Some(reg) = self.registers.get_mut(&addr) else {
            return Vec::new();
        };
        let mut targets = Vec::new();
        reg.entries.retain(|entry| match entry {
            Entry::Pointer(target) => {
                targets.push(*target);
                false
            }
            Entry::Event { .. } => true,
        });
        self.prune(addr);
        targets
    }

    #[must_use]
    pub fn acks_needed(&self, addr: address) -> u32 {
        self.registers.get(&addr).map_or(0, |reg| reg.acks_needed)
    }

    pub fn increment_acks_needed(&mut self, addr: address) {
        let reg = self.registers.entry(addr).or_default();
        reg.acks_needed += 1;
        log::trace!("mshr::acks_needed(addr={addr:#x}) -> {}", reg.acks_needed);
    }

    pub fn decrement_acks_needed(&mut self, addr: address) {
        if let Some(reg) = self.registers.get_mut(&addr) {
            debug_assert!(reg.acks_needed > 0, "ack underflow at {addr:#x}");
            reg.acks_needed = reg.acks_needed.saturating_sub(1);
            log::trace!("mshr::acks_needed(addr={addr:#x}) -> {}", reg.acks_needed);
        }
        self.prune(addr);
    }

    pub fn insert_writeback(&mut self, addr: address) {
        log::trace!("mshr::insert_writeback(addr={addr:#x})");
        self.registers.entry(addr).or_default().pending_writeback = true;
    }

    #[must_use]
    pub fn pending_writeback(&self, addr: address) -> bool {
        self.registers
            .get(&addr)
            .is_some_and(|reg| reg.pending_writeback)
    }

    pub fn remove_writeback(&mut self, addr: address) {
        if let Some(reg) = self.registers.get_mut(&addr) {
            reg.pending_writeback = false;
        }
        self.prune(addr);
    }

    pub fn set_data_buffer(&mut self, addr: address, data: Vec<u8>) {
        self.registers.entry(addr).or_default().data_buffer = Some(data);
    }

    #[must_use]
    pub fn data_buffer(&self, addr: address) -> Option<&Vec<u8>> {
        self.registers.get(&addr)?.data_buffer.as_ref()
    }

    pub fn clear_data_buffer(&mut self, addr: address) {
        if let Some(reg) = self.registers.get_mut(&addr) {
            reg.data_buffer = None;
        }
        self.prune(addr);
    }

    fn prune(&mut self, addr: address) {
        if self.registers.get(&addr).is_some_and(Register::is_empty) {
            self.registers.remove(&addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Mshr;
    use crate::mem_event::{Builder, Command, MemEvent};

    fn event(cmd: Command, src: &str, addr: u64) -> MemEvent {
        Builder {
            cmd,
            src: src.to_string(),
            dst: "l2".to_string(),
            base_addr: addr,
            ..Builder::default()
        }
        .build()
    }

    #[test]
    fn replays_in_fifo_order() {
        let mut mshr = Mshr::new(8);
        let a = event(Command::GetS, "l1d.0", 0x40);
        let b = event(Command::GetX, "l1d.1", 0x40);
        let (a_id, b_id) = (a.id, b.id);
        mshr.insert(0x40, a);
        mshr.insert(0x40, b);
        assert_eq!(mshr.lookup_front(0x40).unwrap().id, a_id);
        assert_eq!(mshr.remove_front(0x40).unwrap().id, a_id);
        assert_eq!(mshr.remove_front(0x40).unwrap().id, b_id);
        assert!(!mshr.is_hit(0x40));
    }

    #[test]
    fn blocked_entries_wait_for_their_blocker() {
        let mut mshr = Mshr::new(8);
        let blocker = event(Command::GetS, "l1d.0", 0x40);
        let blocked = event(Command::FetchInv, "l3", 0x40);
        let blocked_id = blocked.id;
        mshr.insert(0x40, blocker);
        mshr.insert_blocked(0x40, blocked);
        // head is replayable, the blocked entry is not yet
        assert!(mshr.remove_front(0x40).is_some());
        // blocker completion unblocks the successor
        assert_eq!(mshr.lookup_front(0x40).unwrap().id, blocked_id);
    }

    #[test]
    fn pointers_are_not_events() {
        let mut mshr = Mshr::new(8);
        mshr.insert_pointer(0x40, 0x1040);
        assert!(mshr.is_hit(0x40));
        assert!(!mshr.exists(0x40));
        assert!(mshr.lookup_front(0x40).is_none());
        assert_eq!(mshr.take_pointers(0x40), vec![0x1040]);
        assert!(!mshr.is_hit(0x40));
    }

    #[test]
    fn writeback_marker_lifecycle() {
        let mut mshr = Mshr::new(8);
        assert!(!mshr.pending_writeback(0x40));
        mshr.insert_writeback(0x40);
        assert!(mshr.pending_writeback(0x40));
        assert!(mshr.is_hit(0x40));
        mshr.remove_writeback(0x40);
        assert!(!mshr.pending_writeback(0x40));
        assert!(!mshr.is_hit(0x40));
    }

    #[test]
    fn ack_counter_saturates_at_zero() {
        let mut mshr = Mshr::new(8);
        mshr.increment_acks_needed(0x40);
        mshr.increment_acks_needed(0x40);
        assert_eq!(mshr.acks_needed(0x40), 2);
        mshr.decrement_acks_needed(0x40);
        mshr.decrement_acks_needed(0x40);
        assert_eq!(mshr.acks_needed(0x40), 0);
        assert!(!mshr.is_hit(0x40));
    }

    #[test]
    fn data_buffer_holds_uncached_payload() {
        let mut mshr = Mshr::new(8);
        mshr.set_data_buffer(0x40, vec![0xAA; 4]);
        assert_eq!(mshr.data_buffer(0x40).unwrap(), &vec![0xAA; 4]);
        mshr.clear_data_buffer(0x40);
        assert!(mshr.data_buffer(0x40).is_none());
    }

    #[test]
    fn fills_up_at_capacity() {
        let mut mshr = Mshr::new(2);
        mshr.insert(0x40, event(Command::GetS, "l1d.0", 0x40));
        assert!(!mshr.is_full());
        mshr.insert(0x80, event(Command::GetS, "l1d.0", 0x80));
        assert!(mshr.is_full());
        mshr.remove_front(0x40);
        assert!(!mshr.is_full());
    }
}
