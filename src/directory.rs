use crate::address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Coherence states, stable and transient.
///
/// Suffix conventions: `_Inv` = awaiting invalidation acks, `_InvX` =
/// awaiting a downgrade ack from the owner, `_D` = awaiting fetched data for
/// an uncached block, `SI`/`EI`/`MI` = eviction in progress, `_B` = flush
/// forwarded and awaiting the parent's response.
#[allow(non_camel_case_types)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
pub enum State {
    I,
    S,
    E,
    M,
    // request in flight toward the parent
    IS,
    IM,
    SM,
    // invalidation in flight toward children
    S_Inv,
    SI,
    SB_Inv,
    E_Inv,
    EI,
    E_InvX,
    M_Inv,
    MI,
    M_InvX,
    SM_Inv,
    // data fetch in flight toward children
    S_D,
    E_D,
    M_D,
    SM_D,
    // flush pending at the parent
    S_B,
    I_B,
}

impl State {
    #[inline]
    #[must_use]
    pub fn is_stable(&self) -> bool {
        matches!(self, State::I | State::S | State::E | State::M)
    }

    #[inline]
    #[must_use]
    pub fn in_transition(&self) -> bool {
        !self.is_stable()
    }

    /// The state reached when the in-flight work completes: `*_D` fetches
    /// collapse back, downgrades land in their clean state, evictions and
    /// invalidations end invalid.
    #[must_use]
    pub fn settled(&self) -> State {
        match self {
            State::IS => State::S,
            State::IM | State::SM => State::M,
            State::S_D | State::S_B => State::S,
            State::SM_D => State::SM,
            State::E_D | State::E_InvX => State::E,
            State::M_D | State::M_InvX => State::M,
            State::SI | State::EI | State::MI => State::I,
            State::S_Inv | State::E_Inv | State::M_Inv | State::I_B => State::I,
            State::SM_Inv => State::IM,
            State::SB_Inv => State::I_B,
            stable => *stable,
        }
    }
}

/// Per-address directory metadata.
///
/// Tracks a line whether or not its data is locally resident: `data_slot`
/// points at a data-array slot when the bytes are cached here, and is `None`
/// for a tracked-but-uncached block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirLine {
    base_addr: address,
    state: State,
    sharers: BTreeSet<String>,
    owner: Option<String>,
    pub data_slot: Option<usize>,
    /// Logical time of the latest outbound message touching this line.
    timestamp: u64,
    prefetch: bool,
    pub last_access: u64,
}

impl Default for DirLine {
    fn default() -> Self {
        Self {
            base_addr: 0,
            state: State::I,
            sharers: BTreeSet::new(),
            owner: None,
            data_slot: None,
            timestamp: 0,
            prefetch: false,
            last_access: 0,
        }
    }
}

impl std::fmt::Display for DirLine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{:#x}: {} sharers={:?} owner={:?} cached={}",
            self.base_addr,
            self.state,
            self.sharers,
            self.owner,
            self.data_slot.is_some()
        )
    }
}

impl DirLine {
    #[inline]
    #[must_use]
    pub fn base_addr(&self) -> address {
        self.base_addr
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    pub fn set_state(&mut self, state: State) {
        log::trace!(
            "directory::set_state(addr={:#x}, {} -> {})",
            self.base_addr,
            self.state,
            state
        );
        self.state = state;
    }

    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.state != State::I
    }

    #[inline]
    #[must_use]
    pub fn in_transition(&self) -> bool {
        self.state.in_transition()
    }

    #[must_use]
    pub fn num_sharers(&self) -> usize {
        self.sharers.len()
    }

    #[must_use]
    pub fn is_sharer(&self, name: &str) -> bool {
        self.sharers.contains(name)
    }

    #[must_use]
    pub fn sharers(&self) -> impl Iterator<Item = &String> {
        self.sharers.iter()
    }

    /// The sharer a Fetch is directed at when the block is uncached.
    #[must_use]
    pub fn first_sharer(&self) -> Option<&String> {
        self.sharers.iter().next()
    }

    pub fn add_sharer(&mut self, name: &str) {
        debug_assert!(
            self.owner.is_none(),
            "{:#x}: adding sharer {} while owned by {:?}",
            self.base_addr,
            name,
            self.owner
        );
        self.sharers.insert(name.to_string());
    }

    pub fn remove_sharer(&mut self, name: &str) {
        self.sharers.remove(name);
    }

    #[must_use]
    pub fn owner(&self) -> Option<&String> {
        self.owner.as_ref()
    }

    #[must_use]
    pub fn owner_is(&self, name: &str) -> bool {
        self.owner.as_deref() == Some(name)
    }

    pub fn set_owner(&mut self, name: &str) {
        debug_assert!(
            self.sharers.is_empty(),
            "{:#x}: setting owner {} with sharers {:?}",
            self.base_addr,
            name,
            self.sharers
        );
        self.owner = Some(name.to_string());
    }

    pub fn clear_owner(&mut self) {
        self.owner = None;
    }

    #[inline]
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    #[inline]
    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
    }

    #[inline]
    #[must_use]
    pub fn prefetch(&self) -> bool {
        self.prefetch
    }

    #[inline]
    pub fn set_prefetch(&mut self, prefetch: bool) {
        self.prefetch = prefetch;
    }

    /// Reinitialize this line for a new address. The data slot binding is
    /// handled by the cache array, not here.
    pub fn reset(&mut self, base_addr: address) {
        self.base_addr = base_addr;
        self.state = State::I;
        self.sharers.clear();
        self.owner = None;
        self.timestamp = 0;
        self.prefetch = false;
    }
}

#[cfg(test)]
mod tests {
    use super::{DirLine, State};
    use strum::IntoEnumIterator;

    #[test]
    fn only_mesi_states_are_stable() {
        let stable: Vec<State> = State::iter().filter(State::is_stable).collect();
        assert_eq!(stable, vec![State::I, State::S, State::E, State::M]);
    }

    #[test]
    fn transients_settle_to_their_home_state() {
        assert_eq!(State::S_D.settled(), State::S);
        assert_eq!(State::SM_D.settled(), State::SM);
        assert_eq!(State::EI.settled(), State::I);
        assert_eq!(State::MI.settled(), State::I);
        assert_eq!(State::M_InvX.settled(), State::M);
        assert_eq!(State::E_InvX.settled(), State::E);
    }

    #[test]
    fn owner_and_sharers_are_exclusive() {
        let mut line = DirLine::default();
        line.reset(0x40);
        line.add_sharer("l1d.0");
        line.add_sharer("l1d.1");
        assert_eq!(line.num_sharers(), 2);
        line.remove_sharer("l1d.0");
        line.remove_sharer("l1d.1");
        line.set_owner("l1d.0");
        assert!(line.owner_is("l1d.0"));
        assert_eq!(line.num_sharers(), 0);
    }

    #[test]
    fn reset_clears_coherence_metadata() {
        let mut line = DirLine::default();
        line.reset(0x40);
        line.set_state(State::M);
        line.set_owner("l1d.0");
        line.set_prefetch(true);
        line.set_timestamp(10);
        line.reset(0x80);
        assert_eq!(line.base_addr(), 0x80);
        assert_eq!(line.state(), State::I);
        assert!(line.owner().is_none());
        assert!(!line.prefetch());
        assert_eq!(line.timestamp(), 0);
    }
}
