pub mod emitter;
mod mesi;

pub use emitter::{OutboundEmitter, OutgoingEvent};

use crate::cache_array::CacheArray;
use crate::config::{Config, ConfigError};
use crate::directory::State;
use crate::listener::{AccessType, Listener, ResultType};
use crate::mem_event::{Command, Direction, MemEvent};
use crate::mshr::Mshr;
use crate::address;
use std::sync::Arc;

/// What the engine did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Fully processed; the caller may discard it and retry the next queued
    /// event for this address.
    Done,
    /// Accepted and queued in the MSHR; retried when progress occurs.
    Stall,
    /// Cannot proceed until a distinct request on this address completes;
    /// queued behind it rather than as the head.
    Block,
    /// Completed, but the MSHR head must not be replayed yet.
    Ignore,
}

/// Miss classification for profiling; `is_cache_hit` does not mutate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MissClass {
    Hit,
    /// Not present (invalid).
    NotPresent,
    /// Present but in the wrong state for the request (e.g. S on a write).
    WrongState,
    /// Right state but sharers/owner must be invalidated first, or the line
    /// is in transition.
    Pending,
}

/// MESI protocol driver over an internal directory, for a non-inclusive
/// cache with multiple children.
///
/// The engine never blocks: each entry point dispatches one event against
/// one directory line, mutates it, emits messages, and returns a
/// [`Disposition`]. The MSHR is the sole mechanism for deferred work.
pub struct MesiDirectory {
    pub(crate) config: Arc<Config>,
    pub(crate) array: CacheArray,
    pub(crate) mshr: Mshr,
    pub(crate) emitter: OutboundEmitter,
    listeners: Vec<Box<dyn Listener>>,
}

impl std::fmt::Debug for MesiDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MesiDirectory")
            .field("owner", &self.config.owner_name)
            .field("mshr", &self.mshr)
            .finish()
    }
}

impl MesiDirectory {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        Ok(Self {
            array: CacheArray::new(Arc::clone(&config))?,
            mshr: Mshr::new(config.mshr_entries),
            emitter: OutboundEmitter::new(Arc::clone(&config)),
            config,
            listeners: Vec::new(),
        })
    }

    /// Advance the engine's logical time; delivery times of subsequent sends
    /// are computed against it.
    pub fn set_time(&mut self, now: u64) {
        self.emitter.now = now;
    }

    pub fn add_listener(&mut self, listener: Box<dyn Listener>) {
        self.listeners.push(listener);
    }

    #[must_use]
    pub fn emitter(&self) -> &OutboundEmitter {
        &self.emitter
    }

    #[must_use]
    pub fn emitter_mut(&mut self) -> &mut OutboundEmitter {
        &mut self.emitter
    }

    #[must_use]
    pub fn mshr(&self) -> &Mshr {
        &self.mshr
    }

    /// Deferred evictions queued behind `addr`; the controller re-attempts
    /// allocation of the returned addresses once work on `addr` completes.
    pub fn take_deferred_allocations(&mut self, addr: address) -> Vec<address> {
        self.mshr.take_pointers(self.config.block_addr(addr))
    }

    pub(crate) fn notify(&mut self, ev: &MemEvent, access: AccessType, result: ResultType) {
        for listener in &mut self.listeners {
            listener.notify_access(ev, access, result);
        }
    }

    /// Handle a data request (GetS, GetX, GetSX) from a child.
    pub fn handle_request(&mut self, ev: MemEvent, replay: bool) -> Disposition {
        let addr = self.config.block_addr(ev.base_addr);
        log::debug!("directory::handle_request({ev}, replay={replay})");

        let mut idx = self.array.lookup(addr, !replay);
        if let Some(i) = idx {
            if self.array.line(i).in_transition() {
                self.mshr.insert(addr, ev);
                return Disposition::Stall;
            }
        }
        if idx.is_none() {
            if !self.allocate_line(addr) {
                self.mshr.insert(addr, ev);
                return Disposition::Stall;
            }
            idx = self.array.lookup(addr, false);
        }
        let idx = idx.expect("line was just allocated");

        let action = match ev.cmd {
            Command::GetS => self.handle_get_s(&ev, idx, replay),
            Command::GetX | Command::GetSX => self.handle_get_x(&ev, idx, replay),
            other => panic!(
                "unrecognized request {other} for {addr:#x} from {}",
                ev.src
            ),
        };
        if action == Disposition::Stall {
            self.mshr.insert(addr, ev);
        }
        action
    }

    /// Handle a replacement (PutS, PutE, PutM) from a child.
    ///
    /// When the Put races with a stalled request the returned disposition
    /// describes that request; the Put itself always completes.
    pub fn handle_replacement(&mut self, ev: MemEvent, _replay: bool) -> Disposition {
        let addr = self.config.block_addr(ev.base_addr);
        log::debug!("directory::handle_replacement({ev})");

        let Some(idx) = self.array.lookup(addr, false) else {
            panic!("replacement {ev} for untracked address {addr:#x}");
        };

        // The payload needs a home. Attempt a data slot without forcing an
        // eviction when the line is in transition (avoids deadlock).
        if !self.array.is_cached(idx) {
            let in_transition = self.array.line(idx).in_transition();
            if !self.allocate_dir_cache_line(addr, idx, in_transition) && !in_transition {
                self.mshr.insert(addr, ev);
                return Disposition::Stall;
            }
        }

        let req = self.mshr.lookup_front(addr).cloned();
        let action = match ev.cmd {
            Command::PutS => self.handle_put_s(&ev, idx, req.as_ref()),
            Command::PutE | Command::PutM => self.handle_put_m(&ev, idx, req.as_ref()),
            other => panic!(
                "unrecognized replacement {other} for {addr:#x} from {}",
                ev.src
            ),
        };
        if matches!(action, Disposition::Done | Disposition::Stall) && req.is_some() {
            self.mshr.remove_front(addr);
        }
        if matches!(action, Disposition::Stall | Disposition::Block) {
            self.mshr.insert(addr, ev);
        }
        action
    }

    /// Handle an invalidation (Inv, ForceInv, Fetch, FetchInv, FetchInvX)
    /// from the parent.
    ///
    /// An invalidation racing a pending writeback is consumed as the AckPut;
    /// a Put at the MSHR head is treated as if it had already occurred.
    pub fn handle_invalidation(&mut self, ev: MemEvent, replay: bool) -> Disposition {
        let addr = self.config.block_addr(ev.base_addr);
        log::debug!("directory::handle_invalidation({ev}, replay={replay})");

        if !self.mshr.pending_writeback(addr) && self.mshr.is_full() {
            self.mshr.insert(addr, ev);
            return Disposition::Stall;
        }
        if self.mshr.pending_writeback(addr) {
            // raced with our Put; the invalidation doubles as the AckPut
            self.mshr.remove_writeback(addr);
            return Disposition::Done;
        }

        let Some(idx) = self.array.lookup(addr, false) else {
            panic!("invalidation {ev} for untracked address {addr:#x}");
        };
        let action = match ev.cmd {
            Command::Inv => self.handle_inv(&ev, idx, replay),
            Command::Fetch => self.handle_fetch(&ev, idx, replay),
            Command::FetchInv => self.handle_fetch_inv(&ev, idx, replay),
            Command::FetchInvX => self.handle_fetch_inv_x(&ev, idx, replay),
            Command::ForceInv => self.handle_force_inv(&ev, idx, replay),
            other => panic!(
                "unrecognized invalidation {other} for {addr:#x} from {}",
                ev.src
            ),
        };
        match action {
            Disposition::Stall => self.mshr.insert(addr, ev),
            Disposition::Block => self.mshr.insert_blocked(addr, ev),
            _ => {}
        }
        action
    }

    /// Handle a response from the parent (GetSResp, GetXResp, FlushLineResp).
    pub fn handle_response(&mut self, ev: MemEvent) -> Disposition {
        let addr = self.config.block_addr(ev.base_addr);
        log::debug!("directory::handle_response({ev})");

        let req = self.mshr.lookup_front(addr).cloned();
        let action = match ev.cmd {
            Command::GetSResp | Command::GetXResp => {
                let idx = self
                    .array
                    .lookup(addr, false)
                    .unwrap_or_else(|| panic!("response {ev} for untracked address {addr:#x}"));
                let req = req
                    .as_ref()
                    .unwrap_or_else(|| panic!("response {ev} with no outstanding request"));
                self.handle_data_response(&ev, idx, req)
            }
            Command::FlushLineResp => {
                let req = req
                    .as_ref()
                    .unwrap_or_else(|| panic!("flush response {ev} with no outstanding flush"));
                self.emitter.send_flush_response(req, ev.success);
                if let Some(idx) = self.array.lookup(addr, false) {
                    let line = self.array.line_mut(idx);
                    let next = if line.state() == State::S_B {
                        State::S
                    } else {
                        State::I
                    };
                    line.set_state(next);
                }
                Disposition::Done
            }
            other => panic!("unrecognized response {other} for {addr:#x} from {}", ev.src),
        };
        if action == Disposition::Done {
            self.mshr.remove_front(addr);
        }
        action
    }

    /// Handle a response from a child (FetchResp, FetchXResp, AckInv, AckPut).
    pub fn handle_fetch_response(&mut self, ev: MemEvent) -> Disposition {
        let addr = self.config.block_addr(ev.base_addr);
        log::debug!("directory::handle_fetch_response({ev})");

        let req = self.mshr.lookup_front(addr).cloned();
        let (action, completes_front) = match ev.cmd {
            Command::FetchResp | Command::FetchXResp => {
                let idx = self
                    .array
                    .lookup(addr, false)
                    .unwrap_or_else(|| panic!("fetch response {ev} for untracked address"));
                (self.handle_fetch_resp(&ev, idx, req.as_ref()), true)
            }
            Command::AckInv => {
                let idx = self
                    .array
                    .lookup(addr, false)
                    .unwrap_or_else(|| panic!("AckInv {ev} for untracked address"));
                (self.handle_ack_inv(&ev, idx, req.as_ref()), true)
            }
            Command::AckPut => {
                // clears the marker; events stalled behind the writeback replay
                self.mshr.remove_writeback(addr);
                (Disposition::Done, false)
            }
            other => panic!("unrecognized response {other} for {addr:#x} from {}", ev.src),
        };
        if action == Disposition::Done && completes_front && req.is_some() {
            self.mshr.remove_front(addr);
        }
        action
    }

    /// Handle FlushLine/FlushLineInv from a child.
    pub fn handle_flush(&mut self, ev: MemEvent, replay: bool) -> Disposition {
        let addr = self.config.block_addr(ev.base_addr);
        log::debug!("directory::handle_flush({ev}, replay={replay})");

        let idx = self.array.lookup(addr, false);
        let req = self.mshr.lookup_front(addr).cloned();
        let action = match ev.cmd {
            Command::FlushLine => self.handle_flush_line(&ev, idx, req.as_ref(), replay),
            Command::FlushLineInv => self.handle_flush_line_inv(&ev, idx, req.as_ref(), replay),
            other => panic!("unrecognized flush {other} for {addr:#x} from {}", ev.src),
        };
        match action {
            Disposition::Stall => self.mshr.insert(addr, ev),
            Disposition::Block => self.mshr.insert_blocked(addr, ev),
            _ => {}
        }
        action
    }

    /// Evict the line tracking `addr`, from the directory side
    /// (`from_data_cache = false`) or the data-array side (`true`, which
    /// only releases the local copy and deallocates lazily when the block
    /// still exists above).
    pub fn handle_eviction(
        &mut self,
        addr: address,
        rqstr: &str,
        from_data_cache: bool,
    ) -> Disposition {
        let addr = self.config.block_addr(addr);
        let Some(idx) = self.array.lookup(addr, false) else {
            return Disposition::Done;
        };
        self.eviction_inner(idx, rqstr, from_data_cache)
    }

    /// Decide whether a NACKed message must be re-sent. Returns whether it
    /// was.
    pub fn handle_nack(&mut self, ev: MemEvent) -> bool {
        let nacked = *ev.nacked.expect("NACK without a wrapped event");
        let direction = ev.nack_direction.unwrap_or(Direction::Upstream);
        let addr = self.config.block_addr(nacked.base_addr);
        let idx = self.array.lookup(addr, false);
        let state = idx.map_or(State::I, |i| self.array.line(i).state());

        let resend = match nacked.cmd {
            // requests are always retried
            Command::GetS | Command::GetX | Command::GetSX => true,
            // writebacks only while the ack is still owed
            Command::PutS | Command::PutE | Command::PutM => {
                !self.config.expect_writeback_ack || self.mshr.pending_writeback(addr)
            }
            // downgrades only while the destination still owns the line
            Command::FetchInvX => {
                state != State::I
                    && idx.is_some_and(|i| self.array.line(i).owner_is(&nacked.dst))
            }
            Command::FetchInv => {
                state != State::I
                    && idx.is_some_and(|i| {
                        let line = self.array.line(i);
                        line.owner_is(&nacked.dst) || line.is_sharer(&nacked.dst)
                    })
            }
            Command::Fetch | Command::Inv => {
                state != State::I && idx.is_some_and(|i| self.array.line(i).is_sharer(&nacked.dst))
            }
            other => panic!("received NACK for unexpected command {other}"),
        };
        log::debug!(
            "directory::handle_nack({nacked}, state={state}) -> resend={resend}"
        );
        if resend {
            self.emitter.resend(nacked, direction);
        }
        resend
    }

    /// Classify how an incoming request would fare; profiling only.
    #[must_use]
    pub fn is_cache_hit(&self, ev: &MemEvent) -> MissClass {
        let cmd = if ev.cmd == Command::GetSX {
            Command::GetX
        } else {
            ev.cmd
        };
        let Some(line) = self.array.lookup_for(ev) else {
            return MissClass::NotPresent;
        };
        let mut state = line.state();
        if state == State::I {
            return MissClass::NotPresent;
        }
        if ev.prefetch && ev.rqstr == self.config.owner_name {
            return MissClass::Hit;
        }
        if state == State::S && self.config.last_level {
            state = State::M;
        }
        match state {
            State::S => {
                if cmd == Command::GetS {
                    MissClass::Hit
                } else {
                    MissClass::WrongState
                }
            }
            State::E | State::M => {
                if line.owner().is_some() {
                    return MissClass::Pending;
                }
                if cmd == Command::GetS {
                    return MissClass::Hit;
                }
                if cmd == Command::GetX
                    && (line.num_sharers() == 0
                        || (line.is_sharer(&ev.src) && line.num_sharers() == 1))
                {
                    return MissClass::Hit;
                }
                MissClass::Pending
            }
            _ => MissClass::Pending,
        }
    }

    /// Make room in the directory for `addr`: pick a candidate and evict it.
    /// Fails (queuing a deferred-allocation pointer) when the candidate is
    /// busy.
    fn allocate_line(&mut self, addr: address) -> bool {
        let cand = self.array.find_replacement_candidate(addr);
        let cand_addr = self.array.line(cand).base_addr();
        if self.array.line(cand).is_valid() {
            log::trace!("directory::allocate_line(addr={addr:#x}) evicting {cand_addr:#x}");
            if self.array.line(cand).in_transition() {
                self.mshr.insert_pointer(cand_addr, addr);
                return false;
            }
            let owner = self.config.owner_name.clone();
            if self.eviction_inner(cand, &owner, false) == Disposition::Stall {
                self.mshr.insert_pointer(cand_addr, addr);
                return false;
            }
        }
        self.array.replace(addr, cand, None);
        true
    }

    /// Find a data slot for the line at `idx`, evicting another line's local
    /// copy if the data set is full. `no_stall` fails instead of queuing a
    /// deferred pointer.
    pub(crate) fn allocate_dir_cache_line(
        &mut self,
        addr: address,
        idx: usize,
        no_stall: bool,
    ) -> bool {
        let (slot, victim) = self.array.find_data_victim(addr);
        match victim {
            Some(v) if v != idx => {
                let victim_addr = self.array.line(v).base_addr();
                if self.array.line(v).is_valid() {
                    if self.array.line(v).in_transition() {
                        if !no_stall {
                            self.mshr.insert_pointer(victim_addr, addr);
                        }
                        return false;
                    }
                    log::trace!(
                        "directory::allocate_dir_cache_line(addr={addr:#x}) evicting {victim_addr:#x} from cache"
                    );
                    let owner = self.config.owner_name.clone();
                    self.eviction_inner(v, &owner, true);
                }
                self.array.attach_data(idx, slot);
                true
            }
            _ => {
                self.array.attach_data(idx, slot);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Disposition, MesiDirectory, MissClass};
    use crate::config::Config;
    use crate::directory::State;
    use crate::mem_event::{Builder, Command, Direction, MemEvent};
    use itertools::Itertools;

    const LINE: usize = 64;

    fn engine_with(config: Config) -> MesiDirectory {
        let _ = env_logger::builder().is_test(true).try_init();
        MesiDirectory::new(config).unwrap()
    }

    fn engine() -> MesiDirectory {
        engine_with(Config::default())
    }

    fn child(cmd: Command, src: &str, addr: u64) -> MemEvent {
        Builder {
            cmd,
            src: src.to_string(),
            dst: "l2".to_string(),
            base_addr: addr,
            size: LINE as u32,
            ..Builder::default()
        }
        .build()
    }

    fn child_with_payload(cmd: Command, src: &str, addr: u64, byte: u8, dirty: bool) -> MemEvent {
        Builder {
            cmd,
            src: src.to_string(),
            dst: "l2".to_string(),
            base_addr: addr,
            size: LINE as u32,
            payload: vec![byte; LINE],
            dirty,
            ..Builder::default()
        }
        .build()
    }

    fn parent(cmd: Command, addr: u64, byte: u8, dirty: bool) -> MemEvent {
        Builder {
            cmd,
            src: "l3".to_string(),
            dst: "l2".to_string(),
            base_addr: addr,
            size: LINE as u32,
            payload: vec![byte; LINE],
            dirty,
            ..Builder::default()
        }
        .build()
    }

    fn state_of(engine: &mut MesiDirectory, addr: u64) -> State {
        let idx = engine.array.lookup(addr, false).expect("line tracked");
        engine.array.line(idx).state()
    }

    fn upstream_cmds(engine: &MesiDirectory) -> Vec<Command> {
        engine
            .emitter
            .queued_upstream()
            .iter()
            .map(|o| o.event.cmd)
            .collect_vec()
    }

    fn downstream_cmds(engine: &MesiDirectory) -> Vec<Command> {
        engine
            .emitter
            .queued_downstream()
            .iter()
            .map(|o| o.event.cmd)
            .collect_vec()
    }

    /// Drive a line to S with `src` as its (uncached) sharer.
    fn fill_shared(engine: &mut MesiDirectory, addr: u64, src: &str, byte: u8) {
        assert_eq!(
            engine.handle_request(child(Command::GetS, src, addr), false),
            Disposition::Stall
        );
        assert_eq!(
            engine.handle_response(parent(Command::GetSResp, addr, byte, false)),
            Disposition::Done
        );
        assert_eq!(state_of(engine, addr), State::S);
    }

    /// Drive a line to M with `src` as owner (uncached locally).
    fn fill_owned(engine: &mut MesiDirectory, addr: u64, src: &str, byte: u8) {
        assert_eq!(
            engine.handle_request(child(Command::GetX, src, addr), false),
            Disposition::Stall
        );
        assert_eq!(
            engine.handle_response(parent(Command::GetXResp, addr, byte, false)),
            Disposition::Done
        );
        assert_eq!(state_of(engine, addr), State::M);
    }

    #[test]
    fn simple_miss_then_fill() {
        let mut engine = engine();
        let disposition = engine.handle_request(child(Command::GetS, "l1d.0", 0x40), false);
        assert_eq!(disposition, Disposition::Stall);
        assert_eq!(state_of(&mut engine, 0x40), State::IS);
        let forwarded = &engine.emitter.queued_upstream()[0];
        assert_eq!(forwarded.event.cmd, Command::GetS);
        assert_eq!(forwarded.event.dst, "l3");

        let disposition = engine.handle_response(parent(Command::GetSResp, 0x40, 0xAA, false));
        assert_eq!(disposition, Disposition::Done);
        assert_eq!(state_of(&mut engine, 0x40), State::S);
        let idx = engine.array.lookup(0x40, false).unwrap();
        assert!(engine.array.line(idx).is_sharer("l1d.0"));

        let resp = &engine.emitter.queued_downstream()[0];
        assert_eq!(resp.event.cmd, Command::GetSResp);
        assert_eq!(resp.event.dst, "l1d.0");
        assert_eq!(resp.event.payload, vec![0xAA; LINE]);
        // request fully retired
        assert!(!engine.mshr.exists(0x40));
    }

    #[test]
    fn exclusive_upgrade_with_one_other_sharer() {
        let mut engine = engine();
        fill_shared(&mut engine, 0x40, "l1d.0", 0xAA);
        let idx = engine.array.lookup(0x40, false).unwrap();
        engine.array.line_mut(idx).add_sharer("l1d.1");

        let disposition = engine.handle_request(child(Command::GetX, "l1d.0", 0x40), false);
        assert_eq!(disposition, Disposition::Stall);
        assert_eq!(state_of(&mut engine, 0x40), State::SM_Inv);
        assert_eq!(engine.mshr.acks_needed(0x40), 1);
        let inv = engine
            .emitter
            .queued_downstream()
            .iter()
            .find(|o| o.event.cmd == Command::Inv)
            .expect("invalidation sent");
        assert_eq!(inv.event.dst, "l1d.1");

        let disposition = engine.handle_fetch_response(child(Command::AckInv, "l1d.1", 0x40));
        assert_eq!(disposition, Disposition::Ignore);
        assert_eq!(state_of(&mut engine, 0x40), State::SM);
        assert_eq!(engine.mshr.acks_needed(0x40), 0);
        let idx = engine.array.lookup(0x40, false).unwrap();
        assert!(!engine.array.line(idx).is_sharer("l1d.1"));

        let disposition = engine.handle_response(parent(Command::GetXResp, 0x40, 0xBB, false));
        assert_eq!(disposition, Disposition::Done);
        assert_eq!(state_of(&mut engine, 0x40), State::M);
        let idx = engine.array.lookup(0x40, false).unwrap();
        assert!(engine.array.line(idx).owner_is("l1d.0"));
        assert_eq!(engine.array.line(idx).num_sharers(), 0);
        let resp = engine.emitter.queued_downstream().back().unwrap();
        assert_eq!(resp.event.dst, "l1d.0");
        assert_eq!(resp.event.payload, vec![0xBB; LINE]);
    }

    #[test]
    fn put_s_races_with_inv() {
        let mut engine = engine();
        fill_shared(&mut engine, 0x40, "l1d.0", 0xAA);
        engine
            .mshr
            .insert(0x40, child_with_payload(Command::PutS, "l1d.0", 0x40, 0xCC, false));

        let disposition = engine.handle_invalidation(parent(Command::Inv, 0x40, 0, false), false);
        assert_eq!(disposition, Disposition::Done);
        assert_eq!(state_of(&mut engine, 0x40), State::I);
        let idx = engine.array.lookup(0x40, false).unwrap();
        assert_eq!(engine.array.line(idx).num_sharers(), 0);
        assert_eq!(engine.mshr.acks_needed(0x40), 0);
        // the PutS was consumed as the AckInv contribution
        assert!(!engine.mshr.exists(0x40));
        assert!(upstream_cmds(&engine).contains(&Command::AckInv));
    }

    #[test]
    fn eviction_merges_with_queued_put() {
        let config = Config {
            writeback_clean_blocks: true,
            expect_writeback_ack: true,
            ..Config::default()
        };
        let mut engine = engine_with(config);
        fill_shared(&mut engine, 0x40, "l1d.0", 0xAA);
        engine
            .mshr
            .insert(0x40, child_with_payload(Command::PutS, "l1d.0", 0x40, 0xDD, false));

        let disposition = engine.handle_eviction(0x40, "l2", false);
        assert_eq!(disposition, Disposition::Done);
        assert_eq!(state_of(&mut engine, 0x40), State::I);
        let writeback = engine.emitter.queued_upstream().back().unwrap();
        assert_eq!(writeback.event.cmd, Command::PutS);
        assert_eq!(writeback.event.payload, vec![0xDD; LINE]);
        assert!(engine.mshr.pending_writeback(0x40));
    }

    #[test]
    fn owner_downgrade_for_remote_read() {
        let mut engine = engine();
        fill_owned(&mut engine, 0x80, "l1d.0", 0xE0);

        let disposition = engine.handle_request(child(Command::GetS, "l1d.1", 0x80), false);
        assert_eq!(disposition, Disposition::Stall);
        assert_eq!(state_of(&mut engine, 0x80), State::M_InvX);
        assert_eq!(engine.mshr.acks_needed(0x80), 1);
        let fetch = engine.emitter.queued_downstream().back().unwrap();
        assert_eq!(fetch.event.cmd, Command::FetchInvX);
        assert_eq!(fetch.event.dst, "l1d.0");

        let disposition =
            engine.handle_fetch_response(child_with_payload(Command::FetchXResp, "l1d.0", 0x80, 0xEE, true));
        assert_eq!(disposition, Disposition::Done);
        assert_eq!(state_of(&mut engine, 0x80), State::M);
        let idx = engine.array.lookup(0x80, false).unwrap();
        assert!(engine.array.line(idx).owner().is_none());
        assert!(engine.array.line(idx).is_sharer("l1d.0"));
        assert!(engine.array.line(idx).is_sharer("l1d.1"));
        let resp = engine.emitter.queued_downstream().back().unwrap();
        assert_eq!(resp.event.dst, "l1d.1");
        assert_eq!(resp.event.payload, vec![0xEE; LINE]);
    }

    #[test]
    fn flush_with_outstanding_owner() {
        let mut engine = engine();
        // GetXResp on a clean read miss promotes to E with an owner
        assert_eq!(
            engine.handle_request(child(Command::GetS, "l1d.0", 0x40), false),
            Disposition::Stall
        );
        assert_eq!(
            engine.handle_response(parent(Command::GetXResp, 0x40, 0xA0, false)),
            Disposition::Done
        );
        assert_eq!(state_of(&mut engine, 0x40), State::E);
        {
            let idx = engine.array.lookup(0x40, false).unwrap();
            assert!(engine.array.line(idx).owner_is("l1d.0"));
        }

        let disposition = engine.handle_flush(child(Command::FlushLineInv, "l1d.1", 0x40), false);
        assert_eq!(disposition, Disposition::Stall);
        assert_eq!(state_of(&mut engine, 0x40), State::E_Inv);
        let fetch = engine.emitter.queued_downstream().back().unwrap();
        assert_eq!(fetch.event.cmd, Command::FetchInv);
        assert_eq!(fetch.event.dst, "l1d.0");

        let disposition =
            engine.handle_fetch_response(child_with_payload(Command::FetchResp, "l1d.0", 0x40, 0xFF, true));
        assert_eq!(disposition, Disposition::Stall);
        assert_eq!(state_of(&mut engine, 0x40), State::I_B);
        let forwarded = engine.emitter.queued_upstream().back().unwrap();
        assert_eq!(forwarded.event.cmd, Command::FlushLineInv);
        assert!(forwarded.event.dirty);
        assert_eq!(forwarded.event.payload, vec![0xFF; LINE]);

        let mut resp = parent(Command::FlushLineResp, 0x40, 0, false);
        resp.payload.clear();
        resp.success = true;
        assert_eq!(engine.handle_response(resp), Disposition::Done);
        assert_eq!(state_of(&mut engine, 0x40), State::I);
        let flush_resp = engine.emitter.queued_downstream().back().unwrap();
        assert_eq!(flush_resp.event.cmd, Command::FlushLineResp);
        assert_eq!(flush_resp.event.dst, "l1d.1");
        assert!(flush_resp.event.success);
        assert!(!engine.mshr.exists(0x40));
    }

    #[test]
    fn owner_implies_no_sharers() {
        let mut engine = engine();
        fill_owned(&mut engine, 0x40, "l1d.0", 0xAB);
        let idx = engine.array.lookup(0x40, false).unwrap();
        let line = engine.array.line(idx);
        assert!(line.owner().is_some());
        assert_eq!(line.num_sharers(), 0);
    }

    #[test]
    fn replayed_stall_is_idempotent() {
        let mut engine = engine();
        let first = child(Command::GetS, "l1d.0", 0x40);
        let retry = first.clone();
        assert_eq!(engine.handle_request(first, false), Disposition::Stall);
        // replaying against the same state (line now in IS) stalls again
        assert_eq!(engine.handle_request(retry, true), Disposition::Stall);
    }

    #[test]
    fn put_m_from_owner_is_absorbed_locally() {
        let mut engine = engine();
        fill_owned(&mut engine, 0x40, "l1d.0", 0xAB);
        let disposition =
            engine.handle_replacement(child_with_payload(Command::PutM, "l1d.0", 0x40, 0xCD, true), false);
        assert_eq!(disposition, Disposition::Done);
        let idx = engine.array.lookup(0x40, false).unwrap();
        assert!(engine.array.line(idx).owner().is_none());
        assert_eq!(state_of(&mut engine, 0x40), State::M);
        // the replacement claimed a data slot and kept the dirty block here
        assert_eq!(engine.array.data(idx).unwrap(), &vec![0xCD; LINE]);
        assert_eq!(*downstream_cmds(&engine).last().unwrap(), Command::AckPut);
    }

    #[test]
    fn pending_writeback_consumes_racing_inv() {
        let config = Config {
            expect_writeback_ack: true,
            ..Config::default()
        };
        let mut engine = engine_with(config);
        fill_shared(&mut engine, 0x40, "l1d.0", 0xAA);
        engine
            .mshr
            .insert(0x40, child_with_payload(Command::PutS, "l1d.0", 0x40, 0xDD, false));
        assert_eq!(engine.handle_eviction(0x40, "l2", false), Disposition::Done);
        assert!(engine.mshr.pending_writeback(0x40));

        // the Inv doubles as our AckPut
        let disposition = engine.handle_invalidation(parent(Command::Inv, 0x40, 0, false), false);
        assert_eq!(disposition, Disposition::Done);
        assert!(!engine.mshr.pending_writeback(0x40));
    }

    #[test]
    fn full_mshr_requeues_invalidation() {
        let config = Config {
            mshr_entries: 1,
            ..Config::default()
        };
        let mut engine = engine_with(config);
        assert_eq!(
            engine.handle_request(child(Command::GetS, "l1d.0", 0x40), false),
            Disposition::Stall
        );
        assert!(engine.mshr.is_full());

        let disposition = engine.handle_invalidation(parent(Command::Inv, 0x80, 0, false), false);
        assert_eq!(disposition, Disposition::Stall);
        // no loss: the invalidation waits at the tail
        assert!(engine.mshr.exists(0x80));
    }

    #[test]
    fn busy_replacement_candidate_defers_allocation() {
        let config = Config {
            dir_sets: 1,
            dir_assoc: 1,
            data_sets: 1,
            data_assoc: 1,
            ..Config::default()
        };
        let mut engine = engine_with(config);
        assert_eq!(
            engine.handle_request(child(Command::GetS, "l1d.0", 0x40), false),
            Disposition::Stall
        );
        // the only candidate is mid-fill; the new request waits behind it
        assert_eq!(
            engine.handle_request(child(Command::GetS, "l1d.0", 0x80), false),
            Disposition::Stall
        );
        assert_eq!(state_of(&mut engine, 0x40), State::IS);
        assert_eq!(engine.take_deferred_allocations(0x40), vec![0x80]);
    }

    #[test]
    fn last_level_upgrades_shared_write_in_place() {
        let config = Config {
            last_level: true,
            ..Config::default()
        };
        let mut engine = engine_with(config);
        fill_shared(&mut engine, 0x40, "l1d.0", 0xAA);
        let before = upstream_cmds(&engine).len();

        let disposition = engine.handle_request(child(Command::GetX, "l1d.0", 0x40), false);
        assert_eq!(disposition, Disposition::Done);
        assert_eq!(state_of(&mut engine, 0x40), State::M);
        let idx = engine.array.lookup(0x40, false).unwrap();
        assert!(engine.array.line(idx).owner_is("l1d.0"));
        // upgraded in place; nothing was forwarded upstream
        assert_eq!(upstream_cmds(&engine).len(), before);
    }

    #[test]
    fn nacked_request_is_resent() {
        let mut engine = engine();
        assert_eq!(
            engine.handle_request(child(Command::GetS, "l1d.0", 0x40), false),
            Disposition::Stall
        );
        let forwarded = engine.emitter.queued_upstream()[0].event.clone();
        let nack = forwarded.make_nack(Direction::Upstream);
        assert!(engine.handle_nack(nack));
        assert_eq!(
            upstream_cmds(&engine),
            vec![Command::GetS, Command::GetS]
        );
    }

    #[test]
    fn nacked_inv_to_departed_sharer_is_dropped() {
        let mut engine = engine();
        fill_shared(&mut engine, 0x40, "l1d.0", 0xAA);
        // an Inv we supposedly sent to a cache that is no longer a sharer
        let inv = Builder {
            cmd: Command::Inv,
            src: "l2".to_string(),
            dst: "l1d.7".to_string(),
            base_addr: 0x40,
            ..Builder::default()
        }
        .build();
        let before = downstream_cmds(&engine).len();
        assert!(!engine.handle_nack(inv.make_nack(Direction::Downstream)));
        assert_eq!(downstream_cmds(&engine).len(), before);
    }

    #[test]
    fn miss_classification() {
        let mut engine = engine();
        let probe = child(Command::GetS, "l1d.0", 0x40);
        assert_eq!(engine.is_cache_hit(&probe), MissClass::NotPresent);

        fill_shared(&mut engine, 0x40, "l1d.0", 0xAA);
        assert_eq!(engine.is_cache_hit(&probe), MissClass::Hit);
        assert_eq!(
            engine.is_cache_hit(&child(Command::GetX, "l1d.0", 0x40)),
            MissClass::WrongState
        );

        fill_owned(&mut engine, 0x80, "l1d.0", 0xBB);
        assert_eq!(
            engine.is_cache_hit(&child(Command::GetS, "l1d.1", 0x80)),
            MissClass::Pending
        );
    }

    #[test]
    fn fetch_serves_data_from_queued_put() {
        let mut engine = engine();
        fill_shared(&mut engine, 0x40, "l1d.0", 0xAA);
        engine
            .mshr
            .insert(0x40, child_with_payload(Command::PutS, "l1d.0", 0x40, 0xCC, false));

        let disposition = engine.handle_invalidation(parent(Command::Fetch, 0x40, 0, false), false);
        assert_eq!(disposition, Disposition::Done);
        let resp = engine.emitter.queued_upstream().back().unwrap();
        assert_eq!(resp.event.cmd, Command::FetchResp);
        assert_eq!(resp.event.payload, vec![0xCC; LINE]);
        // the Put stays queued; only its data was borrowed
        assert!(engine.mshr.exists(0x40));
    }

    #[test]
    fn engine_rejects_invalid_geometry() -> color_eyre::eyre::Result<()> {
        let engine = MesiDirectory::new(Config::default())?;
        assert!(!engine.mshr().is_full());
        let bad = Config {
            line_size: 48,
            ..Config::default()
        };
        assert!(MesiDirectory::new(bad).is_err());
        Ok(())
    }

    #[test]
    fn listeners_observe_accesses() {
        use crate::listener::{AccessType, Listener, ResultType};
        use std::sync::{Arc, Mutex};

        struct Recorder(Arc<Mutex<Vec<(AccessType, ResultType)>>>);
        impl Listener for Recorder {
            fn notify_access(
                &mut self,
                _ev: &MemEvent,
                access: AccessType,
                result: ResultType,
            ) {
                self.0.lock().unwrap().push((access, result));
            }
        }

        let mut engine = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        engine.add_listener(Box::new(Recorder(Arc::clone(&seen))));
        fill_shared(&mut engine, 0x40, "l1d.0", 0xAA);

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (AccessType::Read, ResultType::Miss));
        assert!(seen.contains(&(AccessType::Read, ResultType::Hit)));
    }

    #[test]
    fn uncached_shared_read_fetches_from_sharer() {
        let mut engine = engine();
        fill_shared(&mut engine, 0x40, "l1d.0", 0xAA);

        let disposition = engine.handle_request(child(Command::GetS, "l1d.1", 0x40), false);
        assert_eq!(disposition, Disposition::Stall);
        assert_eq!(state_of(&mut engine, 0x40), State::S_D);
        let fetch = engine.emitter.queued_downstream().back().unwrap();
        assert_eq!(fetch.event.cmd, Command::Fetch);
        assert_eq!(fetch.event.dst, "l1d.0");

        let disposition =
            engine.handle_fetch_response(child_with_payload(Command::FetchResp, "l1d.0", 0x40, 0xAB, false));
        assert_eq!(disposition, Disposition::Done);
        assert_eq!(state_of(&mut engine, 0x40), State::S);
        let idx = engine.array.lookup(0x40, false).unwrap();
        assert!(engine.array.line(idx).is_sharer("l1d.1"));
        let resp = engine.emitter.queued_downstream().back().unwrap();
        assert_eq!(resp.event.dst, "l1d.1");
        assert_eq!(resp.event.payload, vec![0xAB; LINE]);
    }
}
