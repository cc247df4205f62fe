//! Per-state transition handlers.
//!
//! Dispatch is by (command, state); every arm either completes the event,
//! stalls it, blocks it behind another request, or consumes it against a
//! racing one. States with no arm for a command are protocol violations and
//! halt with a diagnostic naming address, state and command.

use super::{Disposition, MesiDirectory};
use crate::directory::State;
use crate::listener::{AccessType, ResultType};
use crate::mem_event::{Command, MemEvent};
use crate::address;

impl MesiDirectory {
    fn clear_prefetch(&mut self, idx: usize) {
        if self.array.line(idx).prefetch() {
            self.array.line_mut(idx).set_prefetch(false);
        }
    }

    /// Store a payload into the line's data slot, falling back to the MSHR
    /// data buffer for uncached blocks.
    fn deposit_payload(&mut self, idx: usize, addr: address, payload: &[u8]) {
        if !self.array.set_data(idx, payload) && self.mshr.is_hit(addr) {
            self.mshr.set_data_buffer(addr, payload.to_vec());
        }
    }

    /// The bytes at hand for this line: data array if cached, MSHR buffer
    /// otherwise.
    fn local_data(&self, idx: usize, addr: address) -> Option<Vec<u8>> {
        self.array
            .data(idx)
            .cloned()
            .or_else(|| self.mshr.data_buffer(addr).cloned())
    }

    /// Evict `idx` from the directory (or, `from_data_cache`, only release
    /// its local copy). A Put* queued for the same block merges with the
    /// eviction: it stands in for the ack an invalidation would earn.
    pub(crate) fn eviction_inner(
        &mut self,
        idx: usize,
        rqstr: &str,
        from_data_cache: bool,
    ) -> Disposition {
        let addr = self.array.line(idx).base_addr();
        let is_cached = self.array.is_cached(idx);

        let collision = self
            .mshr
            .lookup_front(addr)
            .is_some_and(|front| front.cmd.is_writeback());
        debug_assert!(!(collision && from_data_cache));
        if collision {
            let put = self.mshr.remove_front(addr).expect("front checked above");
            let line = self.array.line_mut(idx);
            if line.state() == State::E && put.dirty {
                line.set_state(State::M);
            }
            if line.is_sharer(&put.src) {
                line.remove_sharer(&put.src);
            } else if line.owner().is_some() {
                line.clear_owner();
            }
            self.mshr.set_data_buffer(addr, put.payload);
        }

        let state = self.array.line(idx).state();
        log::debug!(
            "directory::eviction(addr={addr:#x}, state={state}, from_data_cache={from_data_cache})"
        );
        match state {
            State::I => Disposition::Done,
            State::S => {
                self.clear_prefetch(idx);
                if self.array.line(idx).num_sharers() > 0 && !from_data_cache {
                    let Self { array, mshr, emitter, .. } = self;
                    let line = array.line_mut(idx);
                    let rqstr = &self.config.owner_name;
                    if is_cached || collision {
                        emitter.invalidate_all_sharers(line, mshr, rqstr, false);
                    } else {
                        // one sharer must also return the data for the PutS
                        emitter.invalidate_all_sharers_and_fetch(line, mshr, rqstr, false);
                    }
                    line.set_state(State::SI);
                    return Disposition::Stall;
                }
                if !is_cached && !collision {
                    panic!("evicting uncached block with no sharers: addr={addr:#x}, state={state}");
                }
                if from_data_cache && self.array.line(idx).num_sharers() > 0 {
                    return Disposition::Done; // block still lives above
                }
                self.send_eviction_writeback(idx, addr, Command::PutS, rqstr, is_cached);
                if self.array.line(idx).num_sharers() == 0 {
                    self.array.line_mut(idx).set_state(State::I);
                }
                if self.config.expect_writeback_ack {
                    self.mshr.insert_writeback(addr);
                }
                Disposition::Done
            }
            State::E | State::M => {
                self.clear_prefetch(idx);
                let has_owner = self.array.line(idx).owner().is_some();
                let eviction_state = if state == State::E { State::EI } else { State::MI };
                if self.array.line(idx).num_sharers() > 0 && !from_data_cache {
                    let Self { array, mshr, emitter, .. } = self;
                    let line = array.line_mut(idx);
                    let rqstr = &self.config.owner_name;
                    if is_cached || collision {
                        emitter.invalidate_all_sharers(line, mshr, rqstr, false);
                    } else {
                        emitter.invalidate_all_sharers_and_fetch(line, mshr, rqstr, false);
                    }
                    line.set_state(eviction_state);
                    Disposition::Stall
                } else if has_owner && !from_data_cache {
                    let Self { array, mshr, emitter, .. } = self;
                    let line = array.line_mut(idx);
                    emitter.send_fetch_inv(line, &self.config.owner_name, false);
                    mshr.increment_acks_needed(addr);
                    line.set_state(eviction_state);
                    Disposition::Stall
                } else {
                    if !is_cached && !collision {
                        panic!(
                            "evicting uncached block with no sharers or owner: addr={addr:#x}, state={state}"
                        );
                    }
                    if from_data_cache
                        && (self.array.line(idx).num_sharers() > 0 || has_owner)
                    {
                        return Disposition::Done; // lazy deallocation
                    }
                    let cmd = if state == State::E {
                        Command::PutE
                    } else {
                        Command::PutM
                    };
                    self.send_eviction_writeback(idx, addr, cmd, rqstr, is_cached);
                    let line = self.array.line(idx);
                    if line.num_sharers() == 0 && line.owner().is_none() {
                        self.array.line_mut(idx).set_state(State::I);
                    }
                    if self.config.expect_writeback_ack {
                        self.mshr.insert_writeback(addr);
                    }
                    Disposition::Done
                }
            }
            // in-flight work finishes the eviction
            s if s.in_transition() => Disposition::Stall,
            s => panic!("eviction in invalid state {s}: addr={addr:#x}"),
        }
    }

    fn send_eviction_writeback(
        &mut self,
        idx: usize,
        addr: address,
        cmd: Command,
        rqstr: &str,
        is_cached: bool,
    ) {
        if is_cached {
            let data = self.array.data(idx).cloned().unwrap_or_default();
            let line = self.array.line_mut(idx);
            self.emitter.send_writeback_from_cache(cmd, line, &data, rqstr);
        } else {
            let data = self.mshr.data_buffer(addr).cloned();
            let line = self.array.line(idx);
            self.emitter
                .send_writeback_from_mshr(cmd, line, rqstr, data.as_ref());
        }
    }

    /// GetS. Non-inclusive, so hits do not deallocate the local copy.
    pub(crate) fn handle_get_s(&mut self, ev: &MemEvent, idx: usize, replay: bool) -> Disposition {
        let addr = self.array.line(idx).base_addr();
        let state = self.array.line(idx).state();
        let local_prefetch = ev.prefetch && ev.rqstr == self.config.owner_name;

        // a local prefetch wants the data resident, so claim a slot up front
        if local_prefetch && state == State::I && !self.array.is_cached(idx) {
            if !self.allocate_dir_cache_line(addr, idx, false) {
                return Disposition::Stall;
            }
        }

        let is_cached = self.array.is_cached(idx);
        match state {
            State::I => {
                let send_time =
                    self.emitter
                        .forward_message(ev, addr, self.config.line_size, 0, None);
                self.notify(ev, AccessType::Read, ResultType::Miss);
                let line = self.array.line_mut(idx);
                line.set_state(State::IS);
                line.set_timestamp(send_time);
                Disposition::Stall
            }
            State::S => {
                self.notify(ev, AccessType::Read, ResultType::Hit);
                if local_prefetch {
                    return Disposition::Done; // redundant prefetch
                }
                self.clear_prefetch(idx);
                if is_cached {
                    let data = self.array.data(idx).cloned().unwrap_or_default();
                    let timestamp = self.array.line(idx).timestamp();
                    let send_time =
                        self.emitter
                            .send_response_up(ev, None, Some(&data), replay, timestamp);
                    let line = self.array.line_mut(idx);
                    line.add_sharer(&ev.src);
                    line.set_timestamp(send_time);
                    return Disposition::Done;
                }
                let Self { array, mshr, emitter, .. } = self;
                let line = array.line_mut(idx);
                emitter.send_fetch(line, &ev.rqstr, replay);
                mshr.increment_acks_needed(addr);
                // fetch in progress; block incoming invalidates until it lands
                line.set_state(State::S_D);
                Disposition::Stall
            }
            State::E | State::M => {
                self.notify(ev, AccessType::Read, ResultType::Hit);
                if local_prefetch {
                    return Disposition::Done;
                }
                self.clear_prefetch(idx);
                if self.array.line(idx).owner().is_some() {
                    let Self { array, mshr, emitter, .. } = self;
                    let line = array.line_mut(idx);
                    emitter.send_fetch_inv_x(line, &ev.rqstr, replay);
                    mshr.increment_acks_needed(addr);
                    line.set_state(if state == State::E {
                        State::E_InvX
                    } else {
                        State::M_InvX
                    });
                    Disposition::Stall
                } else if is_cached {
                    let data = self.array.data(idx).cloned().unwrap_or_default();
                    let timestamp = self.array.line(idx).timestamp();
                    if self.config.protocol_mes && self.array.line(idx).num_sharers() == 0 {
                        let send_time = self.emitter.send_response_up(
                            ev,
                            Some(Command::GetXResp),
                            Some(&data),
                            replay,
                            timestamp,
                        );
                        let line = self.array.line_mut(idx);
                        line.set_owner(&ev.src);
                        line.set_timestamp(send_time);
                    } else {
                        let send_time =
                            self.emitter
                                .send_response_up(ev, None, Some(&data), replay, timestamp);
                        let line = self.array.line_mut(idx);
                        line.add_sharer(&ev.src);
                        line.set_timestamp(send_time);
                    }
                    Disposition::Done
                } else {
                    let Self { array, mshr, emitter, .. } = self;
                    let line = array.line_mut(idx);
                    emitter.send_fetch(line, &ev.rqstr, replay);
                    mshr.increment_acks_needed(addr);
                    line.set_state(if state == State::E {
                        State::E_D
                    } else {
                        State::M_D
                    });
                    Disposition::Stall
                }
            }
            s => panic!(
                "GetS in unstable state {s}: addr={addr:#x}, src={}",
                ev.src
            ),
        }
    }

    /// GetX / GetSX.
    pub(crate) fn handle_get_x(&mut self, ev: &MemEvent, idx: usize, replay: bool) -> Disposition {
        let addr = self.array.line(idx).base_addr();
        let mut state = self.array.line(idx).state();
        let is_cached = self.array.is_cached(idx);

        // last coherence level: upgrade in place, no forwarding
        if state == State::S && self.config.last_level {
            state = State::M;
            self.array.line_mut(idx).set_state(State::M);
        }

        match state {
            State::I => {
                self.notify(ev, AccessType::Write, ResultType::Miss);
                let send_time = self.emitter.forward_message(
                    ev,
                    addr,
                    self.config.line_size,
                    0,
                    Some(&ev.payload),
                );
                let line = self.array.line_mut(idx);
                line.set_state(State::IM);
                line.set_timestamp(send_time);
                Disposition::Stall
            }
            State::S => {
                self.notify(ev, AccessType::Write, ResultType::Miss);
                self.clear_prefetch(idx);
                let timestamp = self.array.line(idx).timestamp();
                let send_time = self.emitter.forward_message(
                    ev,
                    addr,
                    self.config.line_size,
                    timestamp,
                    Some(&ev.payload),
                );
                let Self { array, mshr, emitter, .. } = self;
                let line = array.line_mut(idx);
                if emitter.invalidate_sharers_except_requestor(
                    line, mshr, &ev.src, &ev.rqstr, replay, false,
                ) {
                    line.set_state(State::SM_Inv);
                } else {
                    line.set_state(State::SM);
                    line.set_timestamp(send_time);
                }
                Disposition::Stall
            }
            State::E | State::M => {
                if state == State::E {
                    self.array.line_mut(idx).set_state(State::M);
                }
                self.notify(ev, AccessType::Write, ResultType::Hit);
                self.clear_prefetch(idx);
                {
                    let Self { array, mshr, emitter, .. } = self;
                    let line = array.line_mut(idx);
                    if emitter.invalidate_sharers_except_requestor(
                        line, mshr, &ev.src, &ev.rqstr, replay, !is_cached,
                    ) {
                        line.set_state(State::M_Inv);
                        return Disposition::Stall;
                    }
                    if line.owner().is_some() {
                        emitter.send_fetch_inv(line, &ev.rqstr, replay);
                        mshr.increment_acks_needed(addr);
                        line.set_state(State::M_Inv);
                        return Disposition::Stall;
                    }
                }
                let data = self.array.data(idx).cloned();
                let timestamp = self.array.line(idx).timestamp();
                // an upgrade: the requestor has the data already when cached
                let send_time =
                    self.emitter
                        .send_response_up(ev, None, data.as_deref(), replay, timestamp);
                let line = self.array.line_mut(idx);
                if line.is_sharer(&ev.src) {
                    line.remove_sharer(&ev.src);
                }
                line.set_owner(&ev.src);
                line.set_timestamp(send_time);
                Disposition::Done
            }
            // retried too soon; the forwarded request is still outstanding
            State::SM => Disposition::Stall,
            s => panic!("GetX in unhandled state {s}: addr={addr:#x}, src={}", ev.src),
        }
    }

    /// PutS from a child. `req` is the racing request at the MSHR head, if
    /// any; the returned disposition describes `req`.
    pub(crate) fn handle_put_s(
        &mut self,
        ev: &MemEvent,
        idx: usize,
        req: Option<&MemEvent>,
    ) -> Disposition {
        let addr = self.array.line(idx).base_addr();
        let state = self.array.line(idx).state();

        // during a fetch only the fetch target's Put stands in for the ack
        if matches!(state, State::S_D | State::E_D | State::SM_D | State::M_D) {
            if self.array.line(idx).first_sharer().map(String::as_str) == Some(ev.src.as_str()) {
                self.mshr.decrement_acks_needed(addr);
            }
        } else if self.mshr.acks_needed(addr) > 0 {
            self.mshr.decrement_acks_needed(addr);
        }

        if self.array.line(idx).is_sharer(&ev.src) {
            self.array.line_mut(idx).remove_sharer(&ev.src);
        }
        self.deposit_payload(idx, addr, &ev.payload);

        if self.mshr.acks_needed(addr) > 0 {
            return Disposition::Ignore;
        }

        let expect_ack = self.config.expect_writeback_ack;
        match state {
            State::I | State::S | State::E | State::M | State::S_B => {
                self.emitter.send_writeback_ack(ev);
                Disposition::Done
            }
            State::SI | State::EI | State::MI => {
                let cmd = match state {
                    State::SI => Command::PutS,
                    State::EI => Command::PutE,
                    _ => Command::PutM,
                };
                let rqstr = self.put_race_rqstr(req);
                let line = self.array.line(idx);
                self.emitter
                    .send_writeback_from_mshr(cmd, line, &rqstr, Some(&ev.payload));
                if expect_ack {
                    self.mshr.insert_writeback(addr);
                }
                self.array.line_mut(idx).set_state(State::I);
                Disposition::Done
            }
            State::S_Inv => {
                // raced with an Inv or FetchInv in progress
                let req = self.racing_request(ev, state, req);
                if req.cmd == Command::Inv {
                    self.emitter.send_ack_inv(&req);
                } else {
                    self.emitter.send_response_down_from_mshr(&req, ev, false);
                }
                self.array.line_mut(idx).set_state(State::I);
                Disposition::Done
            }
            State::SB_Inv => {
                let req = self.racing_request(ev, state, req);
                self.emitter.send_ack_inv(&req);
                self.array.line_mut(idx).set_state(State::I_B);
                Disposition::Done
            }
            State::S_D | State::E_D | State::M_D => {
                // raced with the Fetch this state is waiting on
                self.array.line_mut(idx).set_state(state.settled());
                let req = self.racing_request(ev, state, req);
                match req.cmd {
                    Command::Fetch => {
                        if !self.array.is_cached(idx) && self.array.line(idx).num_sharers() == 0 {
                            let cmd = match state {
                                State::S_D => Command::PutS,
                                State::E_D => Command::PutE,
                                _ => Command::PutM,
                            };
                            let line = self.array.line(idx);
                            self.emitter.send_writeback_from_mshr(
                                cmd,
                                line,
                                &req.rqstr,
                                Some(&ev.payload),
                            );
                            self.array.line_mut(idx).set_state(State::I);
                        } else {
                            self.emitter.send_response_down_from_mshr(&req, ev, false);
                        }
                    }
                    Command::GetS => {
                        self.notify(&req, AccessType::Read, ResultType::Hit);
                        let promote = state != State::S_D
                            && self.array.line(idx).num_sharers() == 0;
                        let timestamp = self.array.line(idx).timestamp();
                        let send_time = if promote {
                            let t = self.emitter.send_response_up(
                                &req,
                                Some(Command::GetXResp),
                                Some(&ev.payload),
                                true,
                                timestamp,
                            );
                            self.array.line_mut(idx).set_owner(&req.src);
                            t
                        } else {
                            let t = self.emitter.send_response_up(
                                &req,
                                None,
                                Some(&ev.payload),
                                true,
                                timestamp,
                            );
                            self.array.line_mut(idx).add_sharer(&req.src);
                            t
                        };
                        self.array.line_mut(idx).set_timestamp(send_time);
                    }
                    other => panic!(
                        "PutS in state {state} with stalled {other}: addr={addr:#x}"
                    ),
                }
                Disposition::Done
            }
            State::E_Inv => {
                if let Some(req) = req {
                    if req.cmd == Command::FetchInv {
                        let line = self.array.line_mut(idx);
                        self.emitter
                            .send_response_down(req, line, &ev.payload, ev.dirty, true);
                        self.array.line_mut(idx).set_state(State::I);
                    }
                }
                Disposition::Done
            }
            State::E_InvX => {
                // raced with the Fetch sent for a FetchInvX
                self.array.line_mut(idx).set_state(State::S);
                let req = self.racing_request(ev, state, req);
                if req.cmd != Command::FetchInvX {
                    panic!("PutS in state {state} with stalled {}: addr={addr:#x}", req.cmd);
                }
                if !self.array.is_cached(idx) && self.array.line(idx).num_sharers() == 0 {
                    let line = self.array.line(idx);
                    self.emitter.send_writeback_from_mshr(
                        Command::PutE,
                        line,
                        &req.rqstr,
                        Some(&ev.payload),
                    );
                    self.array.line_mut(idx).set_state(State::I);
                } else {
                    self.emitter.send_response_down_from_mshr(&req, ev, false);
                }
                Disposition::Done
            }
            State::M_Inv => {
                let req = self.racing_request(ev, state, req);
                if req.cmd == Command::FetchInv {
                    let line = self.array.line_mut(idx);
                    self.emitter
                        .send_response_down(&req, line, &ev.payload, true, true);
                    self.array.line_mut(idx).set_state(State::I);
                } else {
                    self.notify(&req, AccessType::Write, ResultType::Hit);
                    let timestamp = self.array.line(idx).timestamp();
                    let send_time = self.emitter.send_response_up(
                        &req,
                        None,
                        Some(&ev.payload),
                        true,
                        timestamp,
                    );
                    let line = self.array.line_mut(idx);
                    if line.is_sharer(&req.src) {
                        line.remove_sharer(&req.src);
                    }
                    line.set_owner(&req.src);
                    line.set_timestamp(send_time);
                    line.set_state(State::M);
                }
                Disposition::Done
            }
            State::SM_Inv => {
                let req = self.racing_request(ev, state, req);
                match req.cmd {
                    Command::Inv => {
                        if self.array.line(idx).num_sharers() > 0 {
                            let Self { array, mshr, emitter, .. } = self;
                            let line = array.line_mut(idx);
                            emitter.invalidate_all_sharers(line, mshr, &ev.rqstr, true);
                            return Disposition::Ignore;
                        }
                        self.emitter.send_ack_inv(&req);
                        self.array.line_mut(idx).set_state(State::IM);
                        Disposition::Done
                    }
                    Command::FetchInv => {
                        if self.array.line(idx).num_sharers() > 0 {
                            let Self { array, mshr, emitter, .. } = self;
                            let line = array.line_mut(idx);
                            emitter.invalidate_all_sharers(line, mshr, &ev.rqstr, true);
                            return Disposition::Ignore;
                        }
                        self.emitter.send_response_down_from_mshr(&req, ev, false);
                        self.array.line_mut(idx).set_state(State::IM);
                        Disposition::Done
                    }
                    // upgrade still waiting on its data; leave it queued
                    _ => {
                        self.array.line_mut(idx).set_state(State::SM);
                        Disposition::Ignore
                    }
                }
            }
            State::SM_D => {
                let req = self.racing_request(ev, state, req);
                if req.cmd == Command::Fetch {
                    self.emitter.send_response_down_from_mshr(&req, ev, false);
                    self.array.line_mut(idx).set_state(State::SM);
                }
                Disposition::Done
            }
            s => panic!("PutS in unhandled state {s}: addr={addr:#x}, src={}", ev.src),
        }
    }

    fn put_race_rqstr(&self, req: Option<&MemEvent>) -> String {
        req.map_or_else(|| self.config.owner_name.clone(), |req| req.rqstr.clone())
    }

    fn racing_request(&self, ev: &MemEvent, state: State, req: Option<&MemEvent>) -> MemEvent {
        req.cloned().unwrap_or_else(|| {
            panic!(
                "{} in state {state} with no racing request: addr={:#x}",
                ev.cmd, ev.base_addr
            )
        })
    }

    /// PutE / PutM from the owner. The Put itself always completes; the
    /// disposition describes the racing request.
    pub(crate) fn handle_put_m(
        &mut self,
        ev: &MemEvent,
        idx: usize,
        req: Option<&MemEvent>,
    ) -> Disposition {
        let addr = self.array.line(idx).base_addr();
        let state = self.array.line(idx).state();
        let is_cached = self.array.is_cached(idx);

        self.deposit_payload(idx, addr, &ev.payload);
        if self.mshr.acks_needed(addr) > 0 {
            self.mshr.decrement_acks_needed(addr);
        }

        let expect_ack = self.config.expect_writeback_ack;
        match state {
            State::E | State::M => {
                let dirty_now = state == State::M || ev.dirty;
                if state == State::E && ev.dirty {
                    self.array.line_mut(idx).set_state(State::M);
                }
                self.array.line_mut(idx).clear_owner();
                self.emitter.send_writeback_ack(ev);
                if !is_cached {
                    let cmd = if dirty_now { Command::PutM } else { Command::PutE };
                    let line = self.array.line(idx);
                    self.emitter.send_writeback_from_mshr(
                        cmd,
                        line,
                        &ev.rqstr,
                        Some(&ev.payload),
                    );
                    if expect_ack {
                        self.mshr.insert_writeback(addr);
                    }
                    self.array.line_mut(idx).set_state(State::I);
                }
                Disposition::Done
            }
            State::EI | State::MI => {
                // evicting this block anyway
                let dirty_now = state == State::MI || ev.dirty;
                if state == State::EI && ev.dirty {
                    self.array.line_mut(idx).set_state(State::MI);
                }
                self.array.line_mut(idx).clear_owner();
                let cmd = if dirty_now { Command::PutM } else { Command::PutE };
                let owner_name = self.config.owner_name.clone();
                let line = self.array.line(idx);
                self.emitter
                    .send_writeback_from_mshr(cmd, line, &owner_name, Some(&ev.payload));
                if expect_ack {
                    self.mshr.insert_writeback(addr);
                }
                self.array.line_mut(idx).set_state(State::I);
                Disposition::Done
            }
            State::E_InvX | State::M_InvX => {
                self.array.line_mut(idx).clear_owner();
                let req = self.racing_request(ev, state, req);
                let dirty = state == State::M_InvX || ev.cmd == Command::PutM || ev.dirty;
                if req.cmd == Command::FetchInvX {
                    if !is_cached {
                        let cmd = if dirty { Command::PutM } else { Command::PutE };
                        let line = self.array.line(idx);
                        self.emitter.send_writeback_from_mshr(
                            cmd,
                            line,
                            &req.rqstr,
                            Some(&ev.payload),
                        );
                        self.array.line_mut(idx).set_state(State::I);
                        if expect_ack {
                            self.mshr.insert_writeback(addr);
                        }
                    } else {
                        self.emitter.send_response_down_from_mshr(&req, ev, dirty);
                        self.array.line_mut(idx).set_state(State::S);
                    }
                } else {
                    self.notify(&req, AccessType::Read, ResultType::Hit);
                    let timestamp = self.array.line(idx).timestamp();
                    if self.config.protocol_mes {
                        let send_time = self.emitter.send_response_up(
                            &req,
                            Some(Command::GetXResp),
                            Some(&ev.payload),
                            true,
                            timestamp,
                        );
                        let line = self.array.line_mut(idx);
                        line.set_owner(&req.src);
                        line.set_timestamp(send_time);
                    } else {
                        let send_time = self.emitter.send_response_up(
                            &req,
                            None,
                            Some(&ev.payload),
                            true,
                            timestamp,
                        );
                        let line = self.array.line_mut(idx);
                        line.add_sharer(&req.src);
                        line.set_timestamp(send_time);
                    }
                    self.array
                        .line_mut(idx)
                        .set_state(if dirty { State::M } else { State::E });
                }
                Disposition::Done
            }
            State::E_Inv | State::M_Inv => {
                // raced with the FetchInv sent to the owner
                if state == State::E_Inv && ev.cmd == Command::PutM {
                    self.array.line_mut(idx).set_state(State::M_Inv);
                }
                self.array.line_mut(idx).clear_owner();
                let req = self.racing_request(ev, state, req);
                if matches!(req.cmd, Command::GetX | Command::GetSX) {
                    self.notify(&req, AccessType::Write, ResultType::Hit);
                    let timestamp = self.array.line(idx).timestamp();
                    let send_time = self.emitter.send_response_up(
                        &req,
                        None,
                        Some(&ev.payload),
                        true,
                        timestamp,
                    );
                    let line = self.array.line_mut(idx);
                    if line.is_sharer(&req.src) {
                        line.remove_sharer(&req.src);
                    }
                    line.set_owner(&req.src);
                    line.set_timestamp(send_time);
                    line.set_state(State::M);
                } else {
                    let dirty = self.array.line(idx).state() == State::M_Inv;
                    self.emitter.send_response_down_from_mshr(&req, ev, dirty);
                    self.array.line_mut(idx).set_state(State::I);
                }
                Disposition::Done
            }
            s => panic!(
                "{} in unhandled state {s}: addr={addr:#x}, src={}",
                ev.cmd, ev.src
            ),
        }
    }

    /// Inv from the parent.
    pub(crate) fn handle_inv(&mut self, ev: &MemEvent, idx: usize, replay: bool) -> Disposition {
        let addr = self.array.line(idx).base_addr();
        let state = self.array.line(idx).state();
        self.clear_prefetch(idx);

        match state {
            // flush already forwarded; it doubles as the ack
            State::I_B => Disposition::Done,
            State::S | State::S_B => {
                if self.array.line(idx).num_sharers() > 0 {
                    {
                        let Self { array, mshr, emitter, .. } = self;
                        let line = array.line_mut(idx);
                        emitter.invalidate_all_sharers(line, mshr, &ev.rqstr, replay);
                        line.set_state(if state == State::S_B {
                            State::SB_Inv
                        } else {
                            State::S_Inv
                        });
                    }
                    self.consume_queued_put_s(addr, idx);
                    if self.mshr.acks_needed(addr) > 0 {
                        return Disposition::Stall;
                    }
                }
                self.emitter.send_ack_inv(ev);
                self.array.line_mut(idx).set_state(if state == State::S_B {
                    State::I_B
                } else {
                    State::I
                });
                Disposition::Done
            }
            State::SM => {
                if self.array.line(idx).num_sharers() > 0 {
                    {
                        let Self { array, mshr, emitter, .. } = self;
                        let line = array.line_mut(idx);
                        emitter.invalidate_all_sharers(line, mshr, &ev.rqstr, replay);
                        line.set_state(State::SM_Inv);
                    }
                    self.consume_queued_put_s(addr, idx);
                    if self.mshr.acks_needed(addr) > 0 {
                        return Disposition::Stall;
                    }
                }
                self.emitter.send_ack_inv(ev);
                self.array.line_mut(idx).set_state(State::IM);
                Disposition::Done
            }
            State::SI | State::S_Inv | State::S_D => Disposition::Block,
            State::SM_Inv => Disposition::Stall,
            s => panic!("Inv in unhandled state {s}: addr={addr:#x}, src={}", ev.src),
        }
    }

    /// Waiting PutS replacements double as invalidation acks: the sharer is
    /// already gone, so drop its Put and take the ack.
    fn consume_queued_put_s(&mut self, addr: address, idx: usize) {
        while self
            .mshr
            .lookup_front(addr)
            .is_some_and(|front| front.cmd == Command::PutS)
        {
            let put = self.mshr.remove_front(addr).expect("front checked above");
            self.array.line_mut(idx).remove_sharer(&put.src);
            self.mshr.decrement_acks_needed(addr);
        }
    }

    /// ForceInv: invalidate regardless of dirtiness, ack without data.
    pub(crate) fn handle_force_inv(
        &mut self,
        ev: &MemEvent,
        idx: usize,
        replay: bool,
    ) -> Disposition {
        let addr = self.array.line(idx).base_addr();
        self.clear_prefetch(idx);

        // queued replacements have effectively happened; ack them and move on
        while self
            .mshr
            .lookup_front(addr)
            .is_some_and(|front| front.cmd.is_writeback())
        {
            let put = self.mshr.remove_front(addr).expect("front checked above");
            let line = self.array.line_mut(idx);
            if line.is_sharer(&put.src) {
                line.remove_sharer(&put.src);
            }
            if line.owner().is_some() {
                line.clear_owner();
            }
            self.emitter.send_writeback_ack(&put);
        }

        let state = self.array.line(idx).state();
        match state {
            // something already told the parent this line is invalid
            State::I | State::IS | State::IM | State::I_B => Disposition::Ignore,
            State::S | State::S_B | State::SM => {
                if self.array.line(idx).num_sharers() > 0 {
                    let Self { array, mshr, emitter, .. } = self;
                    let line = array.line_mut(idx);
                    emitter.invalidate_all_sharers(line, mshr, &ev.rqstr, replay);
                    line.set_state(match state {
                        State::S => State::S_Inv,
                        State::S_B => State::SB_Inv,
                        _ => State::SM_Inv,
                    });
                    if mshr.acks_needed(addr) > 0 {
                        return Disposition::Stall;
                    }
                }
                self.emitter.send_ack_inv(ev);
                self.array.line_mut(idx).set_state(match state {
                    State::S => State::I,
                    State::S_B => State::I_B,
                    _ => State::IM,
                });
                Disposition::Done
            }
            State::E | State::M => {
                let inv_state = if state == State::E {
                    State::E_Inv
                } else {
                    State::M_Inv
                };
                if self.array.line(idx).owner().is_some() {
                    let Self { array, mshr, emitter, .. } = self;
                    let line = array.line_mut(idx);
                    emitter.send_force_inv(line, &ev.rqstr, replay);
                    mshr.increment_acks_needed(addr);
                    line.set_state(inv_state);
                    return Disposition::Stall;
                }
                if self.array.line(idx).num_sharers() > 0 {
                    let Self { array, mshr, emitter, .. } = self;
                    let line = array.line_mut(idx);
                    emitter.invalidate_all_sharers(line, mshr, &ev.rqstr, replay);
                    line.set_state(inv_state);
                    return Disposition::Stall;
                }
                self.emitter.send_ack_inv(ev);
                self.array.line_mut(idx).set_state(State::I);
                Disposition::Done
            }
            State::SI => {
                self.array.line_mut(idx).set_state(State::S_Inv);
                Disposition::Stall
            }
            State::EI => {
                self.array.line_mut(idx).set_state(State::E_Inv);
                Disposition::Stall
            }
            State::MI => {
                self.array.line_mut(idx).set_state(State::M_Inv);
                Disposition::Stall
            }
            s if s.in_transition() => self.block_or_stall_behind_flush(addr),
            s => panic!(
                "ForceInv in unhandled state {s}: addr={addr:#x}, src={}",
                ev.src
            ),
        }
    }

    /// An invalidation meeting a pending flush must not wait behind it
    /// (deadlock); everything else waits behind the in-flight request.
    fn block_or_stall_behind_flush(&self, addr: address) -> Disposition {
        match self.mshr.lookup_front(addr) {
            Some(front)
                if matches!(front.cmd, Command::FlushLine | Command::FlushLineInv) =>
            {
                Disposition::Stall
            }
            _ => Disposition::Block,
        }
    }

    /// Fetch: forward a copy of the data to the parent, keeping sharers.
    pub(crate) fn handle_fetch(&mut self, ev: &MemEvent, idx: usize, replay: bool) -> Disposition {
        let addr = self.array.line(idx).base_addr();
        let state = self.array.line(idx).state();

        match state {
            State::I | State::IS | State::IM => Disposition::Ignore,
            State::S | State::SM => {
                if let Some(data) = self.array.data(idx).cloned() {
                    let line = self.array.line_mut(idx);
                    self.emitter.send_response_down(ev, line, &data, false, replay);
                    return Disposition::Done;
                }
                // a queued PutS carries the data we need
                if let Some(front) = self.mshr.lookup_front(addr) {
                    if front.cmd.is_writeback() {
                        let payload = front.payload.clone();
                        let line = self.array.line_mut(idx);
                        self.emitter
                            .send_response_down(ev, line, &payload, false, replay);
                        return Disposition::Done;
                    }
                }
                let Self { array, mshr, emitter, .. } = self;
                let line = array.line_mut(idx);
                emitter.send_fetch(line, &ev.rqstr, replay);
                mshr.increment_acks_needed(addr);
                line.set_state(if state == State::S {
                    State::S_D
                } else {
                    State::SM_D
                });
                Disposition::Stall
            }
            State::S_Inv | State::SI | State::S_D => Disposition::Block,
            s => panic!("Fetch in unhandled state {s}: addr={addr:#x}, src={}", ev.src),
        }
    }

    /// FetchInv: invalidate the whole line and return the data.
    pub(crate) fn handle_fetch_inv(
        &mut self,
        ev: &MemEvent,
        idx: usize,
        replay: bool,
    ) -> Disposition {
        let addr = self.array.line(idx).base_addr();
        self.clear_prefetch(idx);
        let is_cached = self.array.is_cached(idx);

        // a queued replacement is treated as having already happened
        let mut collision = false;
        if self
            .mshr
            .lookup_front(addr)
            .is_some_and(|front| front.cmd.is_writeback())
        {
            collision = true;
            let put = self.mshr.remove_front(addr).expect("front checked above");
            {
                let line = self.array.line_mut(idx);
                if line.is_sharer(&put.src) {
                    line.remove_sharer(&put.src);
                }
                if line.owner().is_some() {
                    line.clear_owner();
                }
                if line.state() == State::E && put.dirty {
                    line.set_state(State::M);
                }
            }
            self.mshr.set_data_buffer(addr, put.payload.clone());
            self.emitter.send_writeback_ack(&put);
        }
        // after merging the Put the block is effectively modified here
        let state = if collision {
            State::M
        } else {
            self.array.line(idx).state()
        };

        match state {
            State::I | State::IS | State::IM | State::I_B => Disposition::Ignore,
            State::S | State::SM => {
                if self.array.line(idx).num_sharers() > 0 {
                    let Self { array, mshr, emitter, .. } = self;
                    let line = array.line_mut(idx);
                    if is_cached || collision {
                        emitter.invalidate_all_sharers(line, mshr, &ev.rqstr, replay);
                    } else {
                        emitter.invalidate_all_sharers_and_fetch(line, mshr, &ev.rqstr, replay);
                    }
                    line.set_state(if state == State::S {
                        State::S_Inv
                    } else {
                        State::SM_Inv
                    });
                    return Disposition::Stall;
                }
                let data = self.require_fetchable_data(idx, addr, collision, state, ev);
                let line = self.array.line_mut(idx);
                self.emitter.send_response_down(ev, line, &data, false, replay);
                self.array.line_mut(idx).set_state(if state == State::S {
                    State::I
                } else {
                    State::IM
                });
                Disposition::Done
            }
            State::S_B => {
                if self.array.line(idx).num_sharers() > 0 {
                    let Self { array, mshr, emitter, .. } = self;
                    let line = array.line_mut(idx);
                    emitter.invalidate_all_sharers(line, mshr, &ev.rqstr, replay);
                    line.set_state(State::SB_Inv);
                    return Disposition::Stall;
                }
                self.emitter.send_ack_inv(ev);
                self.array.line_mut(idx).set_state(State::I_B);
                Disposition::Done
            }
            State::E | State::M => {
                let inv_state = if state == State::E {
                    State::E_Inv
                } else {
                    State::M_Inv
                };
                if self.array.line(idx).owner().is_some() {
                    let Self { array, mshr, emitter, .. } = self;
                    let line = array.line_mut(idx);
                    emitter.send_fetch_inv(line, &ev.rqstr, replay);
                    mshr.increment_acks_needed(addr);
                    line.set_state(inv_state);
                    return Disposition::Stall;
                }
                if self.array.line(idx).num_sharers() > 0 {
                    let Self { array, mshr, emitter, .. } = self;
                    let line = array.line_mut(idx);
                    if is_cached || collision {
                        emitter.invalidate_all_sharers(line, mshr, &ev.rqstr, replay);
                    } else {
                        emitter.invalidate_all_sharers_and_fetch(line, mshr, &ev.rqstr, replay);
                    }
                    line.set_state(inv_state);
                    return Disposition::Stall;
                }
                let data = self.require_fetchable_data(idx, addr, collision, state, ev);
                let dirty = state == State::M;
                let line = self.array.line_mut(idx);
                self.emitter.send_response_down(ev, line, &data, dirty, replay);
                self.array.line_mut(idx).set_state(State::I);
                Disposition::Done
            }
            State::EI => {
                self.array.line_mut(idx).set_state(State::E_Inv);
                Disposition::Stall
            }
            State::MI => {
                self.array.line_mut(idx).set_state(State::M_Inv);
                Disposition::Stall
            }
            s if s.in_transition() => self.block_or_stall_behind_flush(addr),
            s => panic!(
                "FetchInv in unhandled state {s}: addr={addr:#x}, src={}",
                ev.src
            ),
        }
    }

    fn require_fetchable_data(
        &self,
        idx: usize,
        addr: address,
        collision: bool,
        state: State,
        ev: &MemEvent,
    ) -> Vec<u8> {
        let data = if collision {
            self.mshr.data_buffer(addr).cloned()
        } else {
            self.array.data(idx).cloned()
        };
        data.unwrap_or_else(|| {
            panic!(
                "uncached block must have owners or sharers: addr={addr:#x}, state={state}, cmd={}",
                ev.cmd
            )
        })
    }

    /// FetchInvX: downgrade the owner to a sharer and return the data.
    pub(crate) fn handle_fetch_inv_x(
        &mut self,
        ev: &MemEvent,
        idx: usize,
        replay: bool,
    ) -> Disposition {
        let addr = self.array.line(idx).base_addr();
        let is_cached = self.array.is_cached(idx);

        let collision = self
            .mshr
            .lookup_front(addr)
            .is_some_and(|front| front.cmd.is_writeback());
        let state = if collision {
            let front_dirty = self.mshr.lookup_front(addr).map_or(false, |f| f.dirty);
            if self.array.line(idx).state() == State::E && front_dirty {
                self.array.line_mut(idx).set_state(State::M);
            }
            State::M
        } else {
            self.array.line(idx).state()
        };

        match state {
            State::I | State::IS | State::IM | State::I_B | State::S_B => Disposition::Ignore,
            State::E | State::M => {
                if collision {
                    // the queued Put already surrendered ownership; downgrade
                    // it to a PutS and serve the data from its payload
                    let (payload, src) = {
                        let front = self.mshr.lookup_front(addr).expect("collision front");
                        (front.payload.clone(), front.src.clone())
                    };
                    if self.array.line(idx).owner().is_some() {
                        let line = self.array.line_mut(idx);
                        line.clear_owner();
                        line.add_sharer(&src);
                        if let Some(front) = self.mshr.lookup_front_mut(addr) {
                            front.cmd = Command::PutS;
                        }
                    }
                    self.array.line_mut(idx).set_state(State::S);
                    let line = self.array.line_mut(idx);
                    self.emitter.send_response_down(ev, line, &payload, true, replay);
                    return Disposition::Done;
                }
                if self.array.line(idx).owner().is_some() {
                    let Self { array, mshr, emitter, .. } = self;
                    let line = array.line_mut(idx);
                    emitter.send_fetch_inv_x(line, &ev.rqstr, replay);
                    mshr.increment_acks_needed(addr);
                    line.set_state(if state == State::E {
                        State::E_InvX
                    } else {
                        State::M_InvX
                    });
                    return Disposition::Stall;
                }
                if is_cached {
                    let data = self.array.data(idx).cloned().unwrap_or_default();
                    let dirty = state == State::M;
                    let line = self.array.line_mut(idx);
                    self.emitter.send_response_down(ev, line, &data, dirty, replay);
                    self.array.line_mut(idx).set_state(State::S);
                    return Disposition::Done;
                }
                // shared and not cached: recover the data first
                let Self { array, mshr, emitter, .. } = self;
                let line = array.line_mut(idx);
                emitter.send_fetch(line, &ev.rqstr, replay);
                mshr.increment_acks_needed(addr);
                line.set_state(if state == State::E {
                    State::E_InvX
                } else {
                    State::M_InvX
                });
                Disposition::Stall
            }
            s if s.in_transition() => self.block_or_stall_behind_flush(addr),
            s => panic!(
                "FetchInvX in unhandled state {s}: addr={addr:#x}, src={}",
                ev.src
            ),
        }
    }

    /// GetSResp / GetXResp from the parent: settle the request-in-flight
    /// state and forward the data to the stalled requestor.
    pub(crate) fn handle_data_response(
        &mut self,
        ev: &MemEvent,
        idx: usize,
        req: &MemEvent,
    ) -> Disposition {
        let addr = self.array.line(idx).base_addr();
        let state = self.array.line(idx).state();
        let is_cached = self.array.is_cached(idx);

        let mut req = req.clone();
        req.mem_flags = ev.mem_flags;
        let local_prefetch = req.prefetch && req.rqstr == self.config.owner_name;

        match state {
            State::IS => {
                let exclusive = ev.cmd == Command::GetXResp && self.config.protocol_mes;
                self.array.line_mut(idx).set_state(if exclusive {
                    State::E
                } else {
                    State::S
                });
                self.notify(&req, AccessType::Read, ResultType::Hit);
                if is_cached {
                    self.array.set_data(idx, &ev.payload);
                }
                if local_prefetch {
                    self.array.line_mut(idx).set_prefetch(true);
                    return Disposition::Done;
                }
                let timestamp = self.array.line(idx).timestamp();
                let send_time = if exclusive {
                    let t = self.emitter.send_response_up(
                        &req,
                        Some(Command::GetXResp),
                        Some(&ev.payload),
                        true,
                        timestamp,
                    );
                    self.array.line_mut(idx).set_owner(&req.src);
                    t
                } else {
                    let t = self.emitter.send_response_up(
                        &req,
                        None,
                        Some(&ev.payload),
                        true,
                        timestamp,
                    );
                    self.array.line_mut(idx).add_sharer(&req.src);
                    t
                };
                self.array.line_mut(idx).set_timestamp(send_time);
                Disposition::Done
            }
            State::IM | State::SM => {
                if state == State::IM && is_cached {
                    self.array.set_data(idx, &ev.payload);
                }
                self.notify(&req, AccessType::Write, ResultType::Hit);
                let payload = self
                    .array
                    .data(idx)
                    .cloned()
                    .unwrap_or_else(|| ev.payload.clone());
                let timestamp = self.array.line(idx).timestamp();
                let send_time =
                    self.emitter
                        .send_response_up(&req, None, Some(&payload), true, timestamp);
                let line = self.array.line_mut(idx);
                line.set_state(State::M);
                if line.is_sharer(&req.src) {
                    line.remove_sharer(&req.src);
                }
                line.set_owner(&req.src);
                line.set_timestamp(send_time);
                Disposition::Done
            }
            State::SM_Inv => {
                // still collecting acks; park the data until they arrive
                self.mshr.set_data_buffer(addr, ev.payload.clone());
                self.array.line_mut(idx).set_state(State::M_Inv);
                Disposition::Stall
            }
            s => panic!(
                "data response in unhandled state {s}: addr={addr:#x}, src={}",
                ev.src
            ),
        }
    }

    /// FetchResp / FetchXResp from a child.
    pub(crate) fn handle_fetch_resp(
        &mut self,
        ev: &MemEvent,
        idx: usize,
        req: Option<&MemEvent>,
    ) -> Disposition {
        let addr = self.array.line(idx).base_addr();
        let state = self.array.line(idx).state();
        let is_cached = self.array.is_cached(idx);

        if self.mshr.acks_needed(addr) > 0 {
            self.mshr.decrement_acks_needed(addr);
        }
        let action = if self.mshr.acks_needed(addr) == 0 {
            Disposition::Done
        } else {
            Disposition::Ignore
        };
        if is_cached {
            self.array.set_data(idx, &ev.payload);
        }
        let expect_ack = self.config.expect_writeback_ack;

        match state {
            State::S_D | State::SM_D | State::E_D | State::M_D => {
                self.array.line_mut(idx).set_state(state.settled());
                let req = self.racing_request(ev, state, req);
                match req.cmd {
                    Command::Fetch => {
                        self.emitter.send_response_down_from_mshr(&req, ev, false);
                    }
                    Command::GetS => {
                        self.notify(&req, AccessType::Read, ResultType::Hit);
                        let timestamp = self.array.line(idx).timestamp();
                        let send_time = self.emitter.send_response_up(
                            &req,
                            None,
                            Some(&ev.payload),
                            true,
                            timestamp,
                        );
                        let line = self.array.line_mut(idx);
                        line.add_sharer(&req.src);
                        line.set_timestamp(send_time);
                    }
                    other => panic!(
                        "FetchResp in state {state} with stalled {other}: addr={addr:#x}"
                    ),
                }
                action
            }
            State::SI => {
                self.array.line_mut(idx).remove_sharer(&ev.src);
                self.mshr.set_data_buffer(addr, ev.payload.clone());
                if action == Disposition::Done {
                    let rqstr = self.put_race_rqstr(req);
                    let line = self.array.line(idx);
                    self.emitter.send_writeback_from_mshr(
                        Command::PutS,
                        line,
                        &rqstr,
                        Some(&ev.payload),
                    );
                    if expect_ack {
                        self.mshr.insert_writeback(addr);
                    }
                    self.array.line_mut(idx).set_state(State::I);
                }
                action
            }
            State::EI | State::MI => {
                let dirty = state == State::MI || ev.dirty;
                if state == State::EI && ev.dirty {
                    self.array.line_mut(idx).set_state(State::MI);
                }
                {
                    let line = self.array.line_mut(idx);
                    if line.owner_is(&ev.src) {
                        line.clear_owner();
                    }
                    if line.is_sharer(&ev.src) {
                        line.remove_sharer(&ev.src);
                    }
                }
                if action == Disposition::Done {
                    let cmd = if dirty { Command::PutM } else { Command::PutE };
                    let owner_name = self.config.owner_name.clone();
                    let line = self.array.line(idx);
                    self.emitter.send_writeback_from_mshr(
                        cmd,
                        line,
                        &owner_name,
                        Some(&ev.payload),
                    );
                    if expect_ack {
                        self.mshr.insert_writeback(addr);
                    }
                    self.array.line_mut(idx).set_state(State::I);
                }
                action
            }
            State::E_InvX | State::M_InvX => {
                {
                    let line = self.array.line_mut(idx);
                    if line.owner_is(&ev.src) {
                        line.clear_owner();
                        line.add_sharer(&ev.src);
                    }
                }
                if !is_cached {
                    self.mshr.set_data_buffer(addr, ev.payload.clone());
                }
                let dirty = state == State::M_InvX || ev.dirty;
                let req = self.racing_request(ev, state, req);
                match req.cmd {
                    Command::FetchInvX => {
                        self.emitter.send_response_down_from_mshr(&req, ev, dirty);
                        self.array.line_mut(idx).set_state(State::S);
                        action
                    }
                    Command::FetchInv => {
                        // an external FetchInv raced with our flush
                        if self.array.line(idx).num_sharers() > 0 {
                            let Self { array, mshr, emitter, .. } = self;
                            let line = array.line_mut(idx);
                            emitter.invalidate_all_sharers(line, mshr, &req.rqstr, true);
                            line.set_state(if dirty { State::M_Inv } else { State::E_Inv });
                            return Disposition::Stall;
                        }
                        self.array
                            .line_mut(idx)
                            .set_state(if dirty { State::M } else { State::E });
                        self.emitter.send_response_down_from_mshr(&req, ev, dirty);
                        action
                    }
                    Command::FlushLine => {
                        self.array
                            .line_mut(idx)
                            .set_state(if dirty { State::M } else { State::E });
                        self.handle_flush_line(&req, Some(idx), None, true)
                    }
                    _ => {
                        self.notify(&req, AccessType::Read, ResultType::Hit);
                        let timestamp = self.array.line(idx).timestamp();
                        let send_time = self.emitter.send_response_up(
                            &req,
                            None,
                            Some(&ev.payload),
                            true,
                            timestamp,
                        );
                        let line = self.array.line_mut(idx);
                        line.add_sharer(&req.src);
                        line.set_timestamp(send_time);
                        line.set_state(if dirty { State::M } else { State::E });
                        action
                    }
                }
            }
            State::E_Inv | State::M_Inv => {
                {
                    let line = self.array.line_mut(idx);
                    if line.is_sharer(&ev.src) {
                        line.remove_sharer(&ev.src);
                    }
                    if line.owner_is(&ev.src) {
                        line.clear_owner();
                    }
                }
                if action != Disposition::Done {
                    if ev.dirty {
                        self.array.line_mut(idx).set_state(State::M_Inv);
                    }
                    self.mshr.set_data_buffer(addr, ev.payload.clone());
                    return action;
                }
                let req = self.racing_request(ev, state, req);
                match req.cmd {
                    Command::GetX | Command::GetSX => {
                        self.notify(&req, AccessType::Write, ResultType::Hit);
                        let timestamp = self.array.line(idx).timestamp();
                        let send_time = self.emitter.send_response_up(
                            &req,
                            None,
                            Some(&ev.payload),
                            true,
                            timestamp,
                        );
                        let line = self.array.line_mut(idx);
                        if line.is_sharer(&req.src) {
                            line.remove_sharer(&req.src);
                        }
                        line.set_owner(&req.src);
                        line.set_timestamp(send_time);
                        line.set_state(State::M);
                        action
                    }
                    Command::FlushLineInv => {
                        if ev.dirty {
                            self.deposit_payload(idx, addr, &ev.payload);
                        }
                        let dirty = ev.dirty || state == State::M_Inv;
                        self.array
                            .line_mut(idx)
                            .set_state(if dirty { State::M } else { State::E });
                        self.handle_flush_line_inv(&req, Some(idx), None, true)
                    }
                    _ => {
                        let dirty = state == State::M_Inv || ev.dirty;
                        self.emitter.send_response_down_from_mshr(&req, ev, dirty);
                        self.array.line_mut(idx).set_state(State::I);
                        action
                    }
                }
            }
            State::S_Inv | State::SM_Inv => {
                self.array.line_mut(idx).remove_sharer(&ev.src);
                if action != Disposition::Done {
                    self.mshr.set_data_buffer(addr, ev.payload.clone());
                    return action;
                }
                let req = self.racing_request(ev, state, req);
                self.emitter.send_response_down_from_mshr(&req, ev, false);
                self.array.line_mut(idx).set_state(if state == State::S_Inv {
                    State::I
                } else {
                    State::IM
                });
                action
            }
            s => panic!(
                "FetchResp in unhandled state {s}: addr={addr:#x}, src={}",
                ev.src
            ),
        }
    }

    /// AckInv from a child.
    pub(crate) fn handle_ack_inv(
        &mut self,
        ev: &MemEvent,
        idx: usize,
        req: Option<&MemEvent>,
    ) -> Disposition {
        let addr = self.array.line(idx).base_addr();
        let state = self.array.line(idx).state();

        if self.array.line(idx).is_sharer(&ev.src) {
            self.array.line_mut(idx).remove_sharer(&ev.src);
        }
        if self.mshr.acks_needed(addr) > 0 {
            self.mshr.decrement_acks_needed(addr);
        }
        log::trace!(
            "directory::handle_ack_inv(addr={addr:#x}, acks_needed={})",
            self.mshr.acks_needed(addr)
        );
        let action = if self.mshr.acks_needed(addr) == 0 {
            Disposition::Done
        } else {
            Disposition::Ignore
        };
        if action != Disposition::Done {
            return action;
        }

        let data = self.local_data(idx, addr);
        let expect_ack = self.config.expect_writeback_ack;
        match state {
            State::S_Inv => {
                let req = self.racing_request(ev, state, req);
                if req.cmd == Command::FetchInv {
                    let payload = data.unwrap_or_default();
                    let line = self.array.line_mut(idx);
                    self.emitter.send_response_down(&req, line, &payload, false, true);
                } else {
                    self.emitter.send_ack_inv(&req);
                }
                self.array.line_mut(idx).set_state(State::I);
                Disposition::Done
            }
            State::E_Inv | State::M_Inv => {
                let req = self.racing_request(ev, state, req);
                match req.cmd {
                    Command::FetchInv => {
                        let payload = data.unwrap_or_default();
                        let dirty = state == State::E_Inv;
                        let line = self.array.line_mut(idx);
                        self.emitter.send_response_down(&req, line, &payload, dirty, true);
                        self.array.line_mut(idx).set_state(State::I);
                    }
                    Command::ForceInv => {
                        self.emitter.send_ack_inv(&req);
                        self.array.line_mut(idx).set_state(State::I);
                    }
                    _ => {
                        self.notify(&req, AccessType::Write, ResultType::Hit);
                        let timestamp = self.array.line(idx).timestamp();
                        let send_time = self.emitter.send_response_up(
                            &req,
                            None,
                            data.as_deref(),
                            true,
                            timestamp,
                        );
                        let line = self.array.line_mut(idx);
                        if line.is_sharer(&req.src) {
                            line.remove_sharer(&req.src);
                        }
                        line.set_owner(&req.src);
                        line.set_timestamp(send_time);
                        line.set_state(State::M);
                    }
                }
                self.mshr.clear_data_buffer(addr);
                Disposition::Done
            }
            State::SM_Inv => {
                let req = self.racing_request(ev, state, req);
                match req.cmd {
                    Command::Inv | Command::ForceInv => {
                        if self.array.line(idx).num_sharers() > 0 {
                            let Self { array, mshr, emitter, .. } = self;
                            let line = array.line_mut(idx);
                            emitter.invalidate_all_sharers(line, mshr, &req.rqstr, true);
                            return Disposition::Stall;
                        }
                        self.emitter.send_ack_inv(&req);
                        self.array.line_mut(idx).set_state(State::IM);
                        Disposition::Done
                    }
                    Command::FetchInv => {
                        let payload = data.unwrap_or_default();
                        let line = self.array.line_mut(idx);
                        self.emitter.send_response_down(&req, line, &payload, false, true);
                        self.array.line_mut(idx).set_state(State::IM);
                        Disposition::Done
                    }
                    // the upgrade is still waiting on its data
                    _ => {
                        self.array.line_mut(idx).set_state(State::SM);
                        Disposition::Ignore
                    }
                }
            }
            State::SB_Inv => {
                let req = self.racing_request(ev, state, req);
                if self.array.line(idx).num_sharers() > 0 {
                    let Self { array, mshr, emitter, .. } = self;
                    let line = array.line_mut(idx);
                    emitter.invalidate_all_sharers(line, mshr, &req.rqstr, true);
                    return Disposition::Ignore;
                }
                self.emitter.send_ack_inv(&req);
                self.array.line_mut(idx).set_state(State::I_B);
                Disposition::Done
            }
            State::SI | State::EI | State::MI => {
                let cmd = match state {
                    State::SI => Command::PutS,
                    State::EI => Command::PutE,
                    _ => Command::PutM,
                };
                let rqstr = self.put_race_rqstr(req);
                let line = self.array.line(idx);
                self.emitter
                    .send_writeback_from_mshr(cmd, line, &rqstr, data.as_ref());
                if expect_ack {
                    self.mshr.insert_writeback(addr);
                }
                self.array.line_mut(idx).set_state(State::I);
                Disposition::Done
            }
            s => panic!(
                "AckInv in unhandled state {s}: addr={addr:#x}, src={}",
                ev.src
            ),
        }
    }

    /// FlushLine from a child: downgrade locally, then forward and wait for
    /// the parent's response.
    pub(crate) fn handle_flush_line(
        &mut self,
        ev: &MemEvent,
        idx: Option<usize>,
        req: Option<&MemEvent>,
        replay: bool,
    ) -> Disposition {
        let addr = self.config.block_addr(ev.base_addr);
        let state = idx.map_or(State::I, |i| self.array.line(i).state());

        if !ev.payload.is_empty() {
            if let Some(i) = idx {
                self.deposit_payload(i, addr, &ev.payload);
            } else if self.mshr.is_hit(addr) {
                self.mshr.set_data_buffer(addr, ev.payload.clone());
            }
        }

        match state {
            State::I | State::S | State::I_B | State::S_B => {
                if req.is_some() {
                    return Disposition::Stall;
                }
            }
            State::E | State::M => {
                let i = idx.expect("valid state implies a line");
                {
                    let line = self.array.line_mut(i);
                    if line.owner_is(&ev.src) {
                        line.clear_owner();
                        line.add_sharer(&ev.src);
                        if ev.dirty {
                            line.set_state(State::M);
                        }
                    }
                }
                if self.array.line(i).owner().is_some() {
                    let Self { array, mshr, emitter, .. } = self;
                    let line = array.line_mut(i);
                    emitter.send_fetch_inv_x(line, &ev.rqstr, replay);
                    mshr.increment_acks_needed(addr);
                    line.set_state(if state == State::E {
                        State::E_InvX
                    } else {
                        State::M_InvX
                    });
                    return Disposition::Stall;
                }
            }
            // wait for the outstanding request or race to resolve
            State::IM | State::IS | State::SM => return Disposition::Stall,
            State::SM_D | State::S_D | State::E_D | State::M_D => return Disposition::Stall,
            State::S_Inv | State::SI | State::SM_Inv => return Disposition::Stall,
            State::MI | State::EI | State::M_Inv | State::E_Inv => {
                let i = idx.expect("transient state implies a line");
                let line = self.array.line_mut(i);
                if line.owner_is(&ev.src) {
                    line.clear_owner();
                    // the owner's cache treats the outstanding FetchInv as Inv
                    line.add_sharer(&ev.src);
                }
                if ev.dirty {
                    if state == State::EI {
                        line.set_state(State::MI);
                    } else if state == State::E_Inv {
                        line.set_state(State::M_Inv);
                    }
                }
                return Disposition::Stall;
            }
            State::M_InvX | State::E_InvX => {
                let i = idx.expect("transient state implies a line");
                let mut post = state;
                {
                    let line = self.array.line_mut(i);
                    if line.owner_is(&ev.src) {
                        line.clear_owner();
                        line.add_sharer(&ev.src);
                        self.mshr.decrement_acks_needed(addr);
                        if ev.dirty {
                            self.array.line_mut(i).set_state(State::M_InvX);
                            post = State::M_InvX;
                        }
                    }
                }
                if self.mshr.acks_needed(addr) > 0 {
                    return Disposition::Stall;
                }
                let req = self.racing_request(ev, state, req);
                match req.cmd {
                    Command::FetchInvX => {
                        self.emitter
                            .send_response_down_from_mshr(&req, ev, post == State::M_InvX);
                        self.array.line_mut(i).set_state(State::S);
                    }
                    Command::FlushLine => {
                        self.array.line_mut(i).set_state(post.settled());
                        return self.handle_flush_line(&req, Some(i), None, true);
                    }
                    Command::FetchInv => {
                        self.array.line_mut(i).set_state(post.settled());
                        return self.handle_fetch_inv(&req, i, true);
                    }
                    _ => {
                        self.notify(&req, AccessType::Read, ResultType::Hit);
                        let payload = self.local_data(i, addr).unwrap_or_default();
                        let timestamp = self.array.line(i).timestamp();
                        let send_time = self.emitter.send_response_up(
                            &req,
                            None,
                            Some(&payload),
                            true,
                            timestamp,
                        );
                        let line = self.array.line_mut(i);
                        line.add_sharer(&req.src);
                        line.set_timestamp(send_time);
                        line.set_state(post.settled());
                    }
                }
                return Disposition::Done;
            }
            s => panic!(
                "FlushLine in unhandled state {s}: addr={addr:#x}, src={}",
                ev.src
            ),
        }

        self.forward_flush(ev, idx, addr, Command::FlushLine);
        if let Some(i) = idx {
            let line = self.array.line_mut(i);
            let next = if line.state() != State::I {
                State::S_B
            } else {
                State::I_B
            };
            line.set_state(next);
        }
        Disposition::Stall
    }

    /// FlushLineInv from a child: invalidate sharers and owner, invalidate
    /// locally, forward.
    pub(crate) fn handle_flush_line_inv(
        &mut self,
        ev: &MemEvent,
        idx: Option<usize>,
        req: Option<&MemEvent>,
        replay: bool,
    ) -> Disposition {
        let addr = self.config.block_addr(ev.base_addr);
        let mut state = idx.map_or(State::I, |i| self.array.line(i).state());

        if !ev.payload.is_empty() {
            if let Some(i) = idx {
                self.deposit_payload(i, addr, &ev.payload);
            } else if self.mshr.is_hit(addr) {
                self.mshr.set_data_buffer(addr, ev.payload.clone());
            }
        }

        // the source gives up its copy outright
        if matches!(state, State::E | State::M) {
            let i = idx.expect("valid state implies a line");
            let line = self.array.line_mut(i);
            if line.owner_is(&ev.src) {
                line.clear_owner();
                if ev.dirty {
                    line.set_state(State::M);
                    state = State::M;
                }
            }
        }

        match state {
            State::I => {
                if req.is_some() {
                    return Disposition::Stall;
                }
            }
            State::S => {
                let i = idx.expect("valid state implies a line");
                self.clear_prefetch(i);
                if self.array.line(i).is_sharer(&ev.src) {
                    self.array.line_mut(i).remove_sharer(&ev.src);
                }
                if self.array.line(i).num_sharers() > 0 {
                    let Self { array, mshr, emitter, .. } = self;
                    let line = array.line_mut(i);
                    emitter.invalidate_all_sharers(line, mshr, &ev.rqstr, replay);
                    line.set_state(State::S_Inv);
                    return Disposition::Stall;
                }
            }
            State::E | State::M => {
                let i = idx.expect("valid state implies a line");
                self.clear_prefetch(i);
                if self.array.line(i).is_sharer(&ev.src) {
                    self.array.line_mut(i).remove_sharer(&ev.src);
                }
                let inv_state = if state == State::E {
                    State::E_Inv
                } else {
                    State::M_Inv
                };
                if self.array.line(i).owner().is_some() {
                    let Self { array, mshr, emitter, .. } = self;
                    let line = array.line_mut(i);
                    emitter.send_fetch_inv(line, &ev.rqstr, replay);
                    mshr.increment_acks_needed(addr);
                    line.set_state(inv_state);
                    return Disposition::Stall;
                }
                if self.array.line(i).num_sharers() > 0 {
                    let Self { array, mshr, emitter, .. } = self;
                    let line = array.line_mut(i);
                    emitter.invalidate_all_sharers(line, mshr, &ev.rqstr, replay);
                    line.set_state(inv_state);
                    return Disposition::Stall;
                }
            }
            State::IM | State::IS | State::SM => return Disposition::Stall,
            State::SM_D => {
                let i = idx.expect("transient state implies a line");
                if self.array.line(i).first_sharer().map(String::as_str)
                    == Some(ev.src.as_str())
                {
                    self.mshr.decrement_acks_needed(addr);
                }
                if self.mshr.acks_needed(addr) == 0 {
                    let req = self.racing_request(ev, state, req);
                    if req.cmd == Command::Fetch {
                        self.array.line_mut(i).set_state(State::SM);
                        self.emitter.send_response_down_from_mshr(&req, ev, false);
                        return Disposition::Done;
                    }
                }
                return Disposition::Stall;
            }
            State::S_D | State::E_D | State::M_D => {
                let i = idx.expect("transient state implies a line");
                if self.array.line(i).first_sharer().map(String::as_str)
                    == Some(ev.src.as_str())
                {
                    self.mshr.decrement_acks_needed(addr);
                }
                if self.array.line(i).is_sharer(&ev.src) {
                    self.array.line_mut(i).remove_sharer(&ev.src);
                }
                if self.mshr.acks_needed(addr) > 0 {
                    return Disposition::Stall;
                }
                self.array.line_mut(i).set_state(state.settled());
                let req = self.racing_request(ev, state, req);
                match req.cmd {
                    Command::Fetch => {
                        if !self.array.is_cached(i) && self.array.line(i).num_sharers() == 0 {
                            let cmd = if state == State::M_D || ev.dirty {
                                Command::PutM
                            } else if state == State::E_D {
                                Command::PutE
                            } else {
                                Command::PutS
                            };
                            let line = self.array.line(i);
                            self.emitter.send_writeback_from_mshr(
                                cmd,
                                line,
                                &req.rqstr,
                                Some(&ev.payload),
                            );
                            self.array.line_mut(i).set_state(State::I);
                        } else {
                            self.emitter.send_response_down_from_mshr(
                                &req,
                                ev,
                                state == State::M_D || ev.dirty,
                            );
                        }
                    }
                    Command::GetS => {
                        self.notify(&req, AccessType::Read, ResultType::Hit);
                        let share = self.array.line(i).num_sharers() > 0 || state == State::S_D;
                        let timestamp = self.array.line(i).timestamp();
                        let send_time = if share {
                            let t = self.emitter.send_response_up(
                                &req,
                                None,
                                Some(&ev.payload),
                                true,
                                timestamp,
                            );
                            self.array.line_mut(i).add_sharer(&req.src);
                            t
                        } else {
                            let t = self.emitter.send_response_up(
                                &req,
                                Some(Command::GetXResp),
                                Some(&ev.payload),
                                true,
                                timestamp,
                            );
                            self.array.line_mut(i).set_owner(&req.src);
                            t
                        };
                        self.array.line_mut(i).set_timestamp(send_time);
                    }
                    other => panic!(
                        "FlushLineInv in state {state} with stalled {other}: addr={addr:#x}"
                    ),
                }
                return Disposition::Done;
            }
            State::S_Inv => {
                let i = idx.expect("transient state implies a line");
                if self.array.line(i).is_sharer(&ev.src) {
                    self.array.line_mut(i).remove_sharer(&ev.src);
                    self.mshr.decrement_acks_needed(addr);
                }
                if self.mshr.acks_needed(addr) > 0 {
                    return Disposition::Stall;
                }
                let req = self.racing_request(ev, state, req);
                match req.cmd {
                    Command::Inv => {
                        self.emitter.send_ack_inv(&req);
                        self.array.line_mut(i).set_state(State::I);
                        return Disposition::Done;
                    }
                    Command::Fetch | Command::FetchInv | Command::FetchInvX => {
                        self.emitter.send_response_down_from_mshr(&req, ev, false);
                        self.array.line_mut(i).set_state(State::I);
                        return Disposition::Done;
                    }
                    Command::FlushLineInv => {
                        self.forward_flush(&req, Some(i), addr, Command::FlushLineInv);
                        self.array.line_mut(i).set_state(State::I_B);
                        return Disposition::Stall;
                    }
                    other => panic!(
                        "FlushLineInv in state {state} with stalled {other}: addr={addr:#x}"
                    ),
                }
            }
            State::SM_Inv => {
                let i = idx.expect("transient state implies a line");
                if self.array.line(i).is_sharer(&ev.src) {
                    self.array.line_mut(i).remove_sharer(&ev.src);
                    self.mshr.decrement_acks_needed(addr);
                }
                if self.mshr.acks_needed(addr) == 0 {
                    let req = self.racing_request(ev, state, req);
                    if req.cmd == Command::Inv {
                        if self.array.line(i).num_sharers() > 0 {
                            let Self { array, mshr, emitter, .. } = self;
                            let line = array.line_mut(i);
                            emitter.invalidate_all_sharers(line, mshr, &req.rqstr, true);
                            return Disposition::Stall;
                        }
                        self.emitter.send_ack_inv(&req);
                        self.array.line_mut(i).set_state(State::IM);
                        return Disposition::Done;
                    }
                }
                return Disposition::Stall;
            }
            State::MI | State::EI => {
                let i = idx.expect("transient state implies a line");
                {
                    let line = self.array.line_mut(i);
                    if line.owner_is(&ev.src) {
                        line.clear_owner();
                        self.mshr.decrement_acks_needed(addr);
                    } else if self.array.line(i).is_sharer(&ev.src) {
                        self.array.line_mut(i).remove_sharer(&ev.src);
                        self.mshr.decrement_acks_needed(addr);
                    }
                }
                let mut post = state;
                if ev.dirty && state == State::EI {
                    self.array.line_mut(i).set_state(State::MI);
                    post = State::MI;
                }
                if self.mshr.acks_needed(addr) > 0 {
                    return Disposition::Stall;
                }
                let dirty = post == State::MI || ev.dirty;
                let cmd = if dirty { Command::PutM } else { Command::PutE };
                let cmd = if state == State::MI { Command::PutM } else { cmd };
                let owner_name = self.config.owner_name.clone();
                if self.array.is_cached(i) {
                    let data = self.array.data(i).cloned().unwrap_or_default();
                    let line = self.array.line_mut(i);
                    self.emitter
                        .send_writeback_from_cache(cmd, line, &data, &owner_name);
                } else {
                    let data = self.mshr.data_buffer(addr).cloned();
                    let line = self.array.line(i);
                    self.emitter
                        .send_writeback_from_mshr(cmd, line, &owner_name, data.as_ref());
                }
                if self.config.expect_writeback_ack {
                    self.mshr.insert_writeback(addr);
                }
                self.array.line_mut(i).set_state(State::I);
                return Disposition::Done;
            }
            State::SI => {
                let i = idx.expect("transient state implies a line");
                if self.array.line(i).is_sharer(&ev.src) {
                    self.array.line_mut(i).remove_sharer(&ev.src);
                    self.mshr.decrement_acks_needed(addr);
                }
                if self.mshr.acks_needed(addr) > 0 {
                    return Disposition::Stall;
                }
                let owner_name = self.config.owner_name.clone();
                if self.array.is_cached(i) {
                    let data = self.array.data(i).cloned().unwrap_or_default();
                    let line = self.array.line_mut(i);
                    self.emitter
                        .send_writeback_from_cache(Command::PutS, line, &data, &owner_name);
                } else {
                    let data = self.mshr.data_buffer(addr).cloned();
                    let line = self.array.line(i);
                    self.emitter.send_writeback_from_mshr(
                        Command::PutS,
                        line,
                        &owner_name,
                        data.as_ref(),
                    );
                }
                if self.config.expect_writeback_ack {
                    self.mshr.insert_writeback(addr);
                }
                self.array.line_mut(i).set_state(State::I);
                return Disposition::Done;
            }
            State::M_Inv | State::E_Inv => {
                let i = idx.expect("transient state implies a line");
                {
                    let line = self.array.line_mut(i);
                    if line.is_sharer(&ev.src) {
                        line.remove_sharer(&ev.src);
                        self.mshr.decrement_acks_needed(addr);
                    } else if self.array.line(i).owner_is(&ev.src) {
                        self.array.line_mut(i).clear_owner();
                        self.mshr.decrement_acks_needed(addr);
                    }
                }
                if self.mshr.acks_needed(addr) > 0 {
                    return Disposition::Stall;
                }
                let req = self.racing_request(ev, state, req);
                match req.cmd {
                    Command::FetchInv => {
                        let dirty = state == State::M_Inv || ev.dirty;
                        let line = self.array.line_mut(i);
                        self.emitter
                            .send_response_down(&req, line, &ev.payload, dirty, true);
                        self.array.line_mut(i).set_state(State::I);
                        return Disposition::Done;
                    }
                    Command::GetX | Command::GetSX => {
                        let payload = self.local_data(i, addr).unwrap_or_default();
                        let timestamp = self.array.line(i).timestamp();
                        let send_time = self.emitter.send_response_up(
                            &req,
                            None,
                            Some(&payload),
                            true,
                            timestamp,
                        );
                        let line = self.array.line_mut(i);
                        if line.is_sharer(&req.src) {
                            line.remove_sharer(&req.src);
                        }
                        line.set_owner(&req.src);
                        line.set_timestamp(send_time);
                        line.set_state(State::M);
                        return Disposition::Done;
                    }
                    Command::FlushLineInv => {
                        self.forward_flush(&req, Some(i), addr, Command::FlushLineInv);
                        self.array.line_mut(i).set_state(State::I_B);
                        return Disposition::Stall;
                    }
                    other => panic!(
                        "FlushLineInv in state {state} with stalled {other}: addr={addr:#x}"
                    ),
                }
            }
            State::M_InvX | State::E_InvX => {
                let i = idx.expect("transient state implies a line");
                self.clear_prefetch(i);
                if self.array.line(i).owner_is(&ev.src) {
                    self.mshr.decrement_acks_needed(addr);
                    self.array.line_mut(i).clear_owner();
                }
                if self.mshr.acks_needed(addr) > 0 {
                    return Disposition::Stall;
                }
                let dirty = state == State::M_InvX || ev.dirty;
                let req = self.racing_request(ev, state, req);
                if req.cmd == Command::FetchInvX {
                    if !self.array.is_cached(i) {
                        let cmd = if dirty { Command::PutM } else { Command::PutE };
                        let line = self.array.line(i);
                        self.emitter.send_writeback_from_mshr(
                            cmd,
                            line,
                            &req.rqstr,
                            Some(&ev.payload),
                        );
                        self.array.line_mut(i).set_state(State::I);
                        if self.config.expect_writeback_ack {
                            self.mshr.insert_writeback(addr);
                        }
                    } else {
                        self.emitter.send_response_down_from_mshr(&req, ev, dirty);
                        self.array.line_mut(i).set_state(State::S);
                    }
                } else {
                    self.notify(&req, AccessType::Read, ResultType::Hit);
                    let cmd = if self.config.protocol_mes {
                        Some(Command::GetXResp)
                    } else {
                        None
                    };
                    let timestamp = self.array.line(i).timestamp();
                    let send_time = self.emitter.send_response_up(
                        &req,
                        cmd,
                        Some(&ev.payload),
                        true,
                        timestamp,
                    );
                    let line = self.array.line_mut(i);
                    line.add_sharer(&req.src);
                    line.set_timestamp(send_time);
                    line.set_state(if dirty { State::M } else { State::E });
                }
                return Disposition::Done;
            }
            s => panic!(
                "FlushLineInv in unhandled state {s}: addr={addr:#x}, src={}",
                ev.src
            ),
        }

        self.forward_flush(ev, idx, addr, Command::FlushLineInv);
        if let Some(i) = idx {
            self.array.line_mut(i).set_state(State::I_B);
        }
        Disposition::Stall
    }

    fn forward_flush(
        &mut self,
        ev: &MemEvent,
        idx: Option<usize>,
        addr: address,
        cmd: Command,
    ) {
        // forward whatever data is at hand
        let payload = idx.and_then(|i| {
            self.array
                .data(i)
                .cloned()
                .or_else(|| self.mshr.data_buffer(addr).cloned())
                .or_else(|| (!ev.payload.is_empty()).then(|| ev.payload.clone()))
        });
        let dirty = idx.is_some_and(|i| self.array.line(i).state() == State::M);
        match idx {
            Some(i) => {
                let line = self.array.line_mut(i);
                self.emitter
                    .forward_flush_line(ev, cmd, Some(line), payload, dirty);
            }
            None => {
                self.emitter.forward_flush_line(ev, cmd, None, payload, dirty);
            }
        }
    }
}
