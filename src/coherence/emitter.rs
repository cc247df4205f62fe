use crate::config::Config;
use crate::directory::DirLine;
use crate::mem_event::{Builder, Command, Direction, MemEvent};
use crate::mshr::Mshr;
use std::collections::VecDeque;
use std::sync::Arc;

/// A message scheduled for delivery.
#[derive(Debug, Clone)]
pub struct OutgoingEvent {
    pub event: MemEvent,
    pub delivery_time: u64,
    /// Bytes on the wire: packet header plus payload.
    pub size: u32,
}

/// Constructs and timestamps outgoing messages and queues them toward the
/// parent or the children.
///
/// Delivery time is `max(now, line.timestamp) + latency`: `mshr_latency` for
/// replays, `tag_latency` for first-attempt control messages,
/// `access_latency` when the data array is read for a payload. The line
/// timestamp is advanced to the delivery time after every send so emissions
/// per address are monotonically ordered.
#[derive(Debug)]
pub struct OutboundEmitter {
    config: Arc<Config>,
    /// Logical time, advanced by the controller.
    pub now: u64,
    to_parent: VecDeque<OutgoingEvent>,
    to_children: VecDeque<OutgoingEvent>,
}

impl OutboundEmitter {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            now: 0,
            to_parent: VecDeque::new(),
            to_children: VecDeque::new(),
        }
    }

    pub fn add_to_outgoing(&mut self, resp: OutgoingEvent, direction: Direction) {
        log::debug!(
            "emitter::add_to_outgoing({}, delivery={}, {:?})",
            resp.event,
            resp.delivery_time,
            direction
        );
        match direction {
            Direction::Upstream => self.to_parent.push_back(resp),
            Direction::Downstream => self.to_children.push_back(resp),
        }
    }

    #[must_use]
    pub fn queued_upstream(&self) -> &VecDeque<OutgoingEvent> {
        &self.to_parent
    }

    #[must_use]
    pub fn queued_downstream(&self) -> &VecDeque<OutgoingEvent> {
        &self.to_children
    }

    pub fn drain_upstream(&mut self) -> impl Iterator<Item = OutgoingEvent> + '_ {
        self.to_parent.drain(..)
    }

    pub fn drain_downstream(&mut self) -> impl Iterator<Item = OutgoingEvent> + '_ {
        self.to_children.drain(..)
    }

    #[inline]
    fn delivery(&self, line_timestamp: u64, latency: u64) -> u64 {
        self.now.max(line_timestamp) + latency
    }

    #[inline]
    fn control_latency(&self, replay: bool) -> u64 {
        if replay {
            self.config.mshr_latency
        } else {
            self.config.tag_latency
        }
    }

    #[inline]
    fn data_latency(&self, replay: bool) -> u64 {
        if replay {
            self.config.mshr_latency
        } else {
            self.config.access_latency
        }
    }

    fn packet(&self, event: MemEvent, delivery_time: u64) -> OutgoingEvent {
        let size = self.config.packet_header_bytes + event.payload_size();
        OutgoingEvent {
            event,
            delivery_time,
            size,
        }
    }

    /// Send Inv to every sharer; one ack per message becomes due.
    pub fn invalidate_all_sharers(
        &mut self,
        line: &mut DirLine,
        mshr: &mut Mshr,
        rqstr: &str,
        replay: bool,
    ) {
        self.invalidate_sharers(line, mshr, rqstr, replay, None, false);
    }

    /// Send Inv to every sharer, upgrading the first message to FetchInv so
    /// the data comes back with the acks (used when the block is uncached).
    pub fn invalidate_all_sharers_and_fetch(
        &mut self,
        line: &mut DirLine,
        mshr: &mut Mshr,
        rqstr: &str,
        replay: bool,
    ) {
        self.invalidate_sharers(line, mshr, rqstr, replay, None, true);
    }

    /// Invalidate every sharer except `skip` (the upgrading requestor).
    /// When `fetch_needed` and the requestor is not itself a sharer, the
    /// first invalidation is a FetchInv to recover the data.
    ///
    /// Returns whether any invalidation went out.
    pub fn invalidate_sharers_except_requestor(
        &mut self,
        line: &mut DirLine,
        mshr: &mut Mshr,
        skip: &str,
        rqstr: &str,
        replay: bool,
        fetch_needed: bool,
    ) -> bool {
        let fetch = fetch_needed && !line.is_sharer(skip);
        self.invalidate_sharers(line, mshr, rqstr, replay, Some(skip), fetch)
    }

    fn invalidate_sharers(
        &mut self,
        line: &mut DirLine,
        mshr: &mut Mshr,
        rqstr: &str,
        replay: bool,
        skip: Option<&str>,
        mut fetch_first: bool,
    ) -> bool {
        let delivery = self.delivery(line.timestamp(), self.control_latency(replay));
        let targets: Vec<String> = line
            .sharers()
            .filter(|s| Some(s.as_str()) != skip)
            .cloned()
            .collect();
        let mut sent = false;
        for dst in targets {
            let cmd = if fetch_first {
                fetch_first = false;
                Command::FetchInv
            } else {
                Command::Inv
            };
            let inv = Builder {
                cmd,
                src: self.config.owner_name.clone(),
                dst,
                rqstr: rqstr.to_string(),
                base_addr: line.base_addr(),
                size: self.config.line_size,
                ..Builder::default()
            }
            .build();
            self.add_to_outgoing(self.packet(inv, delivery), Direction::Downstream);
            mshr.increment_acks_needed(line.base_addr());
            sent = true;
        }
        if sent {
            line.set_timestamp(delivery);
        }
        sent
    }

    /// FetchInv the owner (or, lacking one, a sharer). The caller accounts
    /// for the expected ack.
    pub fn send_fetch_inv(&mut self, line: &mut DirLine, rqstr: &str, replay: bool) {
        let dst = line
            .owner()
            .or_else(|| line.first_sharer())
            .expect("FetchInv with neither owner nor sharer")
            .clone();
        self.send_line_command(Command::FetchInv, line, dst, rqstr, replay);
    }

    /// Downgrade the owner to a sharer; it answers with FetchXResp.
    pub fn send_fetch_inv_x(&mut self, line: &mut DirLine, rqstr: &str, replay: bool) {
        let dst = line.owner().expect("FetchInvX without an owner").clone();
        self.send_line_command(Command::FetchInvX, line, dst, rqstr, replay);
    }

    /// Ask one sharer for a copy of the data without invalidating it.
    pub fn send_fetch(&mut self, line: &mut DirLine, rqstr: &str, replay: bool) {
        let dst = line
            .first_sharer()
            .expect("Fetch with no sharers")
            .clone();
        self.send_line_command(Command::Fetch, line, dst, rqstr, replay);
    }

    /// Invalidate the owner without recovering dirty data.
    pub fn send_force_inv(&mut self, line: &mut DirLine, rqstr: &str, replay: bool) {
        let dst = line.owner().expect("ForceInv without an owner").clone();
        self.send_line_command(Command::ForceInv, line, dst, rqstr, replay);
    }

    fn send_line_command(
        &mut self,
        cmd: Command,
        line: &mut DirLine,
        dst: String,
        rqstr: &str,
        replay: bool,
    ) {
        let delivery = self.delivery(line.timestamp(), self.control_latency(replay));
        let ev = Builder {
            cmd,
            src: self.config.owner_name.clone(),
            dst,
            rqstr: rqstr.to_string(),
            base_addr: line.base_addr(),
            size: self.config.line_size,
            ..Builder::default()
        }
        .build();
        self.add_to_outgoing(self.packet(ev, delivery), Direction::Downstream);
        line.set_timestamp(delivery);
    }

    /// Respond to a child's request. Returns the delivery time so the caller
    /// can advance the line timestamp.
    pub fn send_response_up(
        &mut self,
        req: &MemEvent,
        cmd: Option<Command>,
        payload: Option<&[u8]>,
        replay: bool,
        line_timestamp: u64,
    ) -> u64 {
        let mut resp = req.make_response();
        if let Some(cmd) = cmd {
            resp.cmd = cmd;
        }
        if let Some(payload) = payload {
            resp.payload = payload.to_vec();
            resp.size = payload.len() as u32;
        }
        let delivery = self.delivery(line_timestamp, self.data_latency(replay));
        self.add_to_outgoing(self.packet(resp, delivery), Direction::Downstream);
        delivery
    }

    /// Respond to the parent (FetchResp/FetchXResp/AckInv carrying data).
    pub fn send_response_down(
        &mut self,
        req: &MemEvent,
        line: &mut DirLine,
        payload: &[u8],
        dirty: bool,
        replay: bool,
    ) {
        let mut resp = req.make_response();
        resp.payload = payload.to_vec();
        resp.size = payload.len() as u32;
        resp.dirty = dirty;
        let delivery = self.delivery(line.timestamp(), self.data_latency(replay));
        self.add_to_outgoing(self.packet(resp, delivery), Direction::Upstream);
        line.set_timestamp(delivery);
    }

    /// Respond to the parent on behalf of the stalled request at the MSHR
    /// head, carrying the payload the triggering event delivered.
    pub fn send_response_down_from_mshr(
        &mut self,
        front: &MemEvent,
        trigger: &MemEvent,
        dirty: bool,
    ) {
        let mut resp = front.make_response();
        resp.payload = trigger.payload.clone();
        resp.size = trigger.size;
        resp.dirty = dirty;
        let delivery = self.now + self.config.mshr_latency;
        self.add_to_outgoing(self.packet(resp, delivery), Direction::Upstream);
    }

    /// Acknowledge an invalidation without data.
    pub fn send_ack_inv(&mut self, req: &MemEvent) {
        let mut ack = req.make_response();
        ack.cmd = Command::AckInv;
        ack.dst = self.config.parent_name.clone();
        let delivery = self.now + self.config.tag_latency;
        self.add_to_outgoing(self.packet(ack, delivery), Direction::Upstream);
    }

    /// Acknowledge a child's Put*.
    pub fn send_writeback_ack(&mut self, put: &MemEvent) {
        let ack = Builder {
            cmd: Command::AckPut,
            src: self.config.owner_name.clone(),
            dst: put.src.clone(),
            rqstr: put.src.clone(),
            base_addr: put.base_addr,
            size: put.size,
            ..Builder::default()
        }
        .build();
        let delivery = self.now + self.config.tag_latency;
        self.add_to_outgoing(self.packet(ack, delivery), Direction::Downstream);
    }

    /// Write the block back to the parent out of the data array.
    pub fn send_writeback_from_cache(
        &mut self,
        cmd: Command,
        line: &mut DirLine,
        data: &[u8],
        rqstr: &str,
    ) {
        let payload = if cmd == Command::PutM || self.config.writeback_clean_blocks {
            data.to_vec()
        } else {
            Vec::new()
        };
        let delivery = self.delivery(line.timestamp(), self.config.access_latency);
        let wb = self.writeback(cmd, line.base_addr(), payload, rqstr);
        self.add_to_outgoing(self.packet(wb, delivery), Direction::Upstream);
        line.set_timestamp(delivery);
    }

    /// Write the block back out of the MSHR data buffer (uncached block).
    pub fn send_writeback_from_mshr(
        &mut self,
        cmd: Command,
        line: &DirLine,
        rqstr: &str,
        data: Option<&Vec<u8>>,
    ) {
        let payload = match data {
            Some(data) if cmd == Command::PutM || self.config.writeback_clean_blocks => {
                data.clone()
            }
            _ => Vec::new(),
        };
        let delivery = self.now + self.config.access_latency;
        let wb = self.writeback(cmd, line.base_addr(), payload, rqstr);
        self.add_to_outgoing(self.packet(wb, delivery), Direction::Upstream);
    }

    fn writeback(
        &self,
        cmd: Command,
        base_addr: crate::address,
        payload: Vec<u8>,
        rqstr: &str,
    ) -> MemEvent {
        debug_assert!(cmd.is_writeback());
        Builder {
            cmd,
            src: self.config.owner_name.clone(),
            dst: self.config.parent_name.clone(),
            rqstr: rqstr.to_string(),
            base_addr,
            size: self.config.line_size,
            payload,
            dirty: cmd == Command::PutM,
            ..Builder::default()
        }
        .build()
    }

    /// Tell the original flush requestor whether its flush succeeded.
    pub fn send_flush_response(&mut self, req: &MemEvent, success: bool) {
        let mut resp = req.make_response();
        resp.success = success;
        let delivery = self.now + self.config.mshr_latency;
        self.add_to_outgoing(self.packet(resp, delivery), Direction::Downstream);
    }

    /// Forward a FlushLine/FlushLineInv to the parent, carrying whatever data
    /// is at hand.
    pub fn forward_flush_line(
        &mut self,
        orig: &MemEvent,
        cmd: Command,
        line: Option<&mut DirLine>,
        payload: Option<Vec<u8>>,
        dirty: bool,
    ) {
        let mut flush = Builder {
            cmd,
            src: self.config.owner_name.clone(),
            dst: self.config.parent_name.clone(),
            rqstr: orig.rqstr.clone(),
            base_addr: orig.base_addr,
            size: self.config.line_size,
            dirty,
            ..Builder::default()
        }
        .build();
        if let Some(payload) = payload {
            flush.payload = payload;
        }
        let line_timestamp = line.as_ref().map_or(0, |l| l.timestamp());
        let delivery = self.delivery(line_timestamp, self.config.tag_latency);
        self.add_to_outgoing(self.packet(flush, delivery), Direction::Upstream);
        if let Some(line) = line {
            line.set_timestamp(delivery - 1);
        }
    }

    /// Forward a request (GetS/GetX/GetSX) to the parent. Returns the
    /// delivery time.
    pub fn forward_message(
        &mut self,
        req: &MemEvent,
        base_addr: crate::address,
        size: u32,
        line_timestamp: u64,
        payload: Option<&[u8]>,
    ) -> u64 {
        let mut fwd = Builder {
            cmd: req.cmd,
            src: self.config.owner_name.clone(),
            dst: self.config.parent_name.clone(),
            rqstr: req.rqstr.clone(),
            base_addr,
            addr: req.addr,
            size,
            prefetch: req.prefetch,
            mem_flags: req.mem_flags,
            ..Builder::default()
        }
        .build();
        let latency = if let Some(payload) = payload {
            fwd.payload = payload.to_vec();
            self.config.access_latency
        } else {
            self.config.tag_latency
        };
        let delivery = self.delivery(line_timestamp, latency);
        self.add_to_outgoing(self.packet(fwd, delivery), Direction::Upstream);
        delivery
    }

    /// Re-send a NACKed event.
    pub fn resend(&mut self, ev: MemEvent, direction: Direction) {
        let delivery = self.now + self.config.mshr_latency;
        self.add_to_outgoing(self.packet(ev, delivery), direction);
    }
}

#[cfg(test)]
mod tests {
    use super::OutboundEmitter;
    use crate::config::Config;
    use crate::directory::DirLine;
    use crate::mem_event::{Builder, Command};
    use crate::mshr::Mshr;
    use std::sync::Arc;

    fn emitter() -> OutboundEmitter {
        OutboundEmitter::new(Arc::new(Config::default()))
    }

    #[test]
    fn delivery_times_never_regress_per_line() {
        let mut emitter = emitter();
        let mut mshr = Mshr::new(8);
        let mut line = DirLine::default();
        line.reset(0x40);
        line.add_sharer("l1d.0");
        line.add_sharer("l1d.1");

        emitter.now = 100;
        emitter.invalidate_all_sharers(&mut line, &mut mshr, "l1d.2", false);
        let first = line.timestamp();
        assert!(first >= 100);

        // clock goes backwards; the line timestamp still orders the sends
        emitter.now = 50;
        emitter.send_fetch(&mut line, "l1d.2", false);
        assert!(line.timestamp() > first);

        let times: Vec<u64> = emitter
            .queued_downstream()
            .iter()
            .map(|o| o.delivery_time)
            .collect();
        let mut sorted = times.clone();
        sorted.sort_unstable();
        assert_eq!(times, sorted);
    }

    #[test]
    fn invalidate_and_fetch_upgrades_one_sharer() {
        let mut emitter = emitter();
        let mut mshr = Mshr::new(8);
        let mut line = DirLine::default();
        line.reset(0x40);
        line.add_sharer("l1d.0");
        line.add_sharer("l1d.1");

        emitter.invalidate_all_sharers_and_fetch(&mut line, &mut mshr, "l2", false);
        let cmds: Vec<Command> = emitter
            .queued_downstream()
            .iter()
            .map(|o| o.event.cmd)
            .collect();
        assert_eq!(cmds, vec![Command::FetchInv, Command::Inv]);
        assert_eq!(mshr.acks_needed(0x40), 2);
    }

    #[test]
    fn requestor_is_skipped_on_upgrade() {
        let mut emitter = emitter();
        let mut mshr = Mshr::new(8);
        let mut line = DirLine::default();
        line.reset(0x40);
        line.add_sharer("l1d.0");
        line.add_sharer("l1d.1");

        let sent = emitter.invalidate_sharers_except_requestor(
            &mut line, &mut mshr, "l1d.0", "l1d.0", false, false,
        );
        assert!(sent);
        let queued = emitter.queued_downstream();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].event.dst, "l1d.1");
        assert_eq!(mshr.acks_needed(0x40), 1);
    }

    #[test]
    fn writebacks_carry_data_per_policy() {
        let config = Config {
            writeback_clean_blocks: false,
            ..Config::default()
        };
        let mut emitter = OutboundEmitter::new(Arc::new(config));
        let mut line = DirLine::default();
        line.reset(0x40);

        emitter.send_writeback_from_cache(Command::PutE, &mut line, &[0xDD; 64], "l2");
        emitter.send_writeback_from_cache(Command::PutM, &mut line, &[0xDD; 64], "l2");
        let queued = emitter.queued_upstream();
        assert!(queued[0].event.payload.is_empty());
        assert!(!queued[0].event.dirty);
        assert_eq!(queued[1].event.payload.len(), 64);
        assert!(queued[1].event.dirty);
    }

    #[test]
    fn replayed_sends_use_the_mshr_latency() {
        let mut emitter = emitter();
        let req = Builder {
            cmd: Command::GetS,
            src: "l1d.0".to_string(),
            dst: "l2".to_string(),
            base_addr: 0x40,
            ..Builder::default()
        }
        .build();
        emitter.now = 10;
        let first = emitter.send_response_up(&req, None, Some(&[0xAA; 64]), false, 0);
        let replay = emitter.send_response_up(&req, None, Some(&[0xAA; 64]), true, 0);
        assert_eq!(first, 10 + Config::default().access_latency);
        assert_eq!(replay, 10 + Config::default().mshr_latency);
    }
}
