use crate::address;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::atomic;

/// Coherence message commands.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
pub enum Command {
    // requests from children
    GetS,
    GetX,
    GetSX,
    // responses from the parent
    GetSResp,
    GetXResp,
    // replacements from children
    PutS,
    PutE,
    PutM,
    // invalidations toward children
    Inv,
    ForceInv,
    Fetch,
    FetchInv,
    FetchInvX,
    // invalidation responses from children
    AckInv,
    FetchResp,
    FetchXResp,
    // writeback ack from the parent
    AckPut,
    // flushes
    FlushLine,
    FlushLineInv,
    FlushLineResp,
    // transport-level rejection
    NACK,
}

impl Command {
    #[must_use]
    pub fn is_writeback(&self) -> bool {
        matches!(self, Command::PutS | Command::PutE | Command::PutM)
    }

    #[must_use]
    pub fn is_request(&self) -> bool {
        matches!(self, Command::GetS | Command::GetX | Command::GetSX)
    }

    /// The command a response to this command carries.
    #[must_use]
    pub fn response(&self) -> Command {
        match self {
            Command::GetS => Command::GetSResp,
            Command::GetX | Command::GetSX => Command::GetXResp,
            Command::Fetch | Command::FetchInv => Command::FetchResp,
            Command::FetchInvX => Command::FetchXResp,
            Command::Inv | Command::ForceInv => Command::AckInv,
            Command::PutS | Command::PutE | Command::PutM => Command::AckPut,
            Command::FlushLine | Command::FlushLineInv => Command::FlushLineResp,
            other => panic!("command {other} has no response form"),
        }
    }
}

/// Which way a message travels: upstream is toward the parent (memory side),
/// downstream is toward the children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Upstream,
    Downstream,
}

static MEM_EVENT_ID: Lazy<atomic::AtomicU64> = Lazy::new(|| atomic::AtomicU64::new(0));

/// Generate a unique id for a new event.
pub fn generate_id() -> u64 {
    MEM_EVENT_ID.fetch_add(1, atomic::Ordering::SeqCst)
}

/// A coherence message.
///
/// `base_addr` is cache-block aligned; `addr` is the originally requested
/// address. `payload` is empty for dataless messages.
#[derive(Debug, Clone)]
pub struct MemEvent {
    pub id: u64,
    pub cmd: Command,
    pub src: String,
    pub dst: String,
    /// The cache that originated the causing request; carried through
    /// forwarded invalidations so responses can be attributed.
    pub rqstr: String,
    pub base_addr: address,
    pub addr: address,
    pub size: u32,
    pub payload: Vec<u8>,
    pub dirty: bool,
    /// Set on requests issued by a prefetcher.
    pub prefetch: bool,
    pub mem_flags: u32,
    /// Identifies the outstanding send this event responds to.
    pub resp_key: Option<u64>,
    /// On a NACK, the rejected event and the direction it was traveling.
    pub nacked: Option<Box<MemEvent>>,
    pub nack_direction: Option<Direction>,
    /// Set when the flush this event completes succeeded.
    pub success: bool,
}

impl std::fmt::Display for MemEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}(addr={:#x}, src={}, dst={})",
            self.cmd, self.base_addr, self.src, self.dst
        )
    }
}

impl PartialEq for MemEvent {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MemEvent {}

#[derive(Debug, Clone)]
pub struct Builder {
    pub cmd: Command,
    pub src: String,
    pub dst: String,
    pub rqstr: String,
    pub base_addr: address,
    pub addr: address,
    pub size: u32,
    pub payload: Vec<u8>,
    pub dirty: bool,
    pub prefetch: bool,
    pub mem_flags: u32,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            cmd: Command::GetS,
            src: String::new(),
            dst: String::new(),
            rqstr: String::new(),
            base_addr: 0,
            addr: 0,
            size: 0,
            payload: Vec::new(),
            dirty: false,
            prefetch: false,
            mem_flags: 0,
        }
    }
}

impl Builder {
    #[must_use]
    pub fn build(self) -> MemEvent {
        let rqstr = if self.rqstr.is_empty() {
            self.src.clone()
        } else {
            self.rqstr
        };
        let addr = if self.addr == 0 { self.base_addr } else { self.addr };
        MemEvent {
            id: generate_id(),
            cmd: self.cmd,
            src: self.src,
            dst: self.dst,
            rqstr,
            base_addr: self.base_addr,
            addr,
            size: self.size,
            payload: self.payload,
            dirty: self.dirty,
            prefetch: self.prefetch,
            mem_flags: self.mem_flags,
            resp_key: None,
            nacked: None,
            nack_direction: None,
            success: false,
        }
    }
}

impl From<Builder> for MemEvent {
    fn from(builder: Builder) -> Self {
        builder.build()
    }
}

impl MemEvent {
    /// Build the response to this event: src/dst swapped, response command,
    /// flags carried over. Payload and dirty bit are filled in by the sender.
    #[must_use]
    pub fn make_response(&self) -> MemEvent {
        MemEvent {
            id: generate_id(),
            cmd: self.cmd.response(),
            src: self.dst.clone(),
            dst: self.src.clone(),
            rqstr: self.rqstr.clone(),
            base_addr: self.base_addr,
            addr: self.addr,
            size: self.size,
            payload: Vec::new(),
            dirty: false,
            prefetch: false,
            mem_flags: self.mem_flags,
            resp_key: Some(self.id),
            nacked: None,
            nack_direction: None,
            success: false,
        }
    }

    /// Wrap this event in a NACK traveling back to its sender.
    #[must_use]
    pub fn make_nack(self, direction: Direction) -> MemEvent {
        MemEvent {
            id: generate_id(),
            cmd: Command::NACK,
            src: self.dst.clone(),
            dst: self.src.clone(),
            rqstr: self.rqstr.clone(),
            base_addr: self.base_addr,
            addr: self.addr,
            size: 0,
            payload: Vec::new(),
            dirty: false,
            prefetch: false,
            mem_flags: self.mem_flags,
            resp_key: None,
            nacked: Some(Box::new(self)),
            nack_direction: Some(direction),
            success: false,
        }
    }

    #[must_use]
    pub fn payload_size(&self) -> u32 {
        self.payload.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::{Builder, Command, Direction};

    #[test]
    fn response_swaps_endpoints_and_links_ids() {
        let req = Builder {
            cmd: Command::GetS,
            src: "l1d.0".to_string(),
            dst: "l2".to_string(),
            base_addr: 0x40,
            size: 64,
            ..Builder::default()
        }
        .build();
        let resp = req.make_response();
        assert_eq!(resp.cmd, Command::GetSResp);
        assert_eq!(resp.src, "l2");
        assert_eq!(resp.dst, "l1d.0");
        assert_eq!(resp.resp_key, Some(req.id));
        assert_eq!(resp.base_addr, 0x40);
    }

    #[test]
    fn rqstr_defaults_to_src() {
        let ev = Builder {
            cmd: Command::GetX,
            src: "l1d.1".to_string(),
            base_addr: 0x80,
            ..Builder::default()
        }
        .build();
        assert_eq!(ev.rqstr, "l1d.1");
    }

    #[test]
    fn nack_wraps_original() {
        let ev = Builder {
            cmd: Command::FetchInv,
            src: "l2".to_string(),
            dst: "l1d.0".to_string(),
            base_addr: 0xc0,
            ..Builder::default()
        }
        .build();
        let id = ev.id;
        let nack = ev.make_nack(Direction::Downstream);
        assert_eq!(nack.cmd, Command::NACK);
        assert_eq!(nack.nacked.as_ref().unwrap().id, id);
        assert_eq!(nack.nack_direction, Some(Direction::Downstream));
    }

    #[test]
    #[should_panic(expected = "no response form")]
    fn nack_has_no_response_form() {
        let _ = Command::NACK.response();
    }
}
