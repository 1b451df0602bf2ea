//! Per-descriptor state (C5): the connection-state machine, the reliable
//! transport engine once connected, server demultiplexing tables, and the
//! deferred-completion queues the API surface needs.
//!
//! Grounded on `wireguard::tunnel::Peer`'s `queue: Vec<Box<dyn FnOnce(Cursor)>>`
//! pattern for buffering a call until some condition is met (there: a
//! handshake completing; here: a byte arriving, a peer connecting, a buffer
//! draining).

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use stakker::MaxTimerKey;
use utils::error::{ErrorKind, RudpResult};

use crate::codec;
use crate::config::ConfigTable;
use crate::csm::Csm;
use crate::driver::Driver;
use crate::rte::Rte;

/// A one-shot callback satisfied when an async operation completes, however
/// it completes (success, error, or cancellation on `destroy`).
pub type Completion<T> = Box<dyn FnOnce(RudpResult<T>) + Send>;

pub struct PendingRead {
	pub buf: Vec<u8>,
	pub completion: Completion<Vec<u8>>,
}

pub struct PendingWrite {
	pub data: Vec<u8>,
	pub completion: Completion<usize>,
}

/// What role a descriptor plays. A plain connecting/connected descriptor is
/// [Role::Peer]; a descriptor that has called `listen` demultiplexes many
/// remote peers into child descriptors (spec §4.5).
pub enum Role {
	Peer,
	Listener(Listener),
}

pub struct Listener {
	pub max_pending: u32,
	/// `peer_endpoint -> child` for children still mid-handshake.
	pub pending: HashMap<SocketAddr, u32>,
	/// `peer_endpoint -> child` for children that reached CONNECTED but have
	/// not yet been claimed by an `accept` call.
	pub connected: HashMap<SocketAddr, u32>,
	/// Children connected-but-unclaimed, in arrival order, so `accept` can
	/// satisfy itself immediately if one is already waiting.
	pub backlog: VecDeque<u32>,
	pub waiters: VecDeque<(usize, Completion<u32>)>,
}

impl Listener {
	pub fn new(max_pending: u32) -> Self {
		Self { max_pending, pending: HashMap::new(), connected: HashMap::new(), backlog: VecDeque::new(), waiters: VecDeque::new() }
	}

	pub fn occupancy(&self) -> usize {
		self.pending.len() + self.connected.len()
	}
}

/// All per-descriptor state. One lives in the owning executor's `Driver` for
/// as long as the descriptor is alive (spec §9); moved wholesale to another
/// executor's `Driver` on accept-side migration (spec §4.5, §5).
pub struct DescriptorState {
	pub id: u32,
	pub config: ConfigTable,
	pub local_addr: SocketAddr,
	/// The child listener this descriptor was spawned from, if any. Used to
	/// remove this id from the parent's demux tables once it disconnects
	/// (only valid while still resident on the parent's executor).
	pub parent: Option<u32>,

	pub csm: Csm<Driver>,
	pub rte: Option<Rte>,
	pub role: Role,

	pub pending_reads: VecDeque<PendingRead>,
	pub pending_writes: VecDeque<PendingWrite>,
	pub pending_connect: Option<Completion<()>>,

	/// Set by `wait_connect`: this descriptor (not a listener's child) is
	/// waiting for the next inbound SYN on its own bound address to
	/// complete its own handshake in place (spec §4.5's single-shot
	/// passive-wait server).
	pub passive_wait: bool,
	pub wait_timer: MaxTimerKey,

	/// Bumped on every accept-side migration so a completion scheduled on a
	/// stale executor can be told apart from a fresh one (spec §4.5's
	/// "monotonic read-token").
	pub read_epoch: u64,
}

impl DescriptorState {
	pub fn new(id: u32, local_addr: SocketAddr, config: ConfigTable) -> Self {
		let local_id = id;

		Self {
			id,
			config,
			local_addr,
			parent: None,
			csm: Csm::new(id, local_id, &config),
			rte: None,
			role: Role::Peer,
			pending_reads: VecDeque::new(),
			pending_writes: VecDeque::new(),
			pending_connect: None,
			passive_wait: false,
			wait_timer: MaxTimerKey::default(),
			read_epoch: 0,
		}
	}

	/// Instantiate the reliable transport engine once the handshake reaches
	/// CONNECTED (spec §4.3).
	pub fn activate_rte(&mut self) {
		if self.rte.is_none() {
			let conv = self.id;
			let mut config = self.config;
			config.set(crate::config::ConfigOption::MtuSize, self.csm.negotiated_mtu() as i64);
			config.set(crate::config::ConfigOption::EnableStreamMode, self.csm.negotiated_stream_mode() as i64);
			self.rte = Some(Rte::new(conv, &config));
		}
	}

	/// Fail every outstanding completion with `kind` and drop them (spec
	/// §5's "no completion fires after `destroy` returns").
	pub fn cancel_all(&mut self, kind: ErrorKind) {
		for read in self.pending_reads.drain(..) {
			(read.completion)(Err(kind.detail("descriptor destroyed")));
		}

		for write in self.pending_writes.drain(..) {
			(write.completion)(Err(kind.detail("descriptor destroyed")));
		}

		if let Some(connect) = self.pending_connect.take() {
			connect(Err(kind.detail("descriptor destroyed")));
		}

		if let Role::Listener(listener) = &mut self.role {
			for (_, completion) in listener.waiters.drain(..) {
				completion(Err(kind.detail("listener destroyed")));
			}
		}
	}

	/// Drain the RTE's ready queue into any waiting `recv` completions.
	pub fn service_pending_reads(&mut self) {
		let Some(rte) = &mut self.rte else { return };

		while let Some(read) = self.pending_reads.front_mut() {
			let outcome = rte.recv_into(&mut read.buf);

			if outcome.bytes_filled == 0 && outcome.error.is_none() {
				break;
			}

			let mut read = self.pending_reads.pop_front().unwrap();
			read.buf.truncate(outcome.bytes_filled);

			match outcome.error {
				Some(kind) => (read.completion)(Err(kind.detail(format!("{} bytes discarded", outcome.discarded)))),
				None => (read.completion)(Ok(read.buf)),
			}
		}
	}

	/// Push as much of the RTE's send queue as the window allows, completing
	/// writes whose bytes have all been handed to the engine.
	pub fn service_pending_writes(&mut self) {
		let Some(rte) = &mut self.rte else { return };

		while let Some(write) = self.pending_writes.front_mut() {
			let outcome = rte.send_app_bytes(&write.data);

			if let Some(kind) = outcome.error {
				let write = self.pending_writes.pop_front().unwrap();
				(write.completion)(Err(kind.detail("send queue overflow")));
				continue;
			}

			let write = self.pending_writes.pop_front().unwrap();
			let len = write.data.len();
			(write.completion)(Ok(len));
		}
	}
}

/// Parse an inbound datagram far enough to decide which descriptor owns it,
/// without fully decoding it (that happens once the owner is known).
pub fn peek_dst_id(buf: &[u8]) -> Option<u32> {
	match codec::classify(buf)? {
		codec::Frame::Control(frame) => Some(frame.dst.get()),
		codec::Frame::Data(data) => {
			let header: &codec::DataHeader = utils::bytes::cast(&data[..codec::DATA_HEADER_LEN]);
			Some(header.conv.get())
		}
	}
}
