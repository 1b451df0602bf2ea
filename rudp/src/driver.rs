//! The root per-executor actor (C5's runtime half): one instance lives on
//! each executor thread and owns every descriptor currently resident there,
//! plus the bound datagram endpoints (C1) those descriptors send and receive
//! through.
//!
//! Grounded on `wireguard::Wireguard`, the teacher's own single root actor
//! holding one `Interface` (an `Io<UdpSocket>`) and a `Map` of `Peer`s:
//! generalized from one fixed peer-map keyed by public key to a `HashMap`
//! keyed by descriptor id, and from one `Io` to one per bound local address,
//! since a single executor may host both a listener and ordinary peers on
//! different local ports.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::mpsc;

use log::{debug, error, trace, warn};
use stakker::{fwd_to, timer_max, Fwd, MaxTimerKey, CX};
use utils::error::{ErrorKind, RudpResult};

use crate::codec::{self, Frame};
use crate::config::ConfigTable;
use crate::csm::{CsmHost, Effect};
use crate::descriptor::{Completion, DescriptorState, Listener, PendingRead, PendingWrite, Role};
use crate::endpoint::Endpoint;
use crate::registry;

/// A descriptor handed off from one executor to another on accept-side
/// migration (spec §4.5). Carries its own dedicated, already-connected
/// socket so the move never shares a live fd between two reactors at once
/// (spec §5).
pub struct Migration {
	pub id: u32,
	pub state: DescriptorState,
	pub socket: std::net::UdpSocket,
}

/// A request routed to a specific executor's [Driver] from outside its
/// reactor thread (the public API surface in `lib.rs` never touches a
/// `Driver` directly, since a stakker `Stakker` core is not thread-safe).
/// The synchronous operations answer through a one-shot `mpsc::Sender`; the
/// async ones carry the caller's own [Completion].
pub enum Command {
	Create { config: ConfigTable, reply: mpsc::Sender<RudpResult<u32>> },
	Bind { id: u32, addr: SocketAddr, reply: mpsc::Sender<RudpResult<SocketAddr>> },
	Listen { id: u32, max_pending: u32, reply: mpsc::Sender<RudpResult<()>> },
	Configure { id: u32, option: crate::config::ConfigOption, value: i64, reply: mpsc::Sender<RudpResult<()>> },
	Destroy { id: u32, reply: mpsc::Sender<RudpResult<()>> },
	Connect { id: u32, peer: SocketAddr, completion: Completion<()> },
	WaitConnect { id: u32, max_wait_ms: u32, completion: Completion<()> },
	Accept { id: u32, target_executor: usize, completion: Completion<u32> },
	Send { id: u32, data: Vec<u8>, completion: Completion<usize> },
	Recv { id: u32, cap: usize, completion: Completion<Vec<u8>> },
}

pub struct Driver {
	executor: usize,
	senders: Vec<mpsc::Sender<Migration>>,
	inbox: mpsc::Receiver<Migration>,
	commands: mpsc::Receiver<Command>,

	endpoints: HashMap<SocketAddr, Endpoint>,
	descriptors: HashMap<u32, DescriptorState>,
	tick_timer: MaxTimerKey,

	read_fwd: Fwd<(collections::bytes::Slice, SocketAddr)>,
}

impl Driver {
	pub fn init(
		cx: CX![],
		executor: usize,
		senders: Vec<mpsc::Sender<Migration>>,
		inbox: mpsc::Receiver<Migration>,
		commands: mpsc::Receiver<Command>,
	) -> Option<Self> {
		let read_fwd = fwd_to!([cx], on_datagram() as (collections::bytes::Slice, SocketAddr));

		let mut this = Self {
			executor,
			senders,
			inbox,
			commands,
			endpoints: HashMap::new(),
			descriptors: HashMap::new(),
			tick_timer: MaxTimerKey::default(),
			read_fwd,
		};

		this.rearm_tick(cx);
		Some(this)
	}

	/// Drain pending API calls routed in from outside the reactor thread.
	fn drain_commands(&mut self, cx: CX![]) {
		while let Ok(command) = self.commands.try_recv() {
			match command {
				Command::Create { config, reply } => {
					let _ = reply.send(self.create(config));
				}
				Command::Bind { id, addr, reply } => {
					let _ = reply.send(self.bind(cx, id, addr));
				}
				Command::Listen { id, max_pending, reply } => {
					let _ = reply.send(self.listen(id, max_pending));
				}
				Command::Configure { id, option, value, reply } => {
					let _ = reply.send(self.configure(id, option, value));
				}
				Command::Destroy { id, reply } => {
					let _ = reply.send(self.destroy(cx, id));
				}
				Command::Connect { id, peer, completion } => self.connect(cx, id, peer, completion),
				Command::WaitConnect { id, max_wait_ms, completion } => self.wait_connect(cx, id, max_wait_ms, completion),
				Command::Accept { id, target_executor, completion } => self.accept(cx, id, target_executor, completion),
				Command::Send { id, data, completion } => self.send(id, data, completion),
				Command::Recv { id, cap, completion } => self.recv(id, cap, completion),
			}
		}
	}

	/// Reschedule the recurring tick that drives RTE retransmission and
	/// drains the migration inbox, at the configured RTE update interval.
	fn rearm_tick(&mut self, cx: CX![]) {
		let when = cx.now() + std::time::Duration::from_millis(10);
		timer_max!(&mut self.tick_timer, when, [cx], tick());
	}

	/// Drain the migration inbox, wrapping each arriving descriptor's
	/// dedicated socket in its own [Endpoint] (spec §4.5, §5: a migrated
	/// descriptor never shares a live fd with its old executor).
	fn drain_migrations(&mut self) {
		while let Ok(migration) = self.inbox.try_recv() {
			debug!("Accepted migrated descriptor {} onto executor {}", migration.id, self.executor);

			let peer = migration.state.csm.peer_addr();

			let endpoint = match peer {
				Some(peer) => Endpoint::from_connected(migration.socket, peer, self.read_fwd.clone()),
				None => continue,
			};

			match endpoint {
				Ok(endpoint) => {
					let addr = endpoint.local_addr();
					self.endpoints.insert(addr, endpoint);
					registry::global().rehome(migration.id, self.executor);
					self.descriptors.insert(migration.id, migration.state);
				}
				Err(()) => warn!("Failed to rebind migrated endpoint for descriptor {}", migration.id),
			}
		}
	}

	/// Allocate a fresh descriptor not yet bound to any local address.
	pub fn create(&mut self, config: ConfigTable) -> RudpResult<u32> {
		let id = registry::global().allocate(self.executor).ok_or_else(|| ErrorKind::ResourceBusy.detail("descriptor table full"))?;

		let unbound = SocketAddr::from(([0, 0, 0, 0], 0));
		self.descriptors.insert(id, DescriptorState::new(id, unbound, config));
		Ok(id)
	}

	pub fn bind(&mut self, cx: CX![], id: u32, addr: SocketAddr) -> RudpResult<SocketAddr> {
		let descriptor = self.descriptor_mut(id)?;
		let already_bound = descriptor.local_addr.port() != 0;

		if already_bound {
			return Err(ErrorKind::AlreadyConnected.detail("descriptor already bound"));
		}

		if !self.endpoints.contains_key(&addr) {
			let fwd = self.read_fwd.clone();
			let endpoint = Endpoint::bind(addr, fwd).map_err(|()| ErrorKind::Failed.detail(format!("failed to bind {addr}")))?;
			let actual = endpoint.local_addr();
			self.endpoints.insert(actual, endpoint);
			self.descriptor_mut(id)?.local_addr = actual;
			let _ = cx;
			return Ok(actual);
		}

		self.descriptor_mut(id)?.local_addr = addr;
		Ok(addr)
	}

	pub fn listen(&mut self, id: u32, max_pending: u32) -> RudpResult {
		if !(1..=4096).contains(&max_pending) {
			return Err(ErrorKind::InvalidArgument.detail("max_pending out of range [1, 4096]"));
		}

		let descriptor = self.descriptor_mut(id)?;
		descriptor.role = Role::Listener(Listener::new(max_pending));
		Ok(())
	}

	/// Unlike the synchronous `create`/`bind`/`listen`/`destroy`, this and
	/// the three operations below never return an error to the caller
	/// directly: `completion` is always eventually called exactly once,
	/// whether the operation is accepted, fails immediately, or is later
	/// cancelled by `destroy` (spec §5).
	pub fn connect(&mut self, cx: CX![], id: u32, peer: SocketAddr, completion: Completion<()>) {
		let Some(descriptor) = self.descriptors.get_mut(&id) else {
			return completion(Err(ErrorKind::BadFileDescriptor.detail("unknown descriptor")));
		};

		if descriptor.local_addr.port() == 0 {
			return completion(Err(ErrorKind::NotConnected.detail("descriptor not bound")));
		}

		descriptor.pending_connect = Some(completion);
		let effects = descriptor.csm.start_connect(cx, peer);
		self.apply_effects(cx, id, effects);
	}

	/// Single-shot passive wait (spec §4.5): unlike `listen`+`accept`, the
	/// next inbound SYN on this descriptor's own bound address completes
	/// *this* descriptor's handshake directly, with no child spawned.
	pub fn wait_connect(&mut self, cx: CX![], id: u32, max_wait_ms: u32, completion: Completion<()>) {
		let Some(descriptor) = self.descriptors.get_mut(&id) else {
			return completion(Err(ErrorKind::BadFileDescriptor.detail("unknown descriptor")));
		};

		if descriptor.local_addr.port() == 0 {
			return completion(Err(ErrorKind::NotConnected.detail("descriptor not bound")));
		}

		if descriptor.pending_connect.is_some() || matches!(descriptor.role, Role::Listener(_)) {
			return completion(Err(ErrorKind::OperationInProgress.detail("wait_connect already pending, or descriptor is a listener")));
		}

		descriptor.passive_wait = true;
		descriptor.pending_connect = Some(completion);

		let when = cx.now() + std::time::Duration::from_millis(max_wait_ms as u64);
		timer_max!(&mut descriptor.wait_timer, when, [cx], wait_timed_out(id));
	}

	fn wait_timed_out(&mut self, cx: CX![], id: u32) {
		let _ = cx;
		let Some(descriptor) = self.descriptors.get_mut(&id) else { return };

		if !descriptor.passive_wait {
			return;
		}

		descriptor.passive_wait = false;

		if let Some(completion) = descriptor.pending_connect.take() {
			completion(Err(ErrorKind::TimedOut.detail("wait_connect timed out")));
		}
	}

	pub fn accept(&mut self, cx: CX![], id: u32, target_executor: usize, completion: Completion<u32>) {
		let Some(descriptor) = self.descriptors.get_mut(&id) else {
			return completion(Err(ErrorKind::BadFileDescriptor.detail("unknown descriptor")));
		};

		let Role::Listener(listener) = &mut descriptor.role else {
			return completion(Err(ErrorKind::InvalidArgument.detail("accept on a non-listening descriptor")));
		};

		if let Some(child_id) = listener.backlog.pop_front() {
			if let Some(addr) = listener.connected.iter().find(|(_, v)| **v == child_id).map(|(k, _)| *k) {
				listener.connected.remove(&addr);
			}

			self.migrate_child(cx, child_id, target_executor, completion);
			return;
		}

		listener.waiters.push_back((target_executor, completion));
	}

	pub fn send(&mut self, id: u32, data: Vec<u8>, completion: Completion<usize>) {
		let Some(descriptor) = self.descriptors.get_mut(&id) else {
			return completion(Err(ErrorKind::BadFileDescriptor.detail("unknown descriptor")));
		};

		if descriptor.rte.is_none() {
			return completion(Err(ErrorKind::NotConnected.detail("descriptor not connected")));
		}

		descriptor.pending_writes.push_back(PendingWrite { data, completion });
		descriptor.service_pending_writes();
	}

	pub fn recv(&mut self, id: u32, cap: usize, completion: Completion<Vec<u8>>) {
		let Some(descriptor) = self.descriptors.get_mut(&id) else {
			return completion(Err(ErrorKind::BadFileDescriptor.detail("unknown descriptor")));
		};

		if descriptor.rte.is_none() {
			return completion(Err(ErrorKind::NotConnected.detail("descriptor not connected")));
		}

		descriptor.pending_reads.push_back(PendingRead { buf: vec![0u8; cap], completion });
		descriptor.service_pending_reads();
	}

	pub fn destroy(&mut self, cx: CX![], id: u32) -> RudpResult {
		let Some(mut descriptor) = self.descriptors.remove(&id) else {
			return Err(ErrorKind::BadFileDescriptor.detail("unknown descriptor"));
		};

		let effects = descriptor.csm.destroy(cx);
		descriptor.cancel_all(ErrorKind::OperationCanceled);

		if let Some(parent_id) = descriptor.parent {
			if let Some(parent) = self.descriptors.get_mut(&parent_id) {
				if let Role::Listener(listener) = &mut parent.role {
					if let Some(peer) = descriptor.csm.peer_addr() {
						listener.pending.remove(&peer);
						listener.connected.remove(&peer);
					}
					listener.backlog.retain(|c| *c != id);
				}
			}
		}

		registry::global().release(id);
		let local_addr = descriptor.local_addr;

		for effect in effects {
			if let Effect::Send(peer, frame) = effect {
				self.send_control(local_addr, peer, &frame);
			}
		}

		Ok(())
	}

	pub fn configure(&mut self, id: u32, option: crate::config::ConfigOption, value: i64) -> RudpResult {
		self.descriptor_mut(id)?.config.set(option, value);
		Ok(())
	}

	fn descriptor_mut(&mut self, id: u32) -> RudpResult<&mut DescriptorState> {
		self.descriptors.get_mut(&id).ok_or_else(|| ErrorKind::BadFileDescriptor.detail("unknown descriptor"))
	}

	fn on_datagram(&mut self, cx: CX![], buf: collections::bytes::Slice, from: SocketAddr) {
		let Some(dst) = crate::descriptor::peek_dst_id(&buf) else {
			trace!("Discarding unclassifiable datagram from {from}");
			return;
		};

		if let Some(id) = self.lookup_owner(dst, from) {
			self.dispatch_to(cx, id, &buf, from);
			return;
		}

		// No existing owner: a SYN control frame either completes a
		// `wait_connect`-armed descriptor in place, or spawns a new child of
		// a listener (spec §4.5).
		if let Some(Frame::Control(frame)) = codec::classify(&buf) {
			if frame.command() == Some(codec::Command::SYN) {
				if let Some(id) = self.passive_wait_descriptor() {
					self.accept_passive_wait(cx, id, from, frame);
					return;
				}

				self.accept_new_child(cx, from, frame);
			}
		}
	}

	fn passive_wait_descriptor(&self) -> Option<u32> {
		self.descriptors.iter().find(|(_, d)| d.passive_wait).map(|(id, _)| *id)
	}

	fn accept_passive_wait(&mut self, cx: CX![], id: u32, from: SocketAddr, frame: codec::ControlFrame) {
		let Some(descriptor) = self.descriptors.get_mut(&id) else { return };
		descriptor.passive_wait = false;

		let payload = frame.payload.get();
		let effects = descriptor.csm.accept_syn(cx, from, frame.src.get(), payload);
		self.apply_effects(cx, id, effects);
	}

	/// Resolve a datagram's destination to a resident descriptor. Handshake
	/// frames addressed to `UNKNOWN_ID` from a peer already in a listener's
	/// pending table are matched by address instead of id.
	fn lookup_owner(&self, dst: u32, from: SocketAddr) -> Option<u32> {
		if dst != codec::UNKNOWN_ID && self.descriptors.contains_key(&dst) {
			return Some(dst);
		}

		for descriptor in self.descriptors.values() {
			if let Role::Listener(listener) = &descriptor.role {
				if let Some(child) = listener.pending.get(&from) {
					return Some(*child);
				}
			}
		}

		None
	}

	fn accept_new_child(&mut self, cx: CX![], from: SocketAddr, frame: codec::ControlFrame) {
		let Some((listener_id, local_addr, config)) = self.listener_for(from) else { return };

		let (occupancy, max_pending) = match &self.descriptors.get(&listener_id).unwrap().role {
			Role::Listener(listener) => (listener.occupancy(), listener.max_pending as usize),
			_ => return,
		};

		if occupancy >= max_pending {
			warn!("Dropping SYN from {from}: listener at capacity");
			return;
		}

		let Some(child_id) = registry::global().allocate(self.executor) else {
			warn!("Dropping SYN from {from}: descriptor table full");
			return;
		};

		let mut child = DescriptorState::new(child_id, local_addr, config);
		child.parent = Some(listener_id);
		let payload = frame.payload.get();
		let effects = child.csm.accept_syn(cx, from, frame.src.get(), payload);
		self.descriptors.insert(child_id, child);

		if let Role::Listener(listener) = &mut self.descriptors.get_mut(&listener_id).unwrap().role {
			listener.pending.insert(from, child_id);
		}

		self.apply_effects(cx, child_id, effects);
	}

	fn listener_for(&self, _from: SocketAddr) -> Option<(u32, SocketAddr, ConfigTable)> {
		self.descriptors.iter().find(|(_, d)| matches!(d.role, Role::Listener(_))).map(|(id, d)| (*id, d.local_addr, d.config))
	}

	fn dispatch_to(&mut self, cx: CX![], id: u32, buf: &[u8], from: SocketAddr) {
		let Some(descriptor) = self.descriptors.get_mut(&id) else { return };

		let effects = match codec::classify(buf) {
			Some(Frame::Control(frame)) => {
				descriptor.csm.note_activity(cx);
				descriptor.csm.on_control_frame(cx, &frame)
			}
			Some(Frame::Data(data)) => {
				if let Some(rte) = &mut descriptor.rte {
					let now = now_ms(cx);
					rte.feed_datagram(data, now);
					descriptor.csm.note_activity(cx);
				}
				Vec::new()
			}
			None => Vec::new(),
		};

		descriptor.service_pending_reads();
		self.apply_effects(cx, id, effects);

		let _ = from;
	}

	fn apply_effects(&mut self, cx: CX![], id: u32, effects: Vec<Effect>) {
		let local_addr = self.descriptors.get(&id).map(|d| d.local_addr);

		for effect in effects {
			match effect {
				Effect::Send(peer, frame) => {
					if let Some(local_addr) = local_addr {
						self.send_control(local_addr, peer, &frame);
					}
				}
				Effect::Connected { conv } => self.on_connected(cx, id, conv),
				Effect::Closed(kind) => self.on_closed(cx, id, kind),
			}
		}
	}

	fn send_control(&mut self, local_addr: SocketAddr, peer: SocketAddr, frame: &codec::ControlFrame) {
		let Some(endpoint) = self.endpoints.get(&local_addr) else {
			error!("No bound endpoint on {local_addr} available to send a control frame to {peer}");
			return;
		};

		if endpoint.send_to(peer, &frame.encode()).is_err() {
			warn!("Failed to send control frame to {peer}");
		}
	}

	fn on_connected(&mut self, cx: CX![], id: u32, _conv: u32) {
		if let Some(descriptor) = self.descriptors.get_mut(&id) {
			descriptor.activate_rte();

			if let Some(completion) = descriptor.pending_connect.take() {
				completion(Ok(()));
			}

			if let Some(parent_id) = descriptor.parent {
				if let Some(peer) = descriptor.csm.peer_addr() {
					if let Some(parent) = self.descriptors.get_mut(&parent_id) {
						if let Role::Listener(listener) = &mut parent.role {
							listener.pending.remove(&peer);

							if let Some((target_executor, completion)) = listener.waiters.pop_front() {
								self.migrate_child(cx, id, target_executor, completion);
								return;
							}

							listener.connected.insert(peer, id);
							listener.backlog.push_back(id);
						}
					}
				}
			}
		}
	}

	fn on_closed(&mut self, cx: CX![], id: u32, kind: ErrorKind) {
		debug!("Descriptor {id} closed: {kind}");
		let _ = self.destroy(cx, id);
	}

	/// Hand a CONNECTED child descriptor to another executor (spec §4.5):
	/// open a dedicated connected socket on the peer's 4-tuple so the kernel
	/// demultiplexes that peer's future datagrams straight to it, then ship
	/// the descriptor state and socket across the migration channel.
	fn migrate_child(&mut self, cx: CX![], id: u32, target_executor: usize, completion: Completion<u32>) {
		let Some(mut state) = self.descriptors.remove(&id) else {
			completion(Err(ErrorKind::BadFileDescriptor.detail("accepted descriptor vanished")));
			return;
		};

		let Some(peer) = state.csm.peer_addr() else {
			completion(Err(ErrorKind::Failed.detail("accepted descriptor has no peer")));
			return;
		};

		if target_executor == self.executor {
			state.read_epoch += 1;
			self.descriptors.insert(id, state);
			completion(Ok(id));
			return;
		}

		let socket = match dedicated_socket(state.local_addr, peer) {
			Ok(socket) => socket,
			Err(err) => {
				self.descriptors.insert(id, state);
				completion(Err(ErrorKind::Failed.detail(err.to_string())));
				return;
			}
		};

		state.read_epoch += 1;

		let Some(sender) = self.senders.get(target_executor) else {
			self.descriptors.insert(id, state);
			completion(Err(ErrorKind::InvalidArgument.detail("unknown target executor")));
			return;
		};

		if sender.send(Migration { id, state, socket }).is_err() {
			completion(Err(ErrorKind::Failed.detail("target executor is gone")));
			return;
		}

		let _ = cx;
		completion(Ok(id));
	}

	/// The recurring per-executor tick (spec §3's `UPDATE_INTERVAL_MS`):
	/// advances every resident RTE's retransmission clock, then drains
	/// whatever arrived on the migration inbox.
	fn tick(&mut self, cx: CX![]) {
		let now = now_ms(cx);
		let mut sends: Vec<(SocketAddr, SocketAddr, Vec<u8>)> = Vec::new();

		for descriptor in self.descriptors.values_mut() {
			let Some(rte) = &mut descriptor.rte else { continue };
			let Some(peer) = descriptor.csm.peer_addr() else { continue };
			let local = descriptor.local_addr;

			rte.tick(now, |bytes| sends.push((local, peer, bytes.to_vec())));
		}

		for (local, peer, bytes) in sends {
			if let Some(endpoint) = self.endpoints.get(&local) {
				let _ = endpoint.send_to(peer, &bytes);
			}
		}

		for descriptor in self.descriptors.values_mut() {
			descriptor.service_pending_reads();
			descriptor.service_pending_writes();
		}

		self.drain_migrations();
		self.drain_commands(cx);
		self.rearm_tick(cx);
	}
}

impl CsmHost for Driver {
	fn on_status_timer(&mut self, cx: CX![Self], descriptor_id: u32) {
		let Some(descriptor) = self.descriptors.get_mut(&descriptor_id) else { return };
		let effects = descriptor.csm.status_timer_expired(cx);
		self.apply_effects(cx, descriptor_id, effects);
	}

	fn on_idle_timer(&mut self, cx: CX![Self], descriptor_id: u32) {
		let Some(descriptor) = self.descriptors.get_mut(&descriptor_id) else { return };
		let effects = descriptor.csm.idle_timer_expired();
		self.apply_effects(cx, descriptor_id, effects);
	}
}

fn now_ms(cx: &mut stakker::Cx<Driver>) -> u32 {
	// Shares the same epoch-relative convention as `csm::now_ms`; duplicated
	// here rather than exported since it is a detail of timestamp encoding,
	// not part of the CSM's public contract.
	static EPOCH: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
	let epoch = *EPOCH.get_or_init(std::time::Instant::now);
	cx.now().saturating_duration_since(epoch).as_millis() as u32
}

fn dedicated_socket(local_addr: SocketAddr, peer: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
	use socket2::{Domain, Socket, Type};

	let domain = if local_addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
	let socket = Socket::new(domain, Type::DGRAM, None)?;
	socket.set_reuse_address(true)?;

	#[cfg(unix)]
	socket.set_reuse_port(true)?;

	socket.bind(&local_addr.into())?;
	socket.connect(&peer.into())?;
	socket.set_nonblocking(true)?;

	Ok(socket.into())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn migration_carries_a_send_safe_socket() {
		fn assert_send<T: Send>() {}
		assert_send::<Migration>();
	}
}
