//! Connection state machine (C4): handshake, keepalive, reset, idle-timeout,
//! command retry with a try-cap.
//!
//! Grounded on `wireguard::tunnel::timers::Timers`'s pattern of a small state
//! struct holding `MaxTimerKey` fields and `reset_*` helpers that rearm via
//! `timer_max!`, generalized from WireGuard's rekey/keepalive pair to this
//! protocol's handshake-retry/idle-timeout pair. As in `Timers`, the timer
//! callback names a fixed method on the owning actor (here `on_status_timer`
//! / `on_idle_timer`) rather than a closure, so the host actor type
//! implements [CsmHost] the same way `Wireguard` implicitly does for
//! `Timers`'s `rekey(self.idx)` callback.

use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, trace, warn};
use stakker::{timer_max, Cx, MaxTimerKey, CX};
use utils::error::ErrorKind;

use crate::codec::{handshake_mtu, handshake_payload, handshake_stream_mode, mask, Command, ControlFrame};
use crate::config::ConfigTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	Closed,
	Init,
	SynSent,
	SynRecv,
	Connected,
}

/// A side effect the caller (`driver`) must carry out after feeding the CSM
/// an event. More than one may apply to a single event (e.g. reaching
/// CONNECTED both instantiates the RTE and sends SYN_ACK2).
pub enum Effect {
	Send(SocketAddr, ControlFrame),
	Connected { conv: u32 },
	Closed(ErrorKind),
}

/// The actor type embedding one or more [Csm]s must implement this so the
/// status/idle timers have a method to call back into when they fire.
pub trait CsmHost: Sized {
	fn on_status_timer(&mut self, cx: CX![Self], descriptor_id: u32);
	fn on_idle_timer(&mut self, cx: CX![Self], descriptor_id: u32);
}

pub struct Csm<A> {
	descriptor_id: u32,

	state: State,
	local_id: u32,
	remote_id: Option<u32>,
	peer_addr: Option<SocketAddr>,

	local_mtu: u32,
	stream_mode_pref: bool,
	negotiated_mtu: u32,
	negotiated_stream_mode: bool,

	tries: u32,
	max_tries: u32,
	connect_timeout: Duration,
	status_timer: MaxTimerKey,

	auto_keepalive: bool,
	idle_timeout: Duration,
	idle_timer: MaxTimerKey,
	pong_outstanding: bool,

	_actor: core::marker::PhantomData<A>,
}

impl<A: CsmHost> Csm<A> {
	pub fn new(descriptor_id: u32, local_id: u32, config: &ConfigTable) -> Self {
		use crate::config::ConfigOption::*;

		Self {
			descriptor_id,

			state: State::Init,
			local_id,
			remote_id: None,
			peer_addr: None,

			local_mtu: config.mtu(),
			stream_mode_pref: config.stream_mode(),
			negotiated_mtu: config.mtu(),
			negotiated_stream_mode: false,

			tries: 0,
			max_tries: config.get(CommandMaxTryCnt) as u32,
			connect_timeout: Duration::from_millis(config.get(ConnectTimeoutMs) as u64),
			status_timer: MaxTimerKey::default(),

			auto_keepalive: config.auto_keepalive(),
			idle_timeout: Duration::from_millis(config.get(MaxIdleConnectionTimeMs) as u64),
			idle_timer: MaxTimerKey::default(),
			pong_outstanding: false,

			_actor: core::marker::PhantomData,
		}
	}

	pub fn state(&self) -> State {
		self.state
	}

	pub fn remote_id(&self) -> Option<u32> {
		self.remote_id
	}

	pub fn peer_addr(&self) -> Option<SocketAddr> {
		self.peer_addr
	}

	pub fn negotiated_mtu(&self) -> u32 {
		self.negotiated_mtu
	}

	pub fn negotiated_stream_mode(&self) -> bool {
		self.negotiated_stream_mode
	}

	fn frame(&self, cmd: Command, ts: u32, dst: u32, payload: u32) -> ControlFrame {
		ControlFrame::new(cmd, ts, self.local_id, dst, payload)
	}

	/// `INIT` + app calls `connect`.
	pub fn start_connect(&mut self, cx: &mut Cx<A>, peer: SocketAddr) -> Vec<Effect> {
		debug_assert_eq!(self.state, State::Init);

		self.peer_addr = Some(peer);
		self.state = State::SynSent;
		self.tries = 0;

		self.rearm_status_timer(cx);

		let payload = handshake_payload(self.local_mtu, self.stream_mode_pref);
		let frame = self.frame(Command::SYN, now_ms(cx), 0, payload);

		vec![Effect::Send(peer, frame)]
	}

	/// `INIT` + a SYN arrived via server dispatch (a brand new child).
	pub fn accept_syn(&mut self, cx: &mut Cx<A>, peer: SocketAddr, src: u32, payload: u32) -> Vec<Effect> {
		debug_assert_eq!(self.state, State::Init);

		self.peer_addr = Some(peer);
		self.remote_id = Some(src);

		let peer_stream_mode = handshake_stream_mode(payload);

		if peer_stream_mode && !self.stream_mode_pref {
			warn!("Rejecting stream-mode SYN from {peer}: this endpoint has stream mode disabled");
			self.state = State::Closed;
			let frame = self.frame(Command::RST, now_ms(cx), src, 0);
			return vec![Effect::Send(peer, frame), Effect::Closed(ErrorKind::InvalidArgument)];
		}

		self.negotiated_stream_mode = peer_stream_mode;
		self.state = State::SynRecv;
		self.tries = 0;

		self.rearm_status_timer(cx);

		let out = self.frame(Command::SYN_ACK, now_ms(cx), src, handshake_payload(self.local_mtu, peer_stream_mode));
		vec![Effect::Send(peer, out)]
	}

	/// The status timer (handshake/keepalive retry) fired.
	pub fn status_timer_expired(&mut self, cx: &mut Cx<A>) -> Vec<Effect> {
		self.tries += 1;

		if self.tries > self.max_tries {
			self.state = State::Closed;
			return vec![Effect::Closed(ErrorKind::NetworkUnreachable)];
		}

		let Some(peer) = self.peer_addr else { return Vec::new() };

		self.rearm_status_timer(cx);

		let frame = match self.state {
			State::SynSent => self.frame(Command::SYN, now_ms(cx), 0, handshake_payload(self.local_mtu, self.stream_mode_pref)),
			State::SynRecv => {
				let dst = self.remote_id.unwrap_or(crate::codec::UNKNOWN_ID);
				self.frame(Command::SYN_ACK, now_ms(cx), dst, handshake_payload(self.local_mtu, self.negotiated_stream_mode))
			}
			State::Connected if self.pong_outstanding => {
				let dst = self.remote_id.unwrap_or(crate::codec::UNKNOWN_ID);
				self.frame(Command::PING, now_ms(cx), dst, 0)
			}
			_ => return Vec::new(),
		};

		vec![Effect::Send(peer, frame)]
	}

	/// Feed one inbound control frame. Returns an empty effect list if the
	/// command is dropped by the per-state acceptance filter or source
	/// verification.
	pub fn on_control_frame(&mut self, cx: &mut Cx<A>, frame: &ControlFrame) -> Vec<Effect> {
		let Some(peer) = self.peer_addr else { return Vec::new() };
		let Some(cmd) = frame.command() else { return Vec::new() };

		if cmd == Command::RST {
			return self.on_rst(frame);
		}

		let accept_mask = match self.state {
			State::Connected => mask::CONNECTED,
			State::SynRecv => mask::SYN_RECV,
			State::SynSent => mask::SYN_SENT,
			State::Init | State::Closed => return Vec::new(),
		};

		if !cmd.is_in(accept_mask) {
			trace!("Dropping command 0x{:x} not valid in state {:?}", cmd.0, self.state);
			return Vec::new();
		}

		if matches!(cmd, Command::SYN_ACK2 | Command::PING | Command::PONG) && !self.verify_source(frame) {
			warn!("Dropping {:?} from {peer} with mismatched src/dst id", self.state);
			return Vec::new();
		}

		match (self.state, cmd) {
			(State::SynSent, Command::SYN_ACK) => self.on_syn_ack(cx, frame),
			(State::SynRecv, Command::SYN_ACK2) => self.on_syn_ack2(cx),
			(State::Connected, Command::PING) => self.on_ping(cx),
			(State::Connected, Command::PONG) => self.on_pong(),
			_ => Vec::new(),
		}
	}

	fn verify_source(&self, frame: &ControlFrame) -> bool {
		let Some(remote_id) = self.remote_id else { return false };
		frame.src.get() == remote_id && frame.dst.get() == self.local_id
	}

	fn on_rst(&mut self, frame: &ControlFrame) -> Vec<Effect> {
		if self.state == State::Closed {
			return Vec::new();
		}

		if let Some(remote_id) = self.remote_id {
			if frame.src.get() != remote_id {
				return Vec::new();
			}
		}

		if frame.dst.get() != self.local_id {
			return Vec::new();
		}

		self.state = State::Closed;
		vec![Effect::Closed(ErrorKind::ConnectionReset)]
	}

	fn on_syn_ack(&mut self, cx: &mut Cx<A>, frame: &ControlFrame) -> Vec<Effect> {
		if frame.dst.get() != self.local_id {
			return Vec::new();
		}

		let peer_mtu = handshake_mtu(frame.payload.get());
		self.negotiated_mtu = self.local_mtu.min(peer_mtu);
		self.remote_id = Some(frame.src.get());
		self.state = State::Connected;

		let peer = self.peer_addr.unwrap();
		let ack2 = self.frame(Command::SYN_ACK2, now_ms(cx), frame.src.get(), 0);
		self.reset_idle_timer(cx);

		vec![Effect::Connected { conv: frame.src.get() }, Effect::Send(peer, ack2)]
	}

	fn on_syn_ack2(&mut self, cx: &mut Cx<A>) -> Vec<Effect> {
		self.state = State::Connected;
		self.reset_idle_timer(cx);
		vec![Effect::Connected { conv: self.local_id }]
	}

	fn on_ping(&mut self, cx: &mut Cx<A>) -> Vec<Effect> {
		self.reset_idle_timer(cx);

		let peer = self.peer_addr.unwrap();
		let dst = self.remote_id.unwrap();
		let pong = self.frame(Command::PONG, now_ms(cx), dst, 0);

		vec![Effect::Send(peer, pong)]
	}

	fn on_pong(&mut self) -> Vec<Effect> {
		self.pong_outstanding = false;
		self.tries = 0;
		Vec::new()
	}

	/// Called by the driver whenever any data (control or RTE) arrives, to
	/// keep the idle timer honest.
	pub fn note_activity(&mut self, cx: &mut Cx<A>) {
		if self.state == State::Connected {
			self.reset_idle_timer(cx);
		}
	}

	/// Auto-keepalive tick: send a PING and expect a PONG within
	/// `CONNECT_TIMEOUT_MS` (spec §4.4).
	pub fn keepalive_tick(&mut self, cx: &mut Cx<A>) -> Vec<Effect> {
		if !self.auto_keepalive || self.state != State::Connected {
			return Vec::new();
		}

		self.pong_outstanding = true;
		self.tries = 0;
		self.rearm_status_timer(cx);

		let peer = self.peer_addr.unwrap();
		let dst = self.remote_id.unwrap();
		let ping = self.frame(Command::PING, now_ms(cx), dst, 0);

		vec![Effect::Send(peer, ping)]
	}

	/// `idle > MAX_IDLE_CONNECTION_TIME_MS` fired.
	pub fn idle_timer_expired(&mut self) -> Vec<Effect> {
		if self.state != State::Connected {
			return Vec::new();
		}

		self.state = State::Closed;
		vec![Effect::Closed(ErrorKind::TimedOut)]
	}

	/// App calls `destroy`: send RST best-effort, tear down unconditionally.
	pub fn destroy(&mut self, cx: &mut Cx<A>) -> Vec<Effect> {
		if self.state == State::Closed {
			return Vec::new();
		}

		let was_peered = self.peer_addr.zip(self.remote_id);
		let ts = now_ms(cx);
		self.state = State::Closed;

		match was_peered {
			Some((peer, remote_id)) => vec![Effect::Send(peer, self.frame(Command::RST, ts, remote_id, 0))],
			None => Vec::new(),
		}
	}

	fn rearm_status_timer(&mut self, cx: &mut Cx<A>) {
		debug!("Arming status timer for {:?}", self.connect_timeout);
		let when = cx.now() + self.connect_timeout;
		let descriptor_id = self.descriptor_id;
		timer_max!(&mut self.status_timer, when, [cx], on_status_timer(descriptor_id));
	}

	fn reset_idle_timer(&mut self, cx: &mut Cx<A>) {
		let when = cx.now() + self.idle_timeout;
		let descriptor_id = self.descriptor_id;
		timer_max!(&mut self.idle_timer, when, [cx], on_idle_timer(descriptor_id));
	}
}

static EPOCH: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();

/// Stakker's clock is used as the handshake/RTE timestamp source: a
/// monotonic millisecond counter relative to this process's start, matching
/// the 32-bit `ts` field's width.
fn now_ms<A>(cx: &mut Cx<A>) -> u32 {
	let epoch = *EPOCH.get_or_init(std::time::Instant::now);
	cx.now().saturating_duration_since(epoch).as_millis() as u32
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn command_acceptance_matches_table() {
		assert!(Command::SYN_ACK.is_in(mask::CONNECTED));
		assert!(!Command::SYN.is_in(mask::CONNECTED));
		assert!(Command::SYN.is_in(mask::SYN_RECV));
		assert!(Command::SYN_ACK2.is_in(mask::SYN_RECV));
		assert!(Command::SYN_ACK.is_in(mask::SYN_SENT));
	}
}
