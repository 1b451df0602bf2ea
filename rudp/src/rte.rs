//! Reliable-transport engine (C3): sliding-window sender/receiver, RTT
//! estimation, fast retransmit, congestion control, stream/message framing.
//!
//! Grounded on the replay-window idea in `wireguard::tunnel::window::Window`
//! (generalized from a fixed-size bitvector to a sequence-keyed reorder map,
//! since the RTE's windows are orders of magnitude larger) and the timer
//! scheduling idiom of `wireguard::tunnel::timers::Timers`.

use std::collections::{BTreeMap, VecDeque};

use utils::bytes;
use utils::error::ErrorKind;

use crate::codec::{DataHeader, DATA_CMD_ACK, DATA_CMD_PUSH, DATA_HEADER_LEN};
use crate::config::ConfigTable;

/// Minimum RTO with `ENABLE_NO_DELAY` unset (spec §4.3, §9 open question).
pub const MIN_RTO_NORMAL_MS: u32 = 200;
/// Minimum RTO with `ENABLE_NO_DELAY` set.
pub const MIN_RTO_NO_DELAY_MS: u32 = 30;
const MAX_RTO_MS: u32 = 60_000;

/// Past this many untransmitted-or-unacked fragments, the connection is
/// considered to have a protocol cache overflow (spec §4.3).
pub const CACHE_OVERFLOW_LIMIT: usize = 32_768;

struct InFlight {
	sn: u32,
	frg: u8,
	data: Vec<u8>,
	send_ts: u32,
	resend_at_ms: u32,
	rto: u32,
	retries: u32,
	skip: u32,
}

#[derive(Default)]
pub struct SendOutcome {
	pub pending_units: usize,
	pub error: Option<ErrorKind>,
}

#[derive(Default)]
pub struct RecvOutcome {
	pub bytes_filled: usize,
	pub error: Option<ErrorKind>,
	/// Set alongside `no_buffer_space`: the number of bytes of the incoming
	/// message that didn't fit and were discarded (spec §7).
	pub discarded: usize,
}

/// Per-connection reliable-transport state, instantiated once a descriptor's
/// CSM reaches CONNECTED (spec §4.3's "State" note).
pub struct Rte {
	conv: u32,
	payload_cap: usize,
	stream_mode: bool,
	no_congestion_control: bool,
	fast_resend_skip_cnt: u32,
	tick_interval_ms: u32,
	min_rto: u32,

	snd_nxt: u32,
	snd_una: u32,
	snd_queue: VecDeque<(u8, Vec<u8>)>,
	snd_buf: VecDeque<InFlight>,
	snd_wnd: u32,
	rmt_wnd: u32,
	cwnd: u32,
	ssthresh: u32,
	cwnd_growth: u32,

	rcv_nxt: u32,
	rcv_wnd: u32,
	rcv_buf: BTreeMap<u32, (u8, Vec<u8>)>,
	rcv_ready: VecDeque<(u8, Vec<u8>)>,

	ack_queue: VecDeque<(u32, u32)>,

	srtt: Option<i64>,
	rttvar: i64,
	rto: u32,

	residual: VecDeque<u8>,
	newly_acked_bytes: u64,
}

impl Rte {
	pub fn new(conv: u32, config: &ConfigTable) -> Self {
		use crate::config::ConfigOption::*;

		let mtu = config.mtu() as usize;
		let snd_wnd = config.get(MaxSendWindow) as u32;
		let rcv_wnd = config.get(MaxRecvWindow) as u32;
		let min_rto = if config.no_delay() { MIN_RTO_NO_DELAY_MS } else { MIN_RTO_NORMAL_MS };

		Self {
			conv,
			payload_cap: mtu.saturating_sub(DATA_HEADER_LEN).max(1),
			stream_mode: config.stream_mode(),
			no_congestion_control: config.no_congestion_control(),
			fast_resend_skip_cnt: config.get(FastResendSkipCnt) as u32,
			tick_interval_ms: config.get(UpdateIntervalMs) as u32,
			min_rto,

			snd_nxt: 0,
			snd_una: 0,
			snd_queue: VecDeque::new(),
			snd_buf: VecDeque::new(),
			snd_wnd,
			rmt_wnd: snd_wnd,
			cwnd: 1,
			ssthresh: 1 << 15,
			cwnd_growth: 0,

			rcv_nxt: 0,
			rcv_wnd,
			rcv_buf: BTreeMap::new(),
			rcv_ready: VecDeque::new(),

			ack_queue: VecDeque::new(),

			srtt: None,
			rttvar: 0,
			rto: min_rto,

			residual: VecDeque::new(),
			newly_acked_bytes: 0,
		}
	}

	fn payload_cap(&self) -> usize {
		self.payload_cap
	}

	/// Number of fragments not yet both sent and acked.
	pub fn pending_units(&self) -> usize {
		self.snd_queue.len() + self.snd_buf.len()
	}

	/// Bytes that have become fully acked since the last call, draining the
	/// internal counter. Drives write-completion bookkeeping in `descriptor`.
	pub fn take_newly_acked_bytes(&mut self) -> u64 {
		core::mem::take(&mut self.newly_acked_bytes)
	}

	fn advertised_wnd(&self) -> u16 {
		let used = self.rcv_buf.len() as u32;
		self.rcv_wnd.saturating_sub(used).min(u16::MAX as u32) as u16
	}

	fn send_window(&self) -> u32 {
		let cwnd = if self.no_congestion_control { self.snd_wnd } else { self.cwnd };
		self.snd_wnd.min(self.rmt_wnd.max(1)).min(cwnd.max(1))
	}

	/// Copy application bytes into the send side, fragmenting per the
	/// stream/message rules of spec §4.3.
	pub fn send_app_bytes(&mut self, bytes: &[u8]) -> SendOutcome {
		let before = self.pending_units();

		if bytes.is_empty() {
			return SendOutcome { pending_units: 0, error: None };
		}

		let cap = self.payload_cap();
		let mut rest = bytes;

		if self.stream_mode {
			if let Some((_, tail)) = self.snd_queue.back_mut() {
				if tail.len() < cap {
					let room = cap - tail.len();
					let take = room.min(rest.len());
					tail.extend_from_slice(&rest[..take]);
					rest = &rest[take..];
				}
			}

			for chunk in rest.chunks(cap) {
				self.snd_queue.push_back((0, chunk.to_vec()));
			}
		} else {
			let chunks: Vec<&[u8]> = rest.chunks(cap).collect();
			let total = chunks.len();

			// frg counts down from total - 1 to 0 and must fit in a u8; a
			// message needing more fragments than that can never be sent
			// whole, and a single send must also fit inside the configured
			// window (a message-mode send is all-or-nothing, unlike stream
			// mode where chunks can drain across many window turns).
			if total > u8::MAX as usize + 1 || total as u32 > self.snd_wnd {
				return SendOutcome { pending_units: 0, error: Some(ErrorKind::NoBufferSpace) };
			}

			for (i, chunk) in chunks.into_iter().enumerate() {
				let frg = (total - 1 - i) as u8;
				self.snd_queue.push_back((frg, chunk.to_vec()));
			}
		}

		let after = self.pending_units();
		let pending_units = after - before;

		if after > CACHE_OVERFLOW_LIMIT {
			return SendOutcome { pending_units, error: Some(ErrorKind::Failed) };
		}

		SendOutcome { pending_units, error: None }
	}

	/// Consume from the residual buffer and the reorder buffer to fill
	/// `buf` per spec §4.3's stream/message rules.
	pub fn recv_into(&mut self, buf: &mut [u8]) -> RecvOutcome {
		let mut filled = 0;

		while filled < buf.len() {
			let Some(byte) = self.residual.pop_front() else { break };
			buf[filled] = byte;
			filled += 1;
		}

		if self.stream_mode {
			while filled < buf.len() {
				let Some((_, data)) = self.rcv_ready.pop_front() else { break };

				let take = data.len().min(buf.len() - filled);
				buf[filled..filled + take].copy_from_slice(&data[..take]);
				filled += take;

				if take < data.len() {
					self.residual.extend(data[take..].iter().copied());
				}
			}

			return RecvOutcome { bytes_filled: filled, error: None, discarded: 0 };
		}

		if filled > 0 {
			return RecvOutcome { bytes_filled: filled, error: None, discarded: 0 };
		}

		let mut message = Vec::new();
		let mut complete = false;

		while let Some((frg, data)) = self.rcv_ready.pop_front() {
			let last = frg == 0;
			message.extend_from_slice(&data);

			if last {
				complete = true;
				break;
			}
		}

		if !complete {
			return RecvOutcome { bytes_filled: 0, error: None, discarded: 0 };
		}

		if message.len() > buf.len() {
			let take = buf.len();
			buf.copy_from_slice(&message[..take]);

			return RecvOutcome {
				bytes_filled: take,
				error: Some(ErrorKind::NoBufferSpace),
				discarded: message.len() - take,
			};
		}

		buf[..message.len()].copy_from_slice(&message);
		RecvOutcome { bytes_filled: message.len(), error: None, discarded: 0 }
	}

	/// Inject a received data frame. Malformed input is dropped silently.
	pub fn feed_datagram(&mut self, buf: &[u8], now_ms: u32) {
		if buf.len() < DATA_HEADER_LEN {
			return;
		}

		let header: &DataHeader = bytes::cast(&buf[..DATA_HEADER_LEN]);

		if header.conv.get() != self.conv {
			return;
		}

		let payload = &buf[DATA_HEADER_LEN..];

		if payload.len() != header.len.get() as usize {
			return;
		}

		self.rmt_wnd = header.wnd.get() as u32;
		self.advance_una(header.una.get());

		match header.cmd {
			DATA_CMD_PUSH => self.handle_push(header.sn.get(), header.frg, header.ts.get(), payload),
			DATA_CMD_ACK => self.handle_ack(header.sn.get(), header.ts.get(), now_ms),
			_ => {}
		}
	}

	fn advance_una(&mut self, una: u32) {
		while self.snd_buf.front().is_some_and(|f| seq_lt(f.sn, una)) {
			let frag = self.snd_buf.pop_front().unwrap();
			self.newly_acked_bytes += frag.data.len() as u64;
			self.snd_una = frag.sn.wrapping_add(1);
			self.on_ack_growth();
		}
	}

	fn handle_push(&mut self, sn: u32, frg: u8, ts: u32, payload: &[u8]) {
		self.ack_queue.push_back((sn, ts));

		if seq_lt(sn, self.rcv_nxt) {
			return; // duplicate, already delivered
		}

		if sn.wrapping_sub(self.rcv_nxt) >= self.rcv_wnd {
			return; // outside the advertised window
		}

		self.rcv_buf.entry(sn).or_insert_with(|| (frg, payload.to_vec()));

		while let Some((frg, data)) = self.rcv_buf.remove(&self.rcv_nxt) {
			self.rcv_ready.push_back((frg, data));
			self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
		}
	}

	fn handle_ack(&mut self, acked_sn: u32, echoed_ts: u32, now_ms: u32) {
		let mut found = false;

		self.snd_buf.retain(|f| {
			if f.sn == acked_sn {
				found = true;
				false
			} else {
				true
			}
		});

		if found {
			self.newly_acked_bytes += 0; // byte accounting already happened via cumulative una advance
			let rtt = now_ms.wrapping_sub(echoed_ts) as i64;
			self.update_rtt(rtt);
			self.on_ack_growth();
		}

		for frag in self.snd_buf.iter_mut() {
			if seq_lt(frag.sn, acked_sn) {
				frag.skip += 1;
			}
		}
	}

	fn on_ack_growth(&mut self) {
		if self.no_congestion_control {
			return;
		}

		if self.cwnd < self.ssthresh {
			self.cwnd += 1;
		} else {
			self.cwnd_growth += 1;

			if self.cwnd_growth >= self.cwnd {
				self.cwnd_growth = 0;
				self.cwnd += 1;
			}
		}
	}

	fn update_rtt(&mut self, sample_ms: i64) {
		let sample = sample_ms.max(1);

		match self.srtt {
			None => {
				self.srtt = Some(sample);
				self.rttvar = sample / 2;
			}
			Some(srtt) => {
				let delta = (srtt - sample).abs();
				self.rttvar = (3 * self.rttvar + delta) / 4;
				self.srtt = Some((7 * srtt + sample) / 8);
			}
		}

		let srtt = self.srtt.unwrap();
		let computed = srtt + 4 * self.rttvar;
		self.rto = (computed.max(self.min_rto as i64) as u32).min(MAX_RTO_MS);
	}

	/// Advance time, emitting any ready fragments through `output`. Returns
	/// the next instant at which `tick` should be called again.
	pub fn tick(&mut self, now_ms: u32, mut output: impl FnMut(&[u8])) -> u32 {
		while let Some((sn, ts)) = self.ack_queue.pop_front() {
			let frame = Self::build_ack(self.conv, self.advertised_wnd(), self.rcv_nxt, now_ms, sn, ts);
			output(&frame);
		}

		let mut rto_expired = false;
		let mut fast_retransmit = false;
		let una = self.rcv_nxt;
		let wnd = self.advertised_wnd();
		let conv = self.conv;
		let fast_resend_skip_cnt = self.fast_resend_skip_cnt;

		for frag in self.snd_buf.iter_mut() {
			let expired = now_ms.wrapping_sub(frag.resend_at_ms) < (u32::MAX / 2) && now_ms >= frag.resend_at_ms;
			let fast = fast_resend_skip_cnt > 0 && frag.skip >= fast_resend_skip_cnt;

			if expired || fast {
				let frame = Self::build_push(conv, wnd, una, now_ms, frag);
				output(&frame);

				frag.retries += 1;

				if expired {
					frag.rto = (frag.rto * 2).min(MAX_RTO_MS);
					rto_expired = true;
				} else {
					fast_retransmit = true;
				}

				frag.resend_at_ms = now_ms.wrapping_add(frag.rto);
				frag.skip = 0;
			}
		}

		// An RTO expiry means the path went quiet long enough that nothing
		// ack'd; restart from slow start. A pure fast retransmit (three
		// dup acks) only halves the window, per spec.
		if !self.no_congestion_control {
			if rto_expired {
				self.ssthresh = (self.cwnd / 2).max(2);
				self.cwnd = 1;
				self.cwnd_growth = 0;
			} else if fast_retransmit {
				self.ssthresh = (self.cwnd / 2).max(2);
				self.cwnd = self.ssthresh;
				self.cwnd_growth = 0;
			}
		}

		let window = self.send_window();

		while self.snd_nxt.wrapping_sub(self.snd_una) < window {
			let Some((frg, data)) = self.snd_queue.pop_front() else { break };

			let sn = self.snd_nxt;
			self.snd_nxt = self.snd_nxt.wrapping_add(1);

			let mut frag = InFlight {
				sn,
				frg,
				data,
				send_ts: now_ms,
				resend_at_ms: now_ms.wrapping_add(self.rto),
				rto: self.rto,
				retries: 0,
				skip: 0,
			};

			let frame = Self::build_push(self.conv, self.advertised_wnd(), self.rcv_nxt, now_ms, &mut frag);
			output(&frame);

			self.snd_buf.push_back(frag);
		}

		now_ms.wrapping_add(self.tick_interval_ms.max(1))
	}

	fn build_push(conv: u32, wnd: u16, una: u32, now_ms: u32, frag: &mut InFlight) -> Vec<u8> {
		frag.send_ts = now_ms;

		let header = DataHeader {
			conv: conv.into(),
			cmd: DATA_CMD_PUSH,
			frg: frag.frg,
			wnd: wnd.into(),
			ts: frag.send_ts.into(),
			sn: frag.sn.into(),
			una: una.into(),
			len: (frag.data.len() as u32).into(),
		};

		let mut out = Vec::with_capacity(DATA_HEADER_LEN + frag.data.len());
		out.extend_from_slice(bytes::as_slice(&header));
		out.extend_from_slice(&frag.data);
		out
	}

	fn build_ack(conv: u32, wnd: u16, una: u32, now_ms: u32, sn: u32, echoed_ts: u32) -> Vec<u8> {
		let header = DataHeader {
			conv: conv.into(),
			cmd: DATA_CMD_ACK,
			frg: 0,
			wnd: wnd.into(),
			ts: echoed_ts.into(),
			sn: sn.into(),
			una: una.into(),
			len: 0u32.into(),
		};

		let _ = now_ms;
		bytes::as_slice(&header).to_vec()
	}
}

/// Sequence-number comparison that tolerates wraparound, the same "distance
/// from head" idea `Window::guard` uses for its replay bitmap.
fn seq_lt(a: u32, b: u32) -> bool {
	(a.wrapping_sub(b) as i32) < 0
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::ConfigTable;

	fn config(stream_mode: bool) -> ConfigTable {
		let mut c = ConfigTable::defaults();
		c.set(crate::config::ConfigOption::EnableStreamMode, stream_mode as i64);
		c.set(crate::config::ConfigOption::MtuSize, 1024);
		c
	}

	#[test]
	fn message_mode_round_trip_single_fragment() {
		let cfg = config(false);
		let mut sender = Rte::new(1, &cfg);
		let mut receiver = Rte::new(1, &cfg);

		sender.send_app_bytes(b"hello");

		let mut now = 0;
		let mut wire = Vec::new();
		sender.tick(now, |frame| wire.push(frame.to_vec()));

		for frame in wire {
			receiver.feed_datagram(&frame, now);
		}

		let mut buf = [0u8; 64];
		let out = receiver.recv_into(&mut buf);
		assert_eq!(out.bytes_filled, 5);
		assert_eq!(&buf[..5], b"hello");

		// drain the ack back to the sender so it clears snd_buf
		let mut acks = Vec::new();
		now += 10;
		receiver.tick(now, |frame| acks.push(frame.to_vec()));

		for frame in acks {
			sender.feed_datagram(&frame, now);
		}

		assert_eq!(sender.pending_units(), 0);
		assert_eq!(sender.take_newly_acked_bytes(), 5);
	}

	#[test]
	fn message_mode_multi_fragment_reassembly() {
		let mut cfg = config(false);
		cfg.set(crate::config::ConfigOption::MtuSize, 64); // small MTU forces multiple fragments

		let mut sender = Rte::new(2, &cfg);
		let mut receiver = Rte::new(2, &cfg);

		let payload = vec![7u8; 200];
		sender.send_app_bytes(&payload);

		let mut wire = Vec::new();
		sender.tick(0, |frame| wire.push(frame.to_vec()));
		for frame in &wire {
			receiver.feed_datagram(frame, 0);
		}

		let mut buf = [0u8; 256];
		let out = receiver.recv_into(&mut buf);
		assert_eq!(out.bytes_filled, 200);
		assert_eq!(&buf[..200], &payload[..]);
	}

	#[test]
	fn message_mode_no_buffer_space_discards_tail() {
		let cfg = config(false);
		let mut sender = Rte::new(3, &cfg);
		let mut receiver = Rte::new(3, &cfg);

		sender.send_app_bytes(b"a longer message than the buffer");

		let mut wire = Vec::new();
		sender.tick(0, |frame| wire.push(frame.to_vec()));
		for frame in &wire {
			receiver.feed_datagram(frame, 0);
		}

		let mut buf = [0u8; 5];
		let out = receiver.recv_into(&mut buf);
		assert_eq!(out.error, Some(ErrorKind::NoBufferSpace));
		assert_eq!(out.bytes_filled, 5);
		assert_eq!(out.discarded, "a longer message than the buffer".len() - 5);
	}

	#[test]
	fn stream_mode_coalesces_and_allows_short_reads() {
		let cfg = config(true);
		let mut sender = Rte::new(4, &cfg);
		let mut receiver = Rte::new(4, &cfg);

		sender.send_app_bytes(b"abc");
		sender.send_app_bytes(b"def");

		let mut wire = Vec::new();
		sender.tick(0, |frame| wire.push(frame.to_vec()));
		for frame in &wire {
			receiver.feed_datagram(frame, 0);
		}

		let mut buf = [0u8; 4];
		let out = receiver.recv_into(&mut buf);
		assert_eq!(out.bytes_filled, 4);
		assert_eq!(&buf, b"abcd");

		let mut buf2 = [0u8; 4];
		let out2 = receiver.recv_into(&mut buf2);
		assert_eq!(out2.bytes_filled, 2);
		assert_eq!(&buf2[..2], b"ef");
	}

	#[test]
	fn out_of_order_fragments_are_buffered_until_gap_fills() {
		let mut cfg = config(false);
		cfg.set(crate::config::ConfigOption::MtuSize, 64);

		let mut sender = Rte::new(5, &cfg);
		let mut receiver = Rte::new(5, &cfg);

		sender.send_app_bytes(&vec![1u8; 90]); // 3 fragments at cap=40

		let mut wire = Vec::new();
		sender.tick(0, |frame| wire.push(frame.to_vec()));
		assert!(wire.len() >= 2);

		// Deliver out of order: last frame first, then the rest.
		let last = wire.pop().unwrap();
		receiver.feed_datagram(&last, 0);

		let mut buf = [0u8; 128];
		let out = receiver.recv_into(&mut buf);
		assert_eq!(out.bytes_filled, 0); // nothing contiguous yet

		for frame in wire {
			receiver.feed_datagram(&frame, 0);
		}

		let out = receiver.recv_into(&mut buf);
		assert_eq!(out.bytes_filled, 90);
	}

	#[test]
	fn duplicate_fragments_are_discarded() {
		let cfg = config(false);
		let mut receiver = Rte::new(6, &cfg);
		let sender_cfg = config(false);
		let mut sender = Rte::new(6, &sender_cfg);

		sender.send_app_bytes(b"x");
		let mut wire = Vec::new();
		sender.tick(0, |frame| wire.push(frame.to_vec()));

		let frame = wire.into_iter().next().unwrap();
		receiver.feed_datagram(&frame, 0);
		receiver.feed_datagram(&frame, 0); // duplicate

		let mut buf = [0u8; 8];
		let out = receiver.recv_into(&mut buf);
		assert_eq!(out.bytes_filled, 1);

		let out2 = receiver.recv_into(&mut buf);
		assert_eq!(out2.bytes_filled, 0);
	}

	#[test]
	fn cache_overflow_is_reported() {
		let cfg = config(true);
		let mut rte = Rte::new(7, &cfg);

		for _ in 0..CACHE_OVERFLOW_LIMIT + 10 {
			rte.send_app_bytes(&[0u8; 2000]); // large enough to not coalesce away
		}

		let outcome = rte.send_app_bytes(&[0u8; 2000]);
		assert_eq!(outcome.error, Some(ErrorKind::Failed));
	}

	#[test]
	fn message_mode_send_exceeding_window_is_rejected() {
		let mut cfg = config(false);
		cfg.set(crate::config::ConfigOption::MtuSize, 64); // payload_cap = 40
		let mut rte = Rte::new(8, &cfg);

		// 150 fragments at cap=40 needs 6000 bytes; default window is 128.
		let outcome = rte.send_app_bytes(&[0u8; 6000]);
		assert_eq!(outcome.error, Some(ErrorKind::NoBufferSpace));
		assert_eq!(outcome.pending_units, 0);
		assert_eq!(rte.pending_units(), 0);
	}

	#[test]
	fn message_mode_send_exceeding_u8_fragment_count_is_rejected() {
		let mut cfg = config(false);
		cfg.set(crate::config::ConfigOption::MtuSize, 64); // payload_cap = 40
		cfg.set(crate::config::ConfigOption::MaxSendWindow, 1000); // window isn't the limiting factor
		let mut rte = Rte::new(9, &cfg);

		// 300 fragments at cap=40 needs 12000 bytes, past the 256-fragment
		// cap a u8 frg field can express.
		let outcome = rte.send_app_bytes(&[0u8; 12000]);
		assert_eq!(outcome.error, Some(ErrorKind::NoBufferSpace));
		assert_eq!(rte.pending_units(), 0);
	}
}
