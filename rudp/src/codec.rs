//! Wire codec (C2): the 21-byte control frame and the 24-byte RTE data header.
//!
//! Both are `#[repr(C)]` structs built from `utils::endian`'s byte-order
//! wrapper types and cast directly onto the wire buffer, the same way
//! `net`'s own `udp::Header`/`tcp::Header` do it.

use macros::Cast;
use utils::bytes::{self, Cast as _};
use utils::endian::{u16le, u32le};

/// The fixed magic value identifying a control frame.
pub const MAGIC: u32 = 0xFFFF_FFFF;

/// Descriptor id meaning "unbound" or "unknown" on the wire.
pub const UNKNOWN_ID: u32 = 0xFFFF_FFFF;

pub const CONTROL_FRAME_LEN: usize = 21;
pub const DATA_HEADER_LEN: usize = 24;

/// One command kind, represented as a single set bit so that the per-state
/// acceptance filter (spec §4.4) reduces to one bitwise AND against a mask
/// instead of a match arm per command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command(pub u8);

impl Command {
	pub const SYN: Command = Command(1);
	pub const SYN_ACK: Command = Command(2);
	pub const SYN_ACK2: Command = Command(4);
	pub const PING: Command = Command(8);
	pub const PONG: Command = Command(16);
	pub const RST: Command = Command(32);

	const VALID: u8 = Self::SYN.0 | Self::SYN_ACK.0 | Self::SYN_ACK2.0 | Self::PING.0 | Self::PONG.0 | Self::RST.0;

	/// Parse a command byte, rejecting anything that isn't exactly one of
	/// the six recognized single-bit values.
	pub fn from_byte(byte: u8) -> Option<Command> {
		(byte != 0 && byte & !Self::VALID == 0 && byte.count_ones() == 1).then_some(Command(byte))
	}

	/// Whether this command is a member of a per-state acceptance mask (see
	/// the `mask` module below).
	pub fn is_in(self, mask: u8) -> bool {
		self.0 & mask != 0
	}
}

/// Per-CSM-state command acceptance masks (spec §4.4's "accepts {..}" sets).
pub mod mask {
	use super::Command;

	pub const CONNECTED: u8 = Command::SYN_ACK.0 | Command::PING.0 | Command::PONG.0 | Command::RST.0;
	pub const SYN_RECV: u8 = Command::SYN.0 | Command::SYN_ACK2.0 | Command::RST.0;
	pub const SYN_SENT: u8 = Command::SYN_ACK.0 | Command::RST.0;
}

/// The 21-byte control frame, bit-exact per spec §3. Fields are stored in
/// their wire byte order (little-endian); use `.get()` to read a field in
/// native order.
#[derive(Cast, Clone, Copy)]
#[repr(C)]
pub struct ControlFrame {
	pub magic: u32le,
	pub cmd: u8,
	pub ts: u32le,
	pub src: u32le,
	pub dst: u32le,
	pub payload: u32le,
}

impl ControlFrame {
	pub fn new(cmd: Command, ts: u32, src: u32, dst: u32, payload: u32) -> Self {
		Self {
			magic: MAGIC.into(),
			cmd: cmd.0,
			ts: ts.into(),
			src: src.into(),
			dst: dst.into(),
			payload: payload.into(),
		}
	}

	pub fn command(&self) -> Option<Command> {
		Command::from_byte(self.cmd)
	}

	pub fn encode(&self) -> [u8; CONTROL_FRAME_LEN] {
		let mut buf = [0u8; CONTROL_FRAME_LEN];
		buf.copy_from_slice(bytes::as_slice(self));
		buf
	}

	/// Parse a control frame, returning `None` if the length doesn't match,
	/// the magic doesn't match, or the command byte is unrecognized (spec
	/// §4.2).
	pub fn decode(buf: &[u8]) -> Option<Self> {
		if buf.len() != CONTROL_FRAME_LEN {
			return None;
		}

		let frame: &ControlFrame = bytes::cast(buf);

		if frame.magic.get() != MAGIC {
			return None;
		}

		Command::from_byte(frame.cmd)?;

		Some(*frame)
	}
}

/// Bits of a SYN/SYN_ACK payload: the sender's chosen MTU in the low 24
/// bits, plus (SYN only) the stream-mode flag in bit 24.
pub fn handshake_payload(mtu: u32, stream_mode: bool) -> u32 {
	(mtu & 0xFF_FFFF) | ((stream_mode as u32) << 24)
}

pub fn handshake_mtu(payload: u32) -> u32 {
	payload & 0xFF_FFFF
}

pub fn handshake_stream_mode(payload: u32) -> bool {
	payload & (1 << 24) != 0
}

/// The RTE-internal 24-byte data-frame header (spec §4.3's concrete layout
/// choice: conv/cmd/frg/wnd/ts/sn/una/len, in the order used by well-known
/// KCP-style reliable-UDP engines). Opaque to everything outside the RTE.
#[derive(Cast, Clone, Copy)]
#[repr(C)]
pub struct DataHeader {
	/// Conversation id, adopted from the handshake.
	pub conv: u32le,
	/// 0 = PUSH (data fragment), 1 = ACK.
	pub cmd: u8,
	/// Fragments remaining after this one within the same logical send;
	/// zero on the last fragment.
	pub frg: u8,
	/// Receiver's advertised free window, in fragments.
	pub wnd: u16le,
	/// Sender's send timestamp, echoed back on ACK for RTT sampling.
	pub ts: u32le,
	/// Fragment sequence number.
	pub sn: u32le,
	/// Cumulative ack: everything below this sequence has been received.
	pub una: u32le,
	/// Payload length following the header.
	pub len: u32le,
}

pub const DATA_CMD_PUSH: u8 = 0;
pub const DATA_CMD_ACK: u8 = 1;

/// The result of classifying one inbound datagram (spec §4.2).
pub enum Frame<'a> {
	Control(ControlFrame),
	Data(&'a [u8]),
}

/// Classify an inbound datagram: exactly 21 bytes with a matching magic is a
/// control frame; 24 bytes or more is a data frame; anything else (and a
/// 21-byte datagram with a mismatched magic) is discarded.
pub fn classify(buf: &[u8]) -> Option<Frame<'_>> {
	if buf.len() == CONTROL_FRAME_LEN {
		return ControlFrame::decode(buf).map(Frame::Control);
	}

	if buf.len() >= DATA_HEADER_LEN {
		return Some(Frame::Data(buf));
	}

	None
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sizes_are_exact() {
		assert_eq!(core::mem::size_of::<ControlFrame>(), CONTROL_FRAME_LEN);
		assert_eq!(core::mem::size_of::<DataHeader>(), DATA_HEADER_LEN);
	}

	#[test]
	fn control_frame_round_trips() {
		let frame = ControlFrame::new(Command::SYN_ACK, 0x1234_5678, 7, 9, handshake_payload(1200, false));
		let bytes = frame.encode();
		let decoded = ControlFrame::decode(&bytes).expect("decodes");

		assert_eq!(decoded.command(), Some(Command::SYN_ACK));
		assert_eq!(decoded.ts.get(), 0x1234_5678);
		assert_eq!(decoded.src.get(), 7);
		assert_eq!(decoded.dst.get(), 9);
		assert_eq!(handshake_mtu(decoded.payload.get()), 1200);
	}

	#[test]
	fn decode_rejects_wrong_length() {
		let short = [0u8; CONTROL_FRAME_LEN - 1];
		assert!(ControlFrame::decode(&short).is_none());
	}

	#[test]
	fn decode_rejects_bad_magic() {
		let mut bytes = ControlFrame::new(Command::PING, 0, 1, 2, 0).encode();
		bytes[0] ^= 0xFF;
		assert!(ControlFrame::decode(&bytes).is_none());
	}

	#[test]
	fn decode_rejects_unknown_command() {
		let mut bytes = ControlFrame::new(Command::PING, 0, 1, 2, 0).encode();
		bytes[4] = 0x03; // two bits set, not a recognized single command
		assert!(ControlFrame::decode(&bytes).is_none());
	}

	#[test]
	fn classify_routes_by_length() {
		let control = ControlFrame::new(Command::SYN, 0, 1, UNKNOWN_ID, 0).encode();
		assert!(matches!(classify(&control), Some(Frame::Control(_))));

		let data = vec![0u8; DATA_HEADER_LEN];
		assert!(matches!(classify(&data), Some(Frame::Data(_))));

		let garbage = vec![0u8; 10];
		assert!(classify(&garbage).is_none());

		let mut bad_magic_len21 = control;
		bad_magic_len21[0] = 0;
		assert!(classify(&bad_magic_len21).is_none());
	}

	#[test]
	fn command_masks_match_transition_table() {
		assert!(Command::SYN_ACK.is_in(mask::CONNECTED));
		assert!(Command::PING.is_in(mask::CONNECTED));
		assert!(Command::PONG.is_in(mask::CONNECTED));
		assert!(Command::RST.is_in(mask::CONNECTED));
		assert!(!Command::SYN.is_in(mask::CONNECTED));

		assert!(Command::SYN.is_in(mask::SYN_RECV));
		assert!(Command::SYN_ACK2.is_in(mask::SYN_RECV));
		assert!(!Command::PING.is_in(mask::SYN_RECV));

		assert!(Command::SYN_ACK.is_in(mask::SYN_SENT));
		assert!(!Command::SYN.is_in(mask::SYN_SENT));
	}
}
