//! The UDP transport endpoint (C1): bind/send/recv wrapper around
//! `runtime::Io`, grounded on `wireguard::tunnel::Interface`'s own
//! `Io<UdpSocket>` field. Generalized from a single connected peer to the
//! unconnected/addressed path, since one RUDP endpoint demultiplexes many
//! remote peers (spec §2, §4.5).

use std::net::{SocketAddr, UdpSocket};

use collections::bytes::Slice;
use runtime::Io;
use stakker::Fwd;
use utils::error::Result;

pub struct Endpoint {
	io: Io<UdpSocket>,
	local_addr: SocketAddr,
}

impl Endpoint {
	pub fn bind(addr: SocketAddr, fwd: Fwd<(Slice, SocketAddr)>) -> Result<Self> {
		let socket = UdpSocket::bind(addr).map_err(|err| log::error!("Failed to bind RUDP endpoint to {addr}: {err}"))?;

		socket
			.set_nonblocking(true)
			.map_err(|err| log::error!("Failed to put RUDP endpoint {addr} in non-blocking mode: {err}"))?;

		let local_addr = socket
			.local_addr()
			.map_err(|err| log::error!("Failed to read local address for RUDP endpoint: {err}"))?;

		let io = Io::new_unconnected(socket, fwd);

		Ok(Self { io, local_addr })
	}

	/// Wrap an already-connected socket (spec §4.5's accept-side executor
	/// migration: the migrated child gets a dedicated socket connected to
	/// its one peer, so the kernel demultiplexes for it). `fwd` still takes
	/// `(Slice, SocketAddr)` so callers don't need to special-case a
	/// connected endpoint; `peer` is stamped onto every inbound datagram.
	pub fn from_connected(socket: UdpSocket, peer: SocketAddr, fwd: Fwd<(Slice, SocketAddr)>) -> Result<Self> {
		socket
			.set_nonblocking(true)
			.map_err(|err| log::error!("Failed to put migrated RUDP endpoint in non-blocking mode: {err}"))?;

		let local_addr = socket
			.local_addr()
			.map_err(|err| log::error!("Failed to read local address for migrated RUDP endpoint: {err}"))?;

		let adapted = Fwd::new(move |buf: Slice| fwd.fwd((buf, peer)));
		let io = Io::new(socket, adapted);

		Ok(Self { io, local_addr })
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	pub fn send_to(&self, peer: SocketAddr, data: &[u8]) -> Result {
		self.io.write_to(peer, |mut buf| buf.push(data))
	}
}
