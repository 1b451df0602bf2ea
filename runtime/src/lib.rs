extern crate alloc;

use alloc::collections::VecDeque;
use core::cell::RefCell;
use core::time::Duration;
use std::io::{self, ErrorKind};

use collections::bytes::{Cursor, Slice};
use log::error;
use stakker::Fwd;

mod rt;
pub mod time;

pub use rt::*;

/// Upper bound on a single datagram's wire size; read/write buffers are
/// sized to this so a caller's configured MTU (up to the same bound) never
/// gets silently truncated.
pub const MAX_DATAGRAM_SIZE: usize = 32_768;

#[cfg(target_family = "unix")]
mod sys {
	pub use std::os::fd::{AsRawFd, RawFd};

	pub use libc::{
		c_void as BufType, poll, pollfd as Poll, recv, recvfrom, send, sendto, sockaddr, sockaddr_storage, socklen_t, POLLERR, POLLHUP, POLLIN,
		POLLNVAL, POLLOUT,
	};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_fd()
	}
}

#[cfg(target_family = "windows")]
mod sys {
	pub use std::os::windows::io::AsRawSocket as AsRawFd;

	pub use u8 as BufType;
	pub use windows_sys::Win32::Networking::WinSock::{
		recv, recvfrom, send, sendto, SOCKADDR as sockaddr, SOCKADDR_STORAGE as sockaddr_storage, WSAPoll as poll, POLLERR, POLLHUP, POLLNVAL,
		POLLRDNORM as POLLIN, POLLWRNORM as POLLOUT, SOCKET as RawFd, WSAPOLLFD as Poll,
	};
	pub use windows_sys::Win32::Networking::WinSock::SOCKADDR_STORAGE as SockLenAlias;

	pub type socklen_t = i32;

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_socket() as _
	}
}

pub use sys::AsRawFd;
use sys::*;
use utils::error::*;

fn as_timeout(t: Option<Duration>) -> i32 {
	t.and_then(|d| d.as_millis().try_into().ok()).unwrap_or(-1)
}

fn ret_to_err(val: isize) -> Result<Option<usize>> {
	match TryInto::<usize>::try_into(val) {
		Ok(n) => Ok(Some(n)),
		Err(_) => {
			let err = io::Error::last_os_error();

			if matches!(err.kind(), ErrorKind::WouldBlock) {
				return Ok(None);
			}

			error!("I/O operation failed: {err}");
			Err(())
		}
	}
}

fn send(fd: RawFd, buf: &[u8]) -> Result<bool> {
	let r = unsafe { sys::send(fd, buf.as_ptr() as *mut BufType, buf.len() as _, 0) };

	if let Some(n) = ret_to_err(r as _)? {
		if n != buf.len() {
			error!("Only sent {}/{} bytes to socket", n, buf.len());
			return Err(());
		}

		Ok(true)
	} else {
		Ok(false)
	}
}

fn recv(fd: RawFd, buf: &mut Slice) -> Result<bool> {
	let r = unsafe { sys::recv(fd, buf.as_mut_ptr() as *mut BufType, buf.len() as _, 0) };

	if let Some(n) = ret_to_err(r as _)? {
		buf.truncate(n);
		Ok(true)
	} else {
		Ok(false)
	}
}

fn addr_to_storage(addr: std::net::SocketAddr) -> (sockaddr_storage, socklen_t) {
	let mut storage: sockaddr_storage = unsafe { core::mem::zeroed() };

	let len = match addr {
		std::net::SocketAddr::V4(v4) => unsafe {
			let sin = &mut *(&mut storage as *mut sockaddr_storage as *mut libc::sockaddr_in);
			sin.sin_family = libc::AF_INET as _;
			sin.sin_port = v4.port().to_be();
			sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
			core::mem::size_of::<libc::sockaddr_in>()
		},
		std::net::SocketAddr::V6(v6) => unsafe {
			let sin6 = &mut *(&mut storage as *mut sockaddr_storage as *mut libc::sockaddr_in6);
			sin6.sin6_family = libc::AF_INET6 as _;
			sin6.sin6_port = v6.port().to_be();
			sin6.sin6_addr.s6_addr = v6.ip().octets();
			sin6.sin6_flowinfo = v6.flowinfo();
			sin6.sin6_scope_id = v6.scope_id();
			core::mem::size_of::<libc::sockaddr_in6>()
		},
	};

	(storage, len as socklen_t)
}

fn storage_to_addr(storage: &sockaddr_storage) -> Option<std::net::SocketAddr> {
	unsafe {
		match storage.ss_family as i32 {
			libc::AF_INET => {
				let sin = &*(storage as *const sockaddr_storage as *const libc::sockaddr_in);
				let ip = std::net::Ipv4Addr::from(u32::from_ne_bytes(sin.sin_addr.s_addr.to_ne_bytes()));
				Some(std::net::SocketAddr::V4(std::net::SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
			}
			libc::AF_INET6 => {
				let sin6 = &*(storage as *const sockaddr_storage as *const libc::sockaddr_in6);
				let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
				Some(std::net::SocketAddr::V6(std::net::SocketAddrV6::new(
					ip,
					u16::from_be(sin6.sin6_port),
					sin6.sin6_flowinfo,
					sin6.sin6_scope_id,
				)))
			}
			_ => None,
		}
	}
}

fn send_to(fd: RawFd, buf: &[u8], addr: std::net::SocketAddr) -> Result<bool> {
	let (storage, len) = addr_to_storage(addr);
	let r = unsafe { sendto(fd, buf.as_ptr() as *mut BufType, buf.len() as _, 0, &storage as *const _ as *const sockaddr, len) };

	if let Some(n) = ret_to_err(r as _)? {
		if n != buf.len() {
			error!("Only sent {}/{} bytes to socket", n, buf.len());
			return Err(());
		}

		Ok(true)
	} else {
		Ok(false)
	}
}

fn recv_from(fd: RawFd, buf: &mut Slice) -> Result<Option<std::net::SocketAddr>> {
	let mut storage: sockaddr_storage = unsafe { core::mem::zeroed() };
	let mut len = core::mem::size_of::<sockaddr_storage>() as socklen_t;

	let r = unsafe { recvfrom(fd, buf.as_mut_ptr() as *mut BufType, buf.len() as _, 0, &mut storage as *mut _ as *mut sockaddr, &mut len) };

	if let Some(n) = ret_to_err(r as _)? {
		buf.truncate(n);
		Ok(storage_to_addr(&storage))
	} else {
		Ok(None)
	}
}

thread_local! {
	static GLOBAL: RefCell<State> = const {
		RefCell::new(State {
			fds: Vec::new(),
			entries: Vec::new(),
			polls: 0,
			wakes: 0,
		})
	};
}

struct State {
	fds: Vec<Poll>,
	entries: Vec<Entry>,
	polls: u64,
	wakes: u64,
}

impl State {
	fn with<X, F: FnOnce(&mut Self) -> X>(f: F) -> X {
		GLOBAL.with(|x| f(&mut x.borrow_mut()))
	}

	/// Log a summary of this thread's poll loop activity, called once on exit.
	fn log_stats(&self) {
		log::info!("poll loop exiting: {} polls, {} wakeups, {} fds still registered", self.polls, self.wakes, self.fds.len());
	}

	fn idx_of<T: AsRawFd>(&mut self, socket: &T) -> usize {
		let raw = as_raw(socket);
		self.fds.iter().position(|f| f.fd == raw).expect("Socket is present")
	}

	/// Returns whether any more I/O is waiting.
	fn is_io(&self) -> bool {
		!self.fds.is_empty()
	}

	/// Poll the fds. Returns whether any file descriptors are ready for I/O.
	fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
		let ret = unsafe {
			poll(
				self.fds.as_mut_ptr(),
				self.fds.len().try_into().expect("Fewer than u32::MAX fds"),
				as_timeout(timeout),
			)
		};

		let mut pending: u32 = ret.try_into().map_err(|_| error!("poll() failed: {}", io::Error::last_os_error()))?;

		self.polls += 1;

		if pending == 0 {
			return Ok(false);
		}

		self.wakes += 1;

		for idx in 0.. {
			let Poll { fd, events, revents } = &mut self.fds[idx];
			let entry = &mut self.entries[idx];

			if *revents == 0 {
				continue;
			}

			if *revents & POLLERR != 0 {
				panic!("Socket error while polling");
			}

			if *revents & POLLHUP != 0 {
				panic!("Socket hangup");
			}

			if *revents & POLLNVAL != 0 {
				panic!("Socket invalid");
			}

			if *revents & POLLIN != 0 {
				entry.flush_read(*fd)?;
			}

			if *revents & POLLOUT != 0 {
				entry.flush_write(*fd)?;
			};

			*events = POLLIN;

			if !entry.queue.is_empty() {
				*events |= POLLOUT;
			}

			*revents = 0;

			pending -= 1;

			if pending == 0 {
				break;
			}
		}

		Ok(true)
	}
}

/// Where inbound data for one registered fd is delivered. [Sink::Connected]
/// matches the original single-peer usage (the fd is `connect()`-ed, so
/// `send`/`recv` need no address). [Sink::Addressed] is for a fd shared by
/// several remote peers — a listening RUDP descriptor's server socket — and
/// carries the peer address alongside every datagram.
enum Sink {
	Connected(Fwd<Slice>),
	Addressed(Fwd<(Slice, std::net::SocketAddr)>),
}

struct Entry {
	sink: Sink,
	queue: VecDeque<(Box<[u8]>, Option<std::net::SocketAddr>)>,
}

impl Entry {
	fn flush_read(&mut self, fd: RawFd) -> Result {
		match &self.sink {
			Sink::Connected(fwd) => {
				let mut buf = Slice::new(MAX_DATAGRAM_SIZE);

				while recv(fd, &mut buf)? {
					fwd.fwd(buf);
					buf = Slice::new(MAX_DATAGRAM_SIZE);
				}
			}
			Sink::Addressed(fwd) => loop {
				let mut buf = Slice::new(MAX_DATAGRAM_SIZE);

				match recv_from(fd, &mut buf)? {
					Some(addr) => fwd.fwd((buf, addr)),
					None => break,
				}
			},
		}

		Ok(())
	}

	fn flush_write(&mut self, fd: RawFd) -> Result {
		assert!(!self.queue.is_empty());

		loop {
			let Some((buf, addr)) = self.queue.back() else { return Ok(()) };

			let sent = match addr {
				Some(addr) => send_to(fd, buf, *addr)?,
				None => send(fd, buf)?,
			};

			if !sent {
				return Ok(());
			}

			self.queue.pop_back();
		}
	}
}

pub struct Io<T: AsRawFd> {
	inner: T,
}

impl<T: AsRawFd> Io<T> {
	/// Register a `connect()`-ed socket: every write targets the one peer it
	/// is connected to, and every read is known to come from that peer.
	pub fn new(inner: T, fwd: Fwd<Slice>) -> Self {
		State::with(|i| {
			i.fds.push(Poll { fd: as_raw(&inner), events: POLLIN, revents: 0 });

			i.entries.push(Entry { sink: Sink::Connected(fwd), queue: VecDeque::new() });

			Self { inner }
		})
	}

	/// Register a bound-but-unconnected socket shared by several remote
	/// peers, delivering the sender's address with every datagram.
	pub fn new_unconnected(inner: T, fwd: Fwd<(Slice, std::net::SocketAddr)>) -> Self {
		State::with(|i| {
			i.fds.push(Poll { fd: as_raw(&inner), events: POLLIN, revents: 0 });

			i.entries.push(Entry { sink: Sink::Addressed(fwd), queue: VecDeque::new() });

			Self { inner }
		})
	}

	/// Write to the peer this `Io` is `connect()`-ed to. Panics (via a failed
	/// send) if called on an `Io` created with [Io::new_unconnected].
	pub fn write<X>(&self, f: impl FnOnce(Cursor) -> X) -> Result<X> {
		let mut vec = vec![0; MAX_DATAGRAM_SIZE];
		let res = Cursor::vec(&mut vec, f);

		if !send(as_raw(&self.inner), &mut vec)? {
			State::with(|i| {
				let idx = i.idx_of(&self.inner);
				i.entries[idx].queue.push_front((vec.into_boxed_slice(), None));
				i.fds[idx].events |= POLLOUT;
			});
		}

		Ok(res)
	}

	/// Write to an explicit peer address, for an `Io` registered via
	/// [Io::new_unconnected].
	pub fn write_to<X>(&self, addr: std::net::SocketAddr, f: impl FnOnce(Cursor) -> X) -> Result<X> {
		let mut vec = vec![0; MAX_DATAGRAM_SIZE];
		let res = Cursor::vec(&mut vec, f);

		if !send_to(as_raw(&self.inner), &vec, addr)? {
			State::with(|i| {
				let idx = i.idx_of(&self.inner);
				i.entries[idx].queue.push_front((vec.into_boxed_slice(), Some(addr)));
				i.fds[idx].events |= POLLOUT;
			});
		}

		Ok(res)
	}
}

impl<T: AsRawFd> Drop for Io<T> {
	fn drop(&mut self) {
		State::with(|i| {
			let idx = i.idx_of(&self.inner);
			i.entries.swap_remove(idx);
			i.fds.swap_remove(idx);
		})
	}
}
