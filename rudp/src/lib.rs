//! Reliable UDP transport (spec §1-§2): a KCP-style sliding-window ARQ
//! protocol with a connection handshake, congestion control, and a
//! descriptor-based async API, run across a fixed pool of single-threaded
//! reactor executors (C5, §5).
//!
//! The public surface here is a thin synchronous/callback wrapper: every
//! call is routed as a [driver::Command] into the [Descriptor]'s owning
//! executor and answered either by blocking on a one-shot channel (the
//! `create`/`bind`/`listen`/`configure`/`destroy` family) or by handing the
//! caller's own completion through untouched (`connect`/`wait_connect`/
//! `accept`/`send`/`recv`). Nothing here ever touches a `Driver` directly.

mod codec;
mod config;
mod csm;
mod descriptor;
mod driver;
mod endpoint;
mod executor;
mod registry;
mod rte;

use std::net::SocketAddr;
use std::sync::{mpsc, Arc, OnceLock};

pub use config::{ConfigOption, ConfigTable};
pub use utils::error::{Error, ErrorKind, RudpResult};

use driver::Command;
use executor::{ExecutorHandle, ExecutorPool, DEFAULT_EXECUTORS};

fn pool() -> &'static Arc<ExecutorPool> {
	static POOL: OnceLock<Arc<ExecutorPool>> = OnceLock::new();
	POOL.get_or_init(|| ExecutorPool::new(DEFAULT_EXECUTORS))
}

/// Number of executor threads backing the pool.
pub fn executor_count() -> usize {
	pool().executor_count()
}

/// A live descriptor id. Cheap to copy; every operation looks its owning
/// executor up from the process-wide registry on each call, so a
/// [Descriptor] stays valid across an accept-side migration (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor(u32);

impl Descriptor {
	pub fn id(self) -> u32 {
		self.0
	}
}

fn owning_handle(id: u32) -> RudpResult<&'static ExecutorHandle> {
	let executor = registry::global().owner(id).ok_or_else(|| ErrorKind::BadFileDescriptor.detail("unknown descriptor"))?;
	Ok(pool().handle(executor))
}

fn recv_reply<T>(rx: mpsc::Receiver<RudpResult<T>>) -> RudpResult<T> {
	rx.recv().map_err(|_| ErrorKind::Failed.detail("executor is gone"))?
}

/// Allocate a fresh descriptor, placed on `executor` if given, otherwise
/// round-robin across the pool (spec §4.5, §6).
pub fn create(executor: Option<usize>) -> RudpResult<Descriptor> {
	let handle = match executor {
		Some(index) => pool().handle(index),
		None => pool().next_executor(),
	};

	let (reply, rx) = mpsc::channel();
	handle.send(Command::Create { config: registry::global().system_config(), reply });
	let id = recv_reply(rx)?;

	Ok(Descriptor(id))
}

/// Bind a descriptor to a local address. Port `0` asks the OS to pick one;
/// the actually-bound address is returned.
pub fn bind(d: Descriptor, addr: SocketAddr) -> RudpResult<SocketAddr> {
	let handle = owning_handle(d.0)?;
	let (reply, rx) = mpsc::channel();
	handle.send(Command::Bind { id: d.0, addr, reply });
	recv_reply(rx)
}

/// Turn a bound descriptor into a server, accepting up to `max_pending`
/// concurrently mid-handshake or unclaimed-connected children.
pub fn listen(d: Descriptor, max_pending: u32) -> RudpResult {
	let handle = owning_handle(d.0)?;
	let (reply, rx) = mpsc::channel();
	handle.send(Command::Listen { id: d.0, max_pending, reply });
	recv_reply(rx)
}

/// Wait for a connected child of a listening descriptor, migrating it onto
/// `target_executor` before `completion` fires (spec §4.5).
pub fn accept(d: Descriptor, target_executor: usize, completion: impl FnOnce(RudpResult<Descriptor>) + Send + 'static) {
	let Ok(handle) = owning_handle(d.0) else {
		return completion(Err(ErrorKind::BadFileDescriptor.detail("unknown descriptor")));
	};

	handle.send(Command::Accept {
		id: d.0,
		target_executor,
		completion: Box::new(move |result| completion(result.map(Descriptor))),
	});
}

/// Single-shot passive wait: the next inbound SYN on `d`'s own bound
/// address completes `d`'s own handshake, no child descriptor spawned
/// (spec §4.5).
pub fn wait_connect(d: Descriptor, max_wait_ms: u32, completion: impl FnOnce(RudpResult) + Send + 'static) {
	let Ok(handle) = owning_handle(d.0) else {
		return completion(Err(ErrorKind::BadFileDescriptor.detail("unknown descriptor")));
	};

	handle.send(Command::WaitConnect { id: d.0, max_wait_ms, completion: Box::new(completion) });
}

/// Initiate a handshake to `peer`. `completion` fires once CONNECTED or on
/// error (timeout, reset, or a rejected stream-mode mismatch).
pub fn connect(d: Descriptor, peer: SocketAddr, completion: impl FnOnce(RudpResult) + Send + 'static) {
	let Ok(handle) = owning_handle(d.0) else {
		return completion(Err(ErrorKind::BadFileDescriptor.detail("unknown descriptor")));
	};

	handle.send(Command::Connect { id: d.0, peer, completion: Box::new(completion) });
}

/// Submit bytes to the reliable transport engine. `completion` reports how
/// many bytes were handed off, which on error may be 0 or partial (spec §7).
pub fn send(d: Descriptor, data: Vec<u8>, completion: impl FnOnce(RudpResult<usize>) + Send + 'static) {
	let Ok(handle) = owning_handle(d.0) else {
		return completion(Err(ErrorKind::BadFileDescriptor.detail("unknown descriptor")));
	};

	handle.send(Command::Send { id: d.0, data, completion: Box::new(completion) });
}

/// Read up to `cap` bytes. `completion` reports the bytes actually filled;
/// in message mode, `no_buffer_space` carries the discarded tail's length
/// in its detail string (spec §7).
pub fn recv(d: Descriptor, cap: usize, completion: impl FnOnce(RudpResult<Vec<u8>>) + Send + 'static) {
	let Ok(handle) = owning_handle(d.0) else {
		return completion(Err(ErrorKind::BadFileDescriptor.detail("unknown descriptor")));
	};

	handle.send(Command::Recv { id: d.0, cap, completion: Box::new(completion) });
}

/// Set one configuration option on a single descriptor.
pub fn configure(d: Descriptor, option: ConfigOption, value: i64) -> RudpResult {
	let handle = owning_handle(d.0)?;
	let (reply, rx) = mpsc::channel();
	handle.send(Command::Configure { id: d.0, option, value, reply });
	recv_reply(rx)
}

/// Set one process-wide default, applied to every descriptor created after
/// the call (spec §6, §12). Existing descriptors are unaffected.
pub fn configure_system(option: ConfigOption, value: i64) {
	let mut config = registry::global().system_config();
	config.set(option, value);
	registry::global().set_system_config(config);
}

/// Idempotent close: cancels every pending operation on `d` with
/// `operation_canceled` and releases its id for reuse.
pub fn destroy(d: Descriptor) -> RudpResult {
	let handle = owning_handle(d.0)?;
	let (reply, rx) = mpsc::channel();
	handle.send(Command::Destroy { id: d.0, reply });
	recv_reply(rx)
}
