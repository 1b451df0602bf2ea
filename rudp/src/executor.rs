//! The executor pool (spec §5): a fixed-size set of OS threads, each running
//! its own single-threaded reactor and one root [Driver] actor.
//!
//! This shape — independent `Stakker` instances on plain OS threads, talked
//! to from the outside only through a command channel — has no direct
//! analogue in the pack (`net`/`wireguard` are driven by a single external
//! caller embedding its own `Stakker`, never spawn their own threads or
//! accept cross-thread calls). The per-thread reactor loop itself reuses
//! `runtime::init`/`exec`/`exec_loop` exactly as the teacher wires up
//! one; `exec`/`exec_loop` are split so only the first thread installs the
//! process-wide Ctrl+C handler, since `ctrlc` only allows one registration
//! per process.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use stakker::{actor, ret_nop};

use crate::driver::{Command, Driver, Migration};

/// Default executor count (spec §5 leaves the pool size to the
/// implementation; one reactor thread per descriptor-heavy core is the
/// shape the spec describes, and 8 is a reasonable stand-in for "however
/// many cores this host has" without reaching for a cores-detection crate
/// the rest of the pack never uses).
pub const DEFAULT_EXECUTORS: usize = 8;

/// A handle to one executor thread's command inbox. `lib.rs`'s public API
/// holds one of these per descriptor (recorded by the registry) and per
/// pool (for `create`'s placement).
#[derive(Clone)]
pub struct ExecutorHandle {
	index: usize,
	commands: mpsc::Sender<Command>,
}

impl ExecutorHandle {
	pub fn index(&self) -> usize {
		self.index
	}

	pub fn send(&self, command: Command) {
		// The only way this fails is the executor thread having panicked;
		// there is no reply to fail in that case beyond what the caller
		// already arranged (a oneshot reply whose sender is simply dropped,
		// or a completion that will never fire — both surface as a hang the
		// caller's own timeout should catch, matching spec §5's per-call
		// timeout guidance).
		let _ = self.commands.send(command);
	}
}

pub struct ExecutorPool {
	threads: Vec<JoinHandle<()>>,
	handles: Vec<ExecutorHandle>,
	next: std::sync::atomic::AtomicUsize,
}

impl ExecutorPool {
	pub fn new(count: usize) -> Arc<Self> {
		let count = count.max(1);

		let mut migration_senders = Vec::with_capacity(count);
		let mut migration_inboxes = Vec::with_capacity(count);
		let mut command_senders = Vec::with_capacity(count);
		let mut command_inboxes = Vec::with_capacity(count);

		for _ in 0..count {
			let (mtx, mrx) = mpsc::channel();
			migration_senders.push(mtx);
			migration_inboxes.push(mrx);

			let (ctx, crx) = mpsc::channel();
			command_senders.push(ctx);
			command_inboxes.push(crx);
		}

		let mut threads = Vec::with_capacity(count);
		let mut handles = Vec::with_capacity(count);

		for index in 0..count {
			let migration_senders = migration_senders.clone();
			let migration_inbox = migration_inboxes.remove(0);
			let command_inbox = command_inboxes.remove(0);

			let thread = std::thread::Builder::new()
				.name(format!("rudp-executor-{index}"))
				.spawn(move || run_executor(index, migration_senders, migration_inbox, command_inbox))
				.expect("failed to spawn RUDP executor thread");

			threads.push(thread);
			handles.push(ExecutorHandle { index, commands: command_senders[index].clone() });
		}

		Arc::new(Self { threads, handles, next: std::sync::atomic::AtomicUsize::new(0) })
	}

	pub fn executor_count(&self) -> usize {
		self.handles.len()
	}

	pub fn handle(&self, executor: usize) -> &ExecutorHandle {
		&self.handles[executor]
	}

	/// Pick an executor for a fresh descriptor (round-robin; spec §5 leaves
	/// placement policy to the implementation).
	pub fn next_executor(&self) -> &ExecutorHandle {
		let index = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.handles.len();
		&self.handles[index]
	}
}

impl Drop for ExecutorPool {
	fn drop(&mut self) {
		for thread in self.threads.drain(..) {
			let _ = thread.join();
		}
	}
}

fn run_executor(index: usize, migration_senders: Vec<mpsc::Sender<Migration>>, migration_inbox: mpsc::Receiver<Migration>, command_inbox: mpsc::Receiver<Command>) {
	let mut core = runtime::init();
	let _driver = actor!(core, Driver::init(index, migration_senders, migration_inbox, command_inbox), ret_nop!());

	let run = if index == 0 { runtime::exec } else { runtime::exec_loop };
	let _ = run(&mut core, || {});
}
