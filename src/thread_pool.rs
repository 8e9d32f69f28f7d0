// Copyright (C) 2023 QuerentAI LLC.
// This file is part of Querent.

// The Licensed Work is licensed under the Business Source License 1.1 (BSL 1.1).
// You may use this file in compliance with the BSL 1.1, subject to the following restrictions:
// 1. You may not use the Licensed Work for AI-related services, database services,
//    or any service or product offering that provides database, big data, or analytics
//    services to third parties unless explicitly authorized by QuerentAI LLC.
// 2. For more details, see the LICENSE file or visit https://mariadb.com/bsl11/.

// For inquiries about alternative licensing arrangements, please contact contact@querent.xyz.

// The Licensed Work is provided "AS IS", WITHOUT WARRANTY OF ANY KIND, express or implied,
// including but not limited to the warranties of merchantability, fitness for a particular purpose,
// and non-infringement. See the Business Source License for more details.

// This software includes code developed by QuerentAI LLC (https://querent.xyz).

use std::{
	panic::{catch_unwind, AssertUnwindSafe},
	sync::{Arc, Condvar, Mutex, MutexGuard, Weak},
	thread,
};

use tracing::{debug, error};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

enum WorkerCommand {
	Run(Job),
	Exit,
}

/// Worker pool with a bounded free list.
///
/// `submit` reuses a free worker when one is available and spawns one
/// otherwise; it never blocks. Workers returning from a job join the free list
/// up to the retained bound; beyond it they are transient and exit instead.
/// A burst of deliveries that park (callers blocked in a rendezvous occupy
/// their worker) therefore grows the pool temporarily without ever wedging the
/// dispatcher.
pub(crate) struct ThreadPool {
	core: Arc<PoolCore>,
}

struct PoolCore {
	state: Mutex<PoolState>,
	/// Signaled each time a worker finishes a job.
	idle: Condvar,
	retained: usize,
}

struct PoolState {
	free: Vec<flume::Sender<WorkerCommand>>,
	in_flight: usize,
	/// Monotonic counter used for worker thread names.
	spawned: u64,
	handles: Vec<thread::JoinHandle<()>>,
	draining: bool,
}

impl ThreadPool {
	pub(crate) fn new(retained: usize) -> ThreadPool {
		ThreadPool {
			core: Arc::new(PoolCore {
				state: Mutex::new(PoolState {
					free: Vec::new(),
					in_flight: 0,
					spawned: 0,
					handles: Vec::new(),
					draining: false,
				}),
				idle: Condvar::new(),
				retained,
			}),
		}
	}

	/// Acquires a worker (creating one lazily) and runs `job` on it.
	pub(crate) fn submit(&self, job: Job) {
		let mut state = self.core.lock_state();
		state.in_flight += 1;
		let job = match state.free.pop() {
			Some(worker) => match worker.send(WorkerCommand::Run(job)) {
				Ok(()) => return,
				// The worker died; take the job back and spawn a fresh one.
				Err(send_error) => match send_error.into_inner() {
					WorkerCommand::Run(job) => job,
					WorkerCommand::Exit => unreachable!("submit only sends jobs"),
				},
			},
			None => job,
		};
		state.spawned += 1;
		let worker_id = state.spawned;
		let (commands_tx, commands_rx) = flume::unbounded::<WorkerCommand>();
		commands_tx
			.send(WorkerCommand::Run(job))
			.expect("failed to hand a job to a fresh worker");
		let core = Arc::downgrade(&self.core);
		let handle = thread::Builder::new()
			.name(format!("troupe-worker-{worker_id}"))
			.spawn(move || worker_loop(core, commands_tx, commands_rx, worker_id))
			.expect("failed to spawn a worker thread");
		state.handles.push(handle);
	}

	/// Drains the pool. With `quiescing` set, waits for in-flight jobs to
	/// finish and joins every worker; otherwise idle workers are released and
	/// stragglers are left to exit on their own.
	pub(crate) fn reset(&self, quiescing: bool) {
		debug!(quiescing, "pool reset");
		let mut state = self.core.lock_state();
		state.draining = true;
		if quiescing {
			while state.in_flight > 0 {
				state = self.core.idle.wait(state).expect("pool mutex poisoned");
			}
		}
		for worker in state.free.drain(..) {
			let _ = worker.send(WorkerCommand::Exit);
		}
		let handles = std::mem::take(&mut state.handles);
		if !quiescing {
			state.in_flight = 0;
		}
		drop(state);
		if quiescing {
			for handle in handles {
				let _ = handle.join();
			}
		}
		self.core.lock_state().draining = false;
	}
}

impl Drop for ThreadPool {
	fn drop(&mut self) {
		self.reset(false);
	}
}

impl PoolCore {
	fn lock_state(&self) -> MutexGuard<'_, PoolState> {
		self.state.lock().expect("pool mutex poisoned")
	}
}

fn worker_loop(
	core: Weak<PoolCore>,
	commands_tx: flume::Sender<WorkerCommand>,
	commands_rx: flume::Receiver<WorkerCommand>,
	worker_id: u64,
) {
	while let Ok(command) = commands_rx.recv() {
		let job = match command {
			WorkerCommand::Run(job) => job,
			WorkerCommand::Exit => break,
		};
		if catch_unwind(AssertUnwindSafe(job)).is_err() {
			error!(worker_id, "worker job panicked");
		}
		let Some(core) = core.upgrade() else { break };
		let mut state = core.lock_state();
		state.in_flight = state
			.in_flight
			.checked_sub(1)
			.expect("in-flight accounting underflow");
		let stay = !state.draining && state.free.len() < core.retained;
		if stay {
			state.free.push(commands_tx.clone());
		}
		core.idle.notify_all();
		if !stay {
			break;
		}
	}
	debug!(worker_id, "worker exiting");
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[test]
	fn test_submitted_jobs_run() {
		let pool = ThreadPool::new(2);
		let counter = Arc::new(AtomicUsize::new(0));
		for _ in 0..3 {
			let counter = Arc::clone(&counter);
			pool.submit(Box::new(move || {
				counter.fetch_add(1, Ordering::SeqCst);
			}));
		}
		pool.reset(true);
		assert_eq!(counter.load(Ordering::SeqCst), 3);
	}

	#[test]
	fn test_free_list_is_bounded() {
		let pool = ThreadPool::new(1);
		for _ in 0..4 {
			pool.submit(Box::new(|| {}));
		}
		{
			let mut state = pool.core.lock_state();
			while state.in_flight > 0 {
				state = pool.core.idle.wait(state).unwrap();
			}
			assert!(state.free.len() <= 1);
		}
		pool.reset(true);
	}

	#[test]
	fn test_panicking_job_does_not_poison_the_pool() {
		let pool = ThreadPool::new(2);
		pool.submit(Box::new(|| panic!("boom")));
		let ran = Arc::new(AtomicUsize::new(0));
		let ran_clone = Arc::clone(&ran);
		pool.submit(Box::new(move || {
			ran_clone.fetch_add(1, Ordering::SeqCst);
		}));
		pool.reset(true);
		assert_eq!(ran.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn test_pool_is_reusable_after_reset() {
		let pool = ThreadPool::new(2);
		pool.submit(Box::new(|| {}));
		pool.reset(true);
		let ran = Arc::new(AtomicUsize::new(0));
		let ran_clone = Arc::clone(&ran);
		pool.submit(Box::new(move || {
			ran_clone.fetch_add(1, Ordering::SeqCst);
		}));
		pool.reset(true);
		assert_eq!(ran.load(Ordering::SeqCst), 1);
	}
}
