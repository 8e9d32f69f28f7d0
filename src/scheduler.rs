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
	collections::{HashMap, VecDeque},
	sync::{Arc, Condvar, Mutex, MutexGuard, Weak},
	thread,
	time::Duration,
};

use tracing::{debug, error, info, warn};

use crate::{
	continuation::Suspendable, thread_pool::ThreadPool, timer::Timer, ActorContext, Behavior,
	Deadlock, Fault, Handler,
};

/// Recovery passes are bounded: a program whose actors keep re-blocking after
/// being notified is not going to converge, and the deadlock is surfaced
/// instead.
const MAX_RECOVERY_PASSES: u32 = 3;

/// A ready-queue entry, type-erased over the target actor.
pub(crate) trait RunnableTask: Send {
	fn deliver(self: Box<Self>);
	fn describe(&self) -> String;
}

/// Type-erased view of a live actor, for the deadlock notification sweep.
pub(crate) trait LiveActor: Send + Sync {
	fn live_actor_id(&self) -> u64;
	fn live_label(&self) -> String;
	fn notify_deadlock(&self, deadlock: &Deadlock);
}

/// Synthetic message enqueued to every live actor when a deadlock is detected,
/// giving user code a single chance to break the cycle.
///
/// It dispatches to [`Behavior::deadlock`] through a blanket handler; it is
/// queued like any regular message, so it runs once the actor is free.
#[derive(Debug)]
pub struct DeadlockNotice(pub(crate) Deadlock);

impl DeadlockNotice {
	pub fn deadlock(&self) -> &Deadlock {
		&self.0
	}
}

impl<A: Behavior> Handler<DeadlockNotice> for A {
	type Reply = ();

	fn handle(&mut self, notice: DeadlockNotice, ctx: &ActorContext<Self>) -> Result<(), Fault> {
		self.deadlock(&notice.0, ctx);
		Ok(())
	}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SchedulerPhase {
	/// No dispatcher thread exists.
	Idle,
	/// The dispatcher is handing tasks to the pool.
	Running,
	/// The dispatcher is parked until work or a notification arrives.
	Waiting,
}

struct SchedulerState {
	queue: VecDeque<Box<dyn RunnableTask>>,
	/// Threads currently making progress: workers delivering a message, plus
	/// one token for the driving user thread until it checks in at drain.
	running_threads: usize,
	phase: SchedulerPhase,
	suspended: HashMap<u64, Arc<dyn Suspendable>>,
	actors: Vec<Weak<dyn LiveActor>>,
	pending_timers: usize,
	quiescing: bool,
	shutdown: bool,
}

impl Default for SchedulerState {
	fn default() -> Self {
		SchedulerState {
			queue: VecDeque::new(),
			running_threads: 0,
			phase: SchedulerPhase::Idle,
			suspended: HashMap::new(),
			actors: Vec::new(),
			pending_timers: 0,
			quiescing: false,
			shutdown: false,
		}
	}
}

/// Global dispatcher: owns the ready queue, hands tasks to the worker pool,
/// tracks running and suspended threads and detects the moment no thread can
/// make progress.
///
/// Deadlock criterion: no running thread, an empty ready queue, no pending
/// deadline (a scheduled timer is future work, like a queued task) and at
/// least one parked continuation, outside of a drain.
pub(crate) struct Scheduler {
	weak_self: Weak<Scheduler>,
	state: Mutex<SchedulerState>,
	/// Wakes the dispatcher.
	work: Condvar,
	/// Wakes a thread waiting for the dispatcher to finish.
	drained: Condvar,
	pool: ThreadPool,
	timer: Timer,
	faults: Mutex<Vec<Fault>>,
}

impl Scheduler {
	pub(crate) fn new() -> Arc<Scheduler> {
		Arc::new_cyclic(|weak_self| Scheduler {
			weak_self: weak_self.clone(),
			state: Mutex::new(SchedulerState::default()),
			work: Condvar::new(),
			drained: Condvar::new(),
			pool: ThreadPool::new(*crate::WORKER_THREADS),
			timer: Timer::new(),
			faults: Mutex::new(Vec::new()),
		})
	}

	fn strong(&self) -> Arc<Scheduler> {
		self.weak_self.upgrade().expect("scheduler deallocated while in use")
	}

	fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
		self.state.lock().expect("scheduler mutex poisoned")
	}

	pub(crate) fn register_actor(&self, actor: Arc<dyn LiveActor>) {
		let mut state = self.lock_state();
		state.actors.retain(|live| live.strong_count() > 0);
		state.actors.push(Arc::downgrade(&actor));
	}

	/// Appends a task to the ready queue, lazily spawning the dispatcher the
	/// first time the queue becomes non-empty.
	pub(crate) fn schedule(&self, task: Box<dyn RunnableTask>) {
		let mut state = self.lock_state();
		if state.shutdown {
			debug!(task = %task.describe(), "task dropped after shutdown");
			return;
		}
		state.queue.push_back(task);
		match state.phase {
			SchedulerPhase::Waiting =>
				if state.queue.len() == 1 {
					self.work.notify_one();
				},
			SchedulerPhase::Idle => self.start_dispatcher(&mut state),
			SchedulerPhase::Running => {},
		}
	}

	/// Checks the calling thread out of the running-thread accounting and
	/// records its parked continuation.
	pub(crate) fn suspend_notification(&self, continuation: Arc<dyn Suspendable>) {
		let mut state = self.lock_state();
		if state.phase == SchedulerPhase::Idle && !state.shutdown {
			self.start_dispatcher(&mut state);
		}
		state.running_threads = state
			.running_threads
			.checked_sub(1)
			.expect("running-thread accounting underflow at suspend");
		if state.phase == SchedulerPhase::Waiting {
			self.work.notify_one();
		}
		debug!(tag = continuation.continuation_id(), "suspend");
		state.suspended.insert(continuation.continuation_id(), continuation);
	}

	/// Checks a woken thread back in. A wakeup for a continuation the
	/// scheduler no longer tracks (resolved by a recovery pass, or arriving
	/// after a reset took the dispatcher down) is logged and ignored.
	pub(crate) fn wakeup_notification(&self, continuation_id: u64) {
		let mut state = self.lock_state();
		if state.suspended.remove(&continuation_id).is_some() {
			state.running_threads += 1;
			debug!(tag = continuation_id, "wakeup");
		} else {
			debug!(tag = continuation_id, "wakeup for untracked continuation");
		}
	}

	/// Worker retirement, called on every delivery exit path.
	fn retire_notification(&self) {
		let mut state = self.lock_state();
		if state.running_threads > 0 {
			state.running_threads -= 1;
		} else {
			debug!("retirement after reset");
		}
		if state.phase == SchedulerPhase::Waiting {
			self.work.notify_one();
		}
	}

	/// Runs `callback` once `after` has elapsed. The pending deadline counts
	/// as future work for the deadlock criterion and the drain.
	pub(crate) fn schedule_after(&self, callback: Box<dyn FnOnce() + Send>, after: Duration) {
		{
			let mut state = self.lock_state();
			if state.shutdown {
				debug!("timer dropped after shutdown");
				return;
			}
			state.pending_timers += 1;
		}
		let scheduler = self.strong();
		self.timer.schedule_event(after, Box::new(move || {
			callback();
			scheduler.timer_retired();
		}));
	}

	fn timer_retired(&self) {
		let mut state = self.lock_state();
		if state.pending_timers > 0 {
			state.pending_timers -= 1;
		} else {
			// The deadline fired while a reset was writing the timers off.
			debug!("timer retirement after reset");
		}
		if state.pending_timers == 0 {
			match state.phase {
				SchedulerPhase::Waiting => self.work.notify_one(),
				SchedulerPhase::Idle => self.drained.notify_all(),
				SchedulerPhase::Running => {},
			}
		}
	}

	/// Spawns the dispatcher thread. Outside of a drain, the driving user
	/// thread is counted as one running thread until it checks in.
	fn start_dispatcher(&self, state: &mut SchedulerState) {
		state.phase = SchedulerPhase::Running;
		if !state.quiescing {
			state.running_threads += 1;
		}
		let scheduler = self.strong();
		thread::Builder::new()
			.name("troupe-dispatcher".to_string())
			.spawn(move || scheduler.dispatch_loop())
			.expect("failed to spawn the dispatcher thread");
	}

	fn dispatch_loop(self: Arc<Self>) {
		debug!("dispatcher starting");
		let outcome = self.dispatch_inner();
		let resolve_leftovers = match outcome {
			Ok(()) => false,
			Err(fault) => {
				error!(fault = %fault, "dispatcher stopping on fault");
				self.push_fault(fault);
				true
			},
		};
		let mut state = self.lock_state();
		if resolve_leftovers {
			// Going down on a repeated deadlock: wake every parked caller so
			// no thread stays parked behind a dead dispatcher.
			let leftovers: Vec<Arc<dyn Suspendable>> = state.suspended.values().cloned().collect();
			let deadlock = Deadlock::new(leftovers.len());
			drop(state);
			for continuation in leftovers {
				continuation.resolve_deadlock(deadlock.clone());
			}
			state = self.lock_state();
		}
		state.phase = SchedulerPhase::Idle;
		// A task scheduled while we were going down restarts a dispatcher
		// rather than stranding the queue.
		if !state.queue.is_empty() && !state.shutdown {
			self.start_dispatcher(&mut state);
		}
		self.drained.notify_all();
		debug!("dispatcher exiting");
	}

	fn dispatch_inner(&self) -> Result<(), Fault> {
		let mut recovery_passes = 0u32;
		loop {
			{
				let mut state = self.lock_state();
				while state.queue.is_empty()
					&& (state.running_threads != 0 || state.pending_timers != 0)
					&& !state.shutdown
				{
					state.phase = SchedulerPhase::Waiting;
					state = self.work.wait(state).expect("scheduler mutex poisoned");
					state.phase = SchedulerPhase::Running;
				}
				if state.shutdown {
					return Ok(());
				}
			}
			if let Some(deadlock) = self.check_deadlock() {
				recovery_passes += 1;
				if recovery_passes > MAX_RECOVERY_PASSES {
					return Err(Fault::Deadlock(deadlock));
				}
				self.deadlock_recovery_pass(&deadlock);
				continue;
			}
			let task = {
				let mut state = self.lock_state();
				if state.queue.is_empty() {
					if state.running_threads == 0 && state.pending_timers == 0 {
						return Ok(());
					}
					continue;
				}
				let task = state.queue.pop_front().expect("ready queue emptied under lock");
				state.running_threads += 1;
				task
			};
			debug!(task = %task.describe(), "dispatch");
			let scheduler = self.strong();
			self.pool.submit(Box::new(move || {
				let _retire = RetireGuard(scheduler);
				task.deliver();
			}));
		}
	}

	fn check_deadlock(&self) -> Option<Deadlock> {
		let state = self.lock_state();
		if state.running_threads == 0
			&& state.queue.is_empty()
			&& state.pending_timers == 0
			&& !state.suspended.is_empty()
			&& !state.quiescing
		{
			Some(Deadlock::new(state.suspended.len()))
		} else {
			None
		}
	}

	/// One recovery pass: every live actor is sent a [`DeadlockNotice`], and
	/// every parked continuation is resolved with the deadlock, waking its
	/// caller with an error it can recognize and handle.
	fn deadlock_recovery_pass(&self, deadlock: &Deadlock) {
		let (actors, continuations) = {
			let mut state = self.lock_state();
			state.actors.retain(|live| live.strong_count() > 0);
			let actors: Vec<Arc<dyn LiveActor>> =
				state.actors.iter().filter_map(Weak::upgrade).collect();
			let continuations: Vec<Arc<dyn Suspendable>> =
				state.suspended.values().cloned().collect();
			(actors, continuations)
		};
		warn!(
			suspended = deadlock.suspended_calls(),
			actors = actors.len(),
			"deadlock detected; notifying live actors"
		);
		for actor in &actors {
			debug!(actor = %actor.live_label(), actor_id = actor.live_actor_id(), "deadlock notice");
			actor.notify_deadlock(deadlock);
		}
		for continuation in &continuations {
			continuation.resolve_deadlock(deadlock.clone());
		}
	}

	/// Checks the driving thread in and waits until nothing is left running:
	/// the ready queue is empty, every worker retired and every deadline
	/// fired. Parked continuations found at that point are a deadlock; they
	/// get the recovery treatment and the deadlock is surfaced to the caller.
	pub(crate) fn drain(&self, quiescing: bool) -> Vec<Fault> {
		info!(quiescing, "drain");
		let mut state = self.lock_state();
		state.quiescing = quiescing;
		if state.phase != SchedulerPhase::Idle {
			state.running_threads = state
				.running_threads
				.checked_sub(1)
				.expect("running-thread accounting underflow at drain");
			if state.phase == SchedulerPhase::Waiting {
				self.work.notify_one();
			}
		}
		let mut recovery_passes = 0u32;
		loop {
			while state.phase != SchedulerPhase::Idle || state.pending_timers != 0 {
				state = self.drained.wait(state).expect("scheduler mutex poisoned");
			}
			if state.suspended.is_empty() || recovery_passes >= MAX_RECOVERY_PASSES {
				break;
			}
			recovery_passes += 1;
			let deadlock = Deadlock::new(state.suspended.len());
			let actors: Vec<Arc<dyn LiveActor>> =
				state.actors.iter().filter_map(Weak::upgrade).collect();
			let continuations: Vec<Arc<dyn Suspendable>> =
				state.suspended.values().cloned().collect();
			drop(state);
			warn!(suspended = deadlock.suspended_calls(), "deadlock at drain");
			for actor in &actors {
				actor.notify_deadlock(&deadlock);
			}
			for continuation in &continuations {
				continuation.resolve_deadlock(deadlock.clone());
			}
			self.push_fault(Fault::Deadlock(deadlock));
			state = self.lock_state();
		}
		if !state.suspended.is_empty() {
			// Recovery did not converge. Wake the stragglers anyway so their
			// workers can unwind and the pool can drain.
			warn!(suspended = state.suspended.len(), "continuations still parked after recovery");
			let leftovers: Vec<Arc<dyn Suspendable>> =
				state.suspended.drain().map(|(_, continuation)| continuation).collect();
			let deadlock = Deadlock::new(leftovers.len());
			drop(state);
			for continuation in leftovers {
				continuation.resolve_deadlock(deadlock.clone());
			}
			state = self.lock_state();
		}
		state.quiescing = false;
		drop(state);
		self.pool.reset(quiescing);
		self.take_faults()
	}

	/// Forced teardown: stops the dispatcher, wakes anything parked, clears
	/// the live set and the ready queue, and drains the pool and the timer.
	/// The scheduler is reusable afterwards.
	pub(crate) fn reset(&self) -> Vec<Fault> {
		info!("reset");
		let mut state = self.lock_state();
		state.shutdown = true;
		self.work.notify_one();
		let continuations: Vec<Arc<dyn Suspendable>> =
			state.suspended.drain().map(|(_, continuation)| continuation).collect();
		state.queue.clear();
		state.actors.clear();
		state.pending_timers = 0;
		drop(state);
		let deadlock = Deadlock::new(continuations.len());
		for continuation in continuations {
			continuation.resolve_deadlock(deadlock.clone());
		}
		let mut state = self.lock_state();
		while state.phase != SchedulerPhase::Idle {
			state = self.drained.wait(state).expect("scheduler mutex poisoned");
		}
		state.shutdown = false;
		state.running_threads = 0;
		drop(state);
		self.timer.reset();
		self.pool.reset(false);
		self.take_faults()
	}

	pub(crate) fn push_fault(&self, fault: Fault) {
		self.faults.lock().expect("fault aggregator mutex poisoned").push(fault);
	}

	fn take_faults(&self) -> Vec<Fault> {
		std::mem::take(&mut *self.faults.lock().expect("fault aggregator mutex poisoned"))
	}
}

struct RetireGuard(Arc<Scheduler>);

impl Drop for RetireGuard {
	fn drop(&mut self) {
		self.0.retire_notification();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct NoopTask;

	impl RunnableTask for NoopTask {
		fn deliver(self: Box<Self>) {}

		fn describe(&self) -> String {
			"noop".to_string()
		}
	}

	struct NeverResolved;

	impl Suspendable for NeverResolved {
		fn continuation_id(&self) -> u64 {
			42
		}

		fn resolve_deadlock(&self, _deadlock: Deadlock) {}
	}

	#[test]
	fn test_deadlock_criterion() {
		let scheduler = Scheduler::new();
		// Nothing suspended: no deadlock.
		assert!(scheduler.check_deadlock().is_none());
		scheduler
			.lock_state()
			.suspended
			.insert(42, Arc::new(NeverResolved) as Arc<dyn Suspendable>);
		assert!(scheduler.check_deadlock().is_some());
		// A running thread means progress is possible.
		scheduler.lock_state().running_threads = 1;
		assert!(scheduler.check_deadlock().is_none());
		scheduler.lock_state().running_threads = 0;
		// So does a queued task.
		scheduler.lock_state().queue.push_back(Box::new(NoopTask));
		assert!(scheduler.check_deadlock().is_none());
		scheduler.lock_state().queue.clear();
		// And a pending deadline.
		scheduler.lock_state().pending_timers = 1;
		assert!(scheduler.check_deadlock().is_none());
		scheduler.lock_state().pending_timers = 0;
		// A drain suppresses detection.
		scheduler.lock_state().quiescing = true;
		assert!(scheduler.check_deadlock().is_none());
	}

	#[test]
	fn test_wakeup_for_untracked_continuation_is_ignored() {
		let scheduler = Scheduler::new();
		scheduler.wakeup_notification(7);
		assert_eq!(scheduler.lock_state().running_threads, 0);
	}
}
