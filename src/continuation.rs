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
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Condvar, Mutex,
	},
	thread::{self, ThreadId},
};

use tracing::debug;

use crate::{actor::current_actor, scheduler::Scheduler, Deadlock, Fault};

static CONTINUATION_IDS: AtomicU64 = AtomicU64::new(1);

/// How one request's reply reaches its sender.
pub(crate) enum Continuation<R> {
	/// Fire-and-forget: nobody waits. Handler faults are handed back to the
	/// delivery step, which redirects them to the target behavior's
	/// `exception` hook.
	Nil,
	/// Synchronous rendezvous: the caller is parked inside
	/// [`Rendezvous::rendezvous`] until the reply is published.
	Rpc(Arc<Rendezvous<R>>),
	/// Deferred reply: retained for a later [`crate::Reply::wait`], possibly on
	/// another thread.
	Deferred(Arc<Rendezvous<R>>),
}

impl<R: Send + 'static> Continuation<R> {
	/// Tag used by the admission gate's `only` override.
	pub(crate) fn tag(&self) -> Option<u64> {
		match self {
			Continuation::Nil => None,
			Continuation::Rpc(rendezvous) | Continuation::Deferred(rendezvous) =>
				Some(rendezvous.id),
		}
	}

	pub(crate) fn call_thread(&self) -> Option<ThreadId> {
		match self {
			Continuation::Nil => None,
			Continuation::Rpc(rendezvous) | Continuation::Deferred(rendezvous) =>
				Some(rendezvous.call_thread),
		}
	}

	/// Publishes the handler outcome.
	///
	/// Returns the fault back to the delivery step when nobody is listening for
	/// it, so it can be redirected to the target's `exception` hook.
	pub(crate) fn resolve(self, outcome: Result<R, Fault>) -> Option<Fault> {
		match self {
			Continuation::Nil => match outcome {
				Ok(_) => None,
				Err(fault) => Some(fault),
			},
			Continuation::Rpc(rendezvous) | Continuation::Deferred(rendezvous) => {
				rendezvous.publish(outcome);
				None
			},
		}
	}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
	/// Created; neither side has arrived.
	Start,
	/// The awaiting side is parked on the condvar.
	Waiting,
	/// The reply arrived before anyone parked; the next `wait` returns
	/// without blocking.
	Signaled,
	/// The reply is published and the waiter (if any) has been woken.
	Done,
}

struct RendezvousState<R> {
	phase: Phase,
	value: Option<Result<R, Fault>>,
}

/// Synchronization object linking a blocked caller to a future reply.
///
/// The value is published exactly once, under the rendezvous mutex, before the
/// condvar is signaled; the waiter reads it exactly once.
pub(crate) struct Rendezvous<R> {
	id: u64,
	call_thread: ThreadId,
	scheduler: Arc<Scheduler>,
	state: Mutex<RendezvousState<R>>,
	cond: Condvar,
}

impl<R: Send + 'static> Rendezvous<R> {
	pub(crate) fn new(scheduler: Arc<Scheduler>) -> Arc<Self> {
		Arc::new(Rendezvous {
			id: CONTINUATION_IDS.fetch_add(1, Ordering::Relaxed),
			call_thread: thread::current().id(),
			scheduler,
			state: Mutex::new(RendezvousState { phase: Phase::Start, value: None }),
			cond: Condvar::new(),
		})
	}

	pub(crate) fn id(&self) -> u64 {
		self.id
	}

	/// Blocking request/reply protocol, caller side.
	///
	/// Under the rendezvous mutex: restrict the calling actor's gate to this
	/// continuation's tag, run `enqueue` to hand the task to the target, check
	/// this thread out of the running-thread accounting and park. On wake the
	/// override is removed, which never drops queued messages; they become
	/// runnable again once the current handler returns.
	pub(crate) fn rendezvous(this: &Arc<Self>, enqueue: impl FnOnce()) -> Result<R, Fault> {
		let calling_actor = current_actor();
		let mut state = this.state.lock().expect("rendezvous mutex poisoned");
		match state.phase {
			Phase::Start => {
				state.phase = Phase::Waiting;
				if let Some(actor) = &calling_actor {
					debug!(caller_actor = actor.id, tag = this.id, "rendezvous from actor");
					actor.gate.gate_only(this.id);
				}
				enqueue();
				this.scheduler.suspend_notification(Arc::clone(this) as Arc<dyn Suspendable>);
				while state.phase != Phase::Done {
					state = this.cond.wait(state).expect("rendezvous mutex poisoned");
				}
			},
			phase => {
				panic!("rendezvous entered twice (phase {phase:?}); this should never happen")
			},
		}
		if let Some(actor) = &calling_actor {
			actor.gate.gate_default_by_tag(this.id);
		}
		let outcome = state.value.take().expect("woke from rendezvous with no published reply");
		drop(state);
		chain_deadlock(outcome)
	}

	/// Deferred-reply protocol: like [`Rendezvous::rendezvous`] but the task was
	/// already enqueued, so the reply may have arrived first, and no gate
	/// override is installed (the awaiting thread is unknown at send time).
	pub(crate) fn wait(this: &Arc<Self>) -> Result<R, Fault> {
		let mut state = this.state.lock().expect("rendezvous mutex poisoned");
		match state.phase {
			Phase::Start => {
				state.phase = Phase::Waiting;
				this.scheduler.suspend_notification(Arc::clone(this) as Arc<dyn Suspendable>);
				while state.phase != Phase::Done {
					state = this.cond.wait(state).expect("rendezvous mutex poisoned");
				}
			},
			Phase::Signaled => {
				state.phase = Phase::Done;
			},
			phase => panic!("reply awaited twice (phase {phase:?}); this should never happen"),
		}
		let outcome = state.value.take().expect("woke from rendezvous with no published reply");
		drop(state);
		chain_deadlock(outcome)
	}

	pub(crate) fn is_ready(&self) -> bool {
		let state = self.state.lock().expect("rendezvous mutex poisoned");
		matches!(state.phase, Phase::Signaled | Phase::Done)
	}

	/// Publishes the reply, replying side.
	///
	/// If the waiter already parked, transition to `Done`, check the waiting
	/// thread back into the scheduler accounting and signal the condvar.
	/// If nobody parked yet, jump to `Signaled` so the waiter never blocks.
	/// A second publication is dropped: the first one already won the race
	/// (this happens when a task is delivered after its continuation was
	/// resolved by a deadlock recovery pass).
	pub(crate) fn publish(&self, outcome: Result<R, Fault>) {
		let mut state = self.state.lock().expect("rendezvous mutex poisoned");
		match state.phase {
			Phase::Start => {
				state.value = Some(outcome);
				state.phase = Phase::Signaled;
			},
			Phase::Waiting => {
				state.value = Some(outcome);
				state.phase = Phase::Done;
				self.scheduler.wakeup_notification(self.id);
				self.cond.notify_all();
			},
			Phase::Signaled | Phase::Done => {
				debug!(continuation = self.id, "late reply dropped");
			},
		}
	}
}

/// A deadlock observed through a reply gains one chain hop per propagation,
/// preserving the path it travelled.
fn chain_deadlock<R>(outcome: Result<R, Fault>) -> Result<R, Fault> {
	match outcome {
		Err(Fault::Deadlock(deadlock)) => Err(Fault::Deadlock(deadlock.chained())),
		other => other,
	}
}

/// Type-erased view of a parked rendezvous, held in the scheduler's suspended
/// map so a deadlock recovery pass can resolve it.
pub(crate) trait Suspendable: Send + Sync {
	fn continuation_id(&self) -> u64;

	/// Publishes a deadlock fault, waking the parked caller.
	fn resolve_deadlock(&self, deadlock: Deadlock);
}

impl<R: Send + 'static> Suspendable for Rendezvous<R> {
	fn continuation_id(&self) -> u64 {
		self.id
	}

	fn resolve_deadlock(&self, deadlock: Deadlock) {
		self.publish(Err(Fault::Deadlock(deadlock)));
	}
}

/// Handle on a deferred reply, returned by [`crate::Name::ask_deferred`].
///
/// The reply is retained until consumed; `wait` may run on any thread and
/// returns immediately if the reply already arrived.
pub struct Reply<R> {
	rendezvous: Arc<Rendezvous<R>>,
}

impl<R: Send + 'static> Reply<R> {
	pub(crate) fn new(rendezvous: Arc<Rendezvous<R>>) -> Self {
		Reply { rendezvous }
	}

	/// Blocks until the reply is published, then returns it.
	pub fn wait(self) -> Result<R, Fault> {
		Rendezvous::wait(&self.rendezvous)
	}

	pub fn is_ready(&self) -> bool {
		self.rendezvous.is_ready()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_reply_published_before_wait_does_not_block() {
		let scheduler = Scheduler::new();
		let rendezvous = Rendezvous::<u32>::new(scheduler);
		rendezvous.publish(Ok(42));
		assert!(rendezvous.is_ready());
		let reply = Reply::new(rendezvous);
		assert_eq!(reply.wait().unwrap(), 42);
	}

	#[test]
	fn test_late_reply_is_dropped() {
		let scheduler = Scheduler::new();
		let rendezvous = Rendezvous::<u32>::new(scheduler);
		rendezvous.publish(Ok(1));
		rendezvous.publish(Ok(2));
		let reply = Reply::new(Arc::clone(&rendezvous));
		assert_eq!(reply.wait().unwrap(), 1);
	}

	#[test]
	fn test_deadlock_gains_a_chain_hop_per_propagation() {
		let scheduler = Scheduler::new();
		let rendezvous = Rendezvous::<u32>::new(scheduler);
		rendezvous.resolve_deadlock(Deadlock::new(2));
		match Reply::new(rendezvous).wait() {
			Err(Fault::Deadlock(deadlock)) => assert_eq!(deadlock.depth(), 2),
			other => panic!("expected a deadlock fault, got {other:?}"),
		}
	}
}
