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
	fmt,
	sync::{Arc, Mutex},
	thread::ThreadId,
	time::Duration,
};

use tracing::debug;

use crate::{actor::ActorCore, behavior::Handler, envelope::Selector, name::Name, Behavior};

/// Capabilities a behavior has while one of its handlers (or its `bound` hook)
/// is executing: gate control, behavior replacement, timed re-entry and
/// spawning.
///
/// A fresh context is created for each delivery; a transition requested through
/// it is consumed by the actor right after the handler returns.
pub struct ActorContext<A: Behavior> {
	core: Arc<ActorCore<A>>,
	pending_transition: Mutex<Option<A>>,
	call_thread: Mutex<Option<ThreadId>>,
}

impl<A: Behavior> ActorContext<A> {
	pub(crate) fn new(core: Arc<ActorCore<A>>) -> Self {
		ActorContext {
			core,
			pending_transition: Mutex::new(None),
			call_thread: Mutex::new(None),
		}
	}

	/// Handle on the actor itself, e.g. to pass around as a reply-to address or
	/// to message self.
	pub fn name(&self) -> Name<A> {
		Name::from_core(Arc::clone(&self.core))
	}

	pub fn actor_id(&self) -> u64 {
		self.core.actor_id()
	}

	/// Thread id of the caller whose message is currently being handled, if
	/// that caller awaits a reply.
	pub fn call_thread(&self) -> Option<ThreadId> {
		*self.call_thread.lock().expect("context mutex poisoned")
	}

	/// Keeps messages of type `M` queued but ineligible until a matching
	/// [`ActorContext::accept`].
	pub fn refuse<M: 'static>(&self) {
		self.core.refuse(Selector::of::<M>());
	}

	/// Removes `M` from the refuse-set; queued messages of that type become
	/// runnable again, in their original order.
	pub fn accept<M: 'static>(&self) {
		self.core.accept(Selector::of::<M>());
	}

	/// Deferred behavior replacement (the actor-model *become*): `next` takes
	/// over after the current handler returns, receives its own `bound` call,
	/// and subsequent messages dispatch against it. The mailbox is unchanged.
	pub fn transition(&self, next: A) {
		debug!(actor = %self.core.label(), "transition requested");
		*self.pending_transition.lock().expect("context mutex poisoned") = Some(next);
	}

	/// Voluntary time-based suspension of the current handler.
	///
	/// The executing slot is kept, so the actor stays serial across the sleep;
	/// for a wait that should let other messages through, return from the
	/// handler and use [`ActorContext::schedule_self_msg`] instead. A zero
	/// duration returns immediately.
	pub fn actor_yield(&self, duration: Duration) {
		if duration.is_zero() {
			return;
		}
		debug!(actor = %self.core.label(), duration_ms = duration.as_millis() as u64, "yield");
		std::thread::sleep(duration);
	}

	/// Enqueues `message` to self once `after` has elapsed.
	///
	/// The message travels through the mailbox and the gate like any other, so
	/// the actor keeps processing admitted messages during the interval. This
	/// is the timed re-entry primitive: an auction that must close at a
	/// deadline schedules its own `Close`.
	pub fn schedule_self_msg<M>(&self, after: Duration, message: M)
	where
		A: Handler<M>,
		M: fmt::Debug + Send + 'static,
	{
		let name = self.name();
		self.core
			.scheduler
			.schedule_after(Box::new(move || name.tell(message)), after);
	}

	/// Spawns another actor in the same runtime.
	pub fn spawn<B: Behavior>(&self, behavior: B) -> Name<B> {
		Name::from_core(ActorCore::spawn(Arc::clone(&self.core.scheduler), behavior))
	}

	pub(crate) fn set_call_thread(&self, call_thread: Option<ThreadId>) {
		*self.call_thread.lock().expect("context mutex poisoned") = call_thread;
	}

	pub(crate) fn clear_call_thread(&self) {
		*self.call_thread.lock().expect("context mutex poisoned") = None;
	}

	pub(crate) fn take_transition(&self) -> Option<A> {
		self.pending_transition.lock().expect("context mutex poisoned").take()
	}
}
