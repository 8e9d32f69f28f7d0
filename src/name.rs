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
	hash::{Hash, Hasher},
	sync::Arc,
};

use tracing::debug;

use crate::{
	actor::ActorCore,
	behavior::Handler,
	continuation::{Continuation, Rendezvous, Reply},
	envelope::wrap_in_envelope,
	Behavior, Fault,
};

/// Opaque handle to an actor.
///
/// It is lightweight to clone; equality and hashing go by actor identity. Every
/// invocation through a `Name` becomes a task on the target's mailbox; the
/// actor itself stays alive as long as a `Name` (or a queued task) references
/// it and dies once unreferenced with an empty mailbox.
pub struct Name<A: Behavior> {
	core: Arc<ActorCore<A>>,
}

impl<A: Behavior> Clone for Name<A> {
	fn clone(&self) -> Self {
		Name { core: Arc::clone(&self.core) }
	}
}

impl<A: Behavior> fmt::Debug for Name<A> {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_tuple("Name").field(&self.core.label()).field(&self.core.actor_id()).finish()
	}
}

impl<A: Behavior> PartialEq for Name<A> {
	fn eq(&self, other: &Self) -> bool {
		self.core.actor_id() == other.core.actor_id()
	}
}

impl<A: Behavior> Eq for Name<A> {}

impl<A: Behavior> Hash for Name<A> {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.core.actor_id().hash(state);
	}
}

impl<A: Behavior> Name<A> {
	pub(crate) fn from_core(core: Arc<ActorCore<A>>) -> Self {
		Name { core }
	}

	pub fn actor_id(&self) -> u64 {
		self.core.actor_id()
	}

	pub fn label(&self) -> &str {
		self.core.label()
	}

	/// Synchronous call: enqueues `message` and parks the calling thread until
	/// the reply arrives.
	///
	/// While parked, the calling actor's gate admits nothing but this call's
	/// reply tag, so no other message can sneak into the suspended handler's
	/// actor. The error is either the remote handler's fault or the deadlock
	/// the runtime injected to break a cycle of blocked calls.
	pub fn ask<M>(&self, message: M) -> Result<<A as Handler<M>>::Reply, Fault>
	where
		A: Handler<M>,
		M: fmt::Debug + Send + 'static,
	{
		let rendezvous = Rendezvous::new(Arc::clone(&self.core.scheduler));
		debug!(to = %self.core.label(), msg = ?message, tag = rendezvous.id(), "ask");
		let envelope = wrap_in_envelope(message, Continuation::Rpc(Arc::clone(&rendezvous)));
		Rendezvous::rendezvous(&rendezvous, move || self.core.enqueue(envelope))
	}

	/// Fire-and-forget: enqueues `message` and returns immediately.
	///
	/// The caller is never notified of the outcome; a failing handler reports
	/// to the target behavior's `exception` hook instead.
	pub fn tell<M>(&self, message: M)
	where
		A: Handler<M>,
		M: fmt::Debug + Send + 'static,
	{
		debug!(to = %self.core.label(), msg = ?message, "tell");
		let envelope = wrap_in_envelope(message, Continuation::Nil);
		self.core.enqueue(envelope);
	}

	/// Deferred call: enqueues `message` and returns a [`Reply`] that can be
	/// awaited later, on any thread.
	pub fn ask_deferred<M>(&self, message: M) -> Reply<<A as Handler<M>>::Reply>
	where
		A: Handler<M>,
		M: fmt::Debug + Send + 'static,
	{
		let rendezvous = Rendezvous::new(Arc::clone(&self.core.scheduler));
		debug!(to = %self.core.label(), msg = ?message, tag = rendezvous.id(), "ask deferred");
		let envelope = wrap_in_envelope(message, Continuation::Deferred(Arc::clone(&rendezvous)));
		self.core.enqueue(envelope);
		Reply::new(rendezvous)
	}

	/// Number of messages queued and not yet delivered.
	///
	/// This method is only useful in unit tests.
	#[cfg(any(test, feature = "testsuite"))]
	pub fn pending_for_test(&self) -> usize {
		self.core.pending()
	}

	/// Destroys the mailbox content and returns the pending messages.
	///
	/// This method is only useful in unit tests.
	#[cfg(any(test, feature = "testsuite"))]
	pub fn drain_for_test(&self) -> Vec<Box<dyn std::any::Any>> {
		self.core
			.drain_mailbox()
			.into_iter()
			.map(|mut envelope| envelope.message())
			.collect()
	}
}
