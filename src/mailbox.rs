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

use std::collections::VecDeque;

use crate::{envelope::Envelope, gate::Gate, Behavior};

/// Per-actor FIFO of pending envelopes.
///
/// Extraction is gate-filtered: the first envelope the gate admits is taken,
/// envelopes in front of it stay queued in place. That keeps delivery in
/// enqueue order among eligible messages while a refused message waits for the
/// gate to widen.
pub(crate) struct Mailbox<A: Behavior> {
	queue: VecDeque<Envelope<A>>,
}

impl<A: Behavior> Default for Mailbox<A> {
	fn default() -> Self {
		Mailbox { queue: VecDeque::new() }
	}
}

impl<A: Behavior> Mailbox<A> {
	pub(crate) fn push(&mut self, envelope: Envelope<A>) {
		self.queue.push_back(envelope);
	}

	/// Removes and returns the first envelope the gate admits, if any.
	pub(crate) fn take_admitted(&mut self, gate: &Gate) -> Option<Envelope<A>> {
		let position = self
			.queue
			.iter()
			.position(|envelope| gate.admits(envelope.selector(), envelope.tag()))?;
		self.queue.remove(position)
	}

	pub(crate) fn len(&self) -> usize {
		self.queue.len()
	}

	pub(crate) fn is_empty(&self) -> bool {
		self.queue.is_empty()
	}

	/// Destroys the queue content and returns the pending envelopes.
	///
	/// This method is only useful in unit tests.
	#[cfg(any(test, feature = "testsuite"))]
	pub(crate) fn drain(&mut self) -> Vec<Envelope<A>> {
		self.queue.drain(..).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		continuation::Continuation,
		envelope::{wrap_in_envelope, Selector},
		tests::{Add, Ping, PingActor},
	};

	fn ping_envelope() -> Envelope<PingActor> {
		wrap_in_envelope(Ping, Continuation::Nil)
	}

	fn add_envelope(value: u32) -> Envelope<PingActor> {
		wrap_in_envelope(Add(value), Continuation::Nil)
	}

	#[test]
	fn test_take_admitted_is_fifo() {
		let mut mailbox = Mailbox::<PingActor>::default();
		let gate = Gate::default();
		mailbox.push(add_envelope(1));
		mailbox.push(add_envelope(2));
		let first = mailbox.take_admitted(&gate).unwrap().message_typed::<Add>().unwrap();
		let second = mailbox.take_admitted(&gate).unwrap().message_typed::<Add>().unwrap();
		assert_eq!((first.0, second.0), (1, 2));
		assert!(mailbox.take_admitted(&gate).is_none());
	}

	#[test]
	fn test_refused_envelope_is_skipped_not_dropped() {
		let mut mailbox = Mailbox::<PingActor>::default();
		let mut gate = Gate::default();
		gate.refuse(Selector::of::<Ping>());
		mailbox.push(ping_envelope());
		mailbox.push(add_envelope(7));
		// The refused ping at the head is skipped in place.
		let mut admitted = mailbox.take_admitted(&gate).unwrap();
		assert_eq!(admitted.message_typed::<Add>().unwrap().0, 7);
		assert_eq!(mailbox.len(), 1);
		// Widening the gate makes it runnable again.
		gate.accept(Selector::of::<Ping>());
		assert!(mailbox.take_admitted(&gate).unwrap().message_typed::<Ping>().is_some());
		assert!(mailbox.is_empty());
	}

	#[test]
	fn test_only_override_preserves_queued_envelopes() {
		let mut mailbox = Mailbox::<PingActor>::default();
		let mut gate = Gate::default();
		mailbox.push(add_envelope(1));
		mailbox.push(add_envelope(2));
		gate.only(99);
		assert!(mailbox.take_admitted(&gate).is_none());
		assert_eq!(mailbox.len(), 2);
		gate.default_by_tag(99);
		assert_eq!(mailbox.take_admitted(&gate).unwrap().message_typed::<Add>().unwrap().0, 1);
	}
}
