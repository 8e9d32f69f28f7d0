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
	any::{Any, TypeId},
	fmt,
	panic::{catch_unwind, AssertUnwindSafe},
};

use anyhow::anyhow;

use crate::{behavior::Handler, continuation::Continuation, ActorContext, Behavior, Fault};

/// Message-type token used by the admission gate.
///
/// The refuse-set and the envelope both derive it from the message's `TypeId`,
/// so the two sides can never disagree; the type name rides along for logs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Selector {
	pub(crate) id: TypeId,
	pub(crate) name: &'static str,
}

impl Selector {
	pub(crate) fn of<M: 'static>() -> Self {
		Selector { id: TypeId::of::<M>(), name: std::any::type_name::<M>() }
	}
}

/// An `Envelope` captures the handler of a message and hides its type.
///
/// Messages can have different types but somehow need to be pushed to a
/// mailbox with a single type. Before appending, we capture the right handler
/// implementation in the form of a `Box<dyn EnvelopeT>`, together with the
/// selector and continuation tag the admission gate filters on.
pub struct Envelope<A: Behavior> {
	handler_envelope: Box<dyn EnvelopeT<A>>,
	selector: Selector,
	tag: Option<u64>,
}

impl<A: Behavior> Envelope<A> {
	pub(crate) fn selector(&self) -> Selector {
		self.selector
	}

	pub(crate) fn tag(&self) -> Option<u64> {
		self.tag
	}

	/// Returns the message as a boxed any.
	///
	/// This method is only useful in unit tests.
	pub fn message(&mut self) -> Box<dyn Any> {
		self.handler_envelope.message()
	}

	pub fn message_typed<M: 'static>(&mut self) -> Option<M> {
		if let Ok(boxed_msg) = self.handler_envelope.message().downcast::<M>() {
			Some(*boxed_msg)
		} else {
			None
		}
	}

	/// Executes the captured handler against `behavior` and resolves the
	/// continuation with its outcome, on every exit path: a panicking handler
	/// is caught and converted into a fault.
	pub(crate) fn handle_message(&mut self, behavior: &mut A, ctx: &ActorContext<A>) {
		self.handler_envelope.handle_message(behavior, ctx);
	}
}

impl<A: Behavior> fmt::Debug for Envelope<A> {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		let msg_str = self.handler_envelope.debug_msg();
		f.debug_tuple("Envelope").field(&msg_str).finish()
	}
}

trait EnvelopeT<A: Behavior>: Send {
	fn debug_msg(&self) -> String;

	/// Returns the message as a boxed any.
	///
	/// This method is only useful in unit tests.
	fn message(&mut self) -> Box<dyn Any>;

	/// Executes the captured handler and resolves the continuation.
	fn handle_message(&mut self, behavior: &mut A, ctx: &ActorContext<A>);
}

impl<A, M> EnvelopeT<A> for Option<(Continuation<<A as Handler<M>>::Reply>, M)>
where
	A: Handler<M>,
	M: fmt::Debug + Send + 'static,
{
	fn debug_msg(&self) -> String {
		#[allow(clippy::needless_option_take)]
		if let Some((_continuation, msg)) = self.as_ref().take() {
			format!("{msg:?}")
		} else {
			"<consumed>".to_string()
		}
	}

	fn message(&mut self) -> Box<dyn Any> {
		if let Some((_, message)) = self.take() {
			Box::new(message)
		} else {
			Box::new(())
		}
	}

	fn handle_message(&mut self, behavior: &mut A, ctx: &ActorContext<A>) {
		let (continuation, message) =
			self.take().expect("handle_message should never be called twice.");
		ctx.set_call_thread(continuation.call_thread());
		let outcome = catch_unwind(AssertUnwindSafe(|| behavior.handle(message, ctx)));
		ctx.clear_call_thread();
		let outcome = match outcome {
			Ok(outcome) => outcome,
			Err(panic) =>
				Err(Fault::Error(anyhow!("handler panicked: {}", panic_message(panic.as_ref())))),
		};
		if let Some(unclaimed_fault) = continuation.resolve(outcome) {
			// Fire-and-forget: nobody waits for the outcome, so the fault is
			// redirected to the target's own exception hook.
			behavior.exception(unclaimed_fault, ctx);
		}
	}
}

pub(crate) fn wrap_in_envelope<A, M>(
	message: M,
	continuation: Continuation<<A as Handler<M>>::Reply>,
) -> Envelope<A>
where
	A: Handler<M>,
	M: fmt::Debug + Send + 'static,
{
	let tag = continuation.tag();
	Envelope {
		handler_envelope: Box::new(Some((continuation, message))),
		selector: Selector::of::<M>(),
		tag,
	}
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
	if let Some(msg) = panic.downcast_ref::<&str>() {
		(*msg).to_string()
	} else if let Some(msg) = panic.downcast_ref::<String>() {
		msg.clone()
	} else {
		"<non-string panic payload>".to_string()
	}
}
