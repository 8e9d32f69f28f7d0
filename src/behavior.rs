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

use tracing::{error, warn};

use crate::{ActorContext, Deadlock, Fault};

/// A behavior is the method-bearing object an actor dispatches against.
///
/// The actor owns exactly one behavior value at a time and executes one message
/// handler at a time against it, so handlers take `&mut self` without further
/// synchronization. A handler may hand the actor a replacement behavior through
/// [`ActorContext::transition`]; the swap happens after the handler returns and
/// the replacement gets its own [`Behavior::bound`] call before the next
/// message is dispatched.
pub trait Behavior: Send + Sized + 'static {
	/// Actor name used in logs.
	fn name(&self) -> String {
		std::any::type_name::<Self>().rsplit("::").next().unwrap_or("Behavior").to_string()
	}

	/// Called each time this value becomes the actor's active behavior: once at
	/// spawn, and again after every transition.
	///
	/// This is the place to adjust the admission gate or schedule the first
	/// message to self.
	fn bound(&mut self, ctx: &ActorContext<Self>) {
		let _ = ctx;
	}

	/// Sink for faults raised by fire-and-forget messages.
	///
	/// A caller of [`crate::Name::tell`] never observes the outcome, so a
	/// failing handler is reported here instead.
	fn exception(&mut self, fault: Fault, ctx: &ActorContext<Self>) {
		error!(actor = %self.name(), fault = %fault, "unhandled fault");
		let _ = ctx;
	}

	/// One chance to break the cycle after the runtime detected a deadlock.
	///
	/// Every live actor receives this notification once per detection. The
	/// default does nothing but leave a trace.
	fn deadlock(&mut self, deadlock: &Deadlock, ctx: &ActorContext<Self>) {
		warn!(actor = %self.name(), suspended = deadlock.suspended_calls(), "deadlock notified");
		let _ = ctx;
	}
}

/// Ability to process a message of type `M`.
///
/// The return value resolves the caller's continuation: the reply of a blocking
/// call, the retained value of a deferred call, or nothing at all for a
/// fire-and-forget message (whose errors go to [`Behavior::exception`]).
pub trait Handler<M>: Behavior {
	type Reply: Send + 'static;

	fn handle(&mut self, message: M, ctx: &ActorContext<Self>) -> Result<Self::Reply, Fault>;
}
