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

#![deny(clippy::disallowed_methods)]

//! troupe is a synchronous actor runtime.
//!
//! It solves the following problem:
//! - express concurrent computation as independently addressable, single-threaded behaviors,
//! - keep the illusion of ordinary method calls: a blocking call on a [`Name`] parks the
//!   caller until the reply arrives,
//! - let a behavior refuse messages it is not ready for, and swap itself for another
//!   behavior between messages,
//! - detect the moment no thread can make progress and give every live actor one chance
//!   to break the cycle.
//!
//! Delivery is performed by a bounded worker pool fed by a single dispatcher thread.
//! One user thread (conventionally the main thread) drives the system and participates in
//! the running-thread accounting; it checks in by calling [`Troupe::quiesce`].

use std::num::NonZeroUsize;

use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::warn;

mod actor;
mod actor_context;
mod behavior;
mod continuation;
mod envelope;
mod gate;
mod mailbox;
mod name;
mod runtime;
mod scheduler;
mod thread_pool;
mod timer;

#[cfg(test)]
pub(crate) mod tests;

pub use behavior::{Behavior, Handler};
pub use continuation::Reply;
pub use envelope::Envelope;
pub use name::Name;
pub use runtime::Troupe;
pub use scheduler::DeadlockNotice;

pub use self::actor_context::ActorContext;

/// Number of worker threads the delivery pool keeps around for reuse.
///
/// Workers spawned beyond this bound are transient: they exit after their job
/// instead of joining the free list, so a burst of parked callers can never
/// wedge the dispatcher.
pub static WORKER_THREADS: Lazy<usize> = Lazy::new(worker_threads_from_env_or_default);

/// Returns the retained worker-pool size:
/// - Derived from `TROUPE_WORKER_THREADS` if set and valid.
/// - Defaults to the number of CPUs, with a floor of 4.
fn worker_threads_from_env_or_default() -> usize {
	match std::env::var("TROUPE_WORKER_THREADS") {
		Ok(worker_threads_str) => {
			if let Ok(worker_threads) = worker_threads_str.parse::<NonZeroUsize>() {
				return worker_threads.get();
			} else {
				warn!(
					"failed to parse `TROUPE_WORKER_THREADS={worker_threads_str}` as an integer \
					 > 0, using the default worker count"
				);
			};
		},
		Err(std::env::VarError::NotUnicode(os_str)) => {
			warn!(
				"failed to parse `TROUPE_WORKER_THREADS={os_str:?}` as a valid unicode string, \
				 using the default worker count"
			);
		},
		Err(std::env::VarError::NotPresent) => {},
	}
	num_cpus::get().max(4)
}

/// The runtime could not find a runnable task while blocked calls were still
/// awaiting replies.
///
/// When a deadlocked call chain unwinds, each hop wraps the deadlock it observed,
/// so `next` preserves the propagation chain hop by hop.
#[derive(Clone, Debug, Error)]
#[error("deadlock: {suspended} blocked call(s) and no runnable task")]
pub struct Deadlock {
	suspended: usize,
	#[source]
	next: Option<Box<Deadlock>>,
}

impl Deadlock {
	pub(crate) fn new(suspended: usize) -> Self {
		Deadlock { suspended, next: None }
	}

	/// Wraps `self` as the cause of a new deadlock observed one hop further up
	/// the call chain.
	pub(crate) fn chained(self) -> Self {
		Deadlock { suspended: self.suspended, next: Some(Box::new(self)) }
	}

	/// Number of blocked calls at the point of detection.
	pub fn suspended_calls(&self) -> usize {
		self.suspended
	}

	/// Length of the propagation chain, the detection itself included.
	pub fn depth(&self) -> usize {
		let mut depth = 1;
		let mut next = self.next.as_deref();
		while let Some(deadlock) = next {
			depth += 1;
			next = deadlock.next.as_deref();
		}
		depth
	}
}

/// Error carried by a reply: what a message handler raised, or the deadlock the
/// runtime injected to unblock the caller.
///
/// `Deadlock` is the only runtime-originated variant user code needs to
/// recognize; everything else is an application error in transit.
#[derive(Debug, Error)]
pub enum Fault {
	#[error(transparent)]
	Deadlock(#[from] Deadlock),
	#[error(transparent)]
	Error(#[from] anyhow::Error),
}

impl Fault {
	pub fn is_deadlock(&self) -> bool {
		matches!(self, Fault::Deadlock(_))
	}
}

/// Faults captured off-thread (dispatcher failures, repeated deadlocks) and
/// re-raised on the driving thread at the next `quiesce` or `reset`.
#[derive(Debug, Error)]
#[error("{} fault(s) surfaced while draining the runtime", .faults.len())]
pub struct AggregateError {
	pub faults: Vec<Fault>,
}
