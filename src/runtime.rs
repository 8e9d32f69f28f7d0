use std::sync::Arc;

use tracing::info;

use crate::{actor::ActorCore, name::Name, scheduler::Scheduler, AggregateError, Behavior};

/// Troupe serves as the top-level context in which actors are spawned.
///
/// It is *not* a singleton. A typical application will usually have only one
/// troupe hosting all of its actors but it is not a requirement.
///
/// In particular, unit tests all have their own troupe and hence can be
/// executed in parallel. The dispatcher thread, the worker pool and the
/// deadline thread all belong to the troupe and start lazily on first use.
pub struct Troupe {
	scheduler: Arc<Scheduler>,
}

impl Default for Troupe {
	fn default() -> Troupe {
		Troupe::new()
	}
}

impl Troupe {
	pub fn new() -> Troupe {
		Troupe { scheduler: Scheduler::new() }
	}

	/// Spawns an actor with `behavior` as its initial behavior and returns its
	/// name.
	///
	/// The behavior's `bound` hook runs before any message can be delivered,
	/// so it can shape the admission gate or schedule a first message to self.
	pub fn spawn<A: Behavior>(&self, behavior: A) -> Name<A> {
		Name::from_core(ActorCore::spawn(Arc::clone(&self.scheduler), behavior))
	}

	/// Blocks the calling thread until no actor is runnable, every worker has
	/// retired and every scheduled deadline has fired, then re-raises faults
	/// captured off-thread.
	///
	/// The calling thread checks itself into the scheduler accounting for the
	/// duration: a system that can only progress through it (a cycle of
	/// blocked calls) is detected as a deadlock, recovered and reported. The
	/// runtime stays usable afterwards.
	pub fn quiesce(&self) -> Result<(), AggregateError> {
		let faults = self.scheduler.drain(true);
		if faults.is_empty() {
			Ok(())
		} else {
			Err(AggregateError { faults })
		}
	}

	/// Tears down the scheduler, the worker pool, the deadline thread and the
	/// live-actor set, waking anything still parked. Pending faults are
	/// re-raised. The runtime stays usable afterwards.
	pub fn reset(&self) -> Result<(), AggregateError> {
		info!("runtime reset");
		let faults = self.scheduler.reset();
		if faults.is_empty() {
			Ok(())
		} else {
			Err(AggregateError { faults })
		}
	}

	/// Quiesces and asserts that nothing failed.
	///
	/// This is useful for testing purposes to surface faults captured in
	/// actors.
	#[cfg(any(test, feature = "testsuite"))]
	pub fn assert_quiesce(&self) {
		if let Err(aggregate) = self.quiesce() {
			panic!("faults surfaced at quiesce: {:?}", aggregate.faults);
		}
	}
}

impl Drop for Troupe {
	fn drop(&mut self) {
		let _ = self.scheduler.reset();
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;
	use crate::{
		tests::{Add, Ping, PingActor, Total},
		ActorContext, Fault, Handler,
	};

	#[test]
	fn test_spawn_and_ask() {
		let troupe = Troupe::new();
		let ping = troupe.spawn(PingActor::default());
		assert_eq!(ping.ask(Ping).unwrap(), 1);
		assert_eq!(ping.ask(Ping).unwrap(), 2);
		troupe.assert_quiesce();
	}

	#[test]
	fn test_tell_is_processed_before_quiesce_returns() {
		let troupe = Troupe::new();
		let ping = troupe.spawn(PingActor::default());
		for value in 1..=10u32 {
			ping.tell(Add(value));
		}
		troupe.assert_quiesce();
		assert_eq!(ping.ask(Total).unwrap(), 55);
		troupe.assert_quiesce();
	}

	#[derive(Default)]
	struct TickingActor {
		ticks: usize,
	}

	#[derive(Debug)]
	struct Tick;

	#[derive(Debug)]
	struct Ticks;

	impl crate::Behavior for TickingActor {
		fn bound(&mut self, ctx: &ActorContext<Self>) {
			ctx.schedule_self_msg(Duration::from_millis(30), Tick);
		}
	}

	impl Handler<Tick> for TickingActor {
		type Reply = ();

		fn handle(&mut self, _: Tick, _ctx: &ActorContext<Self>) -> Result<(), Fault> {
			self.ticks += 1;
			Ok(())
		}
	}

	impl Handler<Ticks> for TickingActor {
		type Reply = usize;

		fn handle(&mut self, _: Ticks, _ctx: &ActorContext<Self>) -> Result<usize, Fault> {
			Ok(self.ticks)
		}
	}

	#[test]
	fn test_quiesce_waits_for_scheduled_messages() {
		let troupe = Troupe::new();
		let ticking = troupe.spawn(TickingActor::default());
		// The scheduled tick has not fired yet; quiesce must wait for it.
		troupe.assert_quiesce();
		assert_eq!(ticking.ask(Ticks).unwrap(), 1);
		troupe.assert_quiesce();
	}

	#[test]
	fn test_quiesce_on_an_empty_runtime() {
		let troupe = Troupe::new();
		troupe.assert_quiesce();
		troupe.assert_quiesce();
	}

	#[test]
	fn test_reset_then_reuse() {
		let troupe = Troupe::new();
		let ping = troupe.spawn(PingActor::default());
		ping.tell(Add(1));
		troupe.reset().unwrap();
		let ping = troupe.spawn(PingActor::default());
		assert_eq!(ping.ask(Ping).unwrap(), 1);
		troupe.assert_quiesce();
	}
}
