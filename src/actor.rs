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
	cell::RefCell,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex, MutexGuard, Weak,
	},
};

use tracing::{debug, info};

use crate::{
	envelope::{Envelope, Selector},
	gate::Gate,
	mailbox::Mailbox,
	scheduler::{LiveActor, RunnableTask, Scheduler},
	ActorContext, Behavior, Deadlock,
};

static ACTOR_IDS: AtomicU64 = AtomicU64::new(1);

thread_local! {
	static CURRENT_ACTOR: RefCell<Option<CurrentActor>> = const { RefCell::new(None) };
}

/// Gate mutations a blocking rendezvous performs on the calling actor, without
/// knowing its behavior type.
pub(crate) trait GateOverride: Send + Sync {
	fn gate_only(&self, tag: u64);
	fn gate_default_by_tag(&self, tag: u64);
}

/// Identity of the actor whose message the current thread is delivering.
pub(crate) struct CurrentActor {
	pub(crate) id: u64,
	pub(crate) gate: Arc<dyn GateOverride>,
}

impl Clone for CurrentActor {
	fn clone(&self) -> Self {
		CurrentActor { id: self.id, gate: Arc::clone(&self.gate) }
	}
}

pub(crate) fn current_actor() -> Option<CurrentActor> {
	CURRENT_ACTOR.with(|current| current.borrow().clone())
}

/// Scoped marker for the actor executing on this thread; restores the previous
/// value on drop so nested binds (an actor spawning another from its handler)
/// unwind correctly.
struct CurrentActorGuard {
	previous: Option<CurrentActor>,
}

impl CurrentActorGuard {
	fn enter<A: Behavior>(core: &Arc<ActorCore<A>>) -> Self {
		let current =
			CurrentActor { id: core.id, gate: Arc::clone(core) as Arc<dyn GateOverride> };
		let previous =
			CURRENT_ACTOR.with(|slot| slot.borrow_mut().replace(current));
		CurrentActorGuard { previous }
	}
}

impl Drop for CurrentActorGuard {
	fn drop(&mut self) {
		let previous = self.previous.take();
		CURRENT_ACTOR.with(|slot| *slot.borrow_mut() = previous);
	}
}

/// State of the actor's single execution slot.
///
/// A pending envelope moves `Free → Scheduled` when the gate admits it and the
/// actor hands it to the ready queue, and `Scheduled → Running` when a worker
/// claims it. At most one envelope of an actor is outside the mailbox at any
/// time, which is what makes the actor a serial executor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ExecState {
	Free,
	Scheduled,
	Running,
}

struct CoreState<A: Behavior> {
	/// Absent while a delivery borrows it.
	behavior: Option<A>,
	mailbox: Mailbox<A>,
	gate: Gate,
	exec: ExecState,
}

/// Binds a behavior to a mailbox and a gate, and executes one message at a
/// time against it.
pub(crate) struct ActorCore<A: Behavior> {
	id: u64,
	label: String,
	weak_self: Weak<ActorCore<A>>,
	pub(crate) scheduler: Arc<Scheduler>,
	state: Mutex<CoreState<A>>,
}

impl<A: Behavior> ActorCore<A> {
	/// Creates the core, registers it with the scheduler's live set and binds
	/// the initial behavior.
	pub(crate) fn spawn(scheduler: Arc<Scheduler>, behavior: A) -> Arc<Self> {
		let label = behavior.name();
		let core = Arc::new_cyclic(|weak_self| ActorCore {
			id: ACTOR_IDS.fetch_add(1, Ordering::Relaxed),
			label,
			weak_self: weak_self.clone(),
			scheduler,
			state: Mutex::new(CoreState {
				behavior: None,
				mailbox: Mailbox::default(),
				gate: Gate::default(),
				// The slot is held until the bind completes so no message can
				// be dispatched against the still-absent behavior.
				exec: ExecState::Running,
			}),
		});
		core.scheduler.register_actor(Arc::clone(&core) as Arc<dyn LiveActor>);
		debug!(actor = %core.label, actor_id = core.id, "spawn");
		core.bind(behavior);
		core
	}

	pub(crate) fn actor_id(&self) -> u64 {
		self.id
	}

	pub(crate) fn label(&self) -> &str {
		&self.label
	}

	fn strong(&self) -> Arc<Self> {
		self.weak_self.upgrade().expect("actor core deallocated while in use")
	}

	fn lock_state(&self) -> MutexGuard<'_, CoreState<A>> {
		self.state.lock().expect("actor mutex poisoned")
	}

	/// Makes `behavior` the active behavior: runs its `bound` hook (applying
	/// any transition it requests in turn), then opens the execution slot.
	fn bind(&self, mut behavior: A) {
		let this = self.strong();
		let ctx = ActorContext::new(Arc::clone(&this));
		{
			let _guard = CurrentActorGuard::enter(&this);
			behavior.bound(&ctx);
		}
		behavior = self.apply_transitions(behavior, &ctx);
		let mut state = self.lock_state();
		state.behavior = Some(behavior);
		state.exec = ExecState::Free;
		self.pump(&mut state);
	}

	/// Appends an envelope to the mailbox and dispatches it right away if the
	/// actor is free and the gate admits it.
	pub(crate) fn enqueue(&self, envelope: Envelope<A>) {
		let mut state = self.lock_state();
		debug!(actor = %self.label, msg = ?envelope, "enqueue");
		state.mailbox.push(envelope);
		self.pump(&mut state);
	}

	/// Moves the first admitted envelope from the mailbox to the ready queue,
	/// reserving the execution slot for it.
	fn pump(&self, state: &mut CoreState<A>) {
		if state.exec != ExecState::Free {
			return;
		}
		if let Some(envelope) = state.mailbox.take_admitted(&state.gate) {
			state.exec = ExecState::Scheduled;
			self.scheduler.schedule(Box::new(DeliverTask { core: self.strong(), envelope }));
		}
	}

	/// Executes one envelope: claim the slot and the behavior, run the handler
	/// (which resolves the continuation on every exit path), apply any pending
	/// transition, then free the slot and look for the next admitted envelope.
	fn deliver(&self, mut envelope: Envelope<A>) {
		let this = self.strong();
		let mut behavior = {
			let mut state = self.lock_state();
			assert_eq!(
				state.exec,
				ExecState::Scheduled,
				"delivery without a reservation; this should never happen"
			);
			state.exec = ExecState::Running;
			state.behavior.take().expect("behavior slot empty at delivery")
		};
		let ctx = ActorContext::new(Arc::clone(&this));
		{
			let _guard = CurrentActorGuard::enter(&this);
			debug!(actor = %self.label, msg = ?envelope, "deliver");
			envelope.handle_message(&mut behavior, &ctx);
		}
		behavior = self.apply_transitions(behavior, &ctx);
		let mut state = self.lock_state();
		state.behavior = Some(behavior);
		state.exec = ExecState::Free;
		self.pump(&mut state);
	}

	/// Applies transitions requested through the context, rebinding each
	/// replacement until it settles. The mailbox is untouched: no message is
	/// lost or reordered by a transition.
	fn apply_transitions(&self, mut behavior: A, ctx: &ActorContext<A>) -> A {
		let this = self.strong();
		while let Some(next) = ctx.take_transition() {
			info!(actor = %self.label, "become");
			behavior = next;
			let _guard = CurrentActorGuard::enter(&this);
			behavior.bound(ctx);
		}
		behavior
	}

	pub(crate) fn refuse(&self, selector: Selector) {
		debug!(actor = %self.label, selector = selector.name, "refuse");
		self.lock_state().gate.refuse(selector);
	}

	pub(crate) fn accept(&self, selector: Selector) {
		debug!(actor = %self.label, selector = selector.name, "accept");
		let mut state = self.lock_state();
		state.gate.accept(selector);
		self.pump(&mut state);
	}

	#[cfg(any(test, feature = "testsuite"))]
	pub(crate) fn pending(&self) -> usize {
		self.lock_state().mailbox.len()
	}

	#[cfg(any(test, feature = "testsuite"))]
	pub(crate) fn drain_mailbox(&self) -> Vec<Envelope<A>> {
		self.lock_state().mailbox.drain()
	}
}

impl<A: Behavior> GateOverride for ActorCore<A> {
	fn gate_only(&self, tag: u64) {
		debug!(actor = %self.label, tag, "gate only");
		self.lock_state().gate.only(tag);
	}

	fn gate_default_by_tag(&self, tag: u64) {
		debug!(actor = %self.label, tag, "gate default");
		let mut state = self.lock_state();
		state.gate.default_by_tag(tag);
		self.pump(&mut state);
	}
}

impl<A: Behavior> LiveActor for ActorCore<A> {
	fn live_actor_id(&self) -> u64 {
		self.id
	}

	fn live_label(&self) -> String {
		self.label.clone()
	}

	fn notify_deadlock(&self, deadlock: &Deadlock) {
		let envelope = crate::envelope::wrap_in_envelope(
			crate::scheduler::DeadlockNotice(deadlock.clone()),
			crate::continuation::Continuation::Nil,
		);
		self.enqueue(envelope);
	}
}

/// A ready-queue entry: one admitted envelope bound to its actor.
struct DeliverTask<A: Behavior> {
	core: Arc<ActorCore<A>>,
	envelope: Envelope<A>,
}

impl<A: Behavior> RunnableTask for DeliverTask<A> {
	fn deliver(self: Box<Self>) {
		let DeliverTask { core, envelope } = *self;
		core.deliver(envelope);
	}

	fn describe(&self) -> String {
		format!("{}: {:?}", self.core.label, self.envelope)
	}
}
