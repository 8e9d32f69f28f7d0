// Functional coverage for the runtime itself: rendezvous, admission gates,
// behavior transitions, fault routing and deadlock recovery.

use std::{
	thread,
	time::{Duration, Instant},
};

use anyhow::anyhow;
use troupe::{ActorContext, Behavior, Deadlock, Fault, Handler, Name, Troupe};

#[derive(Debug)]
struct SetOther(Name<Pair>);

#[derive(Debug)]
struct Start;

#[derive(Debug)]
struct Echo;

#[derive(Debug)]
struct Stats;

/// One half of a mutual blocking call: `Start` performs a synchronous call to
/// the other half, which is doing the same thing back.
#[derive(Default)]
struct Pair {
	other: Option<Name<Pair>>,
	deadlock_notices: usize,
	saw_deadlock_fault: bool,
}

impl Behavior for Pair {
	fn deadlock(&mut self, _deadlock: &Deadlock, _ctx: &ActorContext<Self>) {
		self.deadlock_notices += 1;
	}
}

impl Handler<SetOther> for Pair {
	type Reply = ();

	fn handle(&mut self, message: SetOther, _ctx: &ActorContext<Self>) -> Result<(), Fault> {
		self.other = Some(message.0);
		Ok(())
	}
}

impl Handler<Start> for Pair {
	type Reply = ();

	fn handle(&mut self, _: Start, _ctx: &ActorContext<Self>) -> Result<(), Fault> {
		let other = self.other.clone().expect("other half set before start");
		match other.ask(Echo) {
			Ok(_) => {},
			Err(Fault::Deadlock(_)) => self.saw_deadlock_fault = true,
			Err(fault) => return Err(fault),
		}
		Ok(())
	}
}

impl Handler<Echo> for Pair {
	type Reply = u32;

	fn handle(&mut self, _: Echo, _ctx: &ActorContext<Self>) -> Result<u32, Fault> {
		Ok(7)
	}
}

impl Handler<Stats> for Pair {
	type Reply = (usize, bool);

	fn handle(&mut self, _: Stats, _ctx: &ActorContext<Self>) -> Result<(usize, bool), Fault> {
		Ok((self.deadlock_notices, self.saw_deadlock_fault))
	}
}

#[test]
fn test_mutual_blocking_calls_deadlock_and_both_actors_are_notified() {
	let troupe = Troupe::new();
	let left = troupe.spawn(Pair::default());
	let right = troupe.spawn(Pair::default());
	left.tell(SetOther(right.clone()));
	right.tell(SetOther(left.clone()));
	left.tell(Start);
	right.tell(Start);
	// The drain finds both threads parked on each other and surfaces the
	// deadlock after running the recovery pass.
	let aggregate = troupe.quiesce().expect_err("a deadlock must surface");
	assert!(aggregate.faults.iter().any(Fault::is_deadlock));

	for name in [&left, &right] {
		let (notices, saw_fault) = name.ask(Stats).unwrap();
		assert_eq!(notices, 1, "every live actor receives one deadlock notice");
		assert!(saw_fault, "the parked call returns a deadlock fault");
	}
	troupe.quiesce().expect("recovered after the deadlock");
}

#[derive(Debug)]
struct CallSelf;

#[derive(Debug)]
struct Nudge;

#[derive(Debug)]
struct Notices;

#[derive(Default)]
struct Selfish {
	deadlock_notices: usize,
}

impl Behavior for Selfish {
	fn deadlock(&mut self, _deadlock: &Deadlock, _ctx: &ActorContext<Self>) {
		self.deadlock_notices += 1;
	}
}

impl Handler<CallSelf> for Selfish {
	type Reply = bool;

	fn handle(&mut self, _: CallSelf, ctx: &ActorContext<Self>) -> Result<bool, Fault> {
		// A synchronous call to self can never be answered: the actor is busy
		// with this very handler.
		Ok(ctx.name().ask(Nudge).is_err())
	}
}

impl Handler<Nudge> for Selfish {
	type Reply = ();

	fn handle(&mut self, _: Nudge, _ctx: &ActorContext<Self>) -> Result<(), Fault> {
		Ok(())
	}
}

impl Handler<Notices> for Selfish {
	type Reply = usize;

	fn handle(&mut self, _: Notices, _ctx: &ActorContext<Self>) -> Result<usize, Fault> {
		Ok(self.deadlock_notices)
	}
}

#[test]
fn test_deadlock_is_detected_while_the_caller_is_parked() {
	let troupe = Troupe::new();
	let selfish = troupe.spawn(Selfish::default());
	// Main parks on CallSelf, the actor parks on its own Nudge: nothing can
	// run, and the dispatcher resolves both parked calls with the deadlock.
	let outcome = selfish.ask(CallSelf);
	match outcome {
		Err(Fault::Deadlock(_)) => {},
		other => panic!("expected the parked call to fail with a deadlock, got {other:?}"),
	}
	assert!(selfish.ask(Notices).unwrap() >= 1);
	troupe.quiesce().expect("recovered after the deadlock");
}

#[derive(Debug)]
struct Poke;

#[derive(Debug)]
struct Unlock;

#[derive(Debug)]
struct WasPoked;

struct Lockbox {
	unlock_after: Duration,
	pokes: usize,
}

impl Behavior for Lockbox {
	fn bound(&mut self, ctx: &ActorContext<Self>) {
		ctx.refuse::<Poke>();
		ctx.schedule_self_msg(self.unlock_after, Unlock);
	}
}

impl Handler<Poke> for Lockbox {
	type Reply = ();

	fn handle(&mut self, _: Poke, _ctx: &ActorContext<Self>) -> Result<(), Fault> {
		self.pokes += 1;
		Ok(())
	}
}

impl Handler<Unlock> for Lockbox {
	type Reply = ();

	fn handle(&mut self, _: Unlock, ctx: &ActorContext<Self>) -> Result<(), Fault> {
		ctx.accept::<Poke>();
		Ok(())
	}
}

impl Handler<WasPoked> for Lockbox {
	type Reply = usize;

	fn handle(&mut self, _: WasPoked, _ctx: &ActorContext<Self>) -> Result<usize, Fault> {
		Ok(self.pokes)
	}
}

#[test]
fn test_refused_message_waits_in_the_mailbox_until_accept() {
	let troupe = Troupe::new();
	let unlock_after = Duration::from_millis(150);
	let lockbox = troupe.spawn(Lockbox { unlock_after, pokes: 0 });
	let start = Instant::now();
	lockbox.tell(Poke);
	thread::sleep(Duration::from_millis(50));
	// The mailbox grew but the gate does not admit the refused message.
	assert_eq!(lockbox.pending_for_test(), 1);
	// A blocking call on the refused message completes only once the
	// scheduled Unlock has widened the gate.
	lockbox.ask(Poke).unwrap();
	assert!(start.elapsed() >= unlock_after);
	troupe.quiesce().expect("clean drain");
	assert_eq!(lockbox.ask(WasPoked).unwrap(), 2);
	troupe.quiesce().expect("clean drain");
}

#[derive(Debug)]
struct Explode;

#[derive(Debug)]
struct ExceptionCount;

#[derive(Default)]
struct Grumpy {
	exceptions: usize,
}

impl Behavior for Grumpy {
	fn exception(&mut self, _fault: Fault, _ctx: &ActorContext<Self>) {
		self.exceptions += 1;
	}
}

impl Handler<Explode> for Grumpy {
	type Reply = ();

	fn handle(&mut self, _: Explode, _ctx: &ActorContext<Self>) -> Result<(), Fault> {
		Err(Fault::Error(anyhow!("boom")))
	}
}

impl Handler<ExceptionCount> for Grumpy {
	type Reply = usize;

	fn handle(&mut self, _: ExceptionCount, _ctx: &ActorContext<Self>) -> Result<usize, Fault> {
		Ok(self.exceptions)
	}
}

#[test]
fn test_fire_and_forget_fault_goes_to_the_exception_hook() {
	let troupe = Troupe::new();
	let grumpy = troupe.spawn(Grumpy::default());
	grumpy.tell(Explode);
	// The sender is neither blocked nor notified; the fault is not aggregated.
	troupe.quiesce().expect("fire-and-forget faults are not aggregated");
	assert_eq!(grumpy.ask(ExceptionCount).unwrap(), 1);
	troupe.quiesce().expect("clean drain");
}

#[test]
fn test_blocking_call_fault_goes_to_the_caller_not_the_hook() {
	let troupe = Troupe::new();
	let grumpy = troupe.spawn(Grumpy::default());
	match grumpy.ask(Explode) {
		Err(Fault::Error(error)) => assert_eq!(error.to_string(), "boom"),
		other => panic!("expected the handler error, got {other:?}"),
	}
	assert_eq!(grumpy.ask(ExceptionCount).unwrap(), 0);
	troupe.quiesce().expect("clean drain");
}

#[derive(Debug)]
struct BeginSwitch;

#[derive(Debug)]
struct Number(u32);

#[derive(Debug)]
struct SeenLog;

struct Recorder {
	phase: &'static str,
	seen: Vec<(&'static str, u32)>,
}

impl Behavior for Recorder {}

impl Handler<BeginSwitch> for Recorder {
	type Reply = ();

	fn handle(&mut self, _: BeginSwitch, ctx: &ActorContext<Self>) -> Result<(), Fault> {
		// Let the sender queue more messages behind this handler before the
		// behavior is replaced.
		ctx.actor_yield(Duration::from_millis(40));
		ctx.transition(Recorder { phase: "second", seen: std::mem::take(&mut self.seen) });
		Ok(())
	}
}

impl Handler<Number> for Recorder {
	type Reply = ();

	fn handle(&mut self, message: Number, _ctx: &ActorContext<Self>) -> Result<(), Fault> {
		self.seen.push((self.phase, message.0));
		Ok(())
	}
}

impl Handler<SeenLog> for Recorder {
	type Reply = Vec<(&'static str, u32)>;

	fn handle(
		&mut self,
		_: SeenLog,
		_ctx: &ActorContext<Self>,
	) -> Result<Vec<(&'static str, u32)>, Fault> {
		Ok(self.seen.clone())
	}
}

#[test]
fn test_transition_drops_no_queued_message_and_keeps_their_order() {
	let troupe = Troupe::new();
	let recorder = troupe.spawn(Recorder { phase: "first", seen: Vec::new() });
	recorder.tell(BeginSwitch);
	for value in 1..=5 {
		recorder.tell(Number(value));
	}
	troupe.quiesce().expect("clean drain");
	let seen = recorder.ask(SeenLog).unwrap();
	let expected: Vec<(&'static str, u32)> =
		(1..=5).map(|value| ("second", value)).collect();
	assert_eq!(seen, expected);
	troupe.quiesce().expect("clean drain");
}

#[derive(Debug)]
struct Common(&'static str);

#[derive(Debug)]
struct Special(&'static str);

#[derive(Debug)]
struct OpenGate;

#[derive(Debug)]
struct Log;

#[derive(Default)]
struct Sieve {
	log: Vec<&'static str>,
}

impl Behavior for Sieve {
	fn bound(&mut self, ctx: &ActorContext<Self>) {
		ctx.refuse::<Special>();
	}
}

impl Handler<Common> for Sieve {
	type Reply = ();

	fn handle(&mut self, message: Common, _ctx: &ActorContext<Self>) -> Result<(), Fault> {
		self.log.push(message.0);
		Ok(())
	}
}

impl Handler<Special> for Sieve {
	type Reply = ();

	fn handle(&mut self, message: Special, _ctx: &ActorContext<Self>) -> Result<(), Fault> {
		self.log.push(message.0);
		Ok(())
	}
}

impl Handler<OpenGate> for Sieve {
	type Reply = ();

	fn handle(&mut self, _: OpenGate, ctx: &ActorContext<Self>) -> Result<(), Fault> {
		ctx.accept::<Special>();
		Ok(())
	}
}

impl Handler<Log> for Sieve {
	type Reply = Vec<&'static str>;

	fn handle(&mut self, _: Log, _ctx: &ActorContext<Self>) -> Result<Vec<&'static str>, Fault> {
		Ok(self.log.clone())
	}
}

#[test]
fn test_delivery_order_is_the_gate_filtered_subsequence_of_enqueue_order() {
	let troupe = Troupe::new();
	let sieve = troupe.spawn(Sieve::default());
	sieve.tell(Special("s1"));
	sieve.tell(Common("c1"));
	sieve.tell(Special("s2"));
	sieve.tell(Common("c2"));
	troupe.quiesce().expect("clean drain");
	// Only the admitted subsequence ran, in enqueue order.
	assert_eq!(sieve.ask(Log).unwrap(), vec!["c1", "c2"]);
	sieve.ask(OpenGate).unwrap();
	troupe.quiesce().expect("clean drain");
	// The formerly refused messages ran afterwards, their order intact.
	assert_eq!(sieve.ask(Log).unwrap(), vec!["c1", "c2", "s1", "s2"]);
	troupe.quiesce().expect("clean drain");
}

#[derive(Debug)]
struct WhoCalls;

#[derive(Default)]
struct Introspective;

impl Behavior for Introspective {}

impl Handler<WhoCalls> for Introspective {
	type Reply = Option<std::thread::ThreadId>;

	fn handle(
		&mut self,
		_: WhoCalls,
		ctx: &ActorContext<Self>,
	) -> Result<Option<std::thread::ThreadId>, Fault> {
		Ok(ctx.call_thread())
	}
}

#[test]
fn test_call_thread_identifies_a_blocked_caller() {
	let troupe = Troupe::new();
	let actor = troupe.spawn(Introspective);
	assert_eq!(actor.ask(WhoCalls).unwrap(), Some(thread::current().id()));
	troupe.quiesce().expect("clean drain");
}
