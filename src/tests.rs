use crate::{ActorContext, Behavior, Fault, Handler};

#[derive(Debug)]
pub struct Ping;

#[derive(Debug)]
pub struct Add(pub u32);

#[derive(Debug)]
pub struct Total;

/// Minimal counting behavior shared across unit tests.
#[derive(Default)]
pub struct PingActor {
	pub pings: usize,
	pub total: u32,
}

impl Behavior for PingActor {}

impl Handler<Ping> for PingActor {
	type Reply = usize;

	fn handle(&mut self, _: Ping, _ctx: &ActorContext<Self>) -> Result<usize, Fault> {
		self.pings += 1;
		Ok(self.pings)
	}
}

impl Handler<Add> for PingActor {
	type Reply = u32;

	fn handle(&mut self, message: Add, _ctx: &ActorContext<Self>) -> Result<u32, Fault> {
		self.total += message.0;
		Ok(self.total)
	}
}

impl Handler<Total> for PingActor {
	type Reply = u32;

	fn handle(&mut self, _: Total, _ctx: &ActorContext<Self>) -> Result<u32, Fault> {
		Ok(self.total)
	}
}
