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
	cmp::Ordering as CmpOrdering,
	collections::BinaryHeap,
	sync::{Arc, Condvar, Mutex, MutexGuard},
	thread,
	time::{Duration, Instant},
};

use tracing::debug;

/// Fires scheduled callbacks at their deadline, earliest first.
///
/// One deadline thread is spawned lazily on the first event and parks until
/// the next deadline. Callbacks run on the deadline thread and must be short:
/// in practice they enqueue a message and return.
pub(crate) struct Timer {
	core: Arc<TimerCore>,
}

struct TimerCore {
	state: Mutex<TimerState>,
	alarm: Condvar,
}

struct TimerState {
	entries: BinaryHeap<TimerEntry>,
	next_entry_id: u64,
	thread_started: bool,
	shutdown: bool,
}

struct TimerEntry {
	deadline: Instant,
	/// Tie-break so equal deadlines fire in schedule order.
	entry_id: u64,
	callback: Box<dyn FnOnce() + Send>,
}

impl PartialEq for TimerEntry {
	fn eq(&self, other: &Self) -> bool {
		self.entry_id == other.entry_id
	}
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
	fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
		Some(self.cmp(other))
	}
}

impl Ord for TimerEntry {
	// Reversed: BinaryHeap is a max-heap and we want the earliest deadline on
	// top.
	fn cmp(&self, other: &Self) -> CmpOrdering {
		other
			.deadline
			.cmp(&self.deadline)
			.then_with(|| other.entry_id.cmp(&self.entry_id))
	}
}

impl Timer {
	pub(crate) fn new() -> Timer {
		Timer {
			core: Arc::new(TimerCore {
				state: Mutex::new(TimerState {
					entries: BinaryHeap::new(),
					next_entry_id: 0,
					thread_started: false,
					shutdown: false,
				}),
				alarm: Condvar::new(),
			}),
		}
	}

	/// Runs `callback` once `after` has elapsed; a zero delay fires as soon as
	/// the deadline thread gets the CPU.
	pub(crate) fn schedule_event(&self, after: Duration, callback: Box<dyn FnOnce() + Send>) {
		let mut state = self.core.lock_state();
		let entry_id = state.next_entry_id;
		state.next_entry_id += 1;
		state.entries.push(TimerEntry { deadline: Instant::now() + after, entry_id, callback });
		if !state.thread_started {
			state.thread_started = true;
			let core = Arc::clone(&self.core);
			thread::Builder::new()
				.name("troupe-timer".to_string())
				.spawn(move || deadline_loop(core))
				.expect("failed to spawn the timer thread");
		}
		self.core.alarm.notify_one();
	}

	/// Drops every pending event. Fired callbacks already in flight are not
	/// affected.
	pub(crate) fn reset(&self) {
		let mut state = self.core.lock_state();
		let dropped = state.entries.len();
		state.entries.clear();
		if dropped > 0 {
			debug!(dropped, "timer reset dropped pending events");
		}
		self.core.alarm.notify_one();
	}
}

impl Drop for Timer {
	fn drop(&mut self) {
		let mut state = self.core.lock_state();
		state.shutdown = true;
		state.entries.clear();
		self.core.alarm.notify_one();
	}
}

impl TimerCore {
	fn lock_state(&self) -> MutexGuard<'_, TimerState> {
		self.state.lock().expect("timer mutex poisoned")
	}
}

fn deadline_loop(core: Arc<TimerCore>) {
	let mut state = core.lock_state();
	loop {
		if state.shutdown {
			break;
		}
		let now = Instant::now();
		match state.entries.peek().map(|entry| entry.deadline) {
			None => {
				state = core.alarm.wait(state).expect("timer mutex poisoned");
			},
			Some(deadline) if deadline > now => {
				let timeout = deadline - now;
				state = core.alarm.wait_timeout(state, timeout).expect("timer mutex poisoned").0;
			},
			Some(_) => {
				let entry = state.entries.pop().expect("timer heap emptied under lock");
				drop(state);
				(entry.callback)();
				state = core.lock_state();
			},
		}
	}
	debug!("timer exiting");
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_events_fire_in_deadline_order() {
		let timer = Timer::new();
		let (tx, rx) = flume::unbounded();
		let tx_late = tx.clone();
		timer.schedule_event(
			Duration::from_millis(60),
			Box::new(move || tx_late.send("late").unwrap()),
		);
		timer.schedule_event(Duration::from_millis(10), Box::new(move || tx.send("early").unwrap()));
		assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "early");
		assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "late");
	}

	#[test]
	fn test_zero_delay_fires_promptly() {
		let timer = Timer::new();
		let (tx, rx) = flume::unbounded();
		timer.schedule_event(Duration::ZERO, Box::new(move || tx.send(()).unwrap()));
		assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
	}

	#[test]
	fn test_reset_drops_pending_events() {
		let timer = Timer::new();
		let (tx, rx) = flume::unbounded::<()>();
		timer.schedule_event(Duration::from_millis(50), Box::new(move || tx.send(()).unwrap()));
		timer.reset();
		assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
	}
}
