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

use std::{any::TypeId, collections::HashSet};

use crate::envelope::Selector;

/// Per-actor admission policy: decides whether a pending message is runnable
/// now.
///
/// Three overlays, most specific first:
/// - an `only` override admits nothing but the one continuation tag it names
///   (installed around a blocking rendezvous),
/// - the refuse-set keeps named message types queued but ineligible,
/// - everything else is admitted.
///
/// Changing the policy never drops queued messages; a refused or overridden
/// message simply becomes runnable again once the policy widens.
#[derive(Debug, Default)]
pub(crate) struct Gate {
	refused: HashSet<TypeId>,
	only: Option<u64>,
}

impl Gate {
	pub(crate) fn admits(&self, selector: Selector, tag: Option<u64>) -> bool {
		if let Some(only_tag) = self.only {
			return tag == Some(only_tag);
		}
		!self.refused.contains(&selector.id)
	}

	pub(crate) fn refuse(&mut self, selector: Selector) {
		self.refused.insert(selector.id);
	}

	pub(crate) fn accept(&mut self, selector: Selector) {
		self.refused.remove(&selector.id);
	}

	/// Restricts admission to the task carrying `tag`.
	pub(crate) fn only(&mut self, tag: u64) {
		self.only = Some(tag);
	}

	/// Removes the `only` override, provided it still belongs to `tag`.
	///
	/// Overrides are installed and removed by the same rendezvous, but the
	/// tag check keeps a stale removal from clobbering a newer override.
	pub(crate) fn default_by_tag(&mut self, tag: u64) {
		if self.only == Some(tag) {
			self.only = None;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct Offer;
	struct Winner;

	#[test]
	fn test_default_gate_admits_everything() {
		let gate = Gate::default();
		assert!(gate.admits(Selector::of::<Offer>(), None));
		assert!(gate.admits(Selector::of::<Winner>(), Some(7)));
	}

	#[test]
	fn test_refused_selector_is_not_admitted() {
		let mut gate = Gate::default();
		gate.refuse(Selector::of::<Winner>());
		assert!(!gate.admits(Selector::of::<Winner>(), None));
		assert!(gate.admits(Selector::of::<Offer>(), None));
		gate.accept(Selector::of::<Winner>());
		assert!(gate.admits(Selector::of::<Winner>(), None));
	}

	#[test]
	fn test_only_override_admits_single_tag() {
		let mut gate = Gate::default();
		gate.only(42);
		assert!(!gate.admits(Selector::of::<Offer>(), None));
		assert!(!gate.admits(Selector::of::<Offer>(), Some(7)));
		assert!(gate.admits(Selector::of::<Offer>(), Some(42)));
	}

	#[test]
	fn test_only_override_shadows_refuse_set_until_removed() {
		let mut gate = Gate::default();
		gate.refuse(Selector::of::<Winner>());
		gate.only(42);
		assert!(gate.admits(Selector::of::<Winner>(), Some(42)));
		gate.default_by_tag(42);
		assert!(!gate.admits(Selector::of::<Winner>(), Some(42)));
		assert!(gate.admits(Selector::of::<Offer>(), None));
	}

	#[test]
	fn test_default_by_tag_ignores_stale_tag() {
		let mut gate = Gate::default();
		gate.only(42);
		gate.default_by_tag(7);
		assert!(gate.admits(Selector::of::<Offer>(), Some(42)));
		assert!(!gate.admits(Selector::of::<Offer>(), None));
	}
}
