//! Common types and functions.

// ----------

use std::sync::atomic::{AtomicU64, Ordering};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

// Used when expecting a valid value in Options or Results.
pub(crate) const SCOPE_VALIDITY: &str = "scope validity";

// --------------------------------------------------------------------------------

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

// Connection ids are the stable identity of a connection for the whole
// process lifetime; the WebSocket session table keys by them.
pub(crate) fn next_connection_id() -> u64 {
	CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn connection_ids_are_unique() {
		let first = next_connection_id();
		let second = next_connection_id();

		assert_ne!(first, second);
		assert!(second > first);
	}
}
