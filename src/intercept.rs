//! Process-wide connection intercepts, for tests.
//!
//! After `add_intercept(host, port, host2, port2)`, any connection the
//! engine would open towards `(host, port)` goes to `(host2, port2)`
//! instead. The table is consulted once per connection attempt.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::endpoint::Endpoint;

fn table() -> &'static Mutex<HashMap<Endpoint, Endpoint>> {
    static TABLE: OnceLock<Mutex<HashMap<Endpoint, Endpoint>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Redirect future connections aimed at `(host, port)` to `(host2, port2)`.
/// Adding the same mapping twice is equivalent to adding it once.
pub fn add_intercept(host: &str, port: u16, host2: &str, port2: u16) {
    let mut table = table().lock().expect("intercept table lock poisoned");
    table.insert(Endpoint::new(host, port), Endpoint::new(host2, port2));
}

/// Drop every registered intercept.
pub fn clear_intercepts() {
    let mut table = table().lock().expect("intercept table lock poisoned");
    table.clear();
}

pub(crate) fn translate(endpoint: &Endpoint) -> Endpoint {
    let table = table().lock().expect("intercept table lock poisoned");
    table.get(endpoint).cloned().unwrap_or_else(|| endpoint.clone())
}
