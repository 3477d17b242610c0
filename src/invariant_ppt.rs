//! Runtime invariants for the settings merge engine.
//!
//! The merge rules (ancestor wins, paths de-duplicated as absolute paths) are
//! easy to break in a refactor without any single test noticing. Code that
//! enforces such a rule calls [`assert_invariant`]; tests then call
//! [`contract_test`] to prove the check actually ran.

use std::collections::HashSet;
use std::sync::Mutex;
use lazy_static::lazy_static;
use log::error;

lazy_static! {
    /// Descriptions of every invariant that has held at least once in this process.
    static ref CHECKED_INVARIANTS: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

/// Asserts that a merge invariant holds.
///
/// A violation panics in debug and test builds and is logged as an error in
/// release builds, where a slightly wrong reference list beats refusing to
/// run the script at all.
///
/// # Arguments
/// * `condition` - The boolean result of the check.
/// * `description` - What must hold (e.g. "Effective package names are unique").
/// * `component` - Optional component tag (e.g. "Resolver").
pub fn assert_invariant(condition: bool, description: &str, component: Option<&str>) {
    if !condition {
        let msg = format!(
            "INVARIANT VIOLATION [{}]: {}",
            component.unwrap_or("General"),
            description
        );
        error!("{}", msg);

        if cfg!(debug_assertions) || cfg!(test) {
            panic!("{}", msg);
        }
    } else {
        let mut set = CHECKED_INVARIANTS.lock().unwrap_or_else(|e| e.into_inner());
        set.insert(description.to_string());
    }
}

/// Panics unless every listed invariant has been asserted (and held) at least once.
#[cfg(test)]
pub fn contract_test(context: &str, required_invariants: &[&str]) {
    // Release the lock before panicking so other tests never see it poisoned.
    let missing: Vec<&str> = {
        let checked = CHECKED_INVARIANTS.lock().unwrap_or_else(|e| e.into_inner());
        required_invariants
            .iter()
            .copied()
            .filter(|req| !checked.contains(*req))
            .collect()
    };

    if !missing.is_empty() {
        panic!(
            "Contract '{}' failed. These invariants were never checked:\n{:#?}",
            context, missing
        );
    }
}
