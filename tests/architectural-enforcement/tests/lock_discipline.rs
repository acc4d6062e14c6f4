//! Integration Test: Lock and Error Discipline
//!
//! **Policy**:
//! - Locks come from `parking_lot`; `std::sync::Mutex` and `RwLock` poison
//!   and force `unwrap()` at every call site
//! - Production code propagates errors; `unwrap()` and `expect()` are for tests
//!
//! **Exceptions**: `#[cfg(test)]` modules, `unwrap_or*` combinators

use connpool_architecture::{core_src, report, scan};

#[test]
fn test_no_std_locks_in_production_code() {
    let violations = scan(&core_src(), |code| {
        code.contains("std::sync::Mutex")
            || code.contains("std::sync::RwLock")
            || (code.contains("std::sync::{") && (code.contains("Mutex") || code.contains("RwLock")))
    });
    report("std::sync locks found in production code!", &violations);
}

#[test]
fn test_no_unwrap_in_production_code() {
    let violations = scan(&core_src(), |code| {
        code.contains(".unwrap()") || code.contains(".expect(")
    });

    if !violations.is_empty() {
        eprintln!("\n✅ ACCEPTABLE alternatives:");
        eprintln!("  - `?` with a crate error type");
        eprintln!("  - unwrap_or / unwrap_or_default / unwrap_or_else");
        eprintln!("  - let-else with a logged fallback");
    }
    report("unwrap()/expect() found in production code!", &violations);
}
