//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in the core crate MUST NOT sleep. Threads that
//! need to wait (blocked acquisitions, the idle reaper) park on a condition
//! variable with a deadline so shutdown and releases wake them at once.
//! **Exceptions**: test code

use connpool_architecture::{core_src, report, scan};

#[test]
fn test_no_sleep_in_production_code() {
    let violations = scan(&core_src(), |code| {
        code.contains("::sleep(") || code.contains(".sleep(")
    });

    if !violations.is_empty() {
        eprintln!("\n✅ REQUIRED instead:");
        eprintln!("  - parking_lot::Condvar::wait_until with a deadline");
        eprintln!("  - Condvar::notify_one / notify_all from the thread that frees capacity");
    }
    report("Sleep calls found in production code!", &violations);
}

#[test]
fn test_scanner_sees_core_sources() {
    let files = connpool_architecture::rust_files(&core_src());
    assert!(
        files.iter().any(|path| path.ends_with("pool/manager.rs")),
        "core sources not found under {}",
        core_src().display()
    );
}
