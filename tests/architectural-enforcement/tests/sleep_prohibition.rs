//! Sleep Prohibition
//!
//! Parley only waits on purpose in three places: the pairing window, the
//! bot's thinking delay and the daemon's accept backoff. Any other timer in
//! production code is a polling loop or a race papered over with a delay.
//!
//! Blocking sleeps (`std::thread::sleep`) are never allowed; they stall a
//! runtime worker.

use architectural_enforcement::{is_file, report, scan, source_dir};

#[test]
fn test_no_blocking_sleep() {
    let mut violations = Vec::new();
    for krate in ["parley/core", "parley/daemon"] {
        violations.extend(scan(&source_dir(krate), |_, code| {
            (code.contains("thread::sleep") || code.contains("std::thread::sleep"))
                .then(|| "Blocking sleep".to_string())
        }));
    }
    report("blocking sleep", &violations);
}

#[test]
fn test_core_timers_only_in_pairing_and_bot() {
    let violations = scan(&source_dir("parley/core"), |path, code| {
        let allowed = is_file(path, "matchmaker.rs") || is_file(path, "bot.rs");
        (code.contains("time::sleep") && !allowed).then(|| "Async sleep outside pairing/bot".to_string())
    });
    report("core sleep", &violations);
}

#[test]
fn test_daemon_sleeps_only_for_accept_backoff() {
    let violations = scan(&source_dir("parley/daemon"), |path, code| {
        let backoff = is_file(path, "server.rs") && code.contains("ACCEPT_BACKOFF");
        (code.contains("time::sleep") && !backoff).then(|| "Async sleep outside accept backoff".to_string())
    });
    report("daemon sleep", &violations);
}
