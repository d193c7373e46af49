//! Blocking I/O Prohibition
//!
//! The core library runs entirely on the tokio runtime. Sockets belong to the
//! daemon's transports, and the only file the core touches is the config
//! file, read once before the runtime serves anyone.
//!
//! Allowed:
//! - `std::fs` in `parley/core/src/config/`
//! - `std::net` address types in the daemon (`SocketAddr`)
//! - `std::fs` in the daemon for socket file setup and cleanup

use architectural_enforcement::{report, scan, source_dir};

const BLOCKING_SOCKETS: [&str; 4] = [
    "std::net::TcpStream",
    "std::net::TcpListener",
    "std::net::UdpSocket",
    "std::os::unix::net::",
];

#[test]
fn test_core_has_no_sockets() {
    let violations = scan(&source_dir("parley/core"), |_, code| {
        code.contains("std::net")
            .then(|| "Network code in core".to_string())
    });
    report("core networking", &violations);
}

#[test]
fn test_core_file_io_only_in_config() {
    let violations = scan(&source_dir("parley/core"), |path, code| {
        let in_config = path.components().any(|c| c.as_os_str() == "config");
        (code.contains("std::fs") && !in_config).then(|| "Blocking file I/O".to_string())
    });
    report("core file I/O", &violations);
}

#[test]
fn test_daemon_uses_async_sockets() {
    let violations = scan(&source_dir("parley/daemon"), |_, code| {
        BLOCKING_SOCKETS
            .iter()
            .any(|pattern| code.contains(pattern))
            .then(|| "Blocking socket".to_string())
    });
    report("blocking socket", &violations);
}

#[test]
fn test_no_blocking_process_or_stdio() {
    let mut violations = Vec::new();
    for krate in ["parley/core", "parley/daemon"] {
        violations.extend(scan(&source_dir(krate), |_, code| {
            (code.contains("std::process::Command")
                || code.contains("std::io::stdin()")
                || code.contains("std::io::stdout()"))
            .then(|| "Blocking process or stdio".to_string())
        }));
    }
    report("blocking process/stdio", &violations);
}
