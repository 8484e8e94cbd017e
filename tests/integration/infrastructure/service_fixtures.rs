use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use svharness::ServiceConfig;

/// Initialize tracing for test output; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Service configuration running `script` under `sh -c`.
pub fn shell_service(script: &str) -> ServiceConfig {
    ServiceConfig {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        ..Default::default()
    }
}

/// Liveness probe that treats permission errors as "alive".
pub fn pid_alive(pid: Pid) -> bool {
    !matches!(kill(pid, None), Err(Errno::ESRCH))
}
