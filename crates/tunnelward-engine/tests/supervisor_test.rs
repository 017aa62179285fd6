//! Supervisor tests against real processes
//!
//! The tunnel client is replaced by a shell script that idles until killed.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tunnelward_engine::config::Layout;
use tunnelward_engine::process::{
    find_client_processes, process_exists, read_pid_file, write_pid_file,
};
use tunnelward_engine::{EngineError, RuleSetKind, SupervisorConfig, TunnelState, TunnelSupervisor};

const FAKE_CLIENT: &str = r#"#!/bin/sh
echo "fake client started: $@"
while :; do sleep 1; done
"#;

const STUBBORN_CLIENT: &str = r#"#!/bin/sh
trap '' TERM
echo "stubborn client started: $@"
while :; do sleep 1; done
"#;

fn install_script(dir: &Path, script: &str) -> PathBuf {
    let bin_dir = dir.join("bin");
    std::fs::create_dir_all(&bin_dir).unwrap();
    let path = bin_dir.join("frpc");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn setup(kind: RuleSetKind, script: &str) -> (TempDir, SupervisorConfig) {
    let temp = TempDir::new().unwrap();
    let binary = install_script(temp.path(), script);
    let layout = Layout::new(temp.path());

    let config = SupervisorConfig {
        kind,
        binary_paths: vec![temp.path().join("missing-frpc"), binary],
        config_path: layout.generated_config(kind),
        pid_path: layout.pid_file(kind),
        log_path: layout.log_file(kind),
        stop_timeout: Duration::from_millis(500),
        restart_pause: Duration::from_millis(50),
        sweep_strays: kind == RuleSetKind::Temporary,
    };
    std::fs::write(&config.config_path, "remotePort = 30022\n").unwrap();

    (temp, config)
}

fn live_clients(config: &SupervisorConfig) -> Vec<u32> {
    find_client_processes(&config.config_path)
}

#[tokio::test]
async fn test_start_and_stop() {
    let (_temp, config) = setup(RuleSetKind::Main, FAKE_CLIENT);
    let supervisor = TunnelSupervisor::new(config.clone());

    let pid = supervisor.start().await.unwrap();
    assert!(process_exists(pid));
    assert!(supervisor.is_running().await);
    assert_eq!(supervisor.state().await, TunnelState::Running);
    assert_eq!(read_pid_file(&config.pid_path).unwrap(), Some(pid));

    // output goes to the tunnel's log file
    tokio::time::sleep(Duration::from_millis(200)).await;
    let log = std::fs::read_to_string(&config.log_path).unwrap();
    assert!(log.contains("fake client started: -c"));
    assert!(log.contains("frpc.toml"));

    supervisor.stop().await.unwrap();
    assert!(!process_exists(pid));
    assert!(!supervisor.is_running().await);
    assert_eq!(supervisor.state().await, TunnelState::Stopped);
    assert!(!config.pid_path.exists());
}

#[tokio::test]
async fn test_start_is_noop_when_running() {
    let (_temp, config) = setup(RuleSetKind::Main, FAKE_CLIENT);
    let supervisor = TunnelSupervisor::new(config.clone());

    let first = supervisor.start().await.unwrap();
    let second = supervisor.start().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(live_clients(&config), vec![first]);

    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn test_start_without_config() {
    let (_temp, config) = setup(RuleSetKind::Main, FAKE_CLIENT);
    std::fs::remove_file(&config.config_path).unwrap();
    let supervisor = TunnelSupervisor::new(config);

    let result = supervisor.start().await;
    assert!(matches!(result, Err(EngineError::ConfigMissing(_))));
    assert_eq!(supervisor.state().await, TunnelState::Stopped);
}

#[tokio::test]
async fn test_stop_after_external_kill() {
    let (_temp, config) = setup(RuleSetKind::Main, FAKE_CLIENT);
    let supervisor = TunnelSupervisor::new(config.clone());

    let pid = supervisor.start().await.unwrap();
    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());
    tokio::time::sleep(Duration::from_millis(200)).await;

    supervisor.stop().await.unwrap();
    supervisor.stop().await.unwrap();
    assert!(!config.pid_path.exists());
}

#[tokio::test]
async fn test_stubborn_client_is_killed() {
    let (_temp, config) = setup(RuleSetKind::Main, STUBBORN_CLIENT);
    let supervisor = TunnelSupervisor::new(config);

    let pid = supervisor.start().await.unwrap();
    // let the trap install before signalling
    tokio::time::sleep(Duration::from_millis(200)).await;

    supervisor.stop().await.unwrap();
    assert!(!process_exists(pid));
}

#[tokio::test]
async fn test_pid_file_survives_supervisor_instance() {
    let (_temp, config) = setup(RuleSetKind::Temporary, FAKE_CLIENT);

    let pid = {
        let first = TunnelSupervisor::new(config.clone());
        first.start().await.unwrap()
    };

    // a fresh instance finds the client through the PID file alone
    let second = TunnelSupervisor::new(config.clone());
    assert_eq!(second.adopt().await.unwrap(), Some(pid));
    assert!(second.is_running().await);

    second.stop().await.unwrap();
    assert!(!process_exists(pid));
    assert!(!config.pid_path.exists());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_temporary_stop_sweeps_strays() {
    let (temp, config) = setup(RuleSetKind::Temporary, FAKE_CLIENT);

    // a client nobody recorded, e.g. left over from a crashed engine
    let mut stray = std::process::Command::new(temp.path().join("bin").join("frpc"))
        .arg("-c")
        .arg(&config.config_path)
        .stdout(std::process::Stdio::null())
        .spawn()
        .unwrap();
    // merely mentions the config, e.g. someone paging through it
    let mut reader = std::process::Command::new("sh")
        .arg("-c")
        .arg(format!("sleep 30; : {}", config.config_path.display()))
        .spawn()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(live_clients(&config).contains(&stray.id()));
    assert!(!live_clients(&config).contains(&reader.id()));

    let supervisor = TunnelSupervisor::new(config.clone());
    assert!(!supervisor.is_running().await);
    supervisor.stop().await.unwrap();

    let status = stray.wait().unwrap();
    assert!(!status.success());
    assert!(live_clients(&config).is_empty());
    assert!(reader.try_wait().unwrap().is_none());

    reader.kill().unwrap();
    reader.wait().unwrap();
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_pid_file_of_unrelated_process_is_ignored() {
    let (_temp, config) = setup(RuleSetKind::Main, FAKE_CLIENT);

    let mut unrelated = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    write_pid_file(&config.pid_path, unrelated.id()).unwrap();

    let supervisor = TunnelSupervisor::new(config.clone());
    let pid = supervisor.start().await.unwrap();
    assert_ne!(pid, unrelated.id());
    assert_eq!(live_clients(&config), vec![pid]);

    supervisor.stop().await.unwrap();
    assert!(!process_exists(pid));
    assert!(unrelated.try_wait().unwrap().is_none());

    unrelated.kill().unwrap();
    unrelated.wait().unwrap();
}

#[tokio::test]
async fn test_cleanup_removes_artifacts() {
    let (temp, config) = setup(RuleSetKind::Temporary, FAKE_CLIENT);
    let visitor_code = temp.path().join("visitor_code");
    std::fs::write(&visitor_code, "VX-1").unwrap();

    let supervisor = TunnelSupervisor::new(config.clone());
    let pid = supervisor.start().await.unwrap();

    supervisor.cleanup(&[visitor_code.clone()]).await.unwrap();
    assert!(!process_exists(pid));
    assert!(!config.config_path.exists());
    assert!(!config.pid_path.exists());
    assert!(!visitor_code.exists());

    // nothing left to clean is still fine
    supervisor.cleanup(&[visitor_code]).await.unwrap();
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_concurrent_restarts_leave_one_client() {
    let (_temp, config) = setup(RuleSetKind::Main, FAKE_CLIENT);
    let supervisor = Arc::new(TunnelSupervisor::new(config.clone()));
    supervisor.start().await.unwrap();

    let a = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.restart().await }
    });
    let b = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.restart().await }
    });
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let running = live_clients(&config);
    assert_eq!(running.len(), 1, "expected exactly one client: {:?}", running);
    assert_eq!(supervisor.pid().await, Some(running[0]));

    supervisor.stop().await.unwrap();
    assert!(live_clients(&config).is_empty());
}
