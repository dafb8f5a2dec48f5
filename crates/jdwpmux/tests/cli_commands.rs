#![cfg(feature = "cli")]

use std::net::SocketAddr;
use std::process::{Command, Output};

use jdwpmux_session::testing::{FakeVm, FakeVmConfig};
use jdwpmux_transport::TcpEndpoint;
use tokio::runtime::Runtime;

/// A TCP listener serving a fresh fake VM per connection. The VMs live as
/// long as the returned runtime.
fn fake_vm_server(config: FakeVmConfig) -> (Runtime, SocketAddr) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("runtime should build");
    let endpoint = runtime
        .block_on(TcpEndpoint::bind(TcpEndpoint::LOOPBACK_ANY))
        .expect("listener should bind");
    let addr = endpoint.local_addr();
    runtime.spawn(async move {
        let mut vms = Vec::new();
        while let Ok((stream, _)) = endpoint.accept().await {
            vms.push(FakeVm::spawn(stream, config.clone()));
        }
    });
    (runtime, addr)
}

/// An address nothing listens on.
fn closed_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind should work");
    let addr = listener.local_addr().expect("listener has an address");
    drop(listener);
    addr
}

fn jdwpmux(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_jdwpmux"))
        .args(["--log-level", "error"])
        .args(args)
        .output()
        .expect("jdwpmux should run")
}

#[test]
fn version_prints_package_version() {
    let output = jdwpmux(&["version"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn info_reports_collected_properties_as_json() {
    let (_runtime, addr) = fake_vm_server(FakeVmConfig {
        wait_after_helo: true,
        ..FakeVmConfig::default()
    });
    let addr = addr.to_string();
    let output = jdwpmux(&["--format", "json", "info", &addr, "--pid", "1234"]);

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"name\":\"com.example.app\""));
    assert!(stdout.contains("\"vm_identifier\":\"FakeVM 1.0\""));
    assert!(stdout.contains("\"is_waiting_for_debugger\":true"));
}

#[test]
fn gc_succeeds_against_vm() {
    let (_runtime, addr) = fake_vm_server(FakeVmConfig::default());
    let addr = addr.to_string();
    let output = jdwpmux(&["--format", "json", "gc", &addr, "--api-level", "30"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"requested\":true"));
}

#[test]
fn gc_reports_ddms_failure() {
    let (_runtime, addr) = fake_vm_server(FakeVmConfig {
        fail_chunks: vec![jdwpmux_frame::ChunkType::Hpgc],
        ..FakeVmConfig::default()
    });
    let addr = addr.to_string();
    let output = jdwpmux(&["gc", &addr]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("command rejected"));
}

#[test]
fn monitor_prints_requested_packet_count() {
    let (_runtime, addr) = fake_vm_server(FakeVmConfig::default());
    let addr = addr.to_string();
    let output = jdwpmux(&[
        "--format",
        "json",
        "monitor",
        &addr,
        "--send-helo",
        "--count",
        "1",
    ]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.lines().count(), 1);
    assert!(stdout.contains("\"kind\":\"reply\""));
}

#[test]
fn refused_connection_exits_unavailable() {
    let addr = closed_addr().to_string();
    assert_eq!(jdwpmux(&["gc", &addr]).status.code(), Some(69));
    assert_eq!(jdwpmux(&["info", &addr]).status.code(), Some(69));
}

#[test]
fn invalid_duration_exits_usage() {
    let output = jdwpmux(&["info", "127.0.0.1:1", "--timeout", "0s"]);
    assert_eq!(output.status.code(), Some(64));
}
