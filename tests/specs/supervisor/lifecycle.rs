//! Full-process lifecycle: boot to ready, serve a client, shut down.

use crate::prelude::*;
use reef_supervisor::protocol::{encode_startup_packet, ConnectKind, StartupPacket};
use serial_test::serial;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::process::Stdio;
use std::time::Duration;
use tempfile::tempdir;

const READY_DEADLINE: Duration = Duration::from_secs(15);

fn write_server_config(datadir: &std::path::Path, sockdir: &std::path::Path) {
    std::fs::write(
        datadir.join("reef.toml"),
        format!(
            "listen_addresses = []\n\
             unix_socket_directories = [{:?}]\n\
             max_sessions = 5\n\
             shared_buffer_pages = 4\n\
             wal_buffer_pages = 2\n",
            sockdir.display().to_string()
        ),
    )
    .unwrap();
}

fn pidfile_status(datadir: &std::path::Path) -> Option<String> {
    let content = std::fs::read_to_string(datadir.join("reef.pid")).ok()?;
    content.lines().last().map(str::to_string)
}

#[test]
#[serial]
fn boot_serve_a_client_and_shut_down_fast() {
    let datadir = tempdir().unwrap();
    if is_root() {
        reefd()
            .args(&["supervise"])
            .data_dir(datadir.path())
            .exits(2)
            .stderr_has("root");
        return;
    }

    bootstrap(datadir.path());
    let sockdir = tempdir().unwrap();
    write_server_config(datadir.path(), sockdir.path());

    let log = std::fs::File::create(datadir.path().join("supervise.err")).unwrap();
    let mut server = std::process::Command::new(reefd_path())
        .arg("-D")
        .arg(datadir.path())
        .arg("supervise")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(log)
        .spawn()
        .unwrap();

    // Pidfile status walks starting -> ready once Startup finishes.
    wait_for("pidfile status ready", READY_DEADLINE, || {
        pidfile_status(datadir.path()).as_deref() == Some("ready")
    });

    let pid_content = std::fs::read_to_string(datadir.path().join("reef.pid")).unwrap();
    assert_eq!(
        pid_content.lines().next().unwrap(),
        server.id().to_string(),
        "pidfile names the supervisor"
    );
    assert!(datadir.path().join("global/reef.seg").exists());

    // A client is admitted and served by a session worker.
    let socket_path = sockdir.path().join(".s.reef.5470");
    let mut client = UnixStream::connect(&socket_path).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    client
        .write_all(&encode_startup_packet(StartupPacket::Connect {
            kind: ConnectKind::Session,
        }))
        .unwrap();
    client.write_all(b"select 1\n").unwrap();

    let mut reply = String::new();
    BufReader::new(client.try_clone().unwrap())
        .read_line(&mut reply)
        .unwrap();
    assert!(
        reply.contains("ERROR: session worker built without a query engine"),
        "unexpected session reply: {reply:?}"
    );
    drop(client);

    // SIGINT is the fast-shutdown request.
    assert!(std::process::Command::new("kill")
        .args(["-2", &server.id().to_string()])
        .status()
        .unwrap()
        .success());

    wait_for("supervisor exit", READY_DEADLINE, || {
        server.try_wait().unwrap().is_some()
    });
    let status = server.wait().unwrap();
    assert_eq!(status.code(), Some(0), "fast shutdown exits cleanly");

    // Ordered cleanup: socket files and pidfile are gone.
    assert!(!socket_path.exists(), "socket file left behind");
    assert!(
        !sockdir.path().join(".s.reef.5470.lock").exists(),
        "socket lock file left behind"
    );
    assert!(
        !datadir.path().join("reef.pid").exists(),
        "pidfile left behind"
    );
    assert!(
        !datadir.path().join("global/reef.seg").exists(),
        "shared segment left behind"
    );

    // The shutdown checkpoint marked the cluster cleanly shut down.
    let control = std::fs::read_to_string(datadir.path().join("global/control.json")).unwrap();
    assert!(control.contains("shut_down"), "{control}");
}

#[test]
#[serial]
fn smart_shutdown_rejects_new_clients_and_drains_sessions() {
    if is_root() {
        return;
    }
    let datadir = tempdir().unwrap();
    bootstrap(datadir.path());
    let sockdir = tempdir().unwrap();
    write_server_config(datadir.path(), sockdir.path());

    let log = std::fs::File::create(datadir.path().join("supervise.err")).unwrap();
    let mut server = std::process::Command::new(reefd_path())
        .arg("-D")
        .arg(datadir.path())
        .arg("supervise")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(log)
        .spawn()
        .unwrap();

    wait_for("pidfile status ready", READY_DEADLINE, || {
        pidfile_status(datadir.path()).as_deref() == Some("ready")
    });

    // Hold one session open so the smart shutdown has something to drain.
    let socket_path = sockdir.path().join(".s.reef.5470");
    let mut held = UnixStream::connect(&socket_path).unwrap();
    held.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    held.write_all(&encode_startup_packet(StartupPacket::Connect {
        kind: ConnectKind::Session,
    }))
    .unwrap();
    held.write_all(b"ping\n").unwrap();
    let mut reply = String::new();
    BufReader::new(held.try_clone().unwrap())
        .read_line(&mut reply)
        .unwrap();
    assert!(reply.starts_with("ERROR:"), "session not serving: {reply:?}");

    // Smart shutdown: existing sessions drain, new ones are refused.
    assert!(std::process::Command::new("kill")
        .args(["-15", &server.id().to_string()])
        .status()
        .unwrap()
        .success());
    wait_for("pidfile status stopping", READY_DEADLINE, || {
        pidfile_status(datadir.path()).as_deref() == Some("stopping")
    });

    let mut rejected = UnixStream::connect(&socket_path).unwrap();
    rejected
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    rejected
        .write_all(&encode_startup_packet(StartupPacket::Connect {
            kind: ConnectKind::Session,
        }))
        .unwrap();
    let mut rejection = String::new();
    BufReader::new(rejected).read_line(&mut rejection).unwrap();
    assert!(
        rejection.contains("ERROR: the database system is shutting down"),
        "unexpected rejection: {rejection:?}"
    );

    // Releasing the held session lets the drain finish.
    drop(held);
    wait_for("supervisor exit", READY_DEADLINE, || {
        server.try_wait().unwrap().is_some()
    });
    assert_eq!(server.wait().unwrap().code(), Some(0));
}
