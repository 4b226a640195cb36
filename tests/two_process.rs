//! Cross-process tests: the real `tandem` binary as owner and peer.
//!
//! Every test uses its own prefix so runs never see each other's names. When
//! the host forbids POSIX IPC the owner exits with a setup failure and the
//! test is skipped.
//!
//! To see the participants' logs:
//! ```bash
//! RUST_LOG=tandem=debug cargo test --test two_process -- --nocapture
//! ```

use std::process::{Child, Command, Output, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use tandem::{Config, Role, Session, Shutdown, TandemError, stale};

const EXIT_INTERRUPTED: i32 = 1;
const EXIT_NOT_FOUND: i32 = 3;
const EXIT_SETUP: i32 = 4;

fn unique_prefix(test: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "tandem-it-{}-{}-{}",
        std::process::id(),
        test,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn config_for(prefix: &str) -> Config {
    Config {
        key_path: env!("CARGO_MANIFEST_DIR").into(),
        prefix: prefix.to_string(),
        ..Config::default()
    }
}

fn tandem(prefix: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_tandem"));
    cmd.args(["--prefix", prefix, "--key-path", env!("CARGO_MANIFEST_DIR")])
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

fn spawn_owner(prefix: &str, args: &[&str]) -> Child {
    let mut cmd = tandem(prefix, args);
    cmd.arg("owner");
    cmd.spawn().expect("spawn owner")
}

/// Waits until the owner's resources exist. `false` if the owner exited first.
fn wait_for_owner(owner: &mut Child, config: &Config) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if owner.try_wait().expect("poll owner").is_some() {
            return false;
        }
        if stale::inspect(config).map(|r| r.len() == 6).unwrap_or(false) {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("owner never created its resources");
}

fn skip_if_unsupported(output: &Output) -> bool {
    if output.status.code() == Some(EXIT_SETUP) {
        eprintln!(
            "Skipping: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return true;
    }
    false
}

#[test]
fn owner_and_peer_processes_agree() {
    let prefix = unique_prefix("agree");
    let config = config_for(&prefix);
    let mut owner = spawn_owner(&prefix, &["--quota", "50000"]);

    if !wait_for_owner(&mut owner, &config) {
        let output = owner.wait_with_output().expect("owner output");
        assert!(skip_if_unsupported(&output), "owner failed: {output:?}");
        return;
    }

    let peer = tandem(&prefix, &["--quota", "50000", "peer"])
        .output()
        .expect("run peer");
    let owner = owner.wait_with_output().expect("owner output");

    for (role, output) in [("owner", &owner), ("peer", &peer)] {
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(output.status.success(), "{role} failed: {output:?}");
        assert!(
            stdout.contains(&format!(
                "{role} reports final counter value =     100000 Expecting:     100000 CORRECT"
            )),
            "{role} stdout: {stdout}"
        );
    }
    assert!(stale::inspect(&config).unwrap().is_empty());
}

#[test]
fn sigterm_releases_a_blocked_owner() {
    let prefix = unique_prefix("sigterm");
    let config = config_for(&prefix);
    let mut owner = spawn_owner(&prefix, &[]);

    if !wait_for_owner(&mut owner, &config) {
        let output = owner.wait_with_output().expect("owner output");
        assert!(skip_if_unsupported(&output), "owner failed: {output:?}");
        return;
    }
    // let it get from creation into the ready wait
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    kill(Pid::from_raw(owner.id() as i32), Signal::SIGTERM).expect("send SIGTERM");
    let output = owner.wait_with_output().expect("owner output");

    assert_eq!(output.status.code(), Some(EXIT_INTERRUPTED), "{output:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(
        String::from_utf8_lossy(&output.stderr).contains("interrupted"),
        "{output:?}"
    );
    assert!(stale::inspect(&config).unwrap().is_empty());
}

#[test]
fn sigterm_releases_a_peer_waiting_for_owner_done() {
    let prefix = unique_prefix("peerdone");
    let config = Config {
        quota: 1_000,
        ..config_for(&prefix)
    };
    let flag = AtomicBool::new(false);

    // the owner runs in-process and stops before its done gate
    let mut owner = match Session::establish_owner(config.clone(), Shutdown::from_flag(&flag)) {
        Ok(owner) => owner,
        Err(err @ TandemError::SetupFailure { .. }) => {
            eprintln!("Skipping: {err}");
            return;
        }
        Err(err) => panic!("establish owner: {err}"),
    };
    let mut peer = tandem(&prefix, &["--quota", "1000", "peer"])
        .spawn()
        .expect("spawn peer");

    owner.announce().expect("announce");
    owner.await_peer_ready().expect("peer ready");
    owner.run_counter_phase().expect("owner increments");

    let deadline = Instant::now() + Duration::from_secs(10);
    while !owner.segment().expect("mapped").is_done(Role::Peer) {
        assert!(
            peer.try_wait().expect("poll peer").is_none(),
            "peer exited before reaching its done gate"
        );
        assert!(Instant::now() < deadline, "peer never finished counting");
        thread::sleep(Duration::from_millis(10));
    }
    // peer_done is set just before the peer blocks on owner_done
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    kill(Pid::from_raw(peer.id() as i32), Signal::SIGTERM).expect("send SIGTERM");
    let output = peer.wait_with_output().expect("peer output");

    assert_eq!(output.status.code(), Some(EXIT_INTERRUPTED), "{output:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(
        String::from_utf8_lossy(&output.stderr).contains("interrupted during counter phase"),
        "{output:?}"
    );

    // the peer never unlinks: every name is still there until the owner goes
    assert_eq!(stale::inspect(&config).unwrap().len(), 6);
    drop(owner);
    assert!(stale::inspect(&config).unwrap().is_empty());
}

#[test]
fn peer_without_owner_is_not_found() {
    let prefix = unique_prefix("noowner");
    let output = tandem(&prefix, &["--attach-timeout-ms", "0", "peer"])
        .output()
        .expect("run peer");

    if skip_if_unsupported(&output) {
        return;
    }
    assert_eq!(output.status.code(), Some(EXIT_NOT_FOUND), "{output:?}");
    assert!(String::from_utf8_lossy(&output.stderr).contains("not found"));
}

#[test]
fn purge_clears_what_status_reports() {
    let prefix = unique_prefix("purge");
    let config = config_for(&prefix);
    let mut owner = spawn_owner(&prefix, &[]);

    if !wait_for_owner(&mut owner, &config) {
        let output = owner.wait_with_output().expect("owner output");
        assert!(skip_if_unsupported(&output), "owner failed: {output:?}");
        return;
    }
    // SIGKILL skips every cleanup path
    owner.kill().expect("kill owner");
    owner.wait().expect("reap owner");

    let status = tandem(&prefix, &["status"]).output().expect("status");
    let listed = String::from_utf8_lossy(&status.stdout);
    assert_eq!(listed.lines().count(), 6, "{listed}");

    let second = tandem(&prefix, &["owner"]).output().expect("second owner");
    assert_eq!(second.status.code(), Some(2), "{second:?}");

    let purge = tandem(&prefix, &["purge"]).output().expect("purge");
    assert!(purge.status.success());
    assert!(String::from_utf8_lossy(&purge.stdout).contains("6 resource(s) removed"));
    assert!(stale::inspect(&config).unwrap().is_empty());
}
