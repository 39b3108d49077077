//! Cgroup lifecycle tests.
//!
//! These exercise a real cgroup v1 hierarchy and therefore need root on a
//! host with the memory and cpuacct controllers (co-)mounted.
//!
//! ```bash
//! # Unit tests, no privileges:
//! cargo test -p judgebox-sandbox
//!
//! # Lifecycle tests, as root on a cgroup v1 host:
//! sudo cargo test -p judgebox-sandbox --test cgroup_tests -- --ignored
//! ```

mod common;

use judgebox_sandbox::{Cgroup, CgroupError, SpawnRequest};

use crate::common::{is_root, unique, wait_status, SANDBOX_GID, SANDBOX_UID};

#[test]
#[ignore]
fn create_is_idempotent() {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let name = unique("idempotent");

    let first = Cgroup::create(&name).expect("first create");
    assert!(Cgroup::exists(&name));

    let second = Cgroup::create(&name).expect("second create");
    assert_eq!(first.path(), second.path());
    assert!(Cgroup::exists(&name));

    second.destroy().expect("destroy");
    assert!(!Cgroup::exists(&name));
    assert!(!first.valid());
}

#[test]
#[ignore]
fn memory_limit_roundtrip() {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let group = Cgroup::create(&unique("memlimit")).expect("create");

    group.set_memory_limit(64 << 20).expect("set limit");
    assert_eq!(group.memory_limit(), 64 << 20);

    // Raising a finite limit must succeed too: with swap accounting this
    // only works when the memsw ceiling is widened before the memory
    // limit goes up.
    group.set_memory_limit(128 << 20).expect("raise limit");
    assert_eq!(group.memory_limit(), 128 << 20);

    group.set_memory_limit(32 << 20).expect("lower limit");
    assert_eq!(group.memory_limit(), 32 << 20);

    // Lifting the limit writes the -1 sentinel; the kernel reports a huge
    // number, not zero.
    group.set_memory_limit(-1).expect("lift limit");
    assert!(group.memory_limit() > 1 << 40);

    group.destroy().expect("destroy");
}

#[test]
#[ignore]
fn reset_usages_rearms_counters() {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let group = Cgroup::create(&unique("reset")).expect("create");

    let pid = group
        .spawn(&SpawnRequest::new(["/bin/true"], SANDBOX_UID, SANDBOX_GID))
        .expect("spawn");
    wait_status(pid);
    assert!(group.memory_usage() > 0);

    group.reset_usages().expect("reset");
    assert_eq!(group.memory_usage(), 0);
    assert_eq!(group.cpu_usage(), 0.0);

    group.destroy().expect("destroy");
}

#[test]
#[ignore]
fn killall_empties_a_full_group() {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let group = Cgroup::create(&unique("killall")).expect("create");

    // One spawned shell forks a pile of sleepers; all of them inherit the
    // cgroup and must die with it.
    let request = SpawnRequest::new(
        [
            "/bin/sh",
            "-c",
            "for i in 1 2 3 4 5 6 7 8 9 10; do sleep 1000 & done; sleep 1000",
        ],
        SANDBOX_UID,
        SANDBOX_GID,
    );
    let pid = group.spawn(&request).expect("spawn");

    // Give the shell a moment to fork its children.
    std::thread::sleep(std::time::Duration::from_millis(300));

    let kills = group.killall().expect("killall");
    assert!(kills >= 11, "expected >= 11 kills, got {kills}");
    assert!(group.get("tasks", 1 << 16).is_empty());

    wait_status(pid);
    group.destroy().expect("destroy");
}

#[test]
#[ignore]
fn destroy_removes_directory_with_tasks_running() {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let name = unique("destroy");
    let group = Cgroup::create(&name).expect("create");

    let pid = group
        .spawn(&SpawnRequest::new(
            ["/bin/sleep", "1000"],
            SANDBOX_UID,
            SANDBOX_GID,
        ))
        .expect("spawn");

    group.destroy().expect("destroy with live task");
    assert!(!Cgroup::exists(&name));
    wait_status(pid);
}

#[test]
#[ignore]
fn inherit_copies_parent_property() {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let group = Cgroup::create(&unique("inherit")).expect("create");

    // notify_on_release exists on every v1 hierarchy and is inheritable.
    group.inherit("notify_on_release").expect("inherit");
    assert!(!group.get("notify_on_release", 16).is_empty());

    group.destroy().expect("destroy");
}

#[test]
fn bad_name_is_rejected_without_root() {
    assert!(matches!(
        Cgroup::path_from_name("../escape"),
        Err(CgroupError::BadName(_))
    ));
}
