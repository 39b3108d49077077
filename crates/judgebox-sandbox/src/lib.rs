//! judgebox-sandbox: cgroup-backed process confinement
//!
//! This crate launches a single untrusted command under a freshly
//! provisioned isolation envelope - the primitive behind a contest judge
//! or a per-request compute isolator. It combines:
//!
//! - **Cgroup v1 accounting and limits** - memory cap, peak memory and
//!   cpu-time readings, device whitelist, kill-everything teardown
//! - **Namespaces** - fresh PID, mount, UTS, IPC and NET namespaces per
//!   child
//! - **Filesystem layout** - ordered read-only bind mounts, chroot,
//!   size-capped tmpfs
//! - **Credentials and rlimits** - setresgid/setresuid drop, supplementary
//!   groups cleared, soft=hard resource limits
//!
//! The child never runs a user instruction before every limit is in
//! place: parent and child sequence provisioning over a private socketpair
//! handshake, and the pid is attached to the cgroup while the child is
//! still parked on its first receive.
//!
//! ## Quick Start
//!
//! ```ignore
//! use judgebox_sandbox::{Cgroup, SpawnRequest};
//!
//! let group = Cgroup::create("judge-42")?;
//! group.set_memory_limit(256 << 20)?;
//! group.limit_devices()?;
//!
//! let pid = group.spawn(&SpawnRequest::new(["/bin/true"], 1000, 1000))?;
//! // waitpid(pid) however the caller likes, then:
//! println!("cpu: {:.3}s, peak mem: {}", group.cpu_usage(), group.memory_usage());
//! group.destroy()?;
//! ```
//!
//! ## Requirements
//!
//! - Linux with a cgroup v1 hierarchy carrying the `memory` and `cpuacct`
//!   controllers (one is mounted privately when absent and permitted)
//! - Root, for namespace creation, mounts and credential switching

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod cgroup;
mod channel;
pub mod fs;
pub mod spawn;

pub use cgroup::{base_path, Cgroup, CgroupError};
pub use fs::{FsError, MountEntry};
pub use spawn::{SpawnError, SpawnRequest, Stage, BASE_CLONE_FLAGS};
