use std::sync::atomic::{Ordering, fence};
use thiserror::Error;

/// Size of the shared coverage map in bytes. Must stay a power of two and
/// match what the target's instrumentation was built against.
pub const MAP_SIZE: usize = 1 << 16;

/// Sentinel the child stores in the first four map bytes when the target
/// image could not be executed. Without it the parent cannot tell a failed
/// launch apart from a launch that produced no coverage.
pub const EXEC_FAIL_SIG: u32 = 0xfee1_dead;

/// Environment variable carrying the shared memory segment id to the child.
/// Instrumented targets attach to the segment named here.
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";

/// Errors raised while setting up the shared coverage channel.
///
/// Both variants indicate an unusable environment. Callers are expected to
/// abort with a diagnostic rather than retry.
#[derive(Error, Debug)]
pub enum CoverageChannelError {
    #[error("shmget() failed: {0}")]
    Allocate(std::io::Error),
    #[error("shmat() failed: {0}")]
    Attach(std::io::Error),
}

/// An anonymous System V shared memory segment of `MAP_SIZE` bytes, mapped
/// into this process and advertised to children through `SHM_ENV_VAR`.
///
/// The segment is removed when the value is dropped, on success and error
/// paths alike, so the kernel resource cannot leak past the process.
pub struct SharedCoverageMap {
    shm_id: libc::c_int,
    base: *mut u8,
}

impl SharedCoverageMap {
    /// Allocates and attaches the segment, then exports its id so a child
    /// spawned later can attach to the same memory.
    pub fn new() -> Result<Self, CoverageChannelError> {
        let shm_id = unsafe {
            libc::shmget(
                libc::IPC_PRIVATE,
                MAP_SIZE,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            )
        };
        if shm_id < 0 {
            return Err(CoverageChannelError::Allocate(
                std::io::Error::last_os_error(),
            ));
        }

        let base = unsafe { libc::shmat(shm_id, std::ptr::null(), 0) };
        if base as isize == -1 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::shmctl(shm_id, libc::IPC_RMID, std::ptr::null_mut());
            }
            return Err(CoverageChannelError::Attach(err));
        }

        // Children inherit the environment snapshot taken at spawn time, so
        // the id must be exported before any target command is assembled.
        unsafe {
            std::env::set_var(SHM_ENV_VAR, shm_id.to_string());
        }

        Ok(Self {
            shm_id,
            base: base as *mut u8,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base, MAP_SIZE) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base, MAP_SIZE) }
    }

    /// Zeroes the map ahead of one execution. The fence orders the reset
    /// before anything the child writes after the fork.
    pub fn reset_for_exec(&mut self) {
        unsafe {
            std::ptr::write_bytes(self.base, 0, MAP_SIZE);
        }
        fence(Ordering::SeqCst);
    }

    /// True when the launch-failure sentinel is present. Only meaningful
    /// after the child has been reaped and a fence has been issued.
    pub fn launch_failed(&self) -> bool {
        let raw = unsafe { std::ptr::read_volatile(self.base as *const u32) };
        raw == EXEC_FAIL_SIG
    }

    /// Stores the launch-failure sentinel. Called from the forked child
    /// after a failed exec; a single volatile store, safe at that point.
    pub(crate) fn write_launch_sentinel(&self) {
        unsafe {
            std::ptr::write_volatile(self.base as *mut u32, EXEC_FAIL_SIG);
        }
    }
}

impl Drop for SharedCoverageMap {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.base as *const libc::c_void);
            libc::shmctl(self.shm_id, libc::IPC_RMID, std::ptr::null_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_starts_usable_and_resets_to_zero() {
        let mut map = SharedCoverageMap::new().expect("shared map setup failed");
        assert_eq!(map.as_slice().len(), MAP_SIZE);

        map.as_mut_slice()[0] = 7;
        map.as_mut_slice()[MAP_SIZE - 1] = 9;
        map.reset_for_exec();
        assert!(map.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn sentinel_round_trips_through_the_map() {
        let mut map = SharedCoverageMap::new().expect("shared map setup failed");
        map.reset_for_exec();
        assert!(!map.launch_failed());

        map.write_launch_sentinel();
        assert!(map.launch_failed());

        map.reset_for_exec();
        assert!(!map.launch_failed());
    }

    #[test]
    fn segment_id_is_exported_for_children() {
        let _map = SharedCoverageMap::new().expect("shared map setup failed");
        let id: i32 = std::env::var(SHM_ENV_VAR)
            .expect("segment id missing from environment")
            .parse()
            .expect("segment id is not numeric");
        assert!(id >= 0);
    }
}
