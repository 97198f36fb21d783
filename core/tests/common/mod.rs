//! Helpers shared by the integration tests.
#![allow(dead_code)]

use aoti_container::{ProxyCall, ProxyError, ProxyExecutor};
use parking_lot::{Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Proxy executor that parks each call until the test hands out a permit.
#[derive(Default)]
pub struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Default)]
struct GateState {
    active: usize,
    peak: usize,
    permits: usize,
}

impl Gate {
    pub fn release(&self, permits: usize) {
        self.state.lock().permits += permits;
        self.changed.notify_all();
    }

    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    pub fn peak(&self) -> usize {
        self.state.lock().peak
    }

    pub fn wait_for_active(&self, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut state = self.state.lock();
        while state.active != n {
            assert!(
                !self.changed.wait_until(&mut state, deadline).timed_out(),
                "timed out waiting for {} active runs, saw {}",
                n,
                state.active
            );
        }
    }
}

impl ProxyExecutor for Gate {
    fn call_function(&self, _call: &mut ProxyCall<'_, '_>) -> Result<(), ProxyError> {
        let mut state = self.state.lock();
        state.active += 1;
        state.peak = state.peak.max(state.active);
        self.changed.notify_all();
        while state.permits == 0 {
            self.changed.wait(&mut state);
        }
        state.permits -= 1;
        state.active -= 1;
        self.changed.notify_all();
        Ok(())
    }
}

pub fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}
