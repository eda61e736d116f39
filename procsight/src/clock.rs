// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! Duration measurement for the timed interceptor classes (I/O, DNS).
//!
//! When the host advertises an invariant TSC, `rdtsc` is the tick source and
//! a one-shot calibration against `CLOCK_MONOTONIC` captures the tick rate.
//! Otherwise ticks are raw `CLOCK_MONOTONIC` nanoseconds. Absence of an
//! invariant TSC is reported by the caller, never fatal.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    tsc_invariant: bool,
    /// Ticks per microsecond; 1000 exactly when the source is the monotonic
    /// clock.
    ticks_per_us: u64,
}

fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        return 0;
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(target_arch = "x86_64")]
fn read_tsc() -> u64 {
    // SAFETY: rdtsc has no memory preconditions.
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(target_arch = "x86_64")]
fn tsc_is_invariant() -> bool {
    raw_cpuid::CpuId::new()
        .get_advanced_power_mgmt_info()
        .map_or(false, |info| info.has_invariant_tsc())
}

#[cfg(not(target_arch = "x86_64"))]
fn read_tsc() -> u64 {
    monotonic_ns()
}

#[cfg(not(target_arch = "x86_64"))]
fn tsc_is_invariant() -> bool {
    false
}

impl Clock {
    /// Probe and calibrate. Runs once from the load constructor; the spin is
    /// short enough (~200us) to be invisible at process start.
    pub fn init() -> Self {
        if !tsc_is_invariant() {
            return Self {
                tsc_invariant: false,
                ticks_per_us: 1_000,
            };
        }

        let wall_start = monotonic_ns();
        let tsc_start = read_tsc();
        loop {
            let elapsed = monotonic_ns().wrapping_sub(wall_start);
            if elapsed >= 200_000 {
                let ticks = read_tsc().wrapping_sub(tsc_start);
                let per_us = ticks * 1_000 / elapsed;
                if per_us == 0 {
                    break;
                }
                return Self {
                    tsc_invariant: true,
                    ticks_per_us: per_us,
                };
            }
            core::hint::spin_loop();
        }

        Self {
            tsc_invariant: false,
            ticks_per_us: 1_000,
        }
    }

    pub fn tsc_invariant(&self) -> bool {
        self.tsc_invariant
    }

    /// Current tick value. Interceptors capture this before a timed call.
    pub fn now(&self) -> u64 {
        if self.tsc_invariant {
            read_tsc()
        } else {
            monotonic_ns()
        }
    }

    /// Ticks elapsed since `start`, converted to nanoseconds.
    pub fn duration_ns(&self, start: u64) -> u64 {
        let elapsed = self.now().wrapping_sub(start);
        if self.tsc_invariant {
            elapsed.saturating_mul(1_000) / self.ticks_per_us
        } else {
            elapsed
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self {
            tsc_invariant: false,
            ticks_per_us: 1_000,
        }
    }
}

pub fn to_duration(ns: u64) -> Duration {
    Duration::from_nanos(ns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_advance() {
        let clock = Clock::init();
        let start = clock.now();
        std::thread::sleep(Duration::from_millis(2));
        let ns = clock.duration_ns(start);
        assert!(ns >= 1_000_000, "measured only {ns}ns");
        assert!(ns < 5_000_000_000, "implausible duration {ns}ns");
    }

    #[test]
    fn fallback_clock_is_nanoseconds() {
        let clock = Clock::default();
        let start = clock.now();
        std::thread::sleep(Duration::from_millis(1));
        assert!(clock.duration_ns(start) >= 500_000);
    }
}
