//! Millisecond clocks, truncated-counter reconstruction and the windowed
//! clock-offset estimator.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_msec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before the UNIX epoch")
        .as_millis() as u64
}

pub fn now_usec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before the UNIX epoch")
        .as_micros() as u64
}

/// Expands a 16-bit wire counter against a 64-bit center value. With
/// millisecond counters the window is about 32 seconds either way.
pub fn reconstruct_counter16(center_count: u64, sixteen_bits: u16) -> u64 {
    const IV_MSB: u64 = 1 << 16;
    const IV_MASK: u64 = IV_MSB - 1;

    let diff = sixteen_bits.wrapping_sub(center_count as u16) as i16;
    let sub = (IV_MSB >> 1).wrapping_sub(diff as u16 as u64) & IV_MSB;
    let add = (diff as i64 as u64) & IV_MSB;

    ((center_count & !IV_MASK) | sixteen_bits as u64)
        .wrapping_sub(sub)
        .wrapping_add(add)
}

/// Expands a 15-bit millisecond stamp against `center_count`, biased so that
/// arrivals from the recent past are preferred over ones from the near
/// future: the result lands within 8 seconds ahead and 24.768 seconds
/// behind the center.
pub fn reconstruct_msec(center_count: u64, fifteen_bits: u16) -> u64 {
    debug_assert_eq!(fifteen_bits & 0x8000, 0);
    const IV_MSB: u64 = 1 << 15;
    const IV_MASK: u64 = IV_MSB - 1;

    let center = center_count.wrapping_sub(1 << 14).wrapping_add(8000);
    let diff = fifteen_bits as i32 - (center & IV_MASK) as i32;
    let sub = (IV_MSB >> 1).wrapping_sub((diff & IV_MASK as i32) as u64) & IV_MSB;
    let add = (diff as i64 as u64) & IV_MSB;

    ((center & !IV_MASK) | fifteen_bits as u64)
        .wrapping_sub(sub)
        .wrapping_add(add)
}

const WIN_COUNT: usize = 2;
const WIN_MSEC: u64 = 20 * 1000;
const BACK_LIMIT_MSEC: u64 = WIN_MSEC * WIN_COUNT as u64;

#[derive(Debug, Clone, Copy, Default)]
struct Sample {
    first_msec: u64,
    remote_send_msec: u64,
    local_recv_msec: u64,
}

impl Sample {
    fn delta(&self) -> u64 {
        self.local_recv_msec.wrapping_sub(self.remote_send_msec)
    }
}

#[derive(Default)]
struct Ring {
    samples: [Sample; WIN_COUNT],
    write_index: usize,
}

/// Rolling minimum of observed one-way deltas `(localRecv - remoteSend)`,
/// kept in two 20-second buckets. The minimum over a window is a stable
/// estimate of (remote clock - local clock) under network jitter.
///
/// A bucket is active while its `first_msec` is non-zero; inserting into an
/// expired bucket toggles the write index and reseeds.
#[derive(Default)]
pub struct WindowedTimes {
    state: Mutex<Ring>,
}

impl WindowedTimes {
    pub fn new() -> WindowedTimes {
        WindowedTimes::default()
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        *state = Ring::default();
    }

    pub fn insert(&self, remote_send_msec: u64, local_recv_msec: u64) {
        let mut state = self.state.lock().unwrap();
        let delta = local_recv_msec.wrapping_sub(remote_send_msec);

        let index = state.write_index;
        let sample = &mut state.samples[index];
        if sample.first_msec == 0 {
            *sample = Sample {
                first_msec: local_recv_msec,
                remote_send_msec,
                local_recv_msec,
            };
            return;
        }

        if local_recv_msec.wrapping_sub(sample.first_msec) >= WIN_MSEC {
            state.write_index ^= 1;
            let index = state.write_index;
            state.samples[index] = Sample {
                first_msec: local_recv_msec,
                remote_send_msec,
                local_recv_msec,
            };
            return;
        }

        // signed comparison handles counter wraparound
        if sample.delta().wrapping_sub(delta) as i64 >= 0 {
            sample.remote_send_msec = remote_send_msec;
            sample.local_recv_msec = local_recv_msec;
        }
    }

    pub fn compute_delta(&self, now_msec: u64) -> u64 {
        let state = self.state.lock().unwrap();

        let sample = &state.samples[state.write_index];
        if sample.first_msec == 0 {
            return 0;
        }
        let mut delta = sample.delta();

        let other = &state.samples[state.write_index ^ 1];
        if other.first_msec == 0
            || now_msec.wrapping_sub(other.local_recv_msec) as i64 > BACK_LIMIT_MSEC as i64
        {
            return delta;
        }

        let other_delta = other.delta();
        if delta.wrapping_sub(other_delta) as i64 >= 0 {
            delta = other_delta;
        }
        delta
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::same_epoch(100_000, 100_005 & 0x7fff, 100_005)]
    #[case::slightly_behind(100_000, 99_900 & 0x7fff, 99_900)]
    #[case::far_behind(100_000, (100_000u64 - 24_000) & 0x7fff, 100_000 - 24_000)]
    #[case::ahead(100_000, 107_900 & 0x7fff, 107_900)]
    fn test_reconstruct_msec_cases(#[case] now: u64, #[case] wire: u64, #[case] expected: u64) {
        assert_eq!(reconstruct_msec(now, wire as u16), expected);
    }

    #[test]
    fn test_reconstruct_msec_window_property() {
        // exhaustive-ish sweep: for every wire value the result is the unique
        // expansion within [now - 24768, now + 8000] with matching low bits
        for now in [40_000u64, 1_234_567, 99_999_999, 0x7fff_0123] {
            for wire in (0u16..0x8000).step_by(61) {
                let r = reconstruct_msec(now, wire);
                assert_eq!(r & 0x7fff, wire as u64, "now={} wire={}", now, wire);
                assert!(r >= now - 24_768, "now={} wire={} r={}", now, wire, r);
                assert!(r <= now + 8_000, "now={} wire={} r={}", now, wire, r);
            }
        }
    }

    #[test]
    fn test_reconstruct_counter16_tracks_forward() {
        let mut center = 90_000u64;
        for step in [1u64, 50, 900, 20_000] {
            let remote = center + step;
            let expanded = reconstruct_counter16(center, remote as u16);
            assert_eq!(expanded, remote);
            center = expanded;
        }
    }

    #[test]
    fn test_reconstruct_counter16_reordered_datagram() {
        let center = 200_000u64;
        let late = center - 1_500;
        assert_eq!(reconstruct_counter16(center, late as u16), late);
    }

    #[test]
    fn test_windowed_times_minimum_within_single_window() {
        let times = WindowedTimes::new();
        let base = 100_000u64;
        for (at, delta) in [(0u64, 40u64), (1_000, 25), (2_000, 31), (3_000, 27)] {
            let local = base + at;
            times.insert(local - delta, local);
        }
        assert_eq!(times.compute_delta(base + 3_000), 25);
    }

    #[test]
    fn test_windowed_times_two_buckets() {
        let times = WindowedTimes::new();
        let base = 100_000u64;
        // first window: deltas 10, 4, 9 -> minimum 4 observed at +5s
        times.insert(base - 10, base);
        times.insert(base + 5_000 - 4, base + 5_000);
        times.insert(base + 15_000 - 9, base + 15_000);
        // 21s after the first sample: starts the second bucket with delta 7
        times.insert(base + 21_000 - 7, base + 21_000);

        // both buckets in range: overall minimum
        assert_eq!(times.compute_delta(base + 21_000), 4);
        // 40s later the first bucket's best sample (at +5s) has aged out
        assert_eq!(times.compute_delta(base + 61_000), 7);
    }

    #[test]
    fn test_windowed_times_empty() {
        let times = WindowedTimes::new();
        assert_eq!(times.compute_delta(123_456), 0);
        times.insert(100, 130);
        assert_eq!(times.compute_delta(200), 30);
        times.reset();
        assert_eq!(times.compute_delta(200), 0);
    }
}
