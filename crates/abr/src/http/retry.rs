use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConnectionInfo;
use crate::params::ParamDict;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadType {
    Mpd,
    MpdUpdate,
    Xlink,
    Segment,
    SegmentIndex,
    TimeSync,
}

impl LoadType {
    fn retry_budget(&self) -> RetryBudget {
        match self {
            LoadType::Mpd => RetryBudget {
                transport: 3,
                server: 2,
                missing: 0,
                base_backoff_ms: 500,
            },
            LoadType::MpdUpdate => RetryBudget {
                transport: 3,
                server: 2,
                missing: 2,
                base_backoff_ms: 500,
            },
            LoadType::Xlink => RetryBudget {
                transport: 1,
                server: 1,
                missing: 0,
                base_backoff_ms: 500,
            },
            LoadType::Segment | LoadType::SegmentIndex => RetryBudget {
                transport: 1,
                server: 1,
                missing: 0,
                base_backoff_ms: 250,
            },
            LoadType::TimeSync => RetryBudget {
                transport: 1,
                server: 0,
                missing: 0,
                base_backoff_ms: 500,
            },
        }
    }

    /// Connect and no-data timeouts. Segment transfers get the shortest, MPD loads the longest.
    pub fn timeouts(&self, options: &ParamDict) -> (Duration, Duration) {
        let (key, connect, no_data) = match self {
            LoadType::Mpd => ("mpd", 8000, 6000),
            LoadType::MpdUpdate | LoadType::Xlink | LoadType::TimeSync => ("mpd_update", 5000, 4000),
            LoadType::Segment | LoadType::SegmentIndex => ("segment", 4000, 2000),
        };
        let connect = options.get_i64_or(&format!("http.{key}.connect_timeout_ms"), connect);
        let no_data = options.get_i64_or(&format!("http.{key}.no_data_timeout_ms"), no_data);
        (
            Duration::from_millis(connect.max(0) as u64),
            Duration::from_millis(no_data.max(0) as u64),
        )
    }
}

struct RetryBudget {
    /// Retries on connection failure or timeout.
    transport: u32,
    /// Retries on 502/503/504.
    server: u32,
    /// Retries on 404/408/429.
    missing: u32,
    base_backoff_ms: i64,
}

/// Decides whether a failed load is retried.
///
/// `attempt` is the number of retries already made. Returns the delay in milliseconds before the
/// next attempt, or `-1` if the load must not be retried.
pub fn check_for_retry(load_type: LoadType, attempt: u32, info: &ConnectionInfo) -> i64 {
    let budget = load_type.retry_budget();
    let limit = match info.status {
        0 => budget.transport,
        502..=504 => budget.server,
        404 | 408 | 429 => budget.missing,
        _ => 0,
    };
    if attempt >= limit {
        return -1;
    }
    budget.base_backoff_ms << attempt.min(16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(status: u16) -> ConnectionInfo {
        ConnectionInfo {
            status,
            ..Default::default()
        }
    }

    #[test]
    fn test_mpd_transport_retries() {
        assert_eq!(check_for_retry(LoadType::Mpd, 0, &info(0)), 500);
        assert_eq!(check_for_retry(LoadType::Mpd, 1, &info(0)), 1000);
        assert_eq!(check_for_retry(LoadType::Mpd, 2, &info(0)), 2000);
        assert_eq!(check_for_retry(LoadType::Mpd, 3, &info(0)), -1);
    }

    #[test]
    fn test_status_sets() {
        assert_eq!(check_for_retry(LoadType::Mpd, 0, &info(503)), 500);
        assert_eq!(check_for_retry(LoadType::Mpd, 2, &info(503)), -1);
        assert_eq!(check_for_retry(LoadType::Mpd, 0, &info(404)), -1);
        assert_eq!(check_for_retry(LoadType::MpdUpdate, 0, &info(404)), 500);
        assert_eq!(check_for_retry(LoadType::MpdUpdate, 1, &info(429)), 1000);
        assert_eq!(check_for_retry(LoadType::MpdUpdate, 2, &info(408)), -1);
        assert_eq!(check_for_retry(LoadType::Mpd, 0, &info(403)), -1);
    }

    #[test]
    fn test_segment_backoff_is_shorter() {
        assert_eq!(check_for_retry(LoadType::Segment, 0, &info(0)), 250);
        assert_eq!(check_for_retry(LoadType::Segment, 1, &info(0)), -1);
        assert_eq!(check_for_retry(LoadType::Segment, 0, &info(504)), 250);
    }

    #[test]
    fn test_backoff_strictly_increases() {
        for load_type in [LoadType::Mpd, LoadType::MpdUpdate] {
            let mut previous = 0;
            let mut attempt = 0;
            loop {
                let delay = check_for_retry(load_type, attempt, &info(0));
                if delay < 0 {
                    break;
                }
                assert!(delay > previous);
                previous = delay;
                attempt += 1;
            }
            assert_eq!(attempt, 3);
        }
    }
}
