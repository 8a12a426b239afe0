use std::any::Any;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::Networks;

/// Cooperative cancellation flag shared between a worker and whoever stops it.
///
/// There is no interrupt: long waits poll this flag between bounded sleep steps.
#[derive(Debug, Clone)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    pub fn new(active: bool) -> Self {
        Self(Arc::new(AtomicBool::new(active)))
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn lower(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Sleeps for `total` in steps of at most `poll`, checking `is_cancelled`
/// before every step and once more at the end.
///
/// Returns `true` when the wait ended because of cancellation.
pub async fn sleep_cancellable<C>(total: Duration, poll: Duration, is_cancelled: C) -> bool
where
    C: Fn() -> bool,
{
    let poll = if poll.is_zero() { total } else { poll };
    let mut remaining = total;
    loop {
        if is_cancelled() {
            return true;
        }
        if remaining.is_zero() {
            return false;
        }
        let step = remaining.min(poll);
        tokio::time::sleep(step).await;
        remaining -= step;
    }
}

/// Non-loopback addresses currently assigned to any interface.
pub fn collect_local_addresses() -> Vec<String> {
    let mut addresses = Vec::new();
    let networks = Networks::new_with_refreshed_list();

    for (_if_name, network_data) in networks.iter() {
        for ip_network in network_data.ip_networks() {
            let ip_addr = ip_network.addr;
            if ip_addr.is_loopback() || ip_addr.is_unspecified() || ip_addr.is_multicast() {
                continue;
            }
            if let IpAddr::V6(v6) = ip_addr {
                // fe80::/10 is present on every up interface, even without a network.
                if v6.segments()[0] & 0xffc0 == 0xfe80 {
                    continue;
                }
            }
            addresses.push(ip_addr.to_string());
        }
    }
    addresses.sort_unstable();
    addresses.dedup();
    addresses
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown fault".to_string()
    }
}

/// `HH:MM:SS`; hours are not wrapped at 24.
pub fn format_uptime(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    format!("{hours:02}:{minutes:02}:{secs:02}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::time::Instant;

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(0), "00:00:00");
        assert_eq!(format_uptime(3661), "01:01:01");
        assert_eq!(format_uptime(90_000), "25:00:00");
    }

    #[test]
    fn test_panic_message() {
        let caught = std::panic::catch_unwind(|| panic!("static text")).unwrap_err();
        assert_eq!(panic_message(&*caught), "static text");
        let caught = std::panic::catch_unwind(|| panic!("formatted {}", 42)).unwrap_err();
        assert_eq!(panic_message(&*caught), "formatted 42");
        let caught = std::panic::catch_unwind(|| std::panic::panic_any(7_u8)).unwrap_err();
        assert_eq!(panic_message(&*caught), "unknown fault");
    }

    #[test]
    fn test_run_flag_shared_between_clones() {
        let flag = RunFlag::new(true);
        let other = flag.clone();
        other.lower();
        assert!(!flag.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_runs_to_completion() {
        let start = Instant::now();
        let early = sleep_cancellable(Duration::from_secs(95), Duration::from_secs(30), || false).await;
        assert!(!early);
        assert_eq!(start.elapsed(), Duration::from_secs(95));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_exits_within_one_step() {
        let checks = AtomicU32::new(0);
        let start = Instant::now();
        let early = sleep_cancellable(Duration::from_secs(600), Duration::from_secs(10), || {
            // Cancel on the third check, i.e. after two full steps.
            checks.fetch_add(1, Ordering::SeqCst) >= 2
        })
        .await;
        assert!(early);
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_already_cancelled_returns_immediately() {
        let start = Instant::now();
        assert!(sleep_cancellable(Duration::from_secs(60), Duration::from_secs(5), || true).await);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_poll_does_not_spin() {
        let start = Instant::now();
        assert!(!sleep_cancellable(Duration::from_secs(7), Duration::ZERO, || false).await);
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }
}
