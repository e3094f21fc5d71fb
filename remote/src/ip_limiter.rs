use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

/// Sliding-window limiter keyed by client IP, guarding the HTTP surface.
/// Unlike the IPC limiter there is no block list; a denied request simply
/// waits for the window to slide.
pub struct IpRateLimiter {
    max_requests: u32,
    window: Duration,
    requests: Mutex<HashMap<String, Vec<Instant>>>,
}

impl IpRateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_allowed(&self, client_ip: &str) -> bool {
        let now = Instant::now();
        let mut requests = self.lock();
        let history = requests.entry(client_ip.to_string()).or_default();
        history.retain(|t| now.duration_since(*t) < self.window);
        if history.len() as u32 >= self.max_requests {
            return false;
        }
        history.push(now);
        true
    }

    pub fn remaining(&self, client_ip: &str) -> u32 {
        let now = Instant::now();
        let mut requests = self.lock();
        let Some(history) = requests.get_mut(client_ip) else {
            return self.max_requests;
        };
        history.retain(|t| now.duration_since(*t) < self.window);
        self.max_requests.saturating_sub(history.len() as u32)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Instant>>> {
        match self.requests.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for IpRateLimiter {
    fn default() -> Self {
        Self::new(60, Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_limit_per_ip() {
        let limiter = IpRateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.is_allowed("a"));
        assert!(limiter.is_allowed("a"));
        assert!(limiter.is_allowed("a"));
        assert!(!limiter.is_allowed("a"));
        // other IPs are unaffected
        assert!(limiter.is_allowed("b"));
    }

    #[test]
    fn remaining_counts_down() {
        let limiter = IpRateLimiter::new(2, Duration::from_secs(60));
        assert_eq!(limiter.remaining("a"), 2);
        limiter.is_allowed("a");
        assert_eq!(limiter.remaining("a"), 1);
        limiter.is_allowed("a");
        assert_eq!(limiter.remaining("a"), 0);
    }

    #[test]
    fn window_slides() {
        let limiter = IpRateLimiter::new(1, Duration::from_millis(30));
        assert!(limiter.is_allowed("a"));
        assert!(!limiter.is_allowed("a"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.is_allowed("a"));
    }
}
