//! Heuristic classification of authentication failure messages.
use rand::Rng;
use std::fmt;
use std::time::Duration;

/// Phrases suggesting the portal is actively refusing this client.
const BLACKLISTED_KEYWORDS: &[&str] = &[
    "authentication fail",
    "rejected",
    "access denied",
    "forbidden",
    "blocked",
    "banned",
    "locked",
    "认证失败",
    "被拒绝",
    "拉黑",
    "访问受限",
    "账号受限",
    "账号已停用",
];

const RATE_LIMITED_KEYWORDS: &[&str] = &[
    "too many requests",
    "rate limit",
    "timeout",
    "connection reset",
    "频率限制",
    "请求过于频繁",
    "超时",
];

const NETWORK_ERROR_KEYWORDS: &[&str] = &[
    "network error",
    "connection failed",
    "dns",
    "unreachable",
    "网络错误",
    "连接失败",
    "无法访问",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    Blacklisted,
    RateLimited,
    NetworkError,
    Unknown,
}

/// How long to hold off before the next attempt after a failure of a given category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// `base` plus a uniformly drawn jitter in `0..=max_jitter`.
    Fixed { base: Duration, max_jitter: Duration },
    /// Defer to the retry engine's exponential schedule.
    Standard,
}

impl BackoffPolicy {
    /// Returns `None` for the standard policy.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Duration> {
        match *self {
            BackoffPolicy::Fixed { base, max_jitter } => {
                let jitter_secs = rng.random_range(0..=max_jitter.as_secs());
                Some(base + Duration::from_secs(jitter_secs))
            }
            BackoffPolicy::Standard => None,
        }
    }
}

impl FailureCategory {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        match self {
            FailureCategory::Blacklisted => BackoffPolicy::Fixed {
                base: Duration::from_secs(300),
                max_jitter: Duration::from_secs(120),
            },
            FailureCategory::RateLimited => BackoffPolicy::Fixed {
                base: Duration::from_secs(60),
                max_jitter: Duration::from_secs(30),
            },
            FailureCategory::NetworkError | FailureCategory::Unknown => BackoffPolicy::Standard,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Blacklisted => "blacklisted",
            FailureCategory::RateLimited => "rate_limited",
            FailureCategory::NetworkError => "network_error",
            FailureCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a free-text failure description to a category.
///
/// Matching is case-insensitive and groups are checked in order
/// (blacklisted, rate limited, network), first match wins.
pub fn classify(message: &str) -> FailureCategory {
    let lower = message.to_lowercase();
    let matches_any = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

    if matches_any(BLACKLISTED_KEYWORDS) {
        FailureCategory::Blacklisted
    } else if matches_any(RATE_LIMITED_KEYWORDS) {
        FailureCategory::RateLimited
    } else if matches_any(NETWORK_ERROR_KEYWORDS) {
        FailureCategory::NetworkError
    } else {
        FailureCategory::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_each_group() {
        assert_eq!(classify("Authentication failed for user"), FailureCategory::Blacklisted);
        assert_eq!(classify("account locked"), FailureCategory::Blacklisted);
        assert_eq!(classify("429 Too Many Requests"), FailureCategory::RateLimited);
        assert_eq!(classify("portal request timeout"), FailureCategory::RateLimited);
        assert_eq!(classify("DNS lookup failed"), FailureCategory::NetworkError);
        assert_eq!(classify("host unreachable"), FailureCategory::NetworkError);
        assert_eq!(classify("login failed: no success marker"), FailureCategory::Unknown);
        assert_eq!(classify(""), FailureCategory::Unknown);
    }

    #[test]
    fn test_classify_is_case_insensitive() {
        assert_eq!(classify("FORBIDDEN"), FailureCategory::Blacklisted);
        assert_eq!(classify("forbidden"), FailureCategory::Blacklisted);
        assert_eq!(classify("Rate Limit exceeded"), FailureCategory::RateLimited);
    }

    #[test]
    fn test_first_group_wins() {
        // Contains both a blacklist and a rate-limit keyword.
        assert_eq!(classify("blocked after timeout"), FailureCategory::Blacklisted);
        // Contains both a rate-limit and a network keyword.
        assert_eq!(classify("dns timeout"), FailureCategory::RateLimited);
    }

    #[test]
    fn test_portal_markers_in_chinese() {
        assert_eq!(classify("login failed: portal reported '认证失败'"), FailureCategory::Blacklisted);
        assert_eq!(classify("请求过于频繁"), FailureCategory::RateLimited);
        assert_eq!(classify("网络错误"), FailureCategory::NetworkError);
        assert_eq!(classify("账号受限，请联系管理员"), FailureCategory::Blacklisted);
    }

    #[test]
    fn test_chinese_rate_limit_is_not_blacklisted() {
        assert_eq!(classify("请求频率限制，请稍后再试"), FailureCategory::RateLimited);
        assert_eq!(classify("请求频率限制"), FailureCategory::RateLimited);
        for keyword in RATE_LIMITED_KEYWORDS {
            assert_eq!(classify(keyword), FailureCategory::RateLimited, "{keyword}");
        }
    }

    #[test]
    fn test_backoff_policies() {
        let mut rng = rand::rng();
        for _ in 0..200 {
            let d = FailureCategory::Blacklisted
                .backoff_policy()
                .sample(&mut rng)
                .unwrap();
            assert!(d >= Duration::from_secs(300) && d <= Duration::from_secs(420));

            let d = FailureCategory::RateLimited
                .backoff_policy()
                .sample(&mut rng)
                .unwrap();
            assert!(d >= Duration::from_secs(60) && d <= Duration::from_secs(90));
        }
        assert_eq!(FailureCategory::NetworkError.backoff_policy(), BackoffPolicy::Standard);
        assert!(FailureCategory::Unknown.backoff_policy().sample(&mut rng).is_none());
    }
}
