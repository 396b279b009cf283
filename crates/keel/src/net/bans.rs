use super::clock::TimeMs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEntry {
    /// Dotted IPv4 text, optionally ending in `*`.
    pub pattern: String,
    /// `None` is permanent.
    pub expires_at: Option<TimeMs>,
}

impl BanEntry {
    fn matches(&self, ip: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => ip.starts_with(prefix),
            None => self.pattern == ip,
        }
    }

    fn is_expired(&self, now: TimeMs) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// IP denylist with trailing-wildcard patterns and optional expiry.
///
/// Expired entries are only dropped when a scan walks past them.
#[derive(Debug, Default)]
pub struct BanList {
    entries: Vec<BanEntry>,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bans `pattern` for `duration_ms`, or permanently when zero. Re-banning
    /// an existing pattern replaces its expiry.
    pub fn ban(&mut self, pattern: &str, duration_ms: u64, now: TimeMs) {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return;
        }
        let expires_at = (duration_ms > 0).then(|| now + duration_ms);

        if let Some(entry) = self.entries.iter_mut().find(|e| e.pattern == pattern) {
            entry.expires_at = expires_at;
            return;
        }

        self.entries.push(BanEntry {
            pattern: pattern.to_string(),
            expires_at,
        });
    }

    pub fn unban(&mut self, pattern: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.pattern != pattern.trim());
        self.entries.len() != before
    }

    pub fn is_banned(&mut self, ip: &str, now: TimeMs) -> bool {
        let mut banned = false;
        self.entries.retain(|entry| {
            if entry.is_expired(now) {
                return false;
            }
            banned |= entry.matches(ip);
            true
        });
        banned
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
