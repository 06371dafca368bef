//! IP banlist (spec.md §4.C): an in-memory table of timed bans and an
//! on-disk pattern file of permanent ones.
//!
//! Pattern matching is CIDR-ish: a pattern is an IPv4/IPv6 address with
//! trailing octets/groups replaced by `*`, e.g. `10.0.*.*` matches any
//! address in `10.0.0.0/16`. This mirrors the original implementation's
//! wildcard-octet ban patterns rather than full CIDR notation.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{WiredError, WiredResult};

#[derive(Debug, Clone)]
struct TimedBan {
    expires_at: DateTime<Utc>,
}

/// One rwlock guards the file-backed permanent patterns, a second guards
/// the in-memory timed-ban table (spec.md §5).
pub struct Banlist {
    path: PathBuf,
    patterns: RwLock<Vec<String>>,
    timed: RwLock<HashMap<String, TimedBan>>,
}

impl Banlist {
    pub async fn load(path: impl Into<PathBuf>) -> WiredResult<Self> {
        let path = path.into();
        let patterns = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|e| WiredError::io(e, &path))?;
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };

        Ok(Self {
            path,
            patterns: RwLock::new(patterns),
            timed: RwLock::new(HashMap::new()),
        })
    }

    /// Returns whether `ip` is currently banned and, if so, the expiry of
    /// the ban that matched (`None` for a permanent, file-backed ban).
    pub async fn is_banned(&self, ip: IpAddr) -> (bool, Option<DateTime<Utc>>) {
        let now = Utc::now();
        {
            let timed = self.timed.read().await;
            for (pattern, ban) in timed.iter() {
                if ban.expires_at > now && pattern_matches(pattern, ip) {
                    return (true, Some(ban.expires_at));
                }
            }
        }
        let patterns = self.patterns.read().await;
        for pattern in patterns.iter() {
            if pattern_matches(pattern, ip) {
                return (true, None);
            }
        }
        (false, None)
    }

    /// Adds a ban. `expiry: Some(_)` creates an in-memory timed ban that
    /// self-expires; `None` appends a permanent pattern to the on-disk
    /// file.
    pub async fn add_ban(&self, pattern: String, expiry: Option<DateTime<Utc>>) -> WiredResult<()> {
        match expiry {
            Some(expires_at) => {
                let mut timed = self.timed.write().await;
                if timed.contains_key(&pattern) {
                    return Err(WiredError::BanExists(pattern));
                }
                timed.insert(pattern, TimedBan { expires_at });
                Ok(())
            }
            None => {
                let mut patterns = self.patterns.write().await;
                if patterns.contains(&pattern) {
                    return Err(WiredError::BanExists(pattern));
                }
                patterns.push(pattern.clone());
                self.flush(&patterns)?;
                Ok(())
            }
        }
    }

    pub async fn delete_ban(&self, pattern: &str) -> WiredResult<()> {
        {
            let mut timed = self.timed.write().await;
            if timed.remove(pattern).is_some() {
                return Ok(());
            }
        }
        let mut patterns = self.patterns.write().await;
        let before = patterns.len();
        patterns.retain(|p| p != pattern);
        if patterns.len() == before {
            return Err(WiredError::BanNotFound(pattern.to_string()));
        }
        self.flush(&patterns)?;
        Ok(())
    }

    /// Drops timed bans whose expiry has passed. Intended to run on a
    /// periodic timer (spec.md §5: "background timers ... ban-expiry").
    pub async fn sweep_expired(&self) {
        let now = Utc::now();
        self.timed.write().await.retain(|_, ban| ban.expires_at > now);
    }

    pub async fn list_permanent(&self) -> Vec<String> {
        self.patterns.read().await.clone()
    }

    pub async fn list_timed(&self) -> Vec<(String, DateTime<Utc>)> {
        self.timed
            .read()
            .await
            .iter()
            .map(|(p, b)| (p.clone(), b.expires_at))
            .collect()
    }

    fn flush(&self, patterns: &[String]) -> WiredResult<()> {
        let contents = patterns.join("\n") + "\n";
        let tmp_path = temp_path(&self.path);
        std::fs::write(&tmp_path, &contents).map_err(|e| WiredError::io(e, &tmp_path))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| WiredError::io(e, &self.path))?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

fn pattern_matches(pattern: &str, ip: IpAddr) -> bool {
    let ip_parts: Vec<String> = match ip {
        IpAddr::V4(v4) => v4.octets().iter().map(|o| o.to_string()).collect(),
        IpAddr::V6(v6) => v6.segments().iter().map(|s| format!("{:x}", s)).collect(),
    };
    let pattern_parts: Vec<&str> = pattern.split(if pattern.contains(':') { ':' } else { '.' }).collect();
    if pattern_parts.len() != ip_parts.len() {
        return false;
    }
    pattern_parts
        .iter()
        .zip(ip_parts.iter())
        .all(|(p, a)| *p == "*" || *p == a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn wildcard_pattern_matches_subnet() {
        assert!(pattern_matches("10.0.*.*", ip("10.0.5.9")));
        assert!(!pattern_matches("10.0.*.*", ip("10.1.5.9")));
    }

    #[test]
    fn exact_pattern_matches_only_itself() {
        assert!(pattern_matches("192.168.1.1", ip("192.168.1.1")));
        assert!(!pattern_matches("192.168.1.1", ip("192.168.1.2")));
    }

    #[tokio::test]
    async fn permanent_ban_persists_and_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("banlist");
        let banlist = Banlist::load(&path).await.unwrap();
        banlist.add_ban("10.0.*.*".into(), None).await.unwrap();

        let (banned, expiry) = banlist
            .is_banned(IpAddr::V4(Ipv4Addr::new(10, 0, 3, 4)))
            .await;
        assert!(banned);
        assert!(expiry.is_none());

        let reloaded = Banlist::load(&path).await.unwrap();
        assert_eq!(reloaded.list_permanent().await, vec!["10.0.*.*"]);
    }

    #[tokio::test]
    async fn duplicate_permanent_ban_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let banlist = Banlist::load(dir.path().join("banlist")).await.unwrap();
        banlist.add_ban("1.2.3.4".into(), None).await.unwrap();
        let result = banlist.add_ban("1.2.3.4".into(), None).await;
        assert!(matches!(result, Err(WiredError::BanExists(_))));
    }

    #[tokio::test]
    async fn timed_ban_expires_after_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let banlist = Banlist::load(dir.path().join("banlist")).await.unwrap();
        let past = Utc::now() - chrono::Duration::seconds(1);
        banlist.add_ban("5.5.5.5".into(), Some(past)).await.unwrap();
        banlist.sweep_expired().await;
        let (banned, _) = banlist.is_banned(ip("5.5.5.5")).await;
        assert!(!banned);
    }

    #[tokio::test]
    async fn delete_missing_ban_fails() {
        let dir = tempfile::tempdir().unwrap();
        let banlist = Banlist::load(dir.path().join("banlist")).await.unwrap();
        let result = banlist.delete_ban("9.9.9.9").await;
        assert!(matches!(result, Err(WiredError::BanNotFound(_))));
    }
}
