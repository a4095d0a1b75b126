use crate::error::MvdbError;
use crate::remote::retry::RetryPolicy;
use std::collections::BTreeMap;
use std::time::Duration;

const BYTES_PER_GB: u64 = 1_000_000_000;

/// Runtime configuration for an mvdb instance.
#[derive(Debug, Clone)]
pub struct MvdbConfig {
    /// Wipe the local directory and the remote prefix on open.
    pub clean: bool,
    /// Total memory budget in GB shared by the read and write engines. 0 leaves
    /// the engine default in place.
    pub memory_limit_gb: u64,
    /// Total thread budget shared by the read and write engines. 0 leaves the
    /// engine default in place.
    pub cpu: u64,
    /// Share of memory and threads handed to the read engine.
    pub read_write_ratio: f64,
    pub read_settings: BTreeMap<String, String>,
    pub write_settings: BTreeMap<String, String>,
    pub db_init_queries: Vec<String>,
    pub conn_init_queries: Vec<String>,
    pub read_pool_size: u32,
    pub pool_timeout_ms: u64,
    pub remote_retry_attempts: u32,
    pub remote_retry_delay_ms: u64,
    pub download_concurrency: usize,
}

impl Default for MvdbConfig {
    fn default() -> Self {
        Self {
            clean: false,
            memory_limit_gb: 0,
            cpu: 0,
            read_write_ratio: 0.5,
            read_settings: BTreeMap::new(),
            write_settings: BTreeMap::new(),
            db_init_queries: Vec::new(),
            conn_init_queries: Vec::new(),
            read_pool_size: 4,
            pool_timeout_ms: 30_000,
            remote_retry_attempts: 3,
            remote_retry_delay_ms: 500,
            download_concurrency: 4,
        }
    }
}

/// Engine settings applied with `SET` on the read instance and on every write
/// connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedSettings {
    pub read: BTreeMap<String, String>,
    pub write: BTreeMap<String, String>,
}

impl MvdbConfig {
    pub fn with_clean(mut self, clean: bool) -> Self {
        self.clean = clean;
        self
    }

    pub fn with_memory_limit_gb(mut self, gb: u64) -> Self {
        self.memory_limit_gb = gb;
        self
    }

    pub fn with_cpu(mut self, cpu: u64) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn with_read_pool_size(mut self, size: u32) -> Self {
        self.read_pool_size = size;
        self
    }

    pub fn with_db_init_query(mut self, query: impl Into<String>) -> Self {
        self.db_init_queries.push(query.into());
        self
    }

    pub fn with_conn_init_query(mut self, query: impl Into<String>) -> Self {
        self.conn_init_queries.push(query.into());
        self
    }

    pub fn validate(&self) -> Result<(), MvdbError> {
        if self.read_pool_size == 0 {
            return Err(MvdbError::InvalidConfig {
                message: "read_pool_size must be > 0".into(),
            });
        }
        if self.pool_timeout_ms == 0 {
            return Err(MvdbError::InvalidConfig {
                message: "pool_timeout_ms must be > 0".into(),
            });
        }
        if self.remote_retry_attempts == 0 {
            return Err(MvdbError::InvalidConfig {
                message: "remote_retry_attempts must be > 0".into(),
            });
        }
        if self.download_concurrency == 0 {
            return Err(MvdbError::InvalidConfig {
                message: "download_concurrency must be > 0".into(),
            });
        }
        if !(self.read_write_ratio > 0.0 && self.read_write_ratio < 1.0) {
            return Err(MvdbError::InvalidConfig {
                message: "read_write_ratio must be within (0, 1)".into(),
            });
        }
        for key in self.read_settings.keys().chain(self.write_settings.keys()) {
            if !is_setting_name(key) {
                return Err(MvdbError::InvalidConfig {
                    message: format!("invalid setting name '{key}'"),
                });
            }
        }
        Ok(())
    }

    /// Splits the memory and thread budgets between the read and write engines,
    /// then layers the explicit settings on top.
    pub fn resolved_settings(&self) -> ResolvedSettings {
        let mut resolved = ResolvedSettings::default();
        if self.memory_limit_gb > 0 {
            let (read_gb, write_gb) = split_budget(self.memory_limit_gb, self.read_write_ratio);
            resolved
                .read
                .insert("memory_limit".into(), format!("{} bytes", read_gb * BYTES_PER_GB));
            resolved
                .write
                .insert("memory_limit".into(), format!("{} bytes", write_gb * BYTES_PER_GB));
        }
        if self.cpu > 0 {
            let (read_threads, write_threads) = split_budget(self.cpu, self.read_write_ratio);
            resolved.read.insert("threads".into(), read_threads.to_string());
            resolved.write.insert("threads".into(), write_threads.to_string());
        }
        resolved.read.extend(
            self.read_settings
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        resolved.write.extend(
            self.write_settings
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        resolved
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.remote_retry_attempts,
            delay: Duration::from_millis(self.remote_retry_delay_ms),
        }
    }

    pub fn pool_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_timeout_ms)
    }
}

fn split_budget(total: u64, ratio: f64) -> (u64, u64) {
    let read = ((total as f64) * ratio).floor() as u64;
    let read = read.max(1);
    let write = total.saturating_sub(read).max(1);
    (read, write)
}

pub(crate) fn is_setting_name(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::MvdbConfig;

    #[test]
    fn budgets_split_by_ratio_with_floor_of_one() {
        let config = MvdbConfig::default().with_memory_limit_gb(4).with_cpu(1);
        let settings = config.resolved_settings();
        assert_eq!(
            settings.read.get("memory_limit").map(String::as_str),
            Some("2000000000 bytes")
        );
        assert_eq!(
            settings.write.get("memory_limit").map(String::as_str),
            Some("2000000000 bytes")
        );
        assert_eq!(settings.read.get("threads").map(String::as_str), Some("1"));
        assert_eq!(settings.write.get("threads").map(String::as_str), Some("1"));
    }

    #[test]
    fn explicit_settings_override_derived_budgets() {
        let mut config = MvdbConfig::default().with_cpu(8);
        config.read_write_ratio = 0.75;
        config.write_settings.insert("threads".into(), "3".into());
        let settings = config.resolved_settings();
        assert_eq!(settings.read.get("threads").map(String::as_str), Some("6"));
        assert_eq!(settings.write.get("threads").map(String::as_str), Some("3"));
        assert!(!settings.read.contains_key("memory_limit"));
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(MvdbConfig::default().validate().is_ok());
        assert!(MvdbConfig::default().with_read_pool_size(0).validate().is_err());

        let mut config = MvdbConfig::default();
        config.read_write_ratio = 1.0;
        assert!(config.validate().is_err());

        let mut config = MvdbConfig::default();
        config
            .read_settings
            .insert("threads; DROP TABLE x".into(), "1".into());
        assert!(config.validate().is_err());
    }
}
