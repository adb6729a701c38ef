use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use vigil_config::Config;
use vigil_db::{is_memory_url, DbConnectionConfig};
use vigil_job_queue::{BrokerSettings, WorkerSettings};
use vigil_upstream::NvdSettings;

/// Build database connection config from application config.
pub fn database_config_from_config(cfg: &Config) -> DbConnectionConfig {
    let url = cfg.database.url.trim();
    // Every connection to `:memory:` opens a separate database.
    if is_memory_url(url) {
        return DbConnectionConfig {
            url: url.to_string(),
            ..DbConnectionConfig::in_memory()
        };
    }
    DbConnectionConfig {
        max_connections: cfg.database.max_connections,
        min_connections: cfg.database.min_connections,
        connect_timeout_secs: cfg.database.connect_timeout_secs,
        ..DbConnectionConfig::new(url)
    }
}

pub fn broker_settings_from_config(cfg: &Config) -> BrokerSettings {
    BrokerSettings::new(cfg.broker.queue.trim())
        .with_max_retries(cfg.broker.max_retries)
        .with_retry_delay(cfg.broker.retry_delay())
}

/// Leases are renewed three times per visibility window.
pub fn worker_settings_from_config(cfg: &Config) -> WorkerSettings {
    WorkerSettings {
        count: cfg.workers.count,
        poll_interval: cfg.broker.poll_interval(),
        search_timeout: cfg.search.timeout(),
        persistence_retry_delay: cfg.workers.persistence_retry_delay(),
        lease_renewal: (cfg.broker.visibility_timeout() / 3).max(Duration::from_millis(1)),
    }
}

pub fn nvd_settings_from_config(cfg: &Config) -> NvdSettings {
    NvdSettings {
        base_url: cfg.search.base_url.clone(),
        api_key: cfg.search.api_key.clone(),
        timeout: cfg.search.timeout(),
        results_per_page: cfg.search.results_per_page,
    }
}

/// True when the broker queue lives in the same database as the job store.
pub fn broker_shares_database(cfg: &Config) -> bool {
    !cfg.broker.is_memory() && cfg.broker.url.trim() == cfg.database.url.trim()
}

/// Parse host:port into a SocketAddr, with fallback to 0.0.0.0.
pub fn parse_bind_address(host: &str, port: u16) -> SocketAddr {
    host.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, port))
        .or_else(|_| host.parse::<SocketAddr>())
        .or_else(|_| {
            host.trim_matches(|c| c == '[' || c == ']')
                .parse::<Ipv6Addr>()
                .map(|ip| SocketAddr::new(IpAddr::V6(ip), port))
        })
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_database_uses_a_single_connection() {
        let mut cfg = Config::default();
        cfg.database.url = "sqlite::memory:".into();
        let db = database_config_from_config(&cfg);
        assert_eq!(db.max_connections, 1);
        assert_eq!(db.url, "sqlite::memory:");
    }

    #[test]
    fn file_database_keeps_pool_bounds() {
        let mut cfg = Config::default();
        cfg.database.max_connections = 6;
        cfg.database.connect_timeout_secs = 3;
        let db = database_config_from_config(&cfg);
        assert_eq!(db.max_connections, 6);
        assert_eq!(db.connect_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn settings_follow_config() {
        let mut cfg = Config::default();
        cfg.broker.queue = "cves".into();
        cfg.broker.max_retries = 2;
        cfg.broker.retry_delay_ms = 50;
        cfg.workers.count = 4;
        let broker = broker_settings_from_config(&cfg);
        assert_eq!(broker.queue, "cves");
        assert_eq!(broker.max_retries, 2);
        assert_eq!(broker.retry_delay, Duration::from_millis(50));
        let workers = worker_settings_from_config(&cfg);
        assert_eq!(workers.count, 4);
        assert_eq!(workers.search_timeout, Duration::from_secs(30));
        assert!(workers.lease_renewal < cfg.broker.visibility_timeout());
    }

    #[test]
    fn lease_renewal_tracks_visibility_timeout() {
        let mut cfg = Config::default();
        cfg.broker.visibility_timeout_secs = 90;
        let workers = worker_settings_from_config(&cfg);
        assert_eq!(workers.lease_renewal, Duration::from_secs(30));
    }

    #[test]
    fn shared_database_detection() {
        let mut cfg = Config::default();
        assert!(broker_shares_database(&cfg));
        cfg.broker.url = "memory://".into();
        assert!(!broker_shares_database(&cfg));
        cfg.broker.url = "sqlite://queue.sqlite".into();
        assert!(!broker_shares_database(&cfg));
    }

    #[test]
    fn bind_address_parsing() {
        assert_eq!(
            parse_bind_address("127.0.0.1", 8000),
            SocketAddr::from(([127, 0, 0, 1], 8000))
        );
        assert!(parse_bind_address("[::1]", 80).is_ipv6());
        assert_eq!(
            parse_bind_address("localhost", 9000),
            SocketAddr::from(([0, 0, 0, 0], 9000))
        );
    }
}
