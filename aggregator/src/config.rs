use std::net::SocketAddr;
use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:3000")]
    pub address: SocketAddr,

    /// Postgres holding the events and metrics tables.
    pub database_url: String,

    /// Postgres backing the durable queue. Defaults to `database_url`.
    pub queue_url: Option<String>,

    /// Logical queue name; multiple aggregators may share a queue table.
    #[envconfig(default = "event_queue")]
    pub queue_key: String,

    #[envconfig(default = "4")]
    pub worker_count: usize,

    /// Skip spawning workers. Ingestion still queues; for tests.
    #[envconfig(default = "false")]
    pub disable_workers: bool,

    /// Replace the durable queue with the in-memory test double.
    #[envconfig(default = "false")]
    pub use_inmemory_queue: bool,

    #[envconfig(default = "200")]
    pub worker_poll_interval_ms: u64,

    #[envconfig(default = "1000")]
    pub worker_dequeue_timeout_ms: u64,

    #[envconfig(default = "10")]
    pub max_pg_connections: u32,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,
}

impl Config {
    pub fn queue_url(&self) -> &str {
        self.queue_url.as_deref().unwrap_or(&self.database_url)
    }

    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }

    pub fn worker_dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_dequeue_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<String, String> {
        HashMap::from([(
            "DATABASE_URL".to_owned(),
            "postgres://localhost:5432/aggregator".to_owned(),
        )])
    }

    #[test]
    fn defaults_apply_without_optional_vars() {
        let config = Config::init_from_hashmap(&base_env()).unwrap();

        assert_eq!(config.queue_key, "event_queue");
        assert_eq!(config.worker_count, 4);
        assert!(!config.disable_workers);
        assert!(!config.use_inmemory_queue);
        assert_eq!(config.worker_poll_interval(), Duration::from_millis(200));
    }

    #[test]
    fn queue_url_falls_back_to_database_url() {
        let config = Config::init_from_hashmap(&base_env()).unwrap();
        assert_eq!(config.queue_url(), "postgres://localhost:5432/aggregator");

        let mut env = base_env();
        env.insert(
            "QUEUE_URL".to_owned(),
            "postgres://localhost:5432/queue".to_owned(),
        );
        let config = Config::init_from_hashmap(&env).unwrap();
        assert_eq!(config.queue_url(), "postgres://localhost:5432/queue");
    }

    #[test]
    fn missing_database_url_is_an_error() {
        assert!(Config::init_from_hashmap(&HashMap::new()).is_err());
    }
}
