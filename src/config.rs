use crate::{correlation::DEFAULT_HANGUP_CODES, repository::RepositoryConfig, sip};
use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// HEP capture listener.
    pub udp_addr: String,
    pub http_addr: String,
    pub max_packet_length: usize,
    pub min_packet_length: usize,
    pub read_timeout_secs: u64,
    pub queue_size: usize,
    pub session_id_header: String,
    pub discard_methods: Vec<String>,
    pub hangup_codes: Vec<u16>,
    pub unanswered_timeout_secs: u64,
    pub answered_timeout_secs: u64,
    pub call_flush_interval_secs: u64,
    pub rtcp_cleanup_interval_secs: u64,
    pub rtcp_report_ttl_secs: u64,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub repository: RepositoryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            udp_addr: "0.0.0.0:9060".to_string(),
            http_addr: "0.0.0.0:9059".to_string(),
            max_packet_length: 4096,
            min_packet_length: 24,
            read_timeout_secs: 5,
            queue_size: 20000,
            session_id_header: sip::DEFAULT_SESSION_ID_HEADER.to_string(),
            discard_methods: sip::DEFAULT_DISCARD_METHODS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            hangup_codes: DEFAULT_HANGUP_CODES.to_vec(),
            unanswered_timeout_secs: 60,
            answered_timeout_secs: 900,
            call_flush_interval_secs: 30,
            rtcp_cleanup_interval_secs: 60,
            rtcp_report_ttl_secs: 180,
            log_level: Some("info".to_string()),
            log_file: None,
            repository: RepositoryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigIssue {
    pub field: String,
    pub message: String,
}

impl ConfigIssue {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )
        .with_context(|| format!("invalid config {}", path))?;
        Ok(config)
    }

    pub fn udp_socket_addr(&self) -> Result<SocketAddr, Error> {
        self.udp_addr
            .parse()
            .with_context(|| format!("invalid udp_addr {}", self.udp_addr))
    }

    pub fn http_socket_addr(&self) -> Result<SocketAddr, Error> {
        self.http_addr
            .parse()
            .with_context(|| format!("invalid http_addr {}", self.http_addr))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Problems that would stop the monitor from starting or make it drop
    /// every packet.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        if self.udp_socket_addr().is_err() {
            issues.push(ConfigIssue::new("udp_addr", "not a socket address"));
        }
        if self.http_socket_addr().is_err() {
            issues.push(ConfigIssue::new("http_addr", "not a socket address"));
        }
        if self.max_packet_length == 0 || self.min_packet_length > self.max_packet_length {
            issues.push(ConfigIssue::new(
                "max_packet_length",
                format!(
                    "must be positive and not below min_packet_length ({})",
                    self.min_packet_length
                ),
            ));
        }
        if self.queue_size == 0 {
            issues.push(ConfigIssue::new("queue_size", "must be positive"));
        }
        if self.read_timeout_secs == 0 {
            issues.push(ConfigIssue::new("read_timeout_secs", "must be positive"));
        }
        for (field, value) in [
            ("call_flush_interval_secs", self.call_flush_interval_secs),
            ("rtcp_cleanup_interval_secs", self.rtcp_cleanup_interval_secs),
        ] {
            if value == 0 {
                issues.push(ConfigIssue::new(field, "must be positive"));
            }
        }
        if self.session_id_header.trim().is_empty() {
            issues.push(ConfigIssue::new("session_id_header", "must not be empty"));
        }
        if let RepositoryConfig::Local { root } = &self.repository {
            if root.trim().is_empty() {
                issues.push(ConfigIssue::new("repository.root", "must not be empty"));
            }
        }
        issues
    }
}
