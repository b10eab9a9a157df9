use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use crate::net::protocol::MAX_BUNDLE_SIZE;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind every socket to
    pub bind_address: IpAddr,
    /// Main port answering HELLO/PING
    pub connect_port: u16,
    /// First per-session port
    pub port_range_start: u16,
    /// Session ports beyond `max_users`
    pub extra_ports: u16,
    /// Maximum number of connected users
    pub max_users: usize,
    /// Maximum number of open games
    pub max_games: usize,
    /// Accepted protocol strings from the HELLO message
    pub client_types: Vec<String>,
    /// Messages per outbound datagram (newest plus resends)
    pub buffer_size: usize,
    /// Bind attempts per admission
    pub bind_attempts: usize,
    /// Pause between bind attempts
    pub bind_retry_delay: Duration,
    pub max_players_per_game: usize,
    pub keep_alive_timeout: Duration,
    /// Time allowed between HELLO and a completed login
    pub connect_timeout: Duration,
    pub chat_flood_time: Duration,
    pub create_game_flood_time: Duration,
    pub max_user_name_length: usize,
    pub max_chat_length: usize,
    pub max_game_name_length: usize,
    /// Shown to every user right after login
    pub login_messages: Vec<String>,
    pub maintenance_interval: Duration,
    /// Silence in a running game before players are told who is lagging
    pub game_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            connect_port: 27888,
            port_range_start: 27889,
            extra_ports: 10,
            max_users: 100,
            max_games: 50,
            client_types: vec!["0.83".to_string()],
            buffer_size: 4,
            bind_attempts: 5,
            bind_retry_delay: Duration::from_millis(5),
            max_players_per_game: 8,
            keep_alive_timeout: Duration::from_secs(190),
            connect_timeout: Duration::from_secs(15),
            chat_flood_time: Duration::from_secs(2),
            create_game_flood_time: Duration::from_secs(5),
            max_user_name_length: 31,
            max_chat_length: 150,
            max_game_name_length: 127,
            login_messages: vec!["Welcome to the Kaillera relay".to_string()],
            maintenance_interval: Duration::from_secs(1),
            game_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("connect_port cannot be 0")]
    ZeroConnectPort,
    #[error("max_users must be at least 1")]
    NoUsers,
    #[error("buffer_size must be 1-{MAX_BUNDLE_SIZE}, got {0}")]
    BufferSize(usize),
    #[error("bind_attempts must be at least 1")]
    NoBindAttempts,
    #[error("session port range {start}..={end} does not fit in 1-65535")]
    PortRange { start: u32, end: u32 },
    #[error("connect_port {0} overlaps the session port range")]
    PortOverlap(u16),
    #[error("at least one client type is required")]
    NoClientTypes,
    #[error("max_players_per_game must be 1-254, got {0}")]
    PlayersPerGame(usize),
}

/// Parse an environment variable, warning and keeping the default on bad input
fn env_parse<T: FromStr>(name: &str, valid: impl Fn(&T) -> bool) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(parsed) if valid(&parsed) => Some(parsed),
        Ok(_) => {
            tracing::warn!("{} out of range ('{}'), using default", name, raw);
            None
        }
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            None
        }
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Some(addr) = env_parse::<IpAddr>("BIND_ADDRESS", |_| true) {
            config.bind_address = addr;
        }
        if let Some(port) = env_parse::<u16>("CONNECT_PORT", |p| *p > 0) {
            config.connect_port = port;
        }
        if let Some(port) = env_parse::<u16>("PORT_RANGE_START", |p| *p > 0) {
            config.port_range_start = port;
        }
        if let Some(extra) = env_parse::<u16>("EXTRA_PORTS", |_| true) {
            config.extra_ports = extra;
        }
        if let Some(max_users) = env_parse::<usize>("MAX_USERS", |n| (1..=10000).contains(n)) {
            config.max_users = max_users;
        }
        if let Some(max_games) = env_parse::<usize>("MAX_GAMES", |n| *n <= 10000) {
            config.max_games = max_games;
        }
        if let Some(size) = env_parse::<usize>("BUFFER_SIZE", |n| (1..=MAX_BUNDLE_SIZE).contains(n)) {
            config.buffer_size = size;
        }
        if let Some(attempts) = env_parse::<usize>("BIND_ATTEMPTS", |n| (1..=100).contains(n)) {
            config.bind_attempts = attempts;
        }
        if let Some(ms) = env_parse::<u64>("BIND_RETRY_DELAY_MS", |ms| *ms <= 1000) {
            config.bind_retry_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("KEEP_ALIVE_TIMEOUT_SECS", |s| *s > 0) {
            config.keep_alive_timeout = Duration::from_secs(secs);
        }

        if let Ok(types) = std::env::var("CLIENT_TYPES") {
            let types: Vec<String> = types
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
            if types.is_empty() {
                tracing::warn!("CLIENT_TYPES is empty, using default");
            } else {
                config.client_types = types;
            }
        }

        if let Ok(messages) = std::env::var("LOGIN_MESSAGES") {
            config.login_messages = messages
                .split('|')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect();
        }

        config
    }

    /// Last port of the session range, inclusive
    pub fn port_range_end(&self) -> u32 {
        u32::from(self.port_range_start) + self.max_users as u32 + u32::from(self.extra_ports)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_port == 0 {
            return Err(ConfigError::ZeroConnectPort);
        }
        if self.max_users == 0 {
            return Err(ConfigError::NoUsers);
        }
        if self.buffer_size == 0 || self.buffer_size > MAX_BUNDLE_SIZE {
            return Err(ConfigError::BufferSize(self.buffer_size));
        }
        if self.bind_attempts == 0 {
            return Err(ConfigError::NoBindAttempts);
        }
        if self.client_types.is_empty() {
            return Err(ConfigError::NoClientTypes);
        }
        if self.max_players_per_game == 0 || self.max_players_per_game > 254 {
            return Err(ConfigError::PlayersPerGame(self.max_players_per_game));
        }

        let start = u32::from(self.port_range_start);
        let end = self.port_range_end();
        if start == 0 || end > u32::from(u16::MAX) {
            return Err(ConfigError::PortRange { start, end });
        }
        if (start..=end).contains(&u32::from(self.connect_port)) {
            return Err(ConfigError::PortOverlap(self.connect_port));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.connect_port, 27888);
        assert_eq!(config.port_range_start, 27889);
        assert_eq!(config.max_users, 100);
        assert_eq!(config.bind_attempts, 5);
        assert_eq!(config.port_range_end(), 27889 + 110);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_default() {
        let config = ServerConfig::load_or_default();
        assert!(config.connect_port > 0);
    }

    #[test]
    fn test_validate_buffer_size() {
        let config = ServerConfig {
            buffer_size: MAX_BUNDLE_SIZE + 1,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::BufferSize(10)));
    }

    #[test]
    fn test_validate_port_range() {
        let config = ServerConfig {
            port_range_start: 65500,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::PortRange { .. })));

        let config = ServerConfig {
            connect_port: 27900,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::PortOverlap(27900)));
    }
}
