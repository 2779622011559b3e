//! Session configuration: a string-keyed map with typed accessors.

use crate::error::{TernError, TernResult};
use tern_proto::transport::Auth;
use tern_transport::{LEASE_DEFAULT_MS, SCOUT_TIMEOUT_DEFAULT_MS};

pub const MODE_KEY: &str = "mode";
pub const CONNECT_KEY: &str = "connect";
pub const LISTEN_KEY: &str = "listen";
pub const USER_KEY: &str = "user";
pub const PASSWORD_KEY: &str = "password";
pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const LEASE_KEY: &str = "lease_ms";
pub const AUTO_RECONNECT_KEY: &str = "auto_reconnect";
pub const SCOUTING_MULTICAST_ENABLED_KEY: &str = "scouting/multicast/enabled";
pub const SCOUTING_MULTICAST_ADDRESS_KEY: &str = "scouting/multicast/address";
pub const SCOUTING_TIMEOUT_KEY: &str = "scouting/timeout";

/// Default multicast group scouted for routers and used by peer mode.
pub const SCOUTING_MULTICAST_ADDRESS_DEFAULT: &str = "udp/224.0.0.224:7446";

const KNOWN_KEYS: &[&str] = &[
    MODE_KEY,
    CONNECT_KEY,
    LISTEN_KEY,
    USER_KEY,
    PASSWORD_KEY,
    ACCESS_TOKEN_KEY,
    LEASE_KEY,
    AUTO_RECONNECT_KEY,
    SCOUTING_MULTICAST_ENABLED_KEY,
    SCOUTING_MULTICAST_ADDRESS_KEY,
    SCOUTING_TIMEOUT_KEY,
];

/// Keys that accumulate values instead of replacing them.
const LIST_KEYS: &[&str] = &[CONNECT_KEY, LISTEN_KEY];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Client,
    Peer,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    entries: Vec<(String, String)>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a key. Unknown keys are refused rather than silently kept:
    /// misspelled credentials must never be discarded without notice.
    pub fn insert(&mut self, key: &str, value: &str) -> TernResult<()> {
        if !KNOWN_KEYS.contains(&key) {
            return Err(TernError::InvalidArgument(format!(
                "unknown config key `{key}`"
            )));
        }
        if !LIST_KEYS.contains(&key) {
            self.entries.retain(|(k, _)| k != key);
        }
        self.entries.push((key.to_string(), value.to_string()));
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn mode(&self) -> TernResult<Mode> {
        match self.get(MODE_KEY) {
            None | Some("client") => Ok(Mode::Client),
            Some("peer") => Ok(Mode::Peer),
            Some(other) => Err(TernError::InvalidArgument(format!("mode `{other}`"))),
        }
    }

    pub fn connect_endpoints(&self) -> Vec<&str> {
        self.get_all(CONNECT_KEY).collect()
    }

    pub fn listen_endpoints(&self) -> Vec<&str> {
        self.get_all(LISTEN_KEY).collect()
    }

    pub fn lease_ms(&self) -> TernResult<u64> {
        match self.get(LEASE_KEY) {
            None => Ok(LEASE_DEFAULT_MS),
            Some(v) => v
                .parse()
                .map_err(|_| TernError::InvalidArgument(format!("lease_ms `{v}`"))),
        }
    }

    pub fn auto_reconnect(&self) -> TernResult<bool> {
        self.flag(AUTO_RECONNECT_KEY, true)
    }

    pub fn scouting_enabled(&self) -> TernResult<bool> {
        self.flag(SCOUTING_MULTICAST_ENABLED_KEY, true)
    }

    pub fn scouting_address(&self) -> &str {
        self.get(SCOUTING_MULTICAST_ADDRESS_KEY)
            .unwrap_or(SCOUTING_MULTICAST_ADDRESS_DEFAULT)
    }

    pub fn scouting_timeout_ms(&self) -> TernResult<u64> {
        match self.get(SCOUTING_TIMEOUT_KEY) {
            None => Ok(SCOUT_TIMEOUT_DEFAULT_MS),
            Some(v) => v
                .parse()
                .map_err(|_| TernError::InvalidArgument(format!("scouting/timeout `{v}`"))),
        }
    }

    fn flag(&self, key: &str, default: bool) -> TernResult<bool> {
        match self.get(key) {
            None => Ok(default),
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(other) => Err(TernError::InvalidArgument(format!("{key} `{other}`"))),
        }
    }

    /// Resolve the configured credentials. `user`/`password` go together;
    /// the access token excludes both.
    pub fn auth(&self) -> TernResult<Option<Auth>> {
        let user = self.get(USER_KEY);
        let password = self.get(PASSWORD_KEY);
        let token = self.get(ACCESS_TOKEN_KEY);
        match (user, password, token) {
            (None, None, None) => Ok(None),
            (Some(user), Some(password), None) => Ok(Some(Auth::UserPassword {
                user: user.to_string(),
                password: password.to_string(),
            })),
            (None, None, Some(token)) => Ok(Some(Auth::Token(token.as_bytes().to_vec()))),
            _ => Err(TernError::InvalidArgument(
                "credentials: set `user` with `password`, or `access_token` alone".to_string(),
            )),
        }
    }

    /// Full validation at open time.
    pub fn validate(&self) -> TernResult<()> {
        self.mode()?;
        self.auth()?;
        self.lease_ms()?;
        self.auto_reconnect()?;
        self.scouting_enabled()?;
        self.scouting_timeout_ms()?;
        Ok(())
    }
}
