// Deskline Chat Engine — Configuration
//
// ClientConfig: where the collaborator lives and who we are when talking to
// it. Loaded from the environment by the demo binary; embedders construct it
// directly. Timing constants live in atoms/constants.rs, not here.

use serde::{Deserialize, Serialize};

use crate::atoms::error::{ClientError, ClientResult};

// ── Config Struct ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Collaborator REST base URL (default: "http://localhost:8000")
    pub api_base: String,
    /// WebSocket base URL. Derived from `api_base` (http→ws, https→wss)
    /// when left empty.
    pub socket_base: String,
    /// Bearer credential. Without one the socket stays closed and REST
    /// calls go out unauthenticated.
    pub credential: Option<String>,
    /// Identity attached to outbound frames (default: "user-1")
    pub user_id: String,
    /// Banner inserted into an empty transcript on activation. No banner
    /// when unset.
    pub welcome_message: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            api_base: "http://localhost:8000".into(),
            socket_base: String::new(),
            credential: None,
            user_id: "user-1".into(),
            welcome_message: None,
        }
    }
}

impl ClientConfig {
    /// Read config from `DESKLINE_*` environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// Variables: `DESKLINE_API_URL`, `DESKLINE_SOCKET_URL`,
    /// `DESKLINE_TOKEN`, `DESKLINE_USER_ID`, `DESKLINE_WELCOME`.
    pub fn from_env() -> ClientResult<Self> {
        let mut cfg = ClientConfig::default();
        if let Ok(v) = std::env::var("DESKLINE_API_URL") {
            cfg.api_base = v;
        }
        if let Ok(v) = std::env::var("DESKLINE_SOCKET_URL") {
            cfg.socket_base = v;
        }
        if let Ok(v) = std::env::var("DESKLINE_TOKEN") {
            if !v.is_empty() {
                cfg.credential = Some(v);
            }
        }
        if let Ok(v) = std::env::var("DESKLINE_USER_ID") {
            cfg.user_id = v;
        }
        if let Ok(v) = std::env::var("DESKLINE_WELCOME") {
            if !v.is_empty() {
                cfg.welcome_message = Some(v);
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.api_base.is_empty() {
            return Err(ClientError::config("api_base must not be empty"));
        }
        if self.user_id.is_empty() {
            return Err(ClientError::config("user_id must not be empty"));
        }
        Ok(())
    }

    /// REST base with any trailing slash trimmed, so endpoint paths can be
    /// appended verbatim.
    pub fn rest_base(&self) -> &str {
        self.api_base.trim_end_matches('/')
    }

    /// Socket base URL: the explicit `socket_base` when set, otherwise
    /// `api_base` with the scheme swapped to its WebSocket counterpart.
    pub fn ws_base(&self) -> String {
        if !self.socket_base.is_empty() {
            return self.socket_base.trim_end_matches('/').to_string();
        }
        let base = self.rest_base();
        if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_base_derived_from_api_base() {
        let mut cfg = ClientConfig::default();
        assert_eq!(cfg.ws_base(), "ws://localhost:8000");

        cfg.api_base = "https://support.example.com/".into();
        assert_eq!(cfg.ws_base(), "wss://support.example.com");
    }

    #[test]
    fn explicit_socket_base_wins() {
        let cfg = ClientConfig {
            socket_base: "wss://stream.example.com/".into(),
            ..ClientConfig::default()
        };
        assert_eq!(cfg.ws_base(), "wss://stream.example.com");
    }

    #[test]
    fn rest_base_trims_trailing_slash() {
        let cfg = ClientConfig {
            api_base: "http://localhost:8000///".into(),
            ..ClientConfig::default()
        };
        assert_eq!(cfg.rest_base(), "http://localhost:8000");
    }

    #[test]
    fn validate_rejects_empty_fields() {
        let cfg = ClientConfig {
            api_base: String::new(),
            ..ClientConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ClientConfig {
            user_id: String::new(),
            ..ClientConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
