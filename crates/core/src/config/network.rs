//! Endpoints and contract addresses.
//!
//! Values may reference environment variables as `${NAME}`; they are
//! expanded when the configuration is loaded so secrets stay out of files.

use alloy::primitives::Address;
use anyhow::{anyhow, Result};
use sentinel_chain::ProtocolAddresses;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// RPC endpoints and protocol deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// HTTP RPC endpoint
    #[serde(default = "default_http")]
    pub http: String,
    /// WebSocket endpoint for live events (optional; polling sync covers gaps)
    #[serde(default)]
    pub ws: Option<String>,
    /// Dedicated send endpoint
    #[serde(default)]
    pub send: Option<String>,
    /// Per-call RPC timeout (seconds)
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
    #[serde(default)]
    pub contracts: ContractsConfig,
}

fn default_http() -> String {
    "${RPC_URL}".to_string()
}
fn default_rpc_timeout() -> u64 {
    20
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            http: default_http(),
            ws: Some("${WS_URL}".to_string()),
            send: None,
            rpc_timeout_secs: default_rpc_timeout(),
            contracts: ContractsConfig::default(),
        }
    }
}

impl NetworkConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    /// Expand `${VAR}` references in endpoints and addresses.
    pub fn expand_env_vars(&mut self) {
        self.http = expand_env(&self.http);
        for url in [&mut self.ws, &mut self.send].into_iter().flatten() {
            *url = expand_env(url);
        }
        self.contracts.expand_env_vars();
    }

    /// WebSocket URL, if one survived expansion.
    pub fn ws_url(&self) -> Option<&str> {
        self.ws.as_deref().filter(|u| is_resolved(u))
    }

    pub fn send_url(&self) -> Option<&str> {
        self.send.as_deref().filter(|u| is_resolved(u))
    }
}

/// Protocol contract addresses (hex or `${VAR}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractsConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_cfa")]
    pub cfa: String,
    #[serde(default)]
    pub gda: Option<String>,
    #[serde(default)]
    pub toga: Option<String>,
    #[serde(default)]
    pub batch_liquidator: Option<String>,
}

fn default_host() -> String {
    "${HOST_ADDRESS}".to_string()
}
fn default_cfa() -> String {
    "${CFA_ADDRESS}".to_string()
}

impl Default for ContractsConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            cfa: default_cfa(),
            gda: Some("${GDA_ADDRESS}".to_string()),
            toga: Some("${TOGA_ADDRESS}".to_string()),
            batch_liquidator: Some("${BATCH_LIQUIDATOR_ADDRESS}".to_string()),
        }
    }
}

impl ContractsConfig {
    fn expand_env_vars(&mut self) {
        self.host = expand_env(&self.host);
        self.cfa = expand_env(&self.cfa);
        for addr in [&mut self.gda, &mut self.toga, &mut self.batch_liquidator]
            .into_iter()
            .flatten()
        {
            *addr = expand_env(addr);
        }
    }

    /// Parse into addresses. Host and CFA are required; optional contracts
    /// whose variable is unset are treated as not deployed.
    pub fn resolve(&self) -> Result<ProtocolAddresses> {
        Ok(ProtocolAddresses {
            host: parse_required(&self.host, "host")?,
            cfa: parse_required(&self.cfa, "cfa")?,
            gda: parse_optional(self.gda.as_deref(), "gda")?,
            toga: parse_optional(self.toga.as_deref(), "toga")?,
            batch_liquidator: parse_optional(self.batch_liquidator.as_deref(), "batch_liquidator")?,
        })
    }
}

fn parse_required(value: &str, name: &str) -> Result<Address> {
    if !is_resolved(value) {
        return Err(anyhow!("{name} address not configured ({value})"));
    }
    value
        .parse()
        .map_err(|e| anyhow!("invalid {name} address '{value}': {e}"))
}

fn parse_optional(value: Option<&str>, name: &str) -> Result<Option<Address>> {
    match value.filter(|v| is_resolved(v)) {
        Some(v) => parse_required(v, name).map(Some),
        None => Ok(None),
    }
}

fn is_resolved(value: &str) -> bool {
    !value.is_empty() && !value.contains("${")
}

/// Expand `${VAR_NAME}` patterns with environment variable values.
/// Unset variables are left as-is.
pub(crate) fn expand_env(s: &str) -> String {
    let Ok(re) = regex_lite::Regex::new(r"\$\{([^}]+)\}") else {
        return s.to_string();
    };

    let mut result = s.to_string();
    for cap in re.captures_iter(s) {
        if let (Some(full_match), Some(var_match)) = (cap.get(0), cap.get(1)) {
            if let Ok(value) = std::env::var(var_match.as_str()) {
                result = result.replace(full_match.as_str(), &value);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env() {
        // Unique names; tests run in parallel
        std::env::set_var("SENTINEL_NET_TEST_VAR", "test_value");
        assert_eq!(expand_env("${SENTINEL_NET_TEST_VAR}"), "test_value");
        assert_eq!(
            expand_env("wss://${SENTINEL_NET_TEST_VAR}/ws"),
            "wss://test_value/ws"
        );
        assert_eq!(expand_env("${SENTINEL_NET_UNSET_VAR}"), "${SENTINEL_NET_UNSET_VAR}");
        std::env::remove_var("SENTINEL_NET_TEST_VAR");
    }

    #[test]
    fn test_resolve_contracts() {
        let contracts = ContractsConfig {
            host: "0x4E583d9390082B65Bef884b629DFA426114CED6d".to_string(),
            cfa: "0x2844c1BBdA121E9E43105630b9C8310e5c72744b".to_string(),
            gda: Some("${SENTINEL_NET_UNSET_GDA}".to_string()),
            toga: None,
            batch_liquidator: Some("0x0000000000000000000000000000000000000001".to_string()),
        };

        let addresses = contracts.resolve().unwrap();
        assert_eq!(addresses.gda, None);
        assert_eq!(addresses.toga, None);
        assert_eq!(addresses.batch_liquidator, Some(Address::with_last_byte(1)));
    }

    #[test]
    fn test_missing_host_is_an_error() {
        let contracts = ContractsConfig::default();
        std::env::remove_var("HOST_ADDRESS");
        let mut expanded = contracts.clone();
        expanded.expand_env_vars();
        assert!(expanded.resolve().is_err());
    }
}
