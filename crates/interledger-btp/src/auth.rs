use serde::{Deserialize, Serialize};

use crate::packet::ProtocolData;

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthRequest {
    #[serde(rename = "peerId")]
    pub peer_id: String,
    pub secret: String,
}

/// Looks up the `auth` sub-frame among a MESSAGE's protocol data and parses its JSON body.
pub fn extract_auth(protocol_data: &[ProtocolData]) -> Option<AuthRequest> {
    let auth_frame = protocol_data.iter().find(|pd| pd.protocol_name == "auth")?;
    serde_json::from_slice(&auth_frame.data).ok()
}

/// Resolves the expected shared secret for a peer id, e.g. from configuration or environment.
pub trait SecretStore: Send + Sync {
    fn secret_for(&self, peer_id: &str) -> Option<String>;
}

/// Reads `BTP_PEER_<UPPER_SNAKE_ID>_SECRET` environment variables, per the reference scheme.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretStore;

impl EnvSecretStore {
    pub fn env_var_name(peer_id: &str) -> String {
        let normalized: String = peer_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("BTP_PEER_{normalized}_SECRET")
    }
}

impl SecretStore for EnvSecretStore {
    fn secret_for(&self, peer_id: &str) -> Option<String> {
        std::env::var(Self::env_var_name(peer_id)).ok()
    }
}

/// Fixed in-memory secrets, useful for tests and for nodes whose configuration is otherwise
/// assembled at startup rather than read per-lookup from the environment.
#[derive(Debug, Default, Clone)]
pub struct StaticSecretStore {
    secrets: std::collections::HashMap<String, String>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, peer_id: impl Into<String>, secret: impl Into<String>) {
        self.secrets.insert(peer_id.into(), secret.into());
    }
}

impl SecretStore for StaticSecretStore {
    fn secret_for(&self, peer_id: &str) -> Option<String> {
        self.secrets.get(peer_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_name_normalizes_peer_id() {
        assert_eq!(EnvSecretStore::env_var_name("peer-1"), "BTP_PEER_PEER_1_SECRET");
    }

    #[test]
    fn extract_auth_parses_json_body() {
        let pd = vec![ProtocolData {
            protocol_name: "auth".to_owned(),
            content_type: crate::packet::ContentType::ApplicationOctetStream,
            data: br#"{"peerId":"alice","secret":"s3cr3t"}"#.to_vec(),
        }];
        let parsed = extract_auth(&pd).unwrap();
        assert_eq!(parsed.peer_id, "alice");
        assert_eq!(parsed.secret, "s3cr3t");
    }

    #[test]
    fn extract_auth_returns_none_without_auth_frame() {
        assert!(extract_auth(&[]).is_none());
    }
}
