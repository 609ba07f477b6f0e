use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{Aead, Nonce};
use anyhow::{Context, Result, anyhow};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fs;
use std::path::{Path, PathBuf};

use crate::session::TerminalSettings;
use crate::urls::{DEFAULT_SN_HOST, DEFAULT_SSH_HOST, UrlHelper};

/// Where the active API token was loaded from.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CredentialSource {
    #[default]
    None,
    Store,
    EnvVar,
    CommandLine,
}

/// SolarSSH client configuration loaded from ~/.config/solarssh/config.toml + env vars
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SolarSshConfig {
    pub node_id: Option<u64>,
    pub sn_host: Option<String>,
    pub ssh_host: Option<String>,
    pub ssh_path: Option<String>,
    pub tls: Option<bool>,
    pub cols: Option<u16>,
    pub lines: Option<u16>,
    pub log_file: Option<PathBuf>,

    /// SolarNet API token id (never written to config.toml).
    #[serde(skip)]
    pub token: Option<String>,
    #[serde(skip)]
    pub secret: Option<String>,
    #[serde(skip)]
    pub credential_source: CredentialSource,
}

impl SolarSshConfig {
    /// Load config from file + encrypted token store + env var overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path())?;

        if let Some((token, secret)) = CredentialStore::load() {
            config.token = Some(token);
            config.secret = Some(secret);
            config.credential_source = CredentialSource::Store;
        }

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a config file; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = toml::from_str::<SolarSshConfig>(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.token = None;
        config.secret = None;
        Ok(config)
    }

    /// Overlay environment variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("SOLARSSH_NODE_ID").and_then(|v| v.trim().parse().ok()) {
            self.node_id = Some(id);
        }
        if let Some(val) = lookup("SN_HOST") {
            self.sn_host = Some(val);
        }
        if let Some(val) = lookup("SOLARSSH_HOST") {
            self.ssh_host = Some(val);
        }
        if let Some(val) = lookup("SOLARSSH_PATH") {
            self.ssh_path = Some(val);
        }
        if let Some(val) = lookup("SOLARSSH_TLS") {
            self.tls = Some(!matches!(val.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no"));
        }
        let env_token = lookup("SN_TOKEN");
        let env_secret = lookup("SN_TOKEN_SECRET");
        if env_token.is_some() || env_secret.is_some() {
            if let Some(val) = env_token {
                self.token = Some(val);
            }
            if let Some(val) = env_secret {
                self.secret = Some(val);
            }
            self.credential_source = CredentialSource::EnvVar;
        }
    }

    /// Persist non-sensitive settings to ~/.config/solarssh/config.toml.
    pub fn save_to_disk(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config dir: {}", dir.display()))?;
        }
        // token/secret are #[serde(skip)] and never reach the file
        let content = toml::to_string_pretty(self).with_context(|| "Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Get the config directory path: ~/.config/solarssh/
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("solarssh")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    pub fn sn_host(&self) -> &str {
        self.sn_host.as_deref().unwrap_or(DEFAULT_SN_HOST)
    }

    pub fn ssh_host(&self) -> &str {
        self.ssh_host.as_deref().unwrap_or(DEFAULT_SSH_HOST)
    }

    pub fn ssh_path(&self) -> &str {
        self.ssh_path.as_deref().unwrap_or("")
    }

    pub fn tls(&self) -> bool {
        self.tls.unwrap_or(true)
    }

    pub fn terminal_settings(&self) -> TerminalSettings {
        TerminalSettings::new(self.cols, self.lines)
    }

    /// Endpoint builder for `node_id` using the configured hosts.
    pub fn url_helper(&self, node_id: u64) -> UrlHelper {
        let mut urls = UrlHelper::new(node_id);
        urls.sn_host = self.sn_host().to_string();
        urls.sn_tls = self.tls();
        urls.ssh_host = self.ssh_host().to_string();
        urls.ssh_path = normalize_path(self.ssh_path());
        urls.ssh_tls = self.tls();
        urls
    }

    /// Display config with secrets masked
    pub fn display_masked(&self) -> String {
        let mask = |opt: &Option<String>| -> String {
            match opt {
                Some(s) if s.len() > 4 => format!("{}...{}", &s[..2], &s[s.len() - 2..]),
                Some(s) if !s.is_empty() => "****".to_string(),
                _ => "(not set)".to_string(),
            }
        };
        let or_unset = |v: Option<String>| v.unwrap_or_else(|| "(not set)".to_string());

        let mut lines = Vec::new();
        lines.push(format!("Config file: {}", Self::config_path().display()));
        lines.push(format!("node_id: {}", or_unset(self.node_id.map(|n| n.to_string()))));
        lines.push(format!("sn_host: {}", self.sn_host()));
        lines.push(format!("ssh_host: {}", self.ssh_host()));
        lines.push(format!(
            "ssh_path: {}",
            if self.ssh_path().is_empty() { "(none)" } else { self.ssh_path() }
        ));
        lines.push(format!("tls: {}", self.tls()));
        let settings = self.terminal_settings();
        lines.push(format!("terminal: {}x{}", settings.cols, settings.lines));
        lines.push(format!(
            "log_file: {}",
            or_unset(self.log_file.as_ref().map(|p| p.display().to_string()))
        ));
        lines.push(format!("token: {}", mask(&self.token)));
        lines.push(format!("secret: {}", mask(&self.secret)));
        let source = match self.credential_source {
            CredentialSource::None => "none",
            CredentialSource::Store => "encrypted store",
            CredentialSource::EnvVar => "environment",
            CredentialSource::CommandLine => "command line",
        };
        lines.push(format!("token source: {}", source));
        lines.join("\n")
    }
}

/// `solarssh/` and `/solarssh` both mean `/solarssh`.
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Get machine ID for encryption key derivation.
fn get_machine_id() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(id) = fs::read_to_string("/etc/machine-id") {
            let trimmed = id.trim().to_string();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(output) = std::process::Command::new("ioreg")
            .args(["-rd1", "-c", "IOPlatformExpertDevice"])
            .output()
        {
            let stdout = String::from_utf8_lossy(&output.stdout);
            for line in stdout.lines() {
                if line.contains("IOPlatformUUID") {
                    if let Some(uuid) = line.split('"').nth(3) {
                        return uuid.to_string();
                    }
                }
            }
        }
    }

    // Fallback: hostname
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "solarssh-fallback-id".to_string())
}

// ── Encrypted token store (AES-256-GCM, machine-bound) ──────────────

/// SolarNet API token stored at ~/.config/solarssh/credentials.enc
///
/// File format: nonce (12 bytes) || ciphertext || auth tag (16 bytes)
/// Key: HMAC-SHA256(salt="solarssh-token-v1", machine_id)
pub struct CredentialStore;

#[derive(Serialize, Deserialize)]
struct StoredToken {
    token: String,
    secret: String,
}

impl CredentialStore {
    pub fn path() -> PathBuf {
        SolarSshConfig::config_dir().join("credentials.enc")
    }

    fn derive_key() -> Result<[u8; 32]> {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(b"solarssh-token-v1")
            .map_err(|e| anyhow!("Key derivation failed: {}", e))?;
        mac.update(get_machine_id().as_bytes());
        Ok(mac.finalize().into_bytes().into())
    }

    pub fn save(token: &str, secret: &str) -> Result<()> {
        Self::save_to(&Self::path(), token, secret)
    }

    pub fn save_to(path: &Path, token: &str, secret: &str) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let plaintext = serde_json::to_vec(&StoredToken {
            token: token.to_string(),
            secret: secret.to_string(),
        })?;

        let key = Self::derive_key()?;
        let cipher = <Aes256Gcm as aes_gcm::KeyInit>::new((&key).into());

        let mut nonce_bytes = [0u8; 12];
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::<Aes256Gcm>::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        let mut combined = Vec::with_capacity(12 + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        fs::write(path, &combined)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Load and decrypt the token. Returns None on any failure.
    pub fn load() -> Option<(String, String)> {
        Self::load_from(&Self::path())
    }

    pub fn load_from(path: &Path) -> Option<(String, String)> {
        let combined = fs::read(path).ok()?;
        if combined.len() < 12 + 16 {
            return None;
        }

        let (nonce_bytes, ciphertext) = combined.split_at(12);
        let nonce = Nonce::<Aes256Gcm>::from_slice(nonce_bytes);
        let key = Self::derive_key().ok()?;
        let cipher = <Aes256Gcm as aes_gcm::KeyInit>::new((&key).into());

        let plaintext = cipher.decrypt(nonce, ciphertext).ok()?;
        let stored: StoredToken = serde_json::from_slice(&plaintext).ok()?;
        Some((stored.token, stored.secret))
    }

    pub fn delete() -> Result<()> {
        let path = Self::path();
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}
