use serde::{Deserialize, Serialize};

pub const DEFAULT_COLS: u16 = 100;
pub const DEFAULT_LINES: u16 = 24;

/// Terminal type echoed to the relay in the attach handshake.
pub const TERM_TYPE: &str = "xterm";

/// Terminal geometry shared by the local TTY and the attach handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSettings {
    pub cols: u16,
    pub lines: u16,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            lines: DEFAULT_LINES,
        }
    }
}

impl TerminalSettings {
    pub fn new(cols: Option<u16>, lines: Option<u16>) -> Self {
        Self {
            cols: cols.filter(|c| *c > 0).unwrap_or(DEFAULT_COLS),
            lines: lines.filter(|l| *l > 0).unwrap_or(DEFAULT_LINES),
        }
    }
}

/// Session payload returned by the relay for create/start/stop.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    pub session_id: String,
    #[serde(default)]
    pub node_id: Option<u64>,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub reverse_port: u16,
    #[serde(default)]
    pub start_instruction_id: Option<u64>,
    #[serde(default)]
    pub stop_instruction_id: Option<u64>,
}

/// One relay-mediated SSH tunnel, held by the engine from create until stop or reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub host: String,
    pub port: u16,
    pub reverse_port: u16,
    pub start_instruction_id: Option<u64>,
    /// Set once the node acknowledged the StartRemoteSsh instruction.
    pub remote_ready: bool,
    /// Set once a stop has been issued for this session.
    pub stop_requested: bool,
}

impl Session {
    pub fn from_data(data: &SessionData) -> Self {
        Self {
            session_id: data.session_id.clone(),
            host: data.host.clone(),
            port: data.port,
            reverse_port: data.reverse_port,
            start_instruction_id: data.start_instruction_id,
            remote_ready: false,
            stop_requested: false,
        }
    }

    /// Merge a later relay payload (e.g. the start response) into this session.
    pub fn update_from(&mut self, data: &SessionData) {
        if !data.host.is_empty() {
            self.host = data.host.clone();
        }
        if data.port != 0 {
            self.port = data.port;
        }
        if data.reverse_port != 0 {
            self.reverse_port = data.reverse_port;
        }
        if data.start_instruction_id.is_some() {
            self.start_instruction_id = data.start_instruction_id;
        }
    }

    /// Parameters of the StartRemoteSsh / StopRemoteSsh instructions.
    pub fn instruction_parameters(&self) -> Vec<(&'static str, String)> {
        vec![
            ("host", self.host.clone()),
            ("user", self.session_id.clone()),
            ("port", self.port.to_string()),
            ("rport", self.reverse_port.to_string()),
        ]
    }
}

/// SSH login captured from the credential dialog. Lives until one attach handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"****")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_settings_defaults() {
        let settings = TerminalSettings::default();
        assert_eq!(settings.cols, 100);
        assert_eq!(settings.lines, 24);
    }

    #[test]
    fn terminal_settings_overrides_ignore_zero() {
        let settings = TerminalSettings::new(Some(0), Some(40));
        assert_eq!(settings.cols, 100);
        assert_eq!(settings.lines, 40);
    }

    #[test]
    fn session_data_parses_relay_payload() {
        let json = r#"{"sessionId":"abc","created":1,"nodeId":251,"host":"ssh.solarnetwork.net","port":8022,"reversePort":50123,"startInstructionId":null}"#;
        let data: SessionData = serde_json::from_str(json).unwrap();
        assert_eq!(data.session_id, "abc");
        assert_eq!(data.node_id, Some(251));
        assert_eq!(data.reverse_port, 50123);
        assert!(data.start_instruction_id.is_none());
    }

    #[test]
    fn update_from_keeps_coordinates_and_adds_instruction() {
        let created: SessionData = serde_json::from_str(
            r#"{"sessionId":"abc","host":"h","port":8022,"reversePort":50001}"#,
        )
        .unwrap();
        let started: SessionData =
            serde_json::from_str(r#"{"sessionId":"abc","startInstructionId":77}"#).unwrap();
        let mut session = Session::from_data(&created);
        session.update_from(&started);
        assert_eq!(session.host, "h");
        assert_eq!(session.port, 8022);
        assert_eq!(session.reverse_port, 50001);
        assert_eq!(session.start_instruction_id, Some(77));
    }

    #[test]
    fn instruction_parameters_use_session_id_as_user() {
        let data: SessionData = serde_json::from_str(
            r#"{"sessionId":"s1","host":"relay","port":22,"reversePort":50000}"#,
        )
        .unwrap();
        let params = Session::from_data(&data).instruction_parameters();
        assert_eq!(params[0], ("host", "relay".to_string()));
        assert_eq!(params[1], ("user", "s1".to_string()));
        assert_eq!(params[2], ("port", "22".to_string()));
        assert_eq!(params[3], ("rport", "50000".to_string()));
    }

    #[test]
    fn credentials_debug_masks_password() {
        let creds = Credentials::new("solar", "hunter2");
        let text = format!("{:?}", creds);
        assert!(text.contains("solar"));
        assert!(!text.contains("hunter2"));
    }
}
