//! Endpoint builders for SolarNet (SolarUser API) and the SolarSSH relay.

/// Default SolarNet host.
pub const DEFAULT_SN_HOST: &str = "data.solarnetwork.net";
/// Default SolarSSH relay host.
pub const DEFAULT_SSH_HOST: &str = "ssh.solarnetwork.net:8443";

/// WebSocket sub-protocol spoken by the relay's terminal endpoint.
pub const TERMINAL_SUB_PROTOCOL: &str = "solarssh";

pub const START_REMOTE_SSH_TOPIC: &str = "StartRemoteSsh";
pub const STOP_REMOTE_SSH_TOPIC: &str = "StopRemoteSsh";

const SOLARUSER_PATH: &str = "/solaruser/api/v1/sec";
const SSH_API_PATH: &str = "/api/v1/ssh";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlHelper {
    pub node_id: u64,
    pub sn_host: String,
    pub sn_tls: bool,
    pub ssh_host: String,
    pub ssh_path: String,
    pub ssh_tls: bool,
}

impl UrlHelper {
    pub fn new(node_id: u64) -> Self {
        Self {
            node_id,
            sn_host: DEFAULT_SN_HOST.to_string(),
            sn_tls: true,
            ssh_host: DEFAULT_SSH_HOST.to_string(),
            ssh_path: String::new(),
            ssh_tls: true,
        }
    }

    fn scheme(tls: bool, secure: &'static str, plain: &'static str) -> &'static str {
        if tls { secure } else { plain }
    }

    // ── SolarNet ──────────────────────────────────────────────────────────

    pub fn sn_base_url(&self) -> String {
        format!("{}://{}", Self::scheme(self.sn_tls, "https", "http"), self.sn_host)
    }

    fn solaruser_url(&self) -> String {
        format!("{}{}", self.sn_base_url(), SOLARUSER_PATH)
    }

    pub fn view_pending_instructions_url(&self) -> String {
        format!("{}/instr/viewPending?nodeId={}", self.solaruser_url(), self.node_id)
    }

    pub fn view_instruction_url(&self, instruction_id: u64) -> String {
        format!("{}/instr/view?id={}", self.solaruser_url(), instruction_id)
    }

    pub fn view_node_metadata_url(&self) -> String {
        format!("{}/nodes/meta/{}", self.solaruser_url(), self.node_id)
    }

    /// URL that would queue `topic` on the node with the given parameters.
    pub fn queue_instruction_url(&self, topic: &str, parameters: &[(&str, String)]) -> String {
        let mut url = format!(
            "{}/instr/add?nodeId={}&topic={}",
            self.solaruser_url(),
            self.node_id,
            urlencoding::encode(topic)
        );
        for (i, (name, value)) in parameters.iter().enumerate() {
            url.push_str(&format!(
                "&{}={}&{}={}",
                urlencoding::encode(&format!("parameters[{}].name", i)),
                urlencoding::encode(name),
                urlencoding::encode(&format!("parameters[{}].value", i)),
                urlencoding::encode(value)
            ));
        }
        url
    }

    // ── SolarSSH ──────────────────────────────────────────────────────────

    fn ssh_base_url(&self) -> String {
        format!(
            "{}://{}{}",
            Self::scheme(self.ssh_tls, "https", "http"),
            self.ssh_host,
            self.ssh_path
        )
    }

    pub fn create_session_url(&self) -> String {
        format!("{}{}/session/new?nodeId={}", self.ssh_base_url(), SSH_API_PATH, self.node_id)
    }

    pub fn start_session_url(&self, session_id: &str) -> String {
        format!(
            "{}{}/session/{}/start",
            self.ssh_base_url(),
            SSH_API_PATH,
            urlencoding::encode(session_id)
        )
    }

    pub fn stop_session_url(&self, session_id: &str) -> String {
        format!(
            "{}{}/session/{}/stop",
            self.ssh_base_url(),
            SSH_API_PATH,
            urlencoding::encode(session_id)
        )
    }

    pub fn terminal_websocket_url(&self, session_id: &str) -> String {
        format!(
            "{}://{}{}/ssh?sessionId={}",
            Self::scheme(self.ssh_tls, "wss", "ws"),
            self.ssh_host,
            self.ssh_path,
            urlencoding::encode(session_id)
        )
    }

    /// Setup GUI of the node, proxied over the session's reverse HTTP tunnel.
    pub fn http_proxy_url(&self, session_id: &str) -> String {
        format!(
            "{}/nodeproxy/{}/",
            self.ssh_base_url(),
            urlencoding::encode(session_id)
        )
    }
}
