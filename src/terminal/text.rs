//! ANSI-styled messages written into the terminal output area.
//!
//! The TTY runs in raw mode, so every line ends with `\r\n`.

pub const NEWLINE: &str = "\r\n";

pub const BRIGHT_GRAY: &str = "\x1B[30;1m";
pub const BRIGHT_RED: &str = "\x1B[31;1m";
pub const BRIGHT_GREEN: &str = "\x1B[32;1m";
pub const BRIGHT_YELLOW: &str = "\x1B[33;1m";
pub const RESET: &str = "\x1B[0m";

pub const CREATING_SESSION: &str = "Requesting new SSH session... ";
pub const STARTING_REMOTE: &str = "Requesting SolarNode to establish remote SSH session... ";
pub const WAITING_FOR_NODE: &str = "Waiting for SolarNode to establish remote SSH session...";
pub const ATTACHING: &str = "Attaching to SSH session... ";
pub const STOPPING_REMOTE: &str = "Requesting SolarNode to stop remote SSH session... ";
pub const POLL_TICK: &str = ".";

pub fn escaped(esc: &str, text: &str) -> String {
    format!("{}{}{}", esc, text, RESET)
}

pub fn line(text: &str) -> String {
    format!("{}{}", text, NEWLINE)
}

pub fn greeting() -> String {
    line(&format!(
        "Hello from {}{}!",
        escaped(BRIGHT_YELLOW, "Solar"),
        escaped(BRIGHT_GRAY, "SSH")
    ))
}

pub fn success() -> String {
    line(&escaped(BRIGHT_GREEN, "SUCCESS"))
}

pub fn failed() -> String {
    line(&escaped(BRIGHT_RED, "FAILED"))
}

pub fn error_line(text: &str) -> String {
    line(&escaped(BRIGHT_RED, text))
}

/// A control as named in hints: highlighted label plus its key chord.
fn control(label: &str, key: char) -> String {
    format!("{} (Ctrl+B {})", escaped(BRIGHT_YELLOW, label), key)
}

pub fn setup_hint() -> String {
    line(&format!(
        "Use the {} button to view the SolarNode setup GUI.",
        control("Setup", 's')
    ))
}

pub fn connect_hint() -> String {
    line(&format!("Use the {} button to connect via SSH.", control("Connect", 'c')))
}

pub fn reconnect_hint() -> String {
    format!(
        "{}{}",
        line(&format!("Use the {} button to reconnect via SSH.", control("Connect", 'c'))),
        line(&format!(
            "The {} button can still be used to view the SolarNode setup GUI.",
            control("Setup", 's')
        ))
    )
}

pub fn connection_closed(reason: &str) -> String {
    line(&format!("Connection closed: {}", reason))
}
