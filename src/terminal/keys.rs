use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

/// User-level actions reachable from the keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    SetupGui,
    End,
    Quit,
}

/// Result of feeding one key into the chord reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAction {
    Command(Command),
    /// Bytes for the remote shell.
    Input(String),
    None,
}

/// Reads `Ctrl+B <key>` chords. When no shell is attached the bare keys
/// work too; while attached every other key goes to the shell.
#[derive(Debug, Default)]
pub struct ChordReader {
    prefix: bool,
}

impl ChordReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, key: KeyEvent, attached: bool) -> KeyAction {
        if key.kind != KeyEventKind::Press {
            return KeyAction::None;
        }
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);

        if self.prefix {
            self.prefix = false;
            return match command_for(key.code) {
                Some(cmd) => KeyAction::Command(cmd),
                // Ctrl+B Ctrl+B sends a literal Ctrl+B.
                None if ctrl && is_b(key.code) && attached => KeyAction::Input("\x02".to_string()),
                None => KeyAction::None,
            };
        }

        if ctrl && is_b(key.code) {
            self.prefix = true;
            return KeyAction::None;
        }

        if attached {
            return match key_to_bytes(key) {
                Some(bytes) => KeyAction::Input(bytes),
                None => KeyAction::None,
            };
        }

        if ctrl && matches!(key.code, KeyCode::Char('c') | KeyCode::Char('C')) {
            return KeyAction::Command(Command::Quit);
        }
        if ctrl {
            return KeyAction::None;
        }
        match command_for(key.code) {
            Some(cmd) => KeyAction::Command(cmd),
            None => KeyAction::None,
        }
    }
}

fn is_b(code: KeyCode) -> bool {
    matches!(code, KeyCode::Char('b') | KeyCode::Char('B'))
}

fn command_for(code: KeyCode) -> Option<Command> {
    match code {
        KeyCode::Char('c') | KeyCode::Char('C') => Some(Command::Connect),
        KeyCode::Char('s') | KeyCode::Char('S') => Some(Command::SetupGui),
        KeyCode::Char('e') | KeyCode::Char('E') => Some(Command::End),
        KeyCode::Char('q') | KeyCode::Char('Q') => Some(Command::Quit),
        _ => None,
    }
}

/// Translate a key press into the byte sequence an xterm would send.
pub fn key_to_bytes(key: KeyEvent) -> Option<String> {
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    let alt = key.modifiers.contains(KeyModifiers::ALT);
    let base = if ctrl {
        match key.code {
            KeyCode::Char(c) if c.is_ascii_alphabetic() => {
                // Ctrl+A..Z -> 0x01..0x1A
                let byte = (c.to_ascii_lowercase() as u8).wrapping_sub(b'a' - 1);
                Some(String::from(byte as char))
            }
            KeyCode::Char(' ') | KeyCode::Char('@') => Some("\x00".to_string()),
            KeyCode::Char('[') => Some("\x1b".to_string()),
            KeyCode::Char('\\') => Some("\x1c".to_string()),
            KeyCode::Char(']') => Some("\x1d".to_string()),
            _ => None,
        }
    } else {
        match key.code {
            KeyCode::Char(c) => Some(String::from(c)),
            KeyCode::Enter => Some("\r".to_string()),
            KeyCode::Backspace => Some("\x7f".to_string()),
            KeyCode::Tab => Some("\t".to_string()),
            KeyCode::BackTab => Some("\x1b[Z".to_string()),
            KeyCode::Esc => Some("\x1b".to_string()),
            KeyCode::Up => Some("\x1b[A".to_string()),
            KeyCode::Down => Some("\x1b[B".to_string()),
            KeyCode::Right => Some("\x1b[C".to_string()),
            KeyCode::Left => Some("\x1b[D".to_string()),
            KeyCode::Home => Some("\x1b[H".to_string()),
            KeyCode::End => Some("\x1b[F".to_string()),
            KeyCode::PageUp => Some("\x1b[5~".to_string()),
            KeyCode::PageDown => Some("\x1b[6~".to_string()),
            KeyCode::Delete => Some("\x1b[3~".to_string()),
            KeyCode::Insert => Some("\x1b[2~".to_string()),
            KeyCode::F(n) => Some(match n {
                1 => "\x1bOP".to_string(),
                2 => "\x1bOQ".to_string(),
                3 => "\x1bOR".to_string(),
                4 => "\x1bOS".to_string(),
                5 => "\x1b[15~".to_string(),
                6 => "\x1b[17~".to_string(),
                7 => "\x1b[18~".to_string(),
                8 => "\x1b[19~".to_string(),
                9 => "\x1b[20~".to_string(),
                10 => "\x1b[21~".to_string(),
                11 => "\x1b[23~".to_string(),
                12 => "\x1b[24~".to_string(),
                _ => format!("\x1b[{}~", n),
            }),
            _ => None,
        }
    };
    // Meta prefixes the sequence with ESC.
    base.map(|s| if alt { format!("\x1b{}", s) } else { s })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn ctrl(c: char) -> KeyEvent {
        KeyEvent::new(KeyCode::Char(c), KeyModifiers::CONTROL)
    }

    #[test]
    fn plain_keys_map_to_xterm_bytes() {
        assert_eq!(key_to_bytes(key(KeyCode::Char('x'))).as_deref(), Some("x"));
        assert_eq!(key_to_bytes(key(KeyCode::Enter)).as_deref(), Some("\r"));
        assert_eq!(key_to_bytes(key(KeyCode::Up)).as_deref(), Some("\x1b[A"));
        assert_eq!(key_to_bytes(key(KeyCode::F(5))).as_deref(), Some("\x1b[15~"));
        assert_eq!(key_to_bytes(ctrl('c')).as_deref(), Some("\x03"));
        assert_eq!(
            key_to_bytes(KeyEvent::new(KeyCode::Char('f'), KeyModifiers::ALT)).as_deref(),
            Some("\x1bf")
        );
    }

    #[test]
    fn chord_commands_work_while_attached() {
        let mut reader = ChordReader::new();
        assert_eq!(reader.feed(ctrl('b'), true), KeyAction::None);
        assert_eq!(reader.feed(key(KeyCode::Char('e')), true), KeyAction::Command(Command::End));
        // Prefix consumed: next 'e' goes to the shell.
        assert_eq!(reader.feed(key(KeyCode::Char('e')), true), KeyAction::Input("e".into()));
    }

    #[test]
    fn double_prefix_sends_literal_ctrl_b() {
        let mut reader = ChordReader::new();
        reader.feed(ctrl('b'), true);
        assert_eq!(reader.feed(ctrl('b'), true), KeyAction::Input("\x02".into()));
    }

    #[test]
    fn bare_keys_are_commands_when_detached() {
        let mut reader = ChordReader::new();
        assert_eq!(reader.feed(key(KeyCode::Char('c')), false), KeyAction::Command(Command::Connect));
        assert_eq!(reader.feed(key(KeyCode::Char('s')), false), KeyAction::Command(Command::SetupGui));
        assert_eq!(reader.feed(key(KeyCode::Char('x')), false), KeyAction::None);
        assert_eq!(reader.feed(ctrl('c'), false), KeyAction::Command(Command::Quit));
    }

    #[test]
    fn attached_shell_gets_ctrl_c() {
        let mut reader = ChordReader::new();
        assert_eq!(reader.feed(ctrl('c'), true), KeyAction::Input("\x03".into()));
    }
}
