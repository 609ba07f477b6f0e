pub mod form;
pub mod keys;
pub mod text;

use anyhow::Result;
use crossterm::{
    cursor::MoveTo,
    execute,
    terminal::{self as ct, Clear, ClearType, SetTitle, disable_raw_mode, enable_raw_mode},
};
use std::io::{self, Stdout, Write};

use crate::gating::Controls;
use crate::session::TerminalSettings;

/// Output side of the local terminal.
pub trait TerminalSink {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()>;

    fn write_str(&mut self, text: &str) -> Result<()> {
        self.write_bytes(text.as_bytes())
    }

    fn clear(&mut self) -> Result<()>;

    /// Show the enabled controls.
    fn show_controls(&mut self, controls: Controls) -> Result<()>;
}

/// Local TTY standing in for the terminal widget.
///
/// Raw mode is enabled for the lifetime of the value and restored on drop.
pub struct Tty {
    stdout: Stdout,
}

impl Tty {
    pub fn open() -> Result<Self> {
        enable_raw_mode()?;
        Ok(Self {
            stdout: io::stdout(),
        })
    }
}

impl TerminalSink for Tty {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.stdout.write_all(bytes)?;
        self.stdout.flush()?;
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        execute!(self.stdout, Clear(ClearType::All), MoveTo(0, 0))?;
        Ok(())
    }

    /// Controls go in the window title.
    fn show_controls(&mut self, controls: Controls) -> Result<()> {
        execute!(self.stdout, SetTitle(format!("SolarSSH {}", controls)))?;
        Ok(())
    }
}

impl Drop for Tty {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = self.stdout.write_all(text::NEWLINE.as_bytes());
        let _ = self.stdout.flush();
    }
}

/// Terminal geometry: explicit values win, then the local TTY size.
pub fn detect_settings(cols: Option<u16>, lines: Option<u16>) -> TerminalSettings {
    let (tty_cols, tty_lines) = match ct::size() {
        Ok((c, l)) => (Some(c), Some(l)),
        Err(_) => (None, None),
    };
    TerminalSettings::new(cols.or(tty_cols), lines.or(tty_lines))
}
