use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

use super::text::{BRIGHT_YELLOW, NEWLINE, escaped, line};
use crate::engine::DialogOutcome;
use crate::session::Credentials;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Username,
    Password,
}

/// What the caller should do after one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormStep {
    /// Keep reading; write `echo` to the TTY.
    Echo(String),
    Done(DialogOutcome),
}

/// In-terminal SSH login prompt, fed one key at a time.
///
/// Enter moves from username to password and then submits. Esc or Ctrl+C
/// cancels, Ctrl+S continues without SSH credentials.
#[derive(Debug)]
pub struct CredentialForm {
    field: Field,
    username: String,
    password: String,
}

impl CredentialForm {
    /// A fresh form plus the text that draws it.
    pub fn open() -> (Self, String) {
        let form = Self {
            field: Field::Username,
            username: String::new(),
            password: String::new(),
        };
        let prompt = format!(
            "{}{}{}",
            NEWLINE,
            line(&format!(
                "{} Enter to submit, Esc to cancel, Ctrl+S to skip SSH login.",
                escaped(BRIGHT_YELLOW, "SSH login.")
            )),
            "Username: "
        );
        (form, prompt)
    }

    pub fn feed(&mut self, key: KeyEvent) -> FormStep {
        if key.kind != KeyEventKind::Press {
            return FormStep::Echo(String::new());
        }
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Esc => self.finish(DialogOutcome::Cancelled),
            KeyCode::Char('c') | KeyCode::Char('C') if ctrl => self.finish(DialogOutcome::Cancelled),
            KeyCode::Char('s') | KeyCode::Char('S') if ctrl => self.finish(DialogOutcome::SkipLogin),
            KeyCode::Enter => match self.field {
                Field::Username => {
                    self.field = Field::Password;
                    FormStep::Echo(format!("{}Password: ", NEWLINE))
                }
                Field::Password => {
                    let creds = Credentials::new(
                        std::mem::take(&mut self.username),
                        std::mem::take(&mut self.password),
                    );
                    self.finish(DialogOutcome::Login(creds))
                }
            },
            KeyCode::Backspace => match self.field {
                Field::Username => {
                    if self.username.pop().is_some() {
                        FormStep::Echo("\x08 \x08".to_string())
                    } else {
                        FormStep::Echo(String::new())
                    }
                }
                Field::Password => {
                    self.password.pop();
                    FormStep::Echo(String::new())
                }
            },
            KeyCode::Char(c) if !ctrl => match self.field {
                Field::Username => {
                    self.username.push(c);
                    FormStep::Echo(c.to_string())
                }
                Field::Password => {
                    self.password.push(c);
                    FormStep::Echo(String::new())
                }
            },
            _ => FormStep::Echo(String::new()),
        }
    }

    fn finish(&mut self, outcome: DialogOutcome) -> FormStep {
        // Form reset: nothing typed survives the dialog.
        self.username.clear();
        self.password.clear();
        FormStep::Done(outcome)
    }
}
