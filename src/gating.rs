use std::fmt;

use crate::engine::EngineState;

/// Which of the three user actions are currently legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Controls {
    pub connect: bool,
    pub setup_gui: bool,
    pub end: bool,
}

impl Controls {
    pub const NONE: Controls = Controls {
        connect: false,
        setup_gui: false,
        end: false,
    };

    /// Project the engine state onto the controls.
    ///
    /// `has_session` is whether a relay session is held; `remote_ready` is
    /// whether the node acknowledged the start instruction for it.
    pub fn project(state: EngineState, has_session: bool, remote_ready: bool) -> Self {
        let retained = Controls {
            connect: false,
            setup_gui: has_session && remote_ready,
            end: has_session,
        };
        match state {
            EngineState::Idle => Controls {
                connect: true,
                ..Controls::NONE
            },
            EngineState::AwaitingCredentials => retained,
            EngineState::CreatingSession
            | EngineState::StartingRemoteSession
            | EngineState::StoppingSession => Controls::NONE,
            EngineState::WaitingForDeviceConnect => Controls {
                end: has_session,
                ..Controls::NONE
            },
            EngineState::Attaching | EngineState::Live => retained,
            EngineState::Ready | EngineState::Failed => Controls {
                connect: true,
                ..retained
            },
        }
    }
}

impl fmt::Display for Controls {
    /// Compact label list, e.g. `[c]onnect [s]etup`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<&str> = [
            (self.connect, "[c]onnect"),
            (self.setup_gui, "[s]etup"),
            (self.end, "[e]nd"),
        ]
        .iter()
        .filter(|(on, _)| *on)
        .map(|(_, label)| *label)
        .collect();
        if labels.is_empty() {
            f.write_str("(busy)")
        } else {
            f.write_str(&labels.join(" "))
        }
    }
}
