// Process monitor lifecycle
//
// Idle -> Collecting -> Active -> Idle, driven by an explicit transition
// function so the monitor never branches on anything but this enum.

use serde::Serialize;

use crate::error::{NetlabError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MonitorState {
    /// Nothing tracked
    Idle,
    /// Processes registered, not yet validated or polled
    Collecting,
    /// Poll loop running
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    /// An async process was registered
    Launched,
    /// A poll step is about to run
    Polled {
        /// Processes registered since the monitor left Idle
        processes: usize,
        /// Of those, how many are transient (non-daemon)
        transients: usize,
    },
    /// Every transient process has terminated
    Finished,
    /// `stop()` or a fatal validation error
    Stopped,
}

/// How a dead process affects the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Transient process exited with 0
    Normal,
    /// Transient process exited non-zero
    CommandFailed,
    /// Daemon exited while Active, whatever the code
    DaemonExited,
}

impl MonitorState {
    /// Apply an event
    ///
    /// Validation happens exactly once, on the Collecting -> Active edge.
    ///
    /// # Errors
    /// - `NoProcesses` when polling with nothing registered
    /// - `AllDaemons` when polling with only daemons registered
    /// - `InvalidState` for transitions the monitor must never attempt
    pub fn transition(self, event: MonitorEvent) -> Result<MonitorState> {
        use MonitorEvent::*;
        use MonitorState::*;

        match (self, event) {
            (_, Stopped) => Ok(Idle),

            (Idle | Collecting, Launched) => Ok(Collecting),
            (Active, Launched) => Ok(Active),

            (Idle, Polled { .. }) => Err(NetlabError::NoProcesses),
            (Collecting, Polled { processes: 0, .. }) => Err(NetlabError::NoProcesses),
            (Collecting, Polled { transients: 0, .. }) => Err(NetlabError::AllDaemons),
            (Collecting, Polled { .. }) => Ok(Active),
            (Active, Polled { .. }) => Ok(Active),

            (Active, Finished) => Ok(Idle),
            (state, Finished) => Err(NetlabError::InvalidState(format!(
                "monitor cannot finish from {:?}",
                state
            ))),
        }
    }
}

/// Classify a process death observed while the monitor is Active
pub fn classify_exit(returncode: i32, is_daemon: bool) -> ExitOutcome {
    if is_daemon {
        ExitOutcome::DaemonExited
    } else if returncode == 0 {
        ExitOutcome::Normal
    } else {
        ExitOutcome::CommandFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn polled(processes: usize, transients: usize) -> MonitorEvent {
        MonitorEvent::Polled {
            processes,
            transients,
        }
    }

    #[test]
    fn test_happy_path() {
        let state = MonitorState::Idle;
        let state = state.transition(MonitorEvent::Launched).unwrap();
        assert_eq!(state, MonitorState::Collecting);
        let state = state.transition(MonitorEvent::Launched).unwrap();
        let state = state.transition(polled(2, 1)).unwrap();
        assert_eq!(state, MonitorState::Active);
        let state = state.transition(polled(2, 1)).unwrap();
        assert_eq!(state, MonitorState::Active);
        let state = state.transition(MonitorEvent::Launched).unwrap();
        assert_eq!(state, MonitorState::Active);
        assert_eq!(
            state.transition(MonitorEvent::Finished).unwrap(),
            MonitorState::Idle
        );
    }

    #[test]
    fn test_validation_errors() {
        assert!(matches!(
            MonitorState::Idle.transition(polled(0, 0)),
            Err(NetlabError::NoProcesses)
        ));
        assert!(matches!(
            MonitorState::Collecting.transition(polled(0, 0)),
            Err(NetlabError::NoProcesses)
        ));
        assert!(matches!(
            MonitorState::Collecting.transition(polled(3, 0)),
            Err(NetlabError::AllDaemons)
        ));
    }

    #[test]
    fn test_active_is_not_revalidated() {
        // Transients all gone but the step still runs, daemons are polled
        assert_eq!(
            MonitorState::Active.transition(polled(2, 0)).unwrap(),
            MonitorState::Active
        );
    }

    #[test]
    fn test_stop_from_anywhere() {
        for state in [
            MonitorState::Idle,
            MonitorState::Collecting,
            MonitorState::Active,
        ] {
            assert_eq!(
                state.transition(MonitorEvent::Stopped).unwrap(),
                MonitorState::Idle
            );
        }
        assert!(MonitorState::Collecting
            .transition(MonitorEvent::Finished)
            .is_err());
    }

    #[test]
    fn test_classify_exit() {
        assert_eq!(classify_exit(0, false), ExitOutcome::Normal);
        assert_eq!(classify_exit(2, false), ExitOutcome::CommandFailed);
        assert_eq!(classify_exit(-9, false), ExitOutcome::CommandFailed);
        assert_eq!(classify_exit(0, true), ExitOutcome::DaemonExited);
        assert_eq!(classify_exit(1, true), ExitOutcome::DaemonExited);
    }
}
