use thiserror::Error;

/// Lifecycle of one external dependency install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    Absent,
    DownloadingChecksum,
    DownloadingPayload,
    Verifying,
    Installing,
    Present,
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(InstallState, InstallState),
}

pub struct InstallMachine {
    name: String,
    pub state: InstallState,
}

impl InstallMachine {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: InstallState::Absent,
        }
    }

    pub fn can_transition(&self, to: InstallState) -> bool {
        use InstallState::*;
        matches!(
            (self.state, to),
            (Absent, Present)
                | (Absent, DownloadingChecksum)
                | (DownloadingChecksum, DownloadingPayload)
                // transfer failed, try again
                | (DownloadingPayload, DownloadingPayload)
                | (DownloadingPayload, Verifying)
                // digest mismatch: payload deleted and fetched again
                | (Verifying, DownloadingPayload)
                | (Verifying, Installing)
                // installer ran but the target is still missing
                | (Installing, Installing)
                | (Installing, Present)
        )
    }

    pub fn transition(&mut self, to: InstallState) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::debug!("{}: {:?} -> {:?}", self.name, self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }

    pub fn is_present(&self) -> bool {
        self.state == InstallState::Present
    }
}
