//! Routes one interrupt signal to the running turn or to shutdown

use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

/// Where an interrupt lands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    /// A running turn was cancelled
    Turn,
    /// Nothing was running; shutdown was requested
    Shutdown,
}

/// Shared between one long-lived signal listener and the turn loop
///
/// While a turn is running an interrupt cancels only that turn; at the
/// prompt it cancels [`Interrupter::shutdown`].
#[derive(Debug, Default)]
pub struct Interrupter {
    current: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl Interrupter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for a new turn, armed until [`Interrupter::end_turn`]
    #[must_use]
    pub fn begin_turn(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        token
    }

    pub fn end_turn(&self) {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Deliver one interrupt
    pub fn interrupt(&self) -> Interrupted {
        let turn = self.current.lock().unwrap_or_else(PoisonError::into_inner).take();
        match turn {
            Some(token) => {
                token.cancel();
                Interrupted::Turn
            }
            None => {
                self.shutdown.cancel();
                Interrupted::Shutdown
            }
        }
    }

    /// Cancelled once an interrupt arrives with no turn running
    #[must_use]
    pub const fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }
}
