use std::fmt;

use log::debug;

use super::issuer::IssuerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Created,
    OrderOpen,
    Authorizing,
    ValidationPending,
    Validated,
    Finalizing,
    Issued,
    /// An authorization was rejected or never became valid.
    Invalid,
    Failed,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Issued | OrderState::Invalid | OrderState::Failed)
    }

    pub fn can_transition_to(&self, next: OrderState) -> bool {
        use OrderState::*;
        match (self, next) {
            (Created, OrderOpen)
            | (OrderOpen, Authorizing)
            | (Authorizing, ValidationPending)
            | (ValidationPending, Validated)
            | (Validated, Finalizing)
            | (Finalizing, Issued) => true,
            (Created | OrderOpen, Failed) => true,
            (Authorizing | ValidationPending | Validated | Finalizing, Invalid | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Current order state plus every state it has passed through.
#[derive(Debug, Clone)]
pub struct OrderMachine {
    state: OrderState,
    history: Vec<OrderState>,
}

impl Default for OrderMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderMachine {
    pub fn new() -> Self {
        Self {
            state: OrderState::Created,
            history: vec![OrderState::Created],
        }
    }

    pub fn state(&self) -> OrderState {
        self.state
    }

    pub fn history(&self) -> &[OrderState] {
        &self.history
    }

    pub fn advance(&mut self, next: OrderState) -> Result<(), IssuerError> {
        if !self.state.can_transition_to(next) {
            return Err(IssuerError::Operation(format!(
                "illegal order transition {} -> {}",
                self.state, next
            )));
        }
        debug!("[acme] order {} -> {}", self.state, next);
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Moves to a terminal failure state; a no-op when already terminal.
    pub fn fail(&mut self, invalid: bool) {
        let next = match (self.state, invalid) {
            (OrderState::Created | OrderState::OrderOpen, _) => OrderState::Failed,
            (_, true) => OrderState::Invalid,
            (_, false) => OrderState::Failed,
        };
        if !self.state.is_terminal() {
            let _ = self.advance(next);
        }
    }

    /// Whether a cancellation may still be honoured.
    pub fn cancellable(&self) -> bool {
        matches!(
            self.state,
            OrderState::Created
                | OrderState::OrderOpen
                | OrderState::Authorizing
                | OrderState::ValidationPending
                | OrderState::Validated
        )
    }
}
