// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connection state machine: Disconnected → Connecting → Negotiating →
//! Connected, falling back to Faulted (with exponential backoff) on any
//! failure and retrying from Connecting.

use std::{future::Future, pin::Pin};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::{BackoffConfig, Config},
    client::connection::Connection,
    events::{ConnectionStatus, EventSurface},
    state_machine::common::{StateMachine, Transition},
};

/// Tracks the current reconnect delay, doubling on each failure and
/// resetting once a connection attempt succeeds.
#[derive(Debug, Clone)]
pub struct BackoffState {
    cfg: BackoffConfig,
    current: std::time::Duration,
}

impl BackoffState {
    pub fn new(cfg: BackoffConfig) -> Self {
        let current = cfg.initial_delay;
        BackoffState { cfg, current }
    }

    fn reset(&mut self) {
        self.current = self.cfg.initial_delay;
    }

    fn next_delay(&mut self) -> std::time::Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cfg.max_delay);
        delay
    }
}

pub struct ConnCtx<'a> {
    pub cfg: &'a Config,
    pub cancel: &'a CancellationToken,
    pub events: &'a EventSurface,
    pub backoff: BackoffState,
}

type ConnStepOut = Transition<ConnStates, Result<Connection>>;

pub enum ConnStates {
    Connecting(Connecting),
    Faulted(Faulted),
}

pub struct Connecting;

impl<'ctx> StateMachine<ConnCtx<'ctx>, ConnStepOut> for Connecting {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = ConnStepOut> + Send + 'a>>
    where
        Self: 'a,
        ConnCtx<'ctx>: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut ConnCtx<'ctx>) -> Self::StepResult<'a> {
        Box::pin(async move {
            ctx.events.publish_status(ConnectionStatus::Connecting);
            if ctx.cancel.is_cancelled() {
                return Transition::Done(Err(crate::error::S7Error::Cancelled.into()));
            }
            ctx.events.publish_status(ConnectionStatus::Negotiating);
            match Connection::connect(ctx.cfg, ctx.cancel).await {
                Ok(conn) => {
                    ctx.backoff.reset();
                    ctx.events.publish_status(ConnectionStatus::Connected);
                    Transition::Done(Ok(conn))
                },
                Err(e) => {
                    let delay = ctx.backoff.next_delay();
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "connection attempt failed");
                    ctx.events.publish_status(ConnectionStatus::Faulted);
                    Transition::Next(ConnStates::Faulted(Faulted { delay }), Err(e))
                },
            }
        })
    }
}

pub struct Faulted {
    delay: std::time::Duration,
}

impl<'ctx> StateMachine<ConnCtx<'ctx>, ConnStepOut> for Faulted {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = ConnStepOut> + Send + 'a>>
    where
        Self: 'a,
        ConnCtx<'ctx>: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut ConnCtx<'ctx>) -> Self::StepResult<'a> {
        let delay = self.delay;
        Box::pin(async move {
            debug!(delay_ms = delay.as_millis() as u64, "backing off before reconnect");
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    Transition::Done(Err(crate::error::S7Error::Cancelled.into()))
                },
                _ = tokio::time::sleep(delay) => {
                    Transition::Next(ConnStates::Connecting(Connecting), Err(anyhow::anyhow!("retrying")))
                },
            }
        })
    }
}

/// Drives the connection state machine until a connection succeeds or
/// `cancel` fires, retrying failed attempts with exponential backoff.
pub async fn run_connect(
    cfg: &Config,
    cancel: &CancellationToken,
    events: &EventSurface,
) -> Result<Connection> {
    let mut ctx = ConnCtx {
        cfg,
        cancel,
        events,
        backoff: BackoffState::new(cfg.backoff.clone()),
    };
    let mut state = ConnStates::Connecting(Connecting);
    loop {
        let outcome = match &mut state {
            ConnStates::Connecting(s) => s.step(&mut ctx).await,
            ConnStates::Faulted(s) => s.step(&mut ctx).await,
        };
        match outcome {
            Transition::Next(next, Err(_)) => state = next,
            Transition::Next(next, Ok(conn)) => {
                // Unreachable in practice (Next only carries Err today) but
                // handled for completeness of the Transition contract.
                let _ = next;
                return Ok(conn);
            },
            Transition::Stay(r) => return r,
            Transition::Done(r) => return r,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = BackoffConfig {
            initial_delay: std::time::Duration::from_millis(100),
            max_delay: std::time::Duration::from_millis(350),
        };
        let mut b = BackoffState::new(cfg);
        assert_eq!(b.next_delay(), std::time::Duration::from_millis(100));
        assert_eq!(b.next_delay(), std::time::Duration::from_millis(200));
        assert_eq!(b.next_delay(), std::time::Duration::from_millis(350));
        assert_eq!(b.next_delay(), std::time::Duration::from_millis(350));
    }

    #[test]
    fn backoff_resets() {
        let cfg = BackoffConfig {
            initial_delay: std::time::Duration::from_millis(100),
            max_delay: std::time::Duration::from_millis(1000),
        };
        let mut b = BackoffState::new(cfg);
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), std::time::Duration::from_millis(100));
    }
}
