//! Function-pointer state machine driving the voltage protection.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │  StateTable                                                   │
//! │  ┌─────────────┬──────────┬──────────┬───────────────────────┐│
//! │  │ StateId     │ on_enter │ on_exit  │ on_update             ││
//! │  ├─────────────┼──────────┼──────────┼───────────────────────┤│
//! │  │ Normal      │ fn(ctx)  │    -     │ fn(ctx)->Option<Id>   ││
//! │  │ LowVoltage  │ fn(ctx)  │ fn(ctx)  │ fn(ctx)->Option<Id>   ││
//! │  │ Shutdown    │ fn(ctx)  │    -     │ fn(ctx)->Option<Id>   ││
//! │  │ Protected   │ fn(ctx)  │    -     │ fn(ctx)->Option<Id>   ││
//! │  │ Recovery    │ fn(ctx)  │ fn(ctx)  │ fn(ctx)->Option<Id>   ││
//! │  └─────────────┴──────────┴──────────┴───────────────────────┘│
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each sample runs `on_update` for the current state.  A returned id
//! triggers `on_exit(current)`, then `on_enter(next)`.  Transient states
//! (`Shutdown`) settle within the same sample, so observers see the
//! passage through them in the event stream but never as the resting state.

use log::info;
use serde_json::json;

use super::context::ProtectionContext;
use super::event_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StateId {
    Normal = 0,
    LowVoltage = 1,
    Shutdown = 2,
    Protected = 3,
    Recovery = 4,
}

impl StateId {
    pub const COUNT: usize = 5;

    pub fn from_index(idx: usize) -> Self {
        match idx {
            0 => Self::Normal,
            1 => Self::LowVoltage,
            2 => Self::Shutdown,
            3 => Self::Protected,
            4 => Self::Recovery,
            _ => {
                debug_assert!(false, "invalid state index: {idx}");
                Self::Protected
            }
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::LowVoltage => "LOW_VOLTAGE",
            Self::Shutdown => "SHUTDOWN",
            Self::Protected => "PROTECTED",
            Self::Recovery => "RECOVERY",
        }
    }
}

pub type StateActionFn = fn(&mut ProtectionContext);
pub type StateUpdateFn = fn(&mut ProtectionContext) -> Option<StateId>;

pub struct StateDescriptor {
    pub id: StateId,
    pub on_enter: Option<StateActionFn>,
    pub on_exit: Option<StateActionFn>,
    pub on_update: StateUpdateFn,
    /// Settles into its successor within the sample that entered it.
    pub transient: bool,
}

pub struct Fsm {
    table: [StateDescriptor; StateId::COUNT],
    current: usize,
}

impl Fsm {
    pub fn new(table: [StateDescriptor; StateId::COUNT], initial: StateId) -> Self {
        Self {
            table,
            current: initial as usize,
        }
    }

    pub fn start(&mut self, ctx: &mut ProtectionContext) {
        info!("Power: protection starting in {}", self.current_state().as_str());
        ctx.state_entered_ms = ctx.now_ms;
        if let Some(enter) = self.table[self.current].on_enter {
            enter(ctx);
        }
    }

    /// Run one sample through the table.
    pub fn step(&mut self, ctx: &mut ProtectionContext) {
        if let Some(next) = (self.table[self.current].on_update)(ctx) {
            self.transition(next, ctx);
        }
        // Bounded: a transient state never chains into another transient one.
        for _ in 0..StateId::COUNT {
            if !self.table[self.current].transient {
                break;
            }
            match (self.table[self.current].on_update)(ctx) {
                Some(next) => self.transition(next, ctx),
                None => break,
            }
        }
    }

    /// Jump straight to `next`, running the exit and enter hooks.
    pub fn force_transition(&mut self, next: StateId, ctx: &mut ProtectionContext) {
        if next as usize != self.current {
            self.transition(next, ctx);
        }
    }

    pub fn current_state(&self) -> StateId {
        self.table[self.current].id
    }

    fn transition(&mut self, next: StateId, ctx: &mut ProtectionContext) {
        let old = self.current_state();
        info!(
            "Power: {} -> {} at {:.2} V",
            old.as_str(),
            next.as_str(),
            ctx.voltage
        );

        if let Some(exit) = self.table[self.current].on_exit {
            exit(ctx);
        }

        self.current = next as usize;
        ctx.state_entered_ms = ctx.now_ms;

        ctx.emit(
            event_id::STATE_CHANGED,
            json!({
                "old": old.as_str(),
                "new": next.as_str(),
                "voltage": ctx.voltage,
                "devices": ctx.devices.to_json(),
            }),
        );

        if let Some(enter) = self.table[self.current].on_enter {
            enter(ctx);
        }
    }
}
