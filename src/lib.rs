//! Countdown timers and daily alarms whose state survives the process being
//! closed. On every open the persisted records are reconciled with the time
//! that passed while nothing was running.

pub mod alarm;
pub mod alerts;
pub mod api;
pub mod clock;
pub mod error;
pub mod render;
pub mod runtime;
pub mod storage;
pub mod timer;
