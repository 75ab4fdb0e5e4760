// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cross-shard coordination fabric (§4.D): broadcast/targeted messaging,
//! readiness barrier, distributed lock, shared counter and FIFO queue.

pub mod barrier;
pub mod messages;
pub mod nats;

pub use barrier::ReadinessBarrier;
pub use messages::BusMessage;
pub use nats::{BusConfig, CoordinationBus};
