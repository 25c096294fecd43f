// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decides the lifecycle state of every machine in a bare-metal cluster
//!
//! The [`controller::Controller`] periodically combines cluster membership,
//! alerts and hardware health metrics into one state per machine, records
//! those states in the machine inventory, and secure erases machines that
//! operators have marked for retirement.

pub mod config;
pub mod controller;
pub mod decision;
pub mod exec;
#[cfg(any(test, feature = "testing"))]
pub mod fakes;
pub mod hysteresis;
pub mod inventory;
pub mod logging;
pub mod machine;
pub mod policy;
pub mod retirement;
pub mod selector;
pub mod signals;

pub use config::Config;
pub use controller::Controller;
pub use controller::CycleError;
pub use controller::CycleReport;
pub use decision::decide;
pub use decision::Decision;
pub use machine::Machine;
pub use machine::MachineState;
