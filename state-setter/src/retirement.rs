// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Secure erasure and decommissioning of retiring machines

use crate::exec::{command_for_serial, execute_async, ExecutionError};
use crate::inventory::{Inventory, InventoryError, SetStateError};
use crate::machine::{Machine, MachineState};
use async_trait::async_trait;
use slog::{info, Logger};
use slog_error_chain::SlogInlineError;
use std::sync::Arc;

#[async_trait]
pub trait SecureErase: Send + Sync {
    /// Irrecoverably erases the data of the machine with serial `serial`.
    /// Erasing an already erased machine succeeds.
    async fn secure_erase(&self, serial: &str) -> Result<(), ExecutionError>;
}

/// Erases machines by running an operator supplied command, with `{serial}`
/// in any argument replaced by the machine's serial.
pub struct CommandSecureErase {
    argv: Vec<String>,
}

impl CommandSecureErase {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl SecureErase for CommandSecureErase {
    async fn secure_erase(&self, serial: &str) -> Result<(), ExecutionError> {
        execute_async(&mut command_for_serial(&self.argv, serial)?).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, SlogInlineError)]
pub enum RetirementError {
    #[error("machine {serial} is {state}, not retiring")]
    NotRetiring { serial: String, state: MachineState },
    #[error("failed to secure erase {serial}")]
    SecureErase {
        serial: String,
        #[source]
        err: ExecutionError,
    },
    #[error("failed to delete encrypted volumes of {serial}")]
    DeleteVolumes {
        serial: String,
        #[source]
        err: InventoryError,
    },
    #[error("failed to mark {serial} retired")]
    SetState {
        serial: String,
        #[source]
        err: SetStateError,
    },
}

/// Takes a retiring machine through to retired.
///
/// Every step is idempotent, so a machine whose retirement failed part way
/// is simply retried from the start on a later cycle.
pub struct RetirementExecutor {
    log: Logger,
    inventory: Arc<dyn Inventory>,
    secure_erase: Arc<dyn SecureErase>,
}

impl RetirementExecutor {
    pub fn new(
        log: &Logger,
        inventory: Arc<dyn Inventory>,
        secure_erase: Arc<dyn SecureErase>,
    ) -> Self {
        Self {
            log: log.new(slog::o!("component" => "RetirementExecutor")),
            inventory,
            secure_erase,
        }
    }

    pub async fn retire(
        &self,
        machine: &Machine,
    ) -> Result<(), RetirementError> {
        let serial = &machine.serial;
        if machine.state != MachineState::Retiring {
            return Err(RetirementError::NotRetiring {
                serial: serial.clone(),
                state: machine.state,
            });
        }
        let log = self.log.new(slog::o!("serial" => serial.clone()));

        info!(log, "secure erasing machine");
        self.secure_erase.secure_erase(serial).await.map_err(|err| {
            RetirementError::SecureErase { serial: serial.clone(), err }
        })?;

        info!(log, "deleting encrypted volumes");
        self.inventory.delete_encrypted_volumes(serial).await.map_err(
            |err| RetirementError::DeleteVolumes {
                serial: serial.clone(),
                err,
            },
        )?;

        self.inventory
            .set_state(serial, MachineState::Retired)
            .await
            .map_err(|err| RetirementError::SetState {
                serial: serial.clone(),
                err,
            })?;
        info!(log, "machine retired");
        Ok(())
    }
}
