use std::sync::Arc;
use std::time::Duration;

use gridtx_common::{Address, EntryVersionsMap};
use gridtx_transaction::{
    CacheTransaction, CommandPipeline, CommandResponse, OwnershipOracle, RpcOptions, RpcTransport,
    TransactionResult, TxCommand, TxInvocationContext,
};
use tracing::trace;

use crate::network::Transport;
use crate::ownership::StaticOwnership;

/// Sends transaction commands to the owners of the written keys, the local member included.
///
/// Owners are visited one at a time in address order, so two transactions writing the same
/// keys always meet on the same member first.
pub struct ClusterPipeline {
    transport: Arc<Transport>,
    ownership: Arc<StaticOwnership>,
    timeout: Duration,
}

impl ClusterPipeline {
    pub fn new(transport: Arc<Transport>, ownership: Arc<StaticOwnership>, timeout: Duration) -> Self {
        Self {
            transport,
            ownership,
            timeout,
        }
    }

    fn recipients(&self, ctx: &TxInvocationContext) -> Vec<Address> {
        let topology = self.ownership.current_topology();
        let keys = ctx.transaction().affected_keys();
        let mut recipients: Vec<Address> = match self.ownership.owners(&topology, &keys) {
            Some(owners) => owners.into_iter().collect(),
            None => topology.members().to_vec(),
        };
        recipients.sort();
        recipients
    }
}

impl CommandPipeline for ClusterPipeline {
    fn invoke(
        &self,
        ctx: &TxInvocationContext,
        command: &TxCommand,
    ) -> TransactionResult<CommandResponse> {
        let local = self.transport.address();
        let recipients = self.recipients(ctx);
        if let TxCommand::Prepare(_) = command {
            ctx.local_transaction().locks_acquired(recipients.iter().filter(|owner| *owner != local));
        }

        let options = RpcOptions::sync(self.timeout);
        let mut versions: Option<EntryVersionsMap> = None;
        for recipient in &recipients {
            let responses = self.transport.invoke_remotely(
                Some(std::slice::from_ref(recipient)),
                command,
                &options,
            )?;
            for response in responses.values() {
                if let Some(received) = response.versions() {
                    versions
                        .get_or_insert_with(EntryVersionsMap::new)
                        .merge(received);
                }
            }
        }

        // The local member never receives a completion notification from the coordinator.
        if matches!(command, TxCommand::Commit(_)) && recipients.contains(local) {
            let release = TxCommand::TxCompletionNotification {
                gtx: command.global_transaction().clone(),
                topology_id: command.topology_id(),
            };
            self.transport.invoke_remotely(
                Some(std::slice::from_ref(local)),
                &release,
                &RpcOptions::asynchronous(self.timeout),
            )?;
        }
        trace!(
            gtx = %command.global_transaction(),
            command = command.name(),
            ?recipients,
            "command applied"
        );
        Ok(versions.map_or(CommandResponse::Unit, CommandResponse::Versions))
    }
}
