use std::collections::HashMap;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use gridtx_common::Address;
use gridtx_transaction::{
    CommandResponse, RemoteTransactionHandler, RpcError, RpcOptions, RpcTransport, TxCommand,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::container::MemoryDataContainer;

struct Endpoint {
    handler: Weak<RemoteTransactionHandler>,
    container: Weak<MemoryDataContainer>,
}

/// In-process message bus connecting the members of a [`crate::Cluster`].
///
/// Commands are applied on the caller's thread. Every delivery is recorded.
#[derive(Default)]
pub struct Network {
    members: RwLock<Vec<Address>>,
    endpoints: DashMap<Address, Endpoint>,
    delivered: Mutex<Vec<(Address, TxCommand)>>,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connect(
        &self,
        address: Address,
        handler: &Arc<RemoteTransactionHandler>,
        container: &Arc<MemoryDataContainer>,
    ) {
        self.endpoints.insert(
            address.clone(),
            Endpoint {
                handler: Arc::downgrade(handler),
                container: Arc::downgrade(container),
            },
        );
        let mut members = self.members.write();
        if !members.contains(&address) {
            members.push(address);
            members.sort();
        }
    }

    /// Takes `address` off the network. Commands sent to it from now on fail as unreachable.
    pub fn disconnect(&self, address: &Address) {
        self.endpoints.remove(address);
        self.members.write().retain(|member| member != address);
    }

    pub fn members(&self) -> Vec<Address> {
        self.members.read().clone()
    }

    pub fn container(&self, address: &Address) -> Option<Arc<MemoryDataContainer>> {
        self.endpoints
            .get(address)
            .and_then(|endpoint| endpoint.container.upgrade())
    }

    /// Commands delivered so far, in delivery order.
    pub fn delivered(&self) -> Vec<(Address, TxCommand)> {
        self.delivered.lock().clone()
    }

    /// Commands named `name` delivered to `address`.
    pub fn delivered_to(&self, address: &Address, name: &str) -> usize {
        self.delivered
            .lock()
            .iter()
            .filter(|(to, command)| to == address && command.name() == name)
            .count()
    }

    fn deliver(&self, to: &Address, command: &TxCommand) -> Result<CommandResponse, RpcError> {
        let handler = self
            .endpoints
            .get(to)
            .and_then(|endpoint| endpoint.handler.upgrade())
            .ok_or_else(|| RpcError::Unreachable(to.clone()))?;
        self.delivered.lock().push((to.clone(), command.clone()));
        handler
            .handle(command)
            .map_err(|source| RpcError::Remote {
                address: to.clone(),
                source: Box::new(source),
            })
    }
}

/// The [`RpcTransport`] of one member.
pub struct Transport {
    address: Address,
    network: Arc<Network>,
}

impl Transport {
    pub fn new(address: Address, network: Arc<Network>) -> Self {
        Self { address, network }
    }
}

impl RpcTransport for Transport {
    fn address(&self) -> &Address {
        &self.address
    }

    fn members(&self) -> Vec<Address> {
        self.network.members()
    }

    fn invoke_remotely(
        &self,
        recipients: Option<&[Address]>,
        command: &TxCommand,
        options: &RpcOptions,
    ) -> Result<HashMap<Address, CommandResponse>, RpcError> {
        let recipients = match recipients {
            Some(recipients) => recipients.to_vec(),
            None => self
                .network
                .members()
                .into_iter()
                .filter(|member| member != &self.address)
                .collect(),
        };
        trace!(from = %self.address, ?recipients, command = command.name(), "sending command");

        let mut responses = HashMap::with_capacity(recipients.len());
        for recipient in recipients {
            match self.network.deliver(&recipient, command) {
                Ok(response) => {
                    responses.insert(recipient, response);
                }
                Err(RpcError::Unreachable(address)) if options.ignore_unreachable => {
                    debug!(%address, "ignoring unreachable recipient");
                }
                Err(err) if options.sync => return Err(err),
                Err(err) => debug!(error = %err, "asynchronous command failed"),
            }
        }
        if !options.sync {
            responses.clear();
        }
        Ok(responses)
    }
}
