use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use gridtx_common::{
    Address, CacheTopology, Key, NumericVersionGenerator, TopologyChangedEvent, TopologyId, Value,
};
use gridtx_transaction::{
    CacheTransaction, ClusteredTransactionCoordinator, CommitOutcome, CoordinatorResult, DataContainer,
    InvocationContextContainer, LocalTransaction, MvccEntry, OwnershipOracle, PrepareOutcome,
    RemoteTransactionHandler, RpcError, TransactionConfig, TransactionCoordinator,
    TransactionHandle, TransactionResult, TransactionTable, WriteCommand,
};
use tracing::{debug, warn};

use crate::container::MemoryDataContainer;
use crate::network::{Network, Transport};
use crate::ownership::StaticOwnership;
use crate::pipeline::ClusterPipeline;

const INITIAL_TOPOLOGY_ID: TopologyId = 1;

/// One member of a [`Cluster`].
pub struct Node {
    address: Address,
    table: Arc<TransactionTable>,
    coordinator: ClusteredTransactionCoordinator,
    handler: Arc<RemoteTransactionHandler>,
    container: Arc<MemoryDataContainer>,
    versions: Arc<NumericVersionGenerator>,
    network: Arc<Network>,
    ownership: Arc<StaticOwnership>,
    next_handle: AtomicU64,
}

impl Node {
    fn start(
        address: Address,
        config: &TransactionConfig,
        network: &Arc<Network>,
        ownership: &Arc<StaticOwnership>,
    ) -> TransactionResult<Self> {
        let transport = Arc::new(Transport::new(address.clone(), Arc::clone(network)));
        let table = TransactionTable::new(config.clone(), transport.clone(), INITIAL_TOPOLOGY_ID);
        table.start()?;

        let container = Arc::new(MemoryDataContainer::new());
        let versions = Arc::new(NumericVersionGenerator::new(INITIAL_TOPOLOGY_ID));
        let handler = Arc::new(RemoteTransactionHandler::new(
            Arc::clone(&table),
            container.clone(),
            versions.clone(),
            ownership.clone(),
        ));
        network.connect(address.clone(), &handler, &container);

        let pipeline = ClusterPipeline::new(transport.clone(), ownership.clone(), config.rpc_timeout);
        let coordinator = TransactionCoordinator::new(
            Arc::clone(&table),
            Arc::new(pipeline),
            Arc::new(InvocationContextContainer::new()),
        );
        let coordinator =
            ClusteredTransactionCoordinator::new(coordinator, transport, ownership.clone())?;
        debug!(%address, "node started");
        Ok(Self {
            address,
            table,
            coordinator,
            handler,
            container,
            versions,
            network: Arc::clone(network),
            ownership: Arc::clone(ownership),
            next_handle: AtomicU64::new(1),
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn table(&self) -> &Arc<TransactionTable> {
        &self.table
    }

    pub fn coordinator(&self) -> &ClusteredTransactionCoordinator {
        &self.coordinator
    }

    pub fn handler(&self) -> &Arc<RemoteTransactionHandler> {
        &self.handler
    }

    pub fn container(&self) -> &Arc<MemoryDataContainer> {
        &self.container
    }

    /// Starts a transaction originated on this member.
    pub fn begin(&self) -> TransactionResult<Arc<LocalTransaction>> {
        let handle = TransactionHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.table.get_or_create_local_transaction(handle, false)
    }

    /// Reads `key` from its first owner. Repeated reads return what the transaction saw first.
    pub fn read(&self, tx: &LocalTransaction, key: impl Into<Key>) -> TransactionResult<Option<Value>> {
        let key = key.into();
        let entry = match tx.lookup_entry(&key) {
            Some(entry) => entry,
            None => self.read_entry(tx, key)?,
        };
        Ok(entry.value().cloned())
    }

    /// Buffers a put. The key is read first when the transaction has not seen it yet.
    pub fn write(
        &self,
        tx: &LocalTransaction,
        key: impl Into<Key>,
        value: impl Into<Value>,
    ) -> TransactionResult<()> {
        let key = key.into();
        let value = value.into();
        let mut entry = match tx.lookup_entry(&key) {
            Some(entry) => entry,
            None => self.read_entry(tx, key.clone())?,
        };
        entry.set_value(value.clone());
        tx.put_looked_up_entry(key.clone(), entry)?;
        tx.add_modification(WriteCommand::Put { key, value })
    }

    fn read_entry(&self, tx: &LocalTransaction, key: Key) -> TransactionResult<MvccEntry> {
        let owner = self
            .ownership
            .owners_of(&key)
            .into_iter()
            .next()
            .ok_or_else(|| RpcError::Unreachable(self.address.clone()))?;
        let container = self
            .network
            .container(&owner)
            .ok_or(RpcError::Unreachable(owner))?;
        let entry = MvccEntry::read(key.clone(), container.get(&key));
        tx.put_looked_up_entry(key, entry.clone())?;
        Ok(entry)
    }

    /// Runs both phases, rolling back when prepare fails.
    pub fn commit(&self, tx: &Arc<LocalTransaction>) -> CoordinatorResult<CommitOutcome> {
        let prepared = match self.coordinator.prepare(tx) {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Err(rollback) = self.coordinator.rollback(tx) {
                    warn!(gtx = %tx.global_transaction(), error = %rollback, "rollback after failed prepare failed");
                }
                return Err(err);
            }
        };
        match prepared {
            PrepareOutcome::Prepared => self.coordinator.commit(tx, false),
            PrepareOutcome::ReadOnly => Ok(CommitOutcome::Committed),
            PrepareOutcome::RollbackOnly => {
                self.coordinator.rollback(tx)?;
                Ok(CommitOutcome::RollbackOnly)
            }
        }
    }

    pub fn rollback(&self, tx: &Arc<LocalTransaction>) -> CoordinatorResult<()> {
        self.coordinator.rollback(tx)
    }
}

/// Members sharing one [`Network`] and one ownership map.
pub struct Cluster {
    network: Arc<Network>,
    ownership: Arc<StaticOwnership>,
    nodes: Vec<Node>,
}

impl Cluster {
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder::default()
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    pub fn ownership(&self) -> &Arc<StaticOwnership> {
        &self.ownership
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.address.name() == name)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn topology(&self) -> Arc<CacheTopology> {
        self.ownership.current_topology()
    }

    /// Crashes `name`: it leaves the network at once and the survivors install a topology
    /// without it. Returns whether the member was part of the cluster.
    pub fn kill(&mut self, name: &str) -> bool {
        let Some(position) = self.nodes.iter().position(|node| node.address.name() == name) else {
            return false;
        };
        let node = self.nodes.remove(position);
        self.network.disconnect(&node.address);
        drop(node);

        let old = self.topology();
        let members: Vec<Address> = old
            .members()
            .iter()
            .filter(|member| member.name() != name)
            .cloned()
            .collect();
        let new = CacheTopology::new(old.topology_id() + 1, members);
        self.ownership.set_topology(new.clone());
        let event = TopologyChangedEvent::new((*old).clone(), new);
        debug!(left = name, topology_id = event.new_topology().topology_id(), "member left");
        for node in &self.nodes {
            node.versions.set_topology_id(event.new_topology().topology_id());
            node.table.on_topology_changed(&event);
        }
        true
    }

    /// Stops every member, waiting for in-flight transactions.
    pub fn stop(&self) {
        for node in &self.nodes {
            node.table.stop();
        }
    }
}

#[derive(Default)]
pub struct ClusterBuilder {
    members: Vec<Address>,
    config: TransactionConfig,
    assignments: Vec<(Key, Vec<Address>)>,
}

impl ClusterBuilder {
    pub fn members<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.members = members.into_iter().map(Address::new).collect();
        self
    }

    pub fn config(mut self, config: TransactionConfig) -> Self {
        self.config = config;
        self
    }

    /// Assigns `key` to `owners`. Unassigned keys are owned by every member.
    pub fn owners<I, S>(mut self, key: impl Into<Key>, owners: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.assignments
            .push((key.into(), owners.into_iter().map(Address::new).collect()));
        self
    }

    pub fn start(self) -> TransactionResult<Cluster> {
        let mut members = self.members;
        members.sort();
        members.dedup();
        let network = Network::new();
        let ownership = Arc::new(StaticOwnership::new(CacheTopology::new(
            INITIAL_TOPOLOGY_ID,
            members.clone(),
        )));
        for (key, owners) in self.assignments {
            ownership.assign(key, owners);
        }
        let nodes = members
            .into_iter()
            .map(|address| Node::start(address, &self.config, &network, &ownership))
            .collect::<TransactionResult<Vec<_>>>()?;
        Ok(Cluster {
            network,
            ownership,
            nodes,
        })
    }
}
