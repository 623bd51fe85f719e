//! # Connection State Tracker
//!
//! Records the commands that create broker-side state so that it can be rebuilt
//! on a fresh transport after failover.
//!
//! Creation records (connection, session, consumer, producer) are kept in the
//! order they were first tracked. A `RemoveInfo` cancels the record it names and
//! every record below it; the removal itself is never replayed. Open
//! transactions keep their begin marker plus, when enabled, the messages and
//! acknowledgements sent inside them. Replay order is:
//!
//! 1. creation records, oldest first (parents always precede children)
//! 2. each open transaction: begin marker, then its operations in send order
//! 3. cached one-way messages, when message tracking is enabled

use crate::transport::Transport;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, info, trace};
use wirelink_core::{
    command::{ObjectId, TransactionType},
    config::FailoverConfig,
    types::{ConnectionId, ConsumerId, ProducerId, SessionId, TransactionId},
    Command, CommandKind, Error, Result,
};

/// Identity of a piece of tracked broker state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StateKey {
    /// A connection
    Connection(ConnectionId),
    /// A session
    Session(SessionId),
    /// A consumer
    Consumer(ConsumerId),
    /// A producer
    Producer(ProducerId),
    /// An open transaction
    Transaction(TransactionId),
}

impl StateKey {
    /// Whether removing `object` also removes this state.
    fn removed_by(&self, object: &ObjectId) -> bool {
        match (object, self) {
            (ObjectId::Connection(removed), Self::Connection(id)) => id == removed,
            (ObjectId::Connection(removed), Self::Session(id)) => &id.connection_id == removed,
            (ObjectId::Connection(removed), Self::Consumer(id)) => id.connection_id() == removed,
            (ObjectId::Connection(removed), Self::Producer(id)) => id.connection_id() == removed,
            (ObjectId::Connection(removed), Self::Transaction(id)) => &id.connection_id == removed,
            (ObjectId::Session(removed), Self::Session(id)) => id == removed,
            (ObjectId::Session(removed), Self::Consumer(id)) => &id.session_id == removed,
            (ObjectId::Session(removed), Self::Producer(id)) => &id.session_id == removed,
            (ObjectId::Consumer(removed), Self::Consumer(id)) => id == removed,
            (ObjectId::Producer(removed), Self::Producer(id)) => id == removed,
            _ => false,
        }
    }
}

#[derive(Debug)]
struct TrackedTransaction {
    begin: Command,
    operations: Vec<Command>,
}

#[derive(Debug, Default)]
struct TrackerState {
    next_seq: u64,
    records: BTreeMap<u64, Command>,
    transactions: BTreeMap<u64, TrackedTransaction>,
    index: HashMap<StateKey, u64>,
    message_cache: VecDeque<Command>,
    awaiting_response: HashMap<u32, StateKey>,
}

impl TrackerState {
    fn allocate_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Insert or replace a creation record, keeping the original position.
    fn upsert(&mut self, key: StateKey, command: &Command) {
        if let Some(seq) = self.index.get(&key) {
            if let Some(record) = self.records.get_mut(seq) {
                *record = command.clone();
            }
            return;
        }
        let seq = self.allocate_seq();
        self.records.insert(seq, command.clone());
        self.index.insert(key, seq);
    }

    fn remove_cascading(&mut self, object: &ObjectId) -> usize {
        let doomed: Vec<StateKey> = self.index.keys().filter(|key| key.removed_by(object)).cloned().collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }

    fn remove(&mut self, key: &StateKey) {
        if let Some(seq) = self.index.remove(key) {
            self.records.remove(&seq);
            self.transactions.remove(&seq);
        }
    }

    fn transaction_mut(&mut self, transaction_id: &TransactionId) -> Option<&mut TrackedTransaction> {
        let seq = self.index.get(&StateKey::Transaction(transaction_id.clone()))?;
        self.transactions.get_mut(seq)
    }
}

/// Records state-creating commands and replays them onto new transports.
#[derive(Debug)]
pub struct ConnectionStateTracker {
    track_messages: bool,
    track_transaction_producers: bool,
    max_cache_size: usize,
    state: Mutex<TrackerState>,
}

impl ConnectionStateTracker {
    /// Tracker with default settings: transaction operations tracked, message
    /// cache off.
    #[must_use]
    pub fn new() -> Self {
        Self::from_config(&FailoverConfig::default())
    }

    /// Tracker using the tracking options of a failover configuration.
    #[must_use]
    pub fn from_config(config: &FailoverConfig) -> Self {
        Self {
            track_messages: config.track_messages,
            track_transaction_producers: config.track_transaction_producers,
            max_cache_size: config.max_cache_size.max(1),
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Record an outbound command.
    ///
    /// Returns true if the command will be recreated by [`Self::replay`], i.e. a
    /// send failure on it needs no retry by the caller.
    pub fn track(&self, command: &Command) -> bool {
        let mut state = self.state.lock();
        let tracked_key = match &command.kind {
            CommandKind::ConnectionInfo(info) => {
                let key = StateKey::Connection(info.connection_id.clone());
                state.upsert(key.clone(), command);
                Some(key)
            },
            CommandKind::SessionInfo(info) => {
                let key = StateKey::Session(info.session_id.clone());
                state.upsert(key.clone(), command);
                Some(key)
            },
            CommandKind::ConsumerInfo(info) => {
                let key = StateKey::Consumer(info.consumer_id.clone());
                state.upsert(key.clone(), command);
                Some(key)
            },
            CommandKind::ProducerInfo(info) => {
                let key = StateKey::Producer(info.producer_id.clone());
                state.upsert(key.clone(), command);
                Some(key)
            },
            CommandKind::TransactionInfo(info) => {
                let key = StateKey::Transaction(info.transaction_id.clone());
                match info.kind {
                    TransactionType::Begin => {
                        if !state.index.contains_key(&key) {
                            let seq = state.allocate_seq();
                            state
                                .transactions
                                .insert(seq, TrackedTransaction { begin: command.clone(), operations: Vec::new() });
                            state.index.insert(key.clone(), seq);
                        }
                        Some(key)
                    },
                    kind if kind.completes() => {
                        state.remove(&key);
                        None
                    },
                    _ => match state.transaction_mut(&info.transaction_id) {
                        Some(transaction) => {
                            transaction.operations.push(command.clone());
                            Some(key)
                        },
                        None => None,
                    },
                }
            },
            CommandKind::RemoveInfo(info) => {
                let removed = state.remove_cascading(&info.object_id);
                trace!("RemoveInfo for {:?} cancelled {removed} records", info.object_id);
                None
            },
            CommandKind::Message(message) => match &message.transaction_id {
                Some(transaction_id) => self.track_transacted(&mut state, transaction_id, command),
                None if self.track_messages && !command.response_required => {
                    state.message_cache.push_back(command.clone());
                    while state.message_cache.len() > self.max_cache_size {
                        state.message_cache.pop_front();
                    }
                    return true;
                },
                None => None,
            },
            CommandKind::MessageAck(ack) => match &ack.transaction_id {
                Some(transaction_id) => self.track_transacted(&mut state, transaction_id, command),
                None => None,
            },
            _ => None,
        };

        match tracked_key {
            Some(key) => {
                if command.response_required {
                    state.awaiting_response.insert(command.command_id, key);
                }
                true
            },
            None => false,
        }
    }

    fn track_transacted(
        &self,
        state: &mut TrackerState,
        transaction_id: &TransactionId,
        command: &Command,
    ) -> Option<StateKey> {
        if !self.track_transaction_producers {
            return None;
        }
        let transaction = state.transaction_mut(transaction_id)?;
        transaction.operations.push(command.clone());
        Some(StateKey::Transaction(transaction_id.clone()))
    }

    /// Record the broker's answer to a tracked command. A rejected creation
    /// command is dropped so that it is not replayed.
    pub fn track_response(&self, response: &Command) {
        let Some(correlation_id) = response.correlation_id() else {
            return;
        };
        let mut state = self.state.lock();
        let Some(key) = state.awaiting_response.remove(&correlation_id) else {
            return;
        };
        if matches!(response.kind, CommandKind::ExceptionResponse(_)) {
            debug!("Broker rejected tracked {key:?}; dropping it from replay");
            state.remove(&key);
        }
    }

    /// Commands to replay, in replay order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Command> {
        let state = self.state.lock();
        let mut commands: Vec<Command> = state.records.values().cloned().collect();
        for transaction in state.transactions.values() {
            commands.push(transaction.begin.clone());
            commands.extend(transaction.operations.iter().cloned());
        }
        commands.extend(state.message_cache.iter().cloned());
        commands
    }

    /// Send the snapshot on `transport` as one-way commands, in order.
    ///
    /// # Errors
    /// Returns [`Error::Replay`] naming the command that could not be sent; the
    /// transport must then be discarded.
    pub async fn replay(&self, transport: &dyn Transport) -> Result<()> {
        let commands = self.snapshot();
        let count = commands.len();
        for command in commands {
            trace!("Replaying {command}");
            let name = command.to_string();
            transport
                .oneway(command)
                .await
                .map_err(|e| Error::Replay { message: format!("failed to replay {name}: {e}") })?;
        }
        info!("Replayed {count} tracked commands");
        Ok(())
    }

    /// Forget all tracked state.
    pub fn clear(&self) {
        *self.state.lock() = TrackerState::default();
    }

    /// Number of commands a replay would send.
    #[must_use]
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.records.len()
            + state.transactions.values().map(|t| 1 + t.operations.len()).sum::<usize>()
            + state.message_cache.len()
    }

    /// Whether nothing would be replayed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionStateTracker {
    fn default() -> Self {
        Self::new()
    }
}
