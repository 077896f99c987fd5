#![forbid(unsafe_code)]

//! A load balancer's server table
//!
//! Lookups happen on every request while the server list only changes when
//! servers join or leave, so the table is kept in a [`DoublyBufferedData`].
//! Selections hand out a read handle pointing at the chosen server, drop it
//! before changing the table from the same thread.

use std::borrow::Cow;

use dbdata::{Builder, DoublyBufferedData, ReadError, ReadGuard, Update};
use hashbrown::HashMap;
use tracing::debug;


#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub id: ServerId,
    pub addr: String,
    /// Relative share of hashed selections, `0` takes the server out of
    /// rotation without removing it
    pub weight: u32,
}

/// A selected server, the table can't change under it until it is dropped
pub type Selected<'a> = ReadGuard<'a, Server, Cursor>;

/// A view of the whole table
pub type TableGuard<'a> = ReadGuard<'a, ServerList, Cursor>;

/// The servers in one buffer of a [`ServerTable`]
#[derive(Debug, Clone, Default)]
pub struct ServerList {
    servers: Vec<Server>,
    index: HashMap<ServerId, usize>,
    // cumulative[i] is the total weight of servers[..=i]
    cumulative: Vec<u64>,
}

/// A change to the table, batches are applied in order
#[derive(Debug, Clone)]
pub enum TableOp {
    /// Add a server, or replace the server with the same id
    Add(Server),
    Remove(ServerId),
    /// Replace every server, later duplicates of an id win
    Reset(Vec<Server>),
}

/// Per thread round robin position
#[derive(Debug, Default)]
pub struct Cursor {
    next: usize,
}

#[derive(Debug, Default)]
pub struct ServerTable {
    data: DoublyBufferedData<ServerList, Cursor>,
}

impl ServerList {
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn total_weight(&self) -> u64 {
        self.cumulative.last().copied().unwrap_or(0)
    }

    pub fn get(&self, id: ServerId) -> Option<&Server> {
        let &index = self.index.get(&id)?;
        Some(&self.servers[index])
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Server> {
        self.servers.iter()
    }

    /// Pick a server for `hash`, proportionally to the weights
    pub fn pick(&self, hash: u64) -> Option<&Server> {
        let total = self.total_weight();

        if total == 0 {
            return None;
        }

        let point = hash % total;
        let index = self.cumulative.partition_point(|&weight| weight <= point);
        self.servers.get(index)
    }

    fn add(&mut self, server: Cow<'_, Server>) -> usize {
        match self.index.get(&server.id) {
            Some(&index) if self.servers[index] == *server => 0,
            Some(&index) => {
                self.servers[index] = server.into_owned();
                self.reweigh();
                1
            }
            None => {
                let server = server.into_owned();
                self.index.insert(server.id, self.servers.len());
                self.servers.push(server);
                self.reweigh();
                1
            }
        }
    }

    fn remove(&mut self, id: ServerId) -> usize {
        let Some(index) = self.index.remove(&id) else {
            return 0;
        };

        self.servers.swap_remove(index);

        if let Some(moved) = self.servers.get(index) {
            self.index.insert(moved.id, index);
        }

        self.reweigh();
        1
    }

    fn reset(&mut self, servers: Self) -> usize {
        if self.servers == servers.servers {
            return 0;
        }

        *self = servers;
        1
    }

    fn reweigh(&mut self) {
        self.cumulative.clear();
        self.cumulative.extend(self.servers.iter().scan(0u64, |total, server| {
            *total += u64::from(server.weight);
            Some(*total)
        }));
    }
}

impl FromIterator<Server> for ServerList {
    fn from_iter<I: IntoIterator<Item = Server>>(iter: I) -> Self {
        let mut list = Self::default();
        for server in iter {
            list.add(Cow::Owned(server));
        }
        list
    }
}

impl<'a> IntoIterator for &'a ServerList {
    type Item = &'a Server;
    type IntoIter = std::slice::Iter<'a, Server>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl Update<ServerList> for TableOp {
    fn apply(&mut self, background: &mut ServerList, _foreground: &ServerList) -> usize {
        match self {
            TableOp::Add(server) => background.add(Cow::Borrowed(server)),
            TableOp::Remove(id) => background.remove(*id),
            TableOp::Reset(servers) => background.reset(servers.iter().cloned().collect()),
        }
    }

    fn apply_last(self, background: &mut ServerList, _foreground: &ServerList) -> usize {
        match self {
            TableOp::Add(server) => background.add(Cow::Owned(server)),
            TableOp::Remove(id) => background.remove(id),
            TableOp::Reset(servers) => background.reset(servers.into_iter().collect()),
        }
    }
}

impl ServerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builder(builder: Builder) -> Self {
        Self {
            data: builder.build(ServerList::default()),
        }
    }

    /// Returns true if the table changed
    pub fn add(&self, server: Server) -> bool {
        self.apply(TableOp::Add(server)) != 0
    }

    /// Returns true if the server was in the table
    pub fn remove(&self, id: ServerId) -> bool {
        self.apply(TableOp::Remove(id)) != 0
    }

    /// Returns true if the table changed
    pub fn reset(&self, servers: Vec<Server>) -> bool {
        self.apply(TableOp::Reset(servers)) != 0
    }

    /// Apply a batch of operations as one update, returns how many of them
    /// changed the table
    ///
    /// Readers see either none or all of the batch.
    pub fn apply_batch(&self, ops: Vec<TableOp>) -> usize {
        let count = ops.len();
        let changed = self.data.modify_with(ops);
        debug!(count, changed, "applied server table batch");
        changed
    }

    fn apply(&self, op: TableOp) -> usize {
        let changed = self.data.modify_with(op);
        debug!(changed, "applied server table operation");
        changed
    }

    pub fn load(&self) -> Result<TableGuard<'_>, ReadError> {
        self.data.try_read()
    }

    /// Select a server for `hash`, weighted, see [`ServerList::pick`]
    ///
    /// Returns `None` if no server has a weight.
    pub fn select(&self, hash: u64) -> Result<Option<Selected<'_>>, ReadError> {
        let guard = self.data.try_read()?;

        match guard.try_map(|list| list.pick(hash).ok_or(())) {
            Ok(selected) => Ok(Some(selected)),
            Err((_, ())) => Ok(None),
        }
    }

    /// Select the next server with a weight, each thread keeps its own
    /// position
    pub fn select_round_robin(&self) -> Result<Option<Selected<'_>>, ReadError> {
        let mut guard = self.data.try_read()?;
        let len = guard.len();
        let start = guard.tls().next;

        let found = (0..len)
            .map(|step| start.wrapping_add(step) % len)
            .find(|&index| guard.servers[index].weight != 0);

        let Some(index) = found else {
            return Ok(None);
        };

        guard.tls_mut().next = index + 1;
        Ok(Some(guard.map(|list| &list.servers[index])))
    }

    pub fn server_count(&self) -> Result<usize, ReadError> {
        Ok(self.data.try_read()?.len())
    }

    /// Release this thread's read lease, see
    /// [`DoublyBufferedData::thread_exiting`]
    pub fn thread_exiting(&self) {
        self.data.thread_exiting()
    }
}
