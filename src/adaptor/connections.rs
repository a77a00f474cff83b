//! Which client holds which rank, for the job and for the live connections.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        OnceLock,
    },
};

use derive_more::Display;
use thiserror::Error;

use crate::common::{ClientName, Rank};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RankTableError {
    #[error("client {0} appears more than once in the roster")]
    DuplicateClient(ClientName),
    #[error("client {0} has no rank")]
    MissingClient(ClientName),
    #[error("client {0} has a rank but is not in the roster")]
    UnknownClient(ClientName),
    #[error("rank {rank} of client {client} is outside of 0..{world_size}")]
    OutOfRange {
        client: ClientName,
        rank: u32,
        world_size: usize,
    },
    #[error("rank {0} is assigned twice")]
    DuplicateRank(u32),
}

/// The fixed bijection between the clients of a job and the ranks `0..n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankTable {
    by_client: BTreeMap<ClientName, Rank>,
    by_rank: Vec<ClientName>,
}

impl RankTable {
    /// Rank the clients in roster order.
    pub fn in_roster_order(roster: &[ClientName]) -> Result<Self, RankTableError> {
        let mut by_client = BTreeMap::new();
        for (rank, client) in roster.iter().enumerate() {
            if by_client.insert(client.clone(), Rank::new(rank as u32)).is_some() {
                return Err(RankTableError::DuplicateClient(client.clone()));
            }
        }
        Ok(Self {
            by_client,
            by_rank: roster.to_vec(),
        })
    }

    /// Use an explicit assignment. It must cover exactly the roster and map it onto `0..n`.
    pub fn from_explicit(
        roster: &[ClientName],
        ranks: &HashMap<ClientName, u32>,
    ) -> Result<Self, RankTableError> {
        let world_size = roster.len();
        let mut slots: Vec<Option<ClientName>> = vec![None; world_size];
        let mut by_client = BTreeMap::new();

        for client in roster {
            let rank = *ranks
                .get(client)
                .ok_or_else(|| RankTableError::MissingClient(client.clone()))?;
            let slot = slots
                .get_mut(rank as usize)
                .ok_or_else(|| RankTableError::OutOfRange {
                    client: client.clone(),
                    rank,
                    world_size,
                })?;
            if slot.is_some() {
                return Err(RankTableError::DuplicateRank(rank));
            }
            *slot = Some(client.clone());
            if by_client.insert(client.clone(), Rank::new(rank)).is_some() {
                return Err(RankTableError::DuplicateClient(client.clone()));
            }
        }
        if let Some(stranger) = ranks.keys().find(|client| !by_client.contains_key(*client)) {
            return Err(RankTableError::UnknownClient(stranger.clone()));
        }

        Ok(Self {
            by_client,
            by_rank: slots.into_iter().flatten().collect(),
        })
    }

    pub fn rank_of(&self, client: &ClientName) -> Option<Rank> {
        self.by_client.get(client).copied()
    }

    pub fn client_of(&self, rank: Rank) -> Option<&ClientName> {
        self.by_rank.get(rank.get() as usize)
    }

    pub fn len(&self) -> usize {
        self.by_rank.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_rank.is_empty()
    }

    /// The assignment as a map, e.g. for sending it to the clients.
    pub fn to_map(&self) -> BTreeMap<ClientName, Rank> {
        self.by_client.clone()
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display(fmt = "conn-{}", _0)]
pub(crate) struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// One accepted connection. Its identity is set once, by a successful `register`.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) id: ConnectionId,
    identity: OnceLock<(Rank, ClientName)>,
}

impl Connection {
    pub(crate) fn new() -> Self {
        Self {
            id: ConnectionId::next(),
            identity: OnceLock::new(),
        }
    }

    pub(crate) fn identity(&self) -> Option<&(Rank, ClientName)> {
        self.identity.get()
    }

    /// Returns `false` if the connection already has an identity.
    pub(crate) fn bind(&self, rank: Rank, client: ClientName) -> bool {
        self.identity.set((rank, client)).is_ok()
    }
}

/// The ranks held by live connections and the ranks that are done.
#[derive(Debug, Default)]
pub(crate) struct Connections {
    live: HashMap<Rank, ConnectionId>,
    finished: HashSet<Rank>,
}

impl Connections {
    pub(crate) fn holder(&self, rank: Rank) -> Option<ConnectionId> {
        self.live.get(&rank).copied()
    }

    pub(crate) fn claim(&mut self, rank: Rank, conn: ConnectionId) {
        self.live.insert(rank, conn);
    }

    /// Free `rank` if `conn` still holds it.
    pub(crate) fn release(&mut self, rank: Rank, conn: ConnectionId) -> bool {
        if self.live.get(&rank) == Some(&conn) {
            self.live.remove(&rank);
            true
        } else {
            false
        }
    }

    /// Record that `rank` is done and return how many ranks are.
    pub(crate) fn finish(&mut self, rank: Rank) -> usize {
        self.finished.insert(rank);
        self.finished.len()
    }

    pub(crate) fn live(&self) -> usize {
        self.live.len()
    }
}
