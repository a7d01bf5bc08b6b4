use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::peer::Peer;

type Rooms = HashMap<String, HashMap<String, Arc<Peer>>>;

/// Registry of the peers in every room. Rooms are created on first registration and dropped once empty.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: Mutex<Rooms>,
    /// Serializes membership changes per room. Entries live as long as someone holds or waits for them.
    admissions: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn rooms(&self) -> MutexGuard<'_, Rooms> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until no other admission into `rid` is in progress. Membership changes of the room made while holding the guard are not interleaved with another publish.
    pub async fn admit(&self, rid: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut admissions = self
                .admissions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            admissions.retain(|_, lock| lock.strong_count() > 0);
            match admissions.get(rid).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(AsyncMutex::new(()));
                    admissions.insert(rid.to_owned(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    /// Puts `peer` into its room and returns the peer it replaced. The caller closes the previous peer.
    pub fn register(&self, peer: Arc<Peer>) -> Option<Arc<Peer>> {
        let mut rooms = self.rooms();
        let room = rooms.entry(peer.rid.clone()).or_default();
        let previous = room.insert(peer.uid.clone(), peer);
        if let Some(previous) = &previous {
            tracing::debug!("RoomRegistry replaced peer {}", previous.id());
        }
        previous
    }

    pub fn lookup(&self, rid: &str, uid: &str) -> Option<Arc<Peer>> {
        self.rooms()
            .get(rid)
            .and_then(|room| room.get(uid))
            .cloned()
    }

    /// Snapshot of the peers in `rid`. An unknown room is empty.
    pub fn peers(&self, rid: &str) -> Vec<Arc<Peer>> {
        self.rooms()
            .get(rid)
            .map(|room| room.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Calls `f` for every peer in `rid`, outside the registry lock.
    pub fn for_each<F>(&self, rid: &str, mut f: F)
    where
        F: FnMut(&Arc<Peer>),
    {
        for peer in self.peers(rid).iter() {
            f(peer);
        }
    }

    /// Removes the entry for `uid` only if it still belongs to session `cid`.
    pub fn unregister(&self, rid: &str, uid: &str, cid: &str) -> bool {
        let mut rooms = self.rooms();
        let Some(room) = rooms.get_mut(rid) else {
            return false;
        };
        if room.get(uid).map(|peer| peer.cid.as_str()) != Some(cid) {
            return false;
        }
        room.remove(uid);
        if room.is_empty() {
            rooms.remove(rid);
            tracing::debug!("RoomRegistry dropped empty room {}", rid);
        }
        true
    }

    /// Number of peers in `rid` other than `uid`.
    pub fn count_others(&self, rid: &str, uid: &str) -> usize {
        self.rooms()
            .get(rid)
            .map(|room| room.keys().filter(|k| k.as_str() != uid).count())
            .unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms().len()
    }

    pub fn peer_count(&self) -> usize {
        self.rooms().values().map(|room| room.len()).sum()
    }
}
