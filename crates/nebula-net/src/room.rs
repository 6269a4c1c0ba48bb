//! Broadcast groups.
//!
//! A [`Room`] is a lock-guarded list of connections; [`Room::broadcast`]
//! hands the same shared buffer to every member's send queue. Because
//! [`Connection::send`] never blocks, a slow peer cannot stall a broadcast
//! and sending while holding the member lock is safe.
//!
//! [`RoomDirectory`] owns rooms by key, creating them on first entry and
//! dropping them once empty. It is an ordinary value: create one per
//! server (or per test) and share it with the handlers that need it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::connection::{Connection, ConnectionId};

/// A set of connections that receive each other's broadcasts.
///
/// Entering twice is not deduplicated; the caller owns that policy.
#[derive(Debug, Default)]
pub struct Room {
    members: Mutex<Vec<Arc<Connection>>>,
}

impl Room {
    /// Create an empty room.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member.
    pub fn enter(&self, conn: Arc<Connection>) {
        self.members.lock().push(conn);
    }

    /// Remove one entry for `conn`. Returns whether anything was removed.
    pub fn leave(&self, conn: &Connection) -> bool {
        self.leave_id(conn.id())
    }

    /// Remove one entry for the connection with `id`.
    pub fn leave_id(&self, id: ConnectionId) -> bool {
        let mut members = self.members.lock();
        match members.iter().position(|m| m.id() == id) {
            Some(index) => {
                members.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// Whether `conn` is a member.
    pub fn contains(&self, conn: &Connection) -> bool {
        self.members.lock().iter().any(|m| m.id() == conn.id())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    /// Whether the room has no members.
    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    /// Point-in-time copy of the member list.
    pub fn members(&self) -> Vec<Arc<Connection>> {
        self.members.lock().clone()
    }

    /// Send `payload` to every member except `excluding`.
    ///
    /// Returns the number of members the payload was queued for.
    /// Members that are already disconnecting are skipped.
    pub fn broadcast(&self, payload: &Bytes, excluding: Option<&Connection>) -> usize {
        let skip = excluding.map(Connection::id);
        let members = self.members.lock();
        members
            .iter()
            .filter(|m| Some(m.id()) != skip)
            .filter(|m| m.send(payload.clone()))
            .count()
    }
}

/// Rooms keyed by `K`, created lazily and removed when empty.
#[derive(Debug)]
pub struct RoomDirectory<K> {
    rooms: Mutex<HashMap<K, Arc<Room>>>,
}

impl<K: Eq + Hash + Clone> RoomDirectory<K> {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Add `conn` to the room for `key`, creating the room if needed.
    /// Returns the room's member count afterwards.
    pub fn enter(&self, key: K, conn: Arc<Connection>) -> usize {
        // Held across the member insert so a concurrent `leave` cannot
        // prune the room in between. Lock order: directory, then room.
        let mut rooms = self.rooms.lock();
        let room = rooms.entry(key).or_default();
        room.enter(conn);
        room.len()
    }

    /// Remove `conn` from the room for `key`, dropping the room once empty.
    ///
    /// Returns the remaining member count, or `None` if `conn` was not in
    /// that room.
    pub fn leave(&self, key: &K, conn: &Connection) -> Option<usize> {
        let mut rooms = self.rooms.lock();
        let room = rooms.get(key)?;
        if !room.leave(conn) {
            return None;
        }
        let remaining = room.len();
        if remaining == 0 {
            rooms.remove(key);
        }
        Some(remaining)
    }

    /// The room for `key`, if it exists.
    pub fn get(&self, key: &K) -> Option<Arc<Room>> {
        self.rooms.lock().get(key).cloned()
    }

    /// Broadcast into the room for `key`. Returns 0 if the room does not
    /// exist.
    pub fn broadcast(&self, key: &K, payload: &Bytes, excluding: Option<&Connection>) -> usize {
        match self.get(key) {
            Some(room) => room.broadcast(payload, excluding),
            None => 0,
        }
    }

    /// Number of live rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }
}

impl<K: Eq + Hash + Clone> Default for RoomDirectory<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::testing::{Recorder, connected_pair};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    fn unstarted() -> Arc<Connection> {
        Connection::new(Recorder::new(), ConnectionConfig::default())
    }

    async fn members(n: usize) -> Vec<(Arc<Connection>, TcpStream)> {
        let mut out = Vec::new();
        for _ in 0..n {
            let (conn, _rec, client) = connected_pair().await;
            out.push((conn, client));
        }
        out
    }

    #[test]
    fn test_enter_and_leave() {
        let room = Room::new();
        let a = unstarted();
        let b = unstarted();
        room.enter(Arc::clone(&a));
        room.enter(Arc::clone(&b));
        assert_eq!(room.len(), 2);
        assert!(room.contains(&a));

        assert!(room.leave(&a));
        assert!(!room.leave(&a));
        assert!(!room.contains(&a));
        assert_eq!(room.len(), 1);
    }

    #[test]
    fn test_duplicate_entry_not_deduplicated() {
        let room = Room::new();
        let a = unstarted();
        room.enter(Arc::clone(&a));
        room.enter(Arc::clone(&a));
        assert_eq!(room.len(), 2);
        assert!(room.leave(&a));
        assert!(room.contains(&a));
    }

    #[tokio::test]
    async fn test_broadcast_skips_excluded_member() {
        let peers = members(4).await;
        let room = Room::new();
        for (conn, _) in &peers {
            room.enter(Arc::clone(conn));
        }

        let payload = Bytes::from_static(b"hi");
        assert_eq!(room.broadcast(&payload, Some(&*peers[0].0)), 3);
        assert_eq!(room.broadcast(&payload, None), 4);

        let outsider = unstarted();
        assert_eq!(room.broadcast(&payload, Some(&*outsider)), 4);
    }

    #[tokio::test]
    async fn test_broadcast_delivers_bytes() {
        let mut peers = members(3).await;
        let room = Room::new();
        for (conn, _) in &peers {
            room.enter(Arc::clone(conn));
        }
        let sender = Arc::clone(&peers[1].0);
        room.broadcast(&Bytes::from_static(b"news"), Some(&*sender));

        for (i, (_, client)) in peers.iter_mut().enumerate() {
            if i == 1 {
                continue;
            }
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"news");
        }
    }

    #[tokio::test]
    async fn test_broadcast_skips_disconnected_members() {
        let peers = members(2).await;
        let room = Room::new();
        for (conn, _) in &peers {
            room.enter(Arc::clone(conn));
        }
        peers[0].0.disconnect();
        assert_eq!(room.broadcast(&Bytes::from_static(b"x"), None), 1);
    }

    #[test]
    fn test_directory_creates_and_drops_rooms() {
        let dir: RoomDirectory<String> = RoomDirectory::new();
        let a = unstarted();
        let b = unstarted();

        assert_eq!(dir.enter("lobby".into(), Arc::clone(&a)), 1);
        assert_eq!(dir.enter("lobby".into(), Arc::clone(&b)), 2);
        assert_eq!(dir.enter("arena".into(), Arc::clone(&a)), 1);
        assert_eq!(dir.room_count(), 2);

        assert_eq!(dir.leave(&"lobby".to_string(), &a), Some(1));
        assert_eq!(dir.leave(&"lobby".to_string(), &a), None);
        assert_eq!(dir.leave(&"lobby".to_string(), &b), Some(0));
        assert!(dir.get(&"lobby".to_string()).is_none());
        assert_eq!(dir.room_count(), 1);
    }

    #[test]
    fn test_directory_concurrent_enter_and_leave_keep_member() {
        use std::sync::Barrier;

        let dir: Arc<RoomDirectory<u32>> = Arc::new(RoomDirectory::new());
        for _ in 0..500 {
            let a = unstarted();
            let b = unstarted();
            dir.enter(1, Arc::clone(&a));

            let barrier = Arc::new(Barrier::new(2));
            let leaver = {
                let (dir, barrier, a) = (Arc::clone(&dir), Arc::clone(&barrier), Arc::clone(&a));
                std::thread::spawn(move || {
                    barrier.wait();
                    dir.leave(&1, &a);
                })
            };
            let enterer = {
                let (dir, barrier, b) = (Arc::clone(&dir), Arc::clone(&barrier), Arc::clone(&b));
                std::thread::spawn(move || {
                    barrier.wait();
                    dir.enter(1, b);
                })
            };
            leaver.join().unwrap();
            enterer.join().unwrap();

            let room = dir.get(&1).expect("room with a member must stay listed");
            assert!(room.contains(&b));
            assert_eq!(dir.leave(&1, &b), Some(0));
            assert_eq!(dir.room_count(), 0);
        }
    }

    #[test]
    fn test_directory_broadcast_to_missing_room() {
        let dir: RoomDirectory<u32> = RoomDirectory::default();
        assert_eq!(dir.broadcast(&7, &Bytes::from_static(b"x"), None), 0);
        assert_eq!(dir.leave(&7, &unstarted()), None);
    }

    #[test]
    fn test_directories_are_isolated() {
        let first: RoomDirectory<u32> = RoomDirectory::new();
        let second: RoomDirectory<u32> = RoomDirectory::new();
        first.enter(1, unstarted());
        assert_eq!(first.room_count(), 1);
        assert_eq!(second.room_count(), 0);
    }
}
