// Copyright 2021 The BDN Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Triply-indexed set of live connections.
//!
//! Connections are owned by the fileno index; the (ip, port) and type indices
//! hold filenos. For every live connection exactly one entry exists in each
//! index, and `delete` removes all three atomically. Index inconsistencies
//! are invariant violations and abort the process.

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
};

use crate::{connection::ConnectionType, Connection, Fileno};

/// Set of live connections indexed by fileno, by (ip, port) and by
/// connection-type flag.
#[derive(Debug, Default)]
pub struct ConnectionPool {
    by_fileno: HashMap<Fileno, Connection>,
    by_ipport: HashMap<(IpAddr, u16), Fileno>,
    by_type: HashMap<ConnectionType, HashSet<Fileno>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection under all three indices.
    ///
    /// # Panics
    ///
    /// Panics when the fileno or the (ip, port) pair is already present;
    /// callers are expected to have resolved duplicates beforehand.
    pub fn add(&mut self, conn: Connection) {
        let fileno = conn.fileno();
        let ipport = (conn.peer_ip(), conn.peer_port());
        assert!(
            !self.by_fileno.contains_key(&fileno),
            "connection pool already holds fileno {}",
            fileno
        );
        assert!(
            !self.by_ipport.contains_key(&ipport),
            "connection pool already holds a connection to {}:{}",
            ipport.0,
            ipport.1
        );

        for subtype in conn.connection_type().get_subtypes() {
            self.by_type.entry(subtype).or_default().insert(fileno);
        }
        self.by_ipport.insert(ipport, fileno);
        self.by_fileno.insert(fileno, conn);
    }

    /// Removes a connection from all three indices, returning it.
    pub fn delete(&mut self, fileno: Fileno) -> Option<Connection> {
        let conn = self.by_fileno.remove(&fileno)?;
        self.by_ipport.remove(&(conn.peer_ip(), conn.peer_port()));
        for subtype in conn.connection_type().get_subtypes() {
            if let Some(members) = self.by_type.get_mut(&subtype) {
                members.remove(&fileno);
                if members.is_empty() {
                    self.by_type.remove(&subtype);
                }
            }
        }
        Some(conn)
    }

    pub fn has_connection(&self, ip: IpAddr, port: u16) -> bool {
        self.by_ipport.contains_key(&(ip, port))
    }

    pub fn get_by_fileno(&self, fileno: Fileno) -> Option<&Connection> {
        self.by_fileno.get(&fileno)
    }

    pub fn get_by_fileno_mut(&mut self, fileno: Fileno) -> Option<&mut Connection> {
        self.by_fileno.get_mut(&fileno)
    }

    pub fn get_by_ipport(&self, ip: IpAddr, port: u16) -> Option<&Connection> {
        let fileno = *self.by_ipport.get(&(ip, port))?;
        self.by_fileno.get(&fileno)
    }

    /// Filenos of every connection whose type intersects `connection_type`,
    /// i.e. the union over the set bits. Order is unspecified.
    pub fn get_by_connection_type(&self, connection_type: ConnectionType) -> Vec<Fileno> {
        let mut filenos = HashSet::new();
        for subtype in connection_type.get_subtypes() {
            if let Some(members) = self.by_type.get(&subtype) {
                filenos.extend(members.iter().copied());
            }
        }
        filenos.into_iter().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.by_fileno.values()
    }

    pub fn filenos(&self) -> Vec<Fileno> {
        self.by_fileno.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.by_fileno.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_fileno.is_empty()
    }

    /// Checks the cross-index invariant; test-only support.
    #[cfg(test)]
    pub(crate) fn assert_coherent(&self) {
        for (fileno, conn) in &self.by_fileno {
            assert_eq!(conn.fileno(), *fileno);
            assert_eq!(
                self.by_ipport.get(&(conn.peer_ip(), conn.peer_port())),
                Some(fileno)
            );
            for subtype in conn.connection_type().get_subtypes() {
                assert!(self.by_type[&subtype].contains(fileno));
            }
        }
        for ((ip, port), fileno) in &self.by_ipport {
            let conn = &self.by_fileno[fileno];
            assert_eq!((conn.peer_ip(), conn.peer_port()), (*ip, *port));
        }
        for (subtype, members) in &self.by_type {
            for fileno in members {
                let conn = self
                    .by_fileno
                    .get(fileno)
                    .expect("type index references a dead connection");
                assert!(conn.connection_type().contains(*subtype));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;
    use crate::connection::BdnProtocol;

    fn connection(fileno: Fileno, octet: u8, port: u16, ctype: ConnectionType) -> Connection {
        Connection::new(
            fileno,
            IpAddr::from([10, 0, 0, octet]),
            port,
            true,
            ctype,
            1,
            Box::new(BdnProtocol::new()),
        )
    }

    #[test]
    fn indexes_stay_in_sync() {
        let mut pool = ConnectionPool::new();
        pool.add(connection(5, 1, 9000, ConnectionType::RELAY_ALL));
        pool.add(connection(6, 2, 9000, ConnectionType::SDN));
        pool.assert_coherent();

        assert!(pool.has_connection(IpAddr::from([10, 0, 0, 1]), 9000));
        assert_eq!(pool.get_by_fileno(5).unwrap().fileno(), 5);
        assert_eq!(
            pool.get_by_ipport(IpAddr::from([10, 0, 0, 2]), 9000)
                .unwrap()
                .fileno(),
            6
        );

        let removed = pool.delete(5).unwrap();
        assert_eq!(removed.fileno(), 5);
        pool.assert_coherent();
        assert!(!pool.has_connection(IpAddr::from([10, 0, 0, 1]), 9000));
        assert!(pool.get_by_connection_type(ConnectionType::RELAY_ALL).is_empty());
    }

    #[test]
    fn type_index_unions_over_set_bits() {
        let mut pool = ConnectionPool::new();
        pool.add(connection(1, 1, 9000, ConnectionType::RELAY_TRANSACTION));
        pool.add(connection(2, 2, 9000, ConnectionType::RELAY_BLOCK));
        pool.add(connection(3, 3, 9000, ConnectionType::GATEWAY));

        let mut relays = pool.get_by_connection_type(ConnectionType::RELAY_ALL);
        relays.sort_unstable();
        assert_eq!(relays, vec![1, 2]);

        // A connection carrying both relay bits appears once in the union.
        pool.add(connection(4, 4, 9000, ConnectionType::RELAY_ALL));
        let mut relays = pool.get_by_connection_type(ConnectionType::RELAY_ALL);
        relays.sort_unstable();
        assert_eq!(relays, vec![1, 2, 4]);
    }

    #[test]
    #[should_panic(expected = "already holds fileno")]
    fn duplicate_fileno_is_fatal() {
        let mut pool = ConnectionPool::new();
        pool.add(connection(5, 1, 9000, ConnectionType::SDN));
        pool.add(connection(5, 2, 9001, ConnectionType::SDN));
    }

    #[test]
    #[should_panic(expected = "already holds a connection")]
    fn duplicate_ipport_is_fatal() {
        let mut pool = ConnectionPool::new();
        pool.add(connection(5, 1, 9000, ConnectionType::SDN));
        pool.add(connection(6, 1, 9000, ConnectionType::SDN));
    }

    #[test]
    fn delete_of_unknown_fileno_is_none() {
        let mut pool = ConnectionPool::new();
        assert!(pool.delete(42).is_none());
    }

    proptest! {
        // Pool coherence under arbitrary interleavings of adds and deletes.
        #[test]
        fn pool_stays_coherent(ops in proptest::collection::vec((0_u8..2, 0_u8..16), 1..64)) {
            let types = [
                ConnectionType::SDN,
                ConnectionType::RELAY_TRANSACTION,
                ConnectionType::RELAY_ALL,
                ConnectionType::BLOCKCHAIN_NODE,
                ConnectionType::GATEWAY,
            ];
            let mut pool = ConnectionPool::new();
            for (op, id) in ops {
                let fileno = Fileno::from(id);
                match op {
                    0 => {
                        let ip = IpAddr::from([10, 0, 0, id]);
                        if pool.get_by_fileno(fileno).is_none() && !pool.has_connection(ip, 9000) {
                            let ctype = types[usize::from(id) % types.len()];
                            pool.add(connection(fileno, id, 9000, ctype));
                        }
                    }
                    _ => {
                        pool.delete(fileno);
                    }
                }
                pool.assert_coherent();
            }
        }
    }
}
