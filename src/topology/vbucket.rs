// SPDX-License-Identifier: MIT OR Apache-2.0

//! vBucket map: key hashing, master/replica lookup, and config diffing.
//!
//! Keys hash to a vbucket with the CRC32 transform the servers use
//! (`((~crc) >> 16) & 0x7fff`, reduced modulo the vbucket count), and each
//! vbucket row lists `[master, replica1, ...]` as indices into the server
//! list; `-1` marks an unassigned slot during rebalance.

use crate::error::{CouchError, Result};
use crate::topology::ClusterConfig;

// Standard IEEE CRC32, table-driven. The polynomial and the final
// fold below must match the server side or every key routes wrong.
fn crc32_table() -> &'static [u32; 256] {
    use std::sync::OnceLock;
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0u32; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let mut crc = i as u32;
            for _ in 0..8 {
                crc = if crc & 1 != 0 {
                    0xedb8_8320 ^ (crc >> 1)
                } else {
                    crc >> 1
                };
            }
            *entry = crc;
        }
        table
    })
}

/// The 15-bit key hash feeding vbucket selection.
#[must_use]
pub fn hash_key(key: &[u8]) -> u32 {
    let table = crc32_table();
    let mut crc = 0xffff_ffffu32;
    for &b in key {
        crc = (crc >> 8) ^ table[((crc ^ u32::from(b)) & 0xff) as usize];
    }
    ((!crc) >> 16) & 0x7fff
}

/// Result of comparing two configs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    pub servers_added: Vec<String>,
    pub servers_removed: Vec<String>,
    pub vbmap_changed: bool,
}

impl ConfigDiff {
    /// No observable topology change at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers_added.is_empty() && self.servers_removed.is_empty() && !self.vbmap_changed
    }

    #[must_use]
    pub fn has_server_changes(&self) -> bool {
        !self.servers_added.is_empty() || !self.servers_removed.is_empty()
    }
}

/// Parsed vBucket server map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VbucketMap {
    server_list: Vec<String>,
    num_replicas: u16,
    map: Vec<Vec<i32>>,
    forward_map: Option<Vec<Vec<i32>>>,
}

impl VbucketMap {
    pub fn new(
        server_list: Vec<String>,
        num_replicas: u16,
        map: Vec<Vec<i32>>,
        forward_map: Option<Vec<Vec<i32>>>,
        hash_algorithm: &str,
    ) -> Result<Self> {
        if !hash_algorithm.is_empty() && !hash_algorithm.eq_ignore_ascii_case("crc") {
            return Err(CouchError::Protocol(format!(
                "unsupported vbucket hash {hash_algorithm:?}"
            )));
        }
        if map.is_empty() {
            return Err(CouchError::Protocol("empty vbucket map".into()));
        }
        let nservers = server_list.len() as i32;
        for row in &map {
            if row.is_empty() {
                return Err(CouchError::Protocol("vbucket row with no master".into()));
            }
            for &idx in row {
                if idx >= nservers {
                    return Err(CouchError::Protocol(format!(
                        "vbucket server index {idx} out of range ({nservers} servers)"
                    )));
                }
            }
        }
        Ok(Self {
            server_list,
            num_replicas,
            map,
            forward_map,
        })
    }

    #[must_use]
    pub fn num_vbuckets(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn num_replicas(&self) -> u16 {
        self.num_replicas
    }

    #[must_use]
    pub fn server_list(&self) -> &[String] {
        &self.server_list
    }

    /// vBucket id for a key.
    #[must_use]
    pub fn vbucket_for_key(&self, key: &[u8]) -> u16 {
        (hash_key(key) as usize % self.map.len()) as u16
    }

    /// Server index for `(vbucket, replica)`; replica 0 is the master.
    /// Returns `None` for out-of-range input or an unassigned (-1) slot.
    #[must_use]
    pub fn server_for(&self, vbucket: u16, replica: usize) -> Option<usize> {
        let row = self.map.get(vbucket as usize)?;
        match row.get(replica) {
            Some(&idx) if idx >= 0 => Some(idx as usize),
            _ => None,
        }
    }

    /// Master index for a key, with the vbucket it hashed to.
    #[must_use]
    pub fn master_for_key(&self, key: &[u8]) -> (u16, Option<usize>) {
        let vb = self.vbucket_for_key(key);
        (vb, self.server_for(vb, 0))
    }

    /// Forward-map master, when the server published one mid-rebalance.
    #[must_use]
    pub fn forward_master(&self, vbucket: u16) -> Option<usize> {
        let row = self.forward_map.as_ref()?.get(vbucket as usize)?;
        match row.first() {
            Some(&idx) if idx >= 0 => Some(idx as usize),
            _ => None,
        }
    }
}

/// Diff two configs at the granularity the monitor cares about.
#[must_use]
pub fn diff_configs(newer: &ClusterConfig, older: &ClusterConfig) -> ConfigDiff {
    let new_servers: Vec<String> = newer
        .vbmap
        .as_ref()
        .map(|m| m.server_list.clone())
        .unwrap_or_else(|| newer.nodes.iter().map(|n| n.hostname.clone()).collect());
    let old_servers: Vec<String> = older
        .vbmap
        .as_ref()
        .map(|m| m.server_list.clone())
        .unwrap_or_else(|| older.nodes.iter().map(|n| n.hostname.clone()).collect());

    let servers_added = new_servers
        .iter()
        .filter(|s| !old_servers.contains(s))
        .cloned()
        .collect();
    let servers_removed = old_servers
        .iter()
        .filter(|s| !new_servers.contains(s))
        .cloned()
        .collect();

    let vbmap_changed = match (&newer.vbmap, &older.vbmap) {
        (Some(a), Some(b)) => a.map != b.map,
        (None, None) => false,
        _ => true,
    };

    ConfigDiff {
        servers_added,
        servers_removed,
        vbmap_changed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{test_fixtures, ConfigOrigin};

    fn simple_map() -> VbucketMap {
        VbucketMap::new(
            vec!["a:11210".into(), "b:11210".into()],
            1,
            vec![
                vec![0, 1],
                vec![1, 0],
                vec![0, 1],
                vec![1, 0],
                vec![0, -1],
                vec![-1, 0],
                vec![0, 1],
                vec![1, 0],
            ],
            None,
            "CRC",
        )
        .unwrap()
    }

    #[test]
    fn test_hash_is_stable() {
        // Empty key: CRC register never moves, the fold collapses to zero.
        assert_eq!(hash_key(b""), 0);
        let h1 = hash_key(b"hello");
        let h2 = hash_key(b"hello");
        assert_eq!(h1, h2);
        assert!(h1 <= 0x7fff);
        assert_ne!(hash_key(b"hello"), hash_key(b"hellp"));
    }

    #[test]
    fn test_key_spread() {
        let map = simple_map();
        let mut seen = std::collections::HashSet::new();
        for i in 0..64 {
            let key = format!("key-{i}");
            seen.insert(map.vbucket_for_key(key.as_bytes()));
        }
        // 64 keys over 8 vbuckets should hit more than one bucket.
        assert!(seen.len() > 1);
    }

    #[test]
    fn test_master_replica_lookup() {
        let map = simple_map();
        assert_eq!(map.server_for(0, 0), Some(0));
        assert_eq!(map.server_for(0, 1), Some(1));
        assert_eq!(map.server_for(1, 0), Some(1));
        // Unassigned slots.
        assert_eq!(map.server_for(4, 1), None);
        assert_eq!(map.server_for(5, 0), None);
        // Out of range.
        assert_eq!(map.server_for(99, 0), None);
    }

    #[test]
    fn test_rejects_bad_maps() {
        assert!(VbucketMap::new(vec!["a".into()], 0, vec![], None, "CRC").is_err());
        assert!(VbucketMap::new(vec!["a".into()], 0, vec![vec![3]], None, "CRC").is_err());
        assert!(
            VbucketMap::new(vec!["a".into()], 0, vec![vec![0]], None, "fnv1a").is_err()
        );
    }

    #[test]
    fn test_diff_no_changes() {
        let a = ClusterConfig::parse(
            test_fixtures::two_node_config(1).as_bytes(),
            "h",
            ConfigOrigin::Cccp,
        )
        .unwrap();
        let b = ClusterConfig::parse(
            test_fixtures::two_node_config(2).as_bytes(),
            "h",
            ConfigOrigin::Cccp,
        )
        .unwrap();
        let diff = b.diff(&a);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_diff_server_change() {
        let a = ClusterConfig::parse(
            test_fixtures::two_node_config(1).as_bytes(),
            "h",
            ConfigOrigin::Cccp,
        )
        .unwrap();
        let one_node = r#"{
            "rev": 2,
            "nodeLocator": "vbucket",
            "nodesExt": [{"services": {"kv": 11210}, "hostname": "$HOST"}],
            "vBucketServerMap": {
                "hashAlgorithm": "CRC",
                "numReplicas": 0,
                "serverList": ["$HOST:11210"],
                "vBucketMap": [[0],[0],[0],[0],[0],[0],[0],[0]]
            }
        }"#;
        let b = ClusterConfig::parse(one_node.as_bytes(), "h", ConfigOrigin::Cccp).unwrap();
        let diff = b.diff(&a);
        assert!(diff.has_server_changes());
        assert_eq!(diff.servers_removed, vec!["nodeb.example.com:11210"]);
        assert!(diff.vbmap_changed);
    }
}
