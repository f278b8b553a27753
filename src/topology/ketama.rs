// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ketama consistent-hash ring for memcached-bucket distribution.
//!
//! Each server contributes 160 points to the continuum (40 digests, 4
//! points per digest). A key is hashed onto the ring and routed to the
//! first point at or after its position, wrapping at the top.

use sha2::{Digest, Sha256};

/// A point on the continuum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContinuumPoint {
    position: u32,
    server: usize,
}

/// Consistent-hash ring over a fixed server list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KetamaRing {
    points: Vec<ContinuumPoint>,
    servers: Vec<String>,
}

fn point_positions(label: &str, iteration: usize) -> [u32; 4] {
    let digest = Sha256::digest(format!("{label}-{iteration}").as_bytes());
    let mut out = [0u32; 4];
    for (i, chunk) in digest.chunks_exact(4).take(4).enumerate() {
        out[i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    out
}

fn hash_position(key: &[u8]) -> u32 {
    let digest = Sha256::digest(key);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

impl KetamaRing {
    /// Build the continuum. `servers` entries are `host:port` labels; their
    /// order defines the index space returned by [`Self::lookup`].
    #[must_use]
    pub fn new(servers: &[String]) -> Self {
        let mut points = Vec::with_capacity(servers.len() * 160);
        for (idx, label) in servers.iter().enumerate() {
            for iteration in 0..40 {
                for position in point_positions(label, iteration) {
                    points.push(ContinuumPoint {
                        position,
                        server: idx,
                    });
                }
            }
        }
        points.sort_by_key(|p| p.position);
        Self {
            points,
            servers: servers.to_vec(),
        }
    }

    #[must_use]
    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Server index owning `key`.
    #[must_use]
    pub fn lookup(&self, key: &[u8]) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let pos = hash_position(key);
        let idx = match self.points.binary_search_by_key(&pos, |p| p.position) {
            Ok(i) => i,
            Err(i) if i == self.points.len() => 0, // wrap
            Err(i) => i,
        };
        Some(self.points[idx].server)
    }
}
