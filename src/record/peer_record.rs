//! The certified address record a peer signs about itself.

use serde::{Deserialize, Serialize};

use multiaddr::Multiaddr;

use crate::error::{Error, Result};
use crate::identity::PeerId;
use crate::record::Record;
use crate::time;

/// A peer's self-reported address set.
///
/// `seq` advances monotonically (wall-clock milliseconds at creation), so a
/// consumer can discard stale records: a record is only accepted when its
/// `seq` is strictly greater than the one currently held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// The peer the record describes
    pub peer_id: PeerId,
    /// Addresses the peer claims to be reachable at
    pub addresses: Vec<Multiaddr>,
    /// Monotonically advancing issue number
    pub seq: u64,
}

#[derive(Serialize, Deserialize)]
struct StoredPeerRecord {
    peer_id: Vec<u8>,
    addresses: Vec<Vec<u8>>,
    seq: u64,
}

impl PeerRecord {
    /// New record stamped with the current wall clock
    pub fn new(peer_id: PeerId, addresses: Vec<Multiaddr>) -> PeerRecord {
        PeerRecord {
            peer_id,
            addresses,
            seq: time::now_timestamp_millis(),
        }
    }

    /// New record with an explicit sequence number
    pub fn with_seq(peer_id: PeerId, addresses: Vec<Multiaddr>, seq: u64) -> PeerRecord {
        PeerRecord {
            peer_id,
            addresses,
            seq,
        }
    }
}

impl Record for PeerRecord {
    const DOMAIN: &'static str = "libp2p-peer-record";
    const CODEC: &'static [u8] = &[0x03, 0x01];

    fn marshal_record(&self) -> Result<Vec<u8>> {
        let stored = StoredPeerRecord {
            peer_id: self.peer_id.to_bytes(),
            addresses: self.addresses.iter().map(|a| a.to_vec()).collect(),
            seq: self.seq,
        };
        Ok(bincode::serialize(&stored)?)
    }

    fn unmarshal_record(bytes: &[u8]) -> Result<Self> {
        let stored: StoredPeerRecord = bincode::deserialize(bytes)?;
        let peer_id = PeerId::from_bytes(&stored.peer_id)?;
        let addresses = stored
            .addresses
            .into_iter()
            .map(|raw| {
                Multiaddr::try_from(raw)
                    .map_err(|e| Error::InvalidRecord(format!("bad address in peer record: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(PeerRecord {
            peer_id,
            addresses,
            seq: stored.seq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::record::Envelope;

    #[test]
    fn test_peer_record_roundtrip() {
        let keypair = Keypair::generate();
        let record = PeerRecord::with_seq(
            keypair.peer_id(),
            vec!["/ip4/10.0.0.1/tcp/4001".parse().unwrap()],
            100,
        );

        let bytes = record.marshal_record().unwrap();
        let restored = PeerRecord::unmarshal_record(&bytes).unwrap();
        assert_eq!(record, restored);
    }

    #[test]
    fn test_sealed_peer_record_verifies() {
        let keypair = Keypair::generate();
        let record = PeerRecord::new(
            keypair.peer_id(),
            vec!["/ip4/127.0.0.1/tcp/9000".parse().unwrap()],
        );

        let envelope = Envelope::seal(&record, &keypair).unwrap();
        envelope.verify(PeerRecord::DOMAIN).unwrap();
        assert_eq!(envelope.record::<PeerRecord>().unwrap(), record);
    }

    #[test]
    fn test_new_records_advance_seq() {
        let id = Keypair::generate().peer_id();
        let older = PeerRecord::new(id, vec![]);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let newer = PeerRecord::new(id, vec![]);
        assert!(newer.seq > older.seq);
    }
}
