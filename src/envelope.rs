//! The wire protocol (spec §6.3): the only messages ever handed to an
//! adapter's `send` or produced by its `receive` callback.

use crate::id::Identity;
use crate::DocId;
use serde::{Deserialize, Serialize};
use syncrepo_crdt::VersionVector;

/// One document entry in a `sync-request`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncRequestEntry {
    pub doc_id: DocId,
    pub requester_version: VersionVector,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<Vec<u8>>,
}

/// What a `sync-response` carries back for one document.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Transmission {
    /// Responder's version is dominated by (or equal to) the requester's;
    /// there is nothing new to send.
    UpToDate { version: VersionVector },
    /// Responder has ops the requester doesn't; `update` is the delta.
    Update {
        version: VersionVector,
        update: Vec<u8>,
    },
    /// Responder does not have this document at all, or `canReveal` denied it.
    Absent,
}

/// Every message exchanged over an established channel (spec §6.3's table).
/// `#[serde(tag = "type")]` gives each variant a `"type"` discriminant field
/// in the JSON encoding, matching the envelope's canonical shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    #[serde(rename = "channel/establish-request")]
    EstablishRequest { identity: Identity },
    #[serde(rename = "channel/establish-response")]
    EstablishResponse { identity: Identity },
    #[serde(rename = "channel/directory-request")]
    DirectoryRequest,
    #[serde(rename = "channel/directory-response")]
    DirectoryResponse { doc_ids: Vec<DocId> },
    #[serde(rename = "channel/sync-request")]
    SyncRequest {
        docs: Vec<SyncRequestEntry>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        bidirectional: bool,
    },
    #[serde(rename = "channel/sync-response")]
    SyncResponse {
        doc_id: DocId,
        transmission: Transmission,
        #[serde(skip_serializing_if = "Option::is_none")]
        ephemeral: Option<Vec<u8>>,
    },
    #[serde(rename = "channel/update")]
    Update {
        doc_id: DocId,
        update: Vec<u8>,
        version: VersionVector,
        #[serde(skip_serializing_if = "Option::is_none")]
        ephemeral: Option<Vec<u8>>,
    },
    #[serde(rename = "channel/ephemeral")]
    Ephemeral { doc_id: DocId, ephemeral: Vec<u8> },
    #[serde(rename = "channel/delete")]
    Delete { doc_id: DocId },
    #[serde(rename = "channel/batch")]
    Batch { messages: Vec<Envelope> },
}

impl Envelope {
    /// Flattens a `batch` envelope one level, per spec §6.3 ("batch flattens
    /// one level; a nested batch inside a batch is a protocol violation").
    /// Returns `None` for a well-formed non-batch envelope (dispatch it as
    /// is); `Some(Err(..))` if a nested batch was found.
    pub fn flatten_batch(self) -> Result<Vec<Envelope>, &'static str> {
        match self {
            Envelope::Batch { messages } => {
                for m in &messages {
                    if matches!(m, Envelope::Batch { .. }) {
                        return Err("nested batch envelope");
                    }
                }
                Ok(messages)
            }
            other => Ok(vec![other]),
        }
    }
}

#[cfg(feature = "compat")]
pub mod compat {
    //! Translates the `LoroProtocol` wire profile's `%LOR`/`%EPH`/`%EPS`
    //! magic-byte framing to and from [`super::Envelope`] at the adapter
    //! boundary. This is a compatibility shim, not a general transcoder:
    //! `%LOR` carries a full envelope as JSON; `%EPS` carries a bare
    //! ephemeral-only snapshot for when there's no document update to
    //! piggyback it on.

    use super::Envelope;

    const LOR_MAGIC: &[u8; 4] = b"%LOR";
    const EPS_MAGIC: &[u8; 4] = b"%EPS";
    const EPH_MAGIC: &[u8; 4] = b"%EPH";

    pub fn encode(envelope: &Envelope) -> anyhow::Result<Vec<u8>> {
        match envelope {
            // Spec §6.3 leaves the %EPH/%EPS split unspecified beyond
            // "ephemeral vs persistent"; we only ever produce %EPS for an
            // outgoing standalone ephemeral frame (see DESIGN.md) and accept
            // either magic byte sequence on decode.
            Envelope::Ephemeral { doc_id, ephemeral } => {
                let mut out = EPS_MAGIC.to_vec();
                out.extend(serde_json::to_vec(&(doc_id, ephemeral))?);
                Ok(out)
            }
            other => {
                let mut out = LOR_MAGIC.to_vec();
                out.extend(serde_json::to_vec(other)?);
                Ok(out)
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Envelope> {
        if bytes.len() < 4 {
            anyhow::bail!("frame too short for LoroProtocol magic bytes");
        }
        let (magic, body) = bytes.split_at(4);
        if magic == EPS_MAGIC || magic == EPH_MAGIC {
            let (doc_id, ephemeral) = serde_json::from_slice(body)?;
            Ok(Envelope::Ephemeral { doc_id, ephemeral })
        } else if magic == LOR_MAGIC {
            Ok(serde_json::from_slice(body)?)
        } else {
            anyhow::bail!("unrecognized LoroProtocol magic bytes");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_flattens_one_level() {
        let inner = Envelope::DirectoryRequest;
        let batch = Envelope::Batch {
            messages: vec![inner],
        };
        let flat = batch.flatten_batch().unwrap();
        assert_eq!(flat.len(), 1);
    }

    #[test]
    fn nested_batch_is_rejected() {
        let batch = Envelope::Batch {
            messages: vec![Envelope::Batch { messages: vec![] }],
        };
        assert!(batch.flatten_batch().is_err());
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let env = Envelope::DirectoryResponse {
            doc_ids: vec![DocId::from("d1")],
        };
        let bytes = serde_json::to_vec(&env).unwrap();
        let back: Envelope = serde_json::from_slice(&bytes).unwrap();
        assert!(matches!(back, Envelope::DirectoryResponse { .. }));
    }
}
