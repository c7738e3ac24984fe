//! Rendezvous (highest-random-weight) assignment of work items to peers.
//!
//! Every process that answers "who owns this binding" must agree on the
//! answer, so the score is a keyed SipHash-2-4 with fixed keys over the
//! hyphenated string encodings of the peer id and the work id. Nothing is
//! cached or persisted: callers pass a fresh live-peer snapshot every time.

use std::hash::Hasher;

use siphasher::sip::SipHasher24;
use uuid::Uuid;

const HASH_KEY0: u64 = 0x7374_7265_616d_6272; // "streambr"
const HASH_KEY1: u64 = 0x6964_6765_2d68_7277; // "idge-hrw"

/// Returns the peer that owns `work_id`, or `None` when the candidate set
/// is empty. For a fixed peer set the result is deterministic, and
/// removing one peer only reassigns the work that scored highest on it.
pub fn owner(peer_ids: &[Uuid], work_id: Uuid) -> Option<Uuid> {
    peer_ids
        .iter()
        .copied()
        .max_by_key(|peer| (score(*peer, work_id), *peer))
}

fn score(peer_id: Uuid, work_id: Uuid) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(HASH_KEY0, HASH_KEY1);
    hasher.write(peer_id.to_string().as_bytes());
    hasher.write(&[0]);
    hasher.write(work_id.to_string().as_bytes());
    hasher.finish()
}
