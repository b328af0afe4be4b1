//! Reliable triple-delivery ("Jump").
//!
//! A payload known identically to three parties is delivered to a fourth
//! so that with at most one actively malicious sender the receiver either
//! accepts the honest value or detects the corruption. One of the three
//! senders, picked by a canonical content-independent rule, transmits a
//! digest instead of the payload; the receiver checks the two payload
//! copies against it and falls back from the first to the second.
//!
//! Many logical channels accumulate between two [`Jump::communicate`]
//! calls and share one message per ordered peer pair per round. Channel
//! buffers live in an arena keyed by (sorted sender triple, receiver) and
//! are cleared by [`Jump::reset`] for the next round.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::{self, Channel, MsgChannel};

/// The three senders of a jump channel, in ascending order.
pub type SenderTriple = [usize; 3];

/// Errors of the delivery primitive.
#[derive(Debug, Error)]
pub enum JumpError {
    /// Channel identities are out of range, not pairwise distinct, or do
    /// not include the calling party in the required role.
    #[error(
        "invalid jump channel for party {party}: senders {senders:?}, receiver {receiver}"
    )]
    InvalidChannel {
        /// The sender triple as passed by the caller.
        senders: [usize; 3],
        /// The receiver id.
        receiver: usize,
        /// The party that rejected the call.
        party: usize,
    },
    /// No consistent majority value could be established for a channel.
    #[error(
        "malicious behaviour detected in jump with senders {senders:?} and receiver {receiver}"
    )]
    Malicious {
        /// The channel's sender triple.
        senders: SenderTriple,
        /// The channel's receiver.
        receiver: usize,
    },
    /// Transport failure during the round.
    #[error("channel error during jump: {0:?}")]
    Channel(#[from] channel::Error),
}

/// Picks the digest sender of a channel: a fixed function of the sorted
/// sender triple and the receiver, independent of message content.
pub fn digest_sender(senders: SenderTriple, receiver: usize) -> usize {
    senders[(senders[0] + senders[1] + senders[2] + receiver) % 3]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum JumpPayload {
    Data(Vec<u8>),
    Digest([u8; 32]),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JumpItem {
    senders: SenderTriple,
    payload: JumpPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Accumulating,
    Verified,
}

/// Per-round state of the delivery primitive for one party.
#[derive(Debug)]
pub struct Jump {
    id: usize,
    n: usize,
    state: State,
    /// Outgoing payloads of channels this party sends on.
    send: BTreeMap<(SenderTriple, usize), Vec<u8>>,
    /// Expected byte lengths of channels this party receives on.
    expected: BTreeMap<SenderTriple, usize>,
    /// Verified payloads, available after [`Jump::communicate`].
    values: BTreeMap<SenderTriple, Vec<u8>>,
}

impl Jump {
    /// Creates the round state for `id` among `n` parties.
    pub fn new(id: usize, n: usize) -> Self {
        Self {
            id,
            n,
            state: State::Idle,
            send: BTreeMap::new(),
            expected: BTreeMap::new(),
            values: BTreeMap::new(),
        }
    }

    /// Appends `payload` to the buffer of the channel from `senders` (which
    /// must include the calling party) to `receiver`.
    ///
    /// # Panics
    /// If called after [`Jump::communicate`] without a [`Jump::reset`].
    pub fn accumulate(
        &mut self,
        senders: SenderTriple,
        receiver: usize,
        payload: &[u8],
    ) -> Result<(), JumpError> {
        assert!(
            self.state != State::Verified,
            "jump round already communicated"
        );
        let senders = self.checked_channel(senders, receiver)?;
        if !senders.contains(&self.id) {
            return Err(self.invalid(senders, receiver));
        }
        self.send
            .entry((senders, receiver))
            .or_default()
            .extend_from_slice(payload);
        self.state = State::Accumulating;
        Ok(())
    }

    /// Registers that this party expects `nbytes` more payload bytes on
    /// the channel from `senders`. Receivers record lengths only; the
    /// data arrives in [`Jump::communicate`].
    ///
    /// # Panics
    /// If called after [`Jump::communicate`] without a [`Jump::reset`].
    pub fn expect(&mut self, senders: SenderTriple, nbytes: usize) -> Result<(), JumpError> {
        assert!(
            self.state != State::Verified,
            "jump round already communicated"
        );
        let senders = self.checked_channel(senders, self.id)?;
        *self.expected.entry(senders).or_default() += nbytes;
        self.state = State::Accumulating;
        Ok(())
    }

    /// Executes one network round: sends every buffered channel (payload
    /// or digest according to the sender role), receives and verifies
    /// every expected channel.
    ///
    /// # Panics
    /// If the round was already communicated.
    pub async fn communicate<C: Channel>(
        &mut self,
        chan: &mut MsgChannel<C>,
    ) -> Result<(), JumpError> {
        assert!(
            self.state != State::Verified,
            "jump round already communicated"
        );
        let mut outgoing: BTreeMap<usize, Vec<JumpItem>> = BTreeMap::new();
        for ((senders, receiver), payload) in &self.send {
            let payload = if digest_sender(*senders, *receiver) == self.id {
                JumpPayload::Digest(*blake3::hash(payload).as_bytes())
            } else {
                JumpPayload::Data(payload.clone())
            };
            outgoing.entry(*receiver).or_default().push(JumpItem {
                senders: *senders,
                payload,
            });
        }
        tracing::trace!(
            id = self.id,
            send_channels = self.send.len(),
            recv_channels = self.expected.len(),
            "jump round"
        );
        for (peer, items) in &outgoing {
            chan.send_to(*peer, "jump", items).await?;
        }

        let mut expected_from: BTreeMap<usize, usize> = BTreeMap::new();
        for senders in self.expected.keys() {
            for &s in senders {
                *expected_from.entry(s).or_default() += 1;
            }
        }
        let mut received: BTreeMap<(SenderTriple, usize), JumpPayload> = BTreeMap::new();
        for (&peer, &count) in &expected_from {
            let items: Vec<JumpItem> = chan.recv_vec_from(peer, "jump", count).await?;
            for item in items {
                if !self.expected.contains_key(&item.senders)
                    || !item.senders.contains(&peer)
                    || received
                        .insert((item.senders, peer), item.payload)
                        .is_some()
                {
                    return Err(JumpError::Malicious {
                        senders: item.senders,
                        receiver: self.id,
                    });
                }
            }
        }

        for (&senders, &nbytes) in &self.expected {
            let value = self.verify_channel(senders, nbytes, &received)?;
            self.values.insert(senders, value);
        }
        self.state = State::Verified;
        Ok(())
    }

    /// The verified payload delivered by `senders` this round.
    ///
    /// # Panics
    /// If called before [`Jump::communicate`] or for a channel that was
    /// never registered with [`Jump::expect`].
    pub fn values(&self, senders: SenderTriple) -> &[u8] {
        assert!(
            self.state == State::Verified,
            "jump round not yet communicated"
        );
        let mut senders = senders;
        senders.sort_unstable();
        self.values
            .get(&senders)
            .unwrap_or_else(|| panic!("no verified jump channel with senders {senders:?}"))
    }

    /// Clears all buffers for the next round.
    pub fn reset(&mut self) {
        self.send.clear();
        self.expected.clear();
        self.values.clear();
        self.state = State::Idle;
    }

    fn verify_channel(
        &self,
        senders: SenderTriple,
        nbytes: usize,
        received: &BTreeMap<(SenderTriple, usize), JumpPayload>,
    ) -> Result<Vec<u8>, JumpError> {
        let malicious = || JumpError::Malicious {
            senders,
            receiver: self.id,
        };
        let d = digest_sender(senders, self.id);
        let payload_senders: Vec<usize> =
            senders.iter().copied().filter(|&s| s != d).collect();
        let digest = match received.get(&(senders, d)) {
            Some(JumpPayload::Digest(h)) => *h,
            _ => return Err(malicious()),
        };
        let v1 = match received.get(&(senders, payload_senders[0])) {
            Some(JumpPayload::Data(v)) => v,
            _ => return Err(malicious()),
        };
        let v2 = match received.get(&(senders, payload_senders[1])) {
            Some(JumpPayload::Data(v)) => v,
            _ => return Err(malicious()),
        };
        if v1.len() == nbytes && *blake3::hash(v1).as_bytes() == digest {
            Ok(v1.clone())
        } else if v2.len() == nbytes && *blake3::hash(v2).as_bytes() == digest {
            Ok(v2.clone())
        } else if v1.len() == nbytes && v1 == v2 {
            Ok(v1.clone())
        } else {
            Err(malicious())
        }
    }

    fn checked_channel(
        &self,
        mut senders: SenderTriple,
        receiver: usize,
    ) -> Result<SenderTriple, JumpError> {
        senders.sort_unstable();
        let distinct = senders[0] < senders[1]
            && senders[1] < senders[2]
            && !senders.contains(&receiver);
        if !distinct || senders[2] >= self.n || receiver >= self.n {
            return Err(self.invalid(senders, receiver));
        }
        Ok(senders)
    }

    fn invalid(&self, senders: SenderTriple, receiver: usize) -> JumpError {
        JumpError::InvalidChannel {
            senders,
            receiver,
            party: self.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::task::JoinSet;

    use super::*;
    use crate::channel::SimpleChannel;

    /// All sender triples not containing `receiver`, ascending.
    fn triples(n: usize, receiver: usize) -> Vec<SenderTriple> {
        let mut out = vec![];
        for a in 0..n {
            for b in a + 1..n {
                for c in b + 1..n {
                    if a != receiver && b != receiver && c != receiver {
                        out.push([a, b, c]);
                    }
                }
            }
        }
        out
    }

    fn payload(senders: SenderTriple, receiver: usize) -> Vec<u8> {
        format!("A test string. {senders:?} -> {receiver}").into_bytes()
    }

    #[test]
    fn digest_sender_is_canonical_and_varied() {
        let senders = [1, 2, 4];
        let mut seen = vec![];
        for receiver in [0, 3, 5] {
            let d = digest_sender(senders, receiver);
            assert!(senders.contains(&d));
            seen.push(d);
        }
        seen.dedup();
        assert!(seen.len() > 1, "rule should depend on the receiver");
    }

    #[test]
    fn rejects_invalid_channels() {
        let mut jump = Jump::new(0, 5);
        assert!(matches!(
            jump.accumulate([0, 1, 1], 2, b"x"),
            Err(JumpError::InvalidChannel { .. })
        ));
        assert!(matches!(
            jump.accumulate([0, 1, 2], 2, b"x"),
            Err(JumpError::InvalidChannel { .. })
        ));
        assert!(matches!(
            jump.accumulate([0, 1, 5], 2, b"x"),
            Err(JumpError::InvalidChannel { .. })
        ));
        // Not a member of the triple.
        assert!(matches!(
            jump.accumulate([1, 2, 3], 4, b"x"),
            Err(JumpError::InvalidChannel { .. })
        ));
        // Receiver inside the triple.
        assert!(matches!(
            jump.expect([0, 1, 2], 8),
            Err(JumpError::InvalidChannel { .. })
        ));
    }

    #[tokio::test]
    async fn delivers_on_every_channel() {
        let n = 5;
        let mut join = JoinSet::new();
        for (id, channel) in SimpleChannel::channels(n).into_iter().enumerate() {
            join.spawn(async move {
                let mut chan = MsgChannel(channel);
                let mut jump = Jump::new(id, n);
                for receiver in 0..n {
                    for senders in triples(n, receiver) {
                        if senders.contains(&id) {
                            jump.accumulate(senders, receiver, &payload(senders, receiver))
                                .unwrap();
                        } else if receiver == id {
                            jump.expect(senders, payload(senders, receiver).len())
                                .unwrap();
                        }
                    }
                }
                jump.communicate(&mut chan).await.unwrap();
                for senders in triples(n, id) {
                    assert_eq!(jump.values(senders), payload(senders, id));
                }
                jump.reset();
            });
        }
        while let Some(res) = join.join_next().await {
            res.unwrap();
        }
    }

    async fn run_corrupted(corrupt: Vec<usize>) -> Result<Vec<u8>, JumpError> {
        let n = 5;
        let senders = [1, 2, 3];
        let receiver = 0;
        let mut join = JoinSet::new();
        let mut receiver_task = None;
        for (id, channel) in SimpleChannel::channels(n).into_iter().enumerate() {
            let corrupt = corrupt.clone();
            let task = async move {
                let mut chan = MsgChannel(channel);
                let mut jump = Jump::new(id, n);
                if senders.contains(&id) {
                    let msg = if corrupt.contains(&id) {
                        b"A lie, not a test string".to_vec()
                    } else {
                        b"A test string.".to_vec()
                    };
                    jump.accumulate(senders, receiver, &msg).unwrap();
                } else if id == receiver {
                    jump.expect(senders, b"A test string.".len()).unwrap();
                }
                jump.communicate(&mut chan).await?;
                if id == receiver {
                    Ok(jump.values(senders).to_vec())
                } else {
                    Ok(vec![])
                }
            };
            if id == receiver {
                receiver_task = Some(tokio::spawn(task));
            } else {
                join.spawn(task);
            }
        }
        let res = receiver_task.unwrap().await.unwrap();
        while let Some(other) = join.join_next().await {
            other.unwrap().unwrap();
        }
        res
    }

    #[tokio::test]
    async fn one_corrupted_sender_cannot_plant_a_value() {
        for corrupt in [1, 2, 3] {
            let value = run_corrupted(vec![corrupt]).await.unwrap();
            assert_eq!(value, b"A test string.");
        }
    }

    #[tokio::test]
    async fn irreconcilable_channel_is_flagged() {
        // Two colluding senders exceed the tolerance; the receiver must
        // never accept silently when nothing matches.
        let senders = [1, 2, 3];
        let d = digest_sender(senders, 0);
        let one_payload_sender = senders.into_iter().find(|&s| s != d).unwrap();
        let err = run_corrupted(vec![d, one_payload_sender]).await.unwrap_err();
        assert!(matches!(err, JumpError::Malicious { .. }));
        assert!(err.to_string().contains("malicious behaviour"));
    }
}
