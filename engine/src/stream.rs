//! Wraps the signal store's raw subscriptions into deduped sequences: the
//! store (see [`crate::store`]) already replays the current offer/answer/
//! candidate state into every fresh subscription before streaming updates,
//! and this layer adds the dedup key on top (`(epoch, sdp-hash)` for
//! descriptions, `(epoch, candidate-tuple)` for candidates).

use std::{cell::RefCell, rc::Rc};

use futures::{
    stream::{LocalBoxStream, StreamExt as _},
    Stream,
};
use webrtc_signal_proto::{Answer, CandidateRecord, Offer};

/// Stable non-cryptographic hash of an SDP string: FNV-1a over its UTF-8
/// bytes. Deterministic across processes and Rust versions, unlike
/// `std::collections::hash_map::DefaultHasher`, without pulling in a hashing
/// crate for this one call site.
#[must_use]
pub fn hash_sdp(sdp: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    sdp.bytes().fold(OFFSET_BASIS, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME))
}

type OfferKey = (Option<u64>, u64);
type AnswerKey = (Option<u64>, u64);
type CandidateKey = (Option<u64>, String, Option<String>, Option<u16>);

/// Deduplicates a raw offer stream by `(epoch, hash(sdp))`.
pub fn dedup_offers<S>(input: S) -> LocalBoxStream<'static, Offer>
where
    S: Stream<Item = Offer> + 'static,
{
    let last: Rc<RefCell<Option<OfferKey>>> = Rc::default();
    input
        .filter(move |offer| {
            let key = (Some(offer.epoch), hash_sdp(&offer.sdp));
            let mut last = last.borrow_mut();
            let is_new = *last != Some(key);
            if is_new {
                *last = Some(key);
            }
            futures::future::ready(is_new)
        })
        .boxed_local()
}

/// Deduplicates a raw answer stream by `(epoch, hash(sdp))`.
pub fn dedup_answers<S>(input: S) -> LocalBoxStream<'static, Answer>
where
    S: Stream<Item = Answer> + 'static,
{
    let last: Rc<RefCell<Option<AnswerKey>>> = Rc::default();
    input
        .filter(move |answer| {
            let key = (Some(answer.epoch), hash_sdp(&answer.sdp));
            let mut last = last.borrow_mut();
            let is_new = *last != Some(key);
            if is_new {
                *last = Some(key);
            }
            futures::future::ready(is_new)
        })
        .boxed_local()
}

/// Deduplicates a raw candidate stream by
/// `(epoch, candidate, sdpMid, sdpMLineIndex)`.
pub fn dedup_candidates<S>(input: S) -> LocalBoxStream<'static, CandidateRecord>
where
    S: Stream<Item = CandidateRecord> + 'static,
{
    let last: Rc<RefCell<Option<CandidateKey>>> = Rc::default();
    input
        .filter(move |c| {
            let key = (
                Some(c.epoch),
                c.candidate.clone(),
                c.sdp_mid.clone(),
                c.sdp_m_line_index,
            );
            let mut last = last.borrow_mut();
            let is_new = *last != Some(key.clone());
            if is_new {
                *last = Some(key);
            }
            futures::future::ready(is_new)
        })
        .boxed_local()
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;

    fn offer(epoch: u64, sdp: &str) -> Offer {
        Offer::new(sdp.to_owned(), epoch, None)
    }

    fn candidate(epoch: u64, line: &str) -> CandidateRecord {
        CandidateRecord::new(line.to_owned(), Some("0".into()), Some(0), None, epoch, 1)
    }

    #[tokio::test]
    async fn drops_exact_repeat_offers() {
        let items = vec![offer(0, "v=0 a"), offer(0, "v=0 a"), offer(0, "v=0 b")];
        let out: Vec<_> = dedup_offers(stream::iter(items)).collect().await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].sdp, "v=0 a");
        assert_eq!(out[1].sdp, "v=0 b");
    }

    #[tokio::test]
    async fn same_sdp_at_different_epoch_is_not_a_duplicate() {
        let items = vec![offer(0, "v=0 a"), offer(1, "v=0 a")];
        let out: Vec<_> = dedup_offers(stream::iter(items)).collect().await;
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn redelivery_of_the_immediately_preceding_item_is_dropped_but_not_older_ones() {
        let items = vec![offer(0, "a"), offer(0, "b"), offer(0, "a")];
        let out: Vec<_> = dedup_offers(stream::iter(items)).collect().await;
        // matches the spec's "replay cache of size 1": only the immediately
        // preceding item is remembered, so the re-delivered "a" after "b"
        // passes through again.
        assert_eq!(out.len(), 3);
    }

    #[tokio::test]
    async fn drops_repeat_candidates_by_full_identity() {
        let items = vec![
            candidate(0, "typ host 1"),
            candidate(0, "typ host 1"),
            candidate(0, "typ host 2"),
        ];
        let out: Vec<_> = dedup_candidates(stream::iter(items)).collect().await;
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn hash_sdp_is_stable_and_order_sensitive() {
        assert_eq!(hash_sdp("v=0"), hash_sdp("v=0"));
        assert_ne!(hash_sdp("v=0"), hash_sdp("0=v"));
    }
}
