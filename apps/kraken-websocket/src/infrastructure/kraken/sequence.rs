//! Sequence Guard
//!
//! Private channel frames carry a per-channel `sequence` counter that must
//! increase by exactly one. [`in_sequence`] enforces it on a channel stream
//! and fails with [`GapDetected`] on the first violation;
//! [`recover_on_gap`] catches that failure, drops the broken upstream,
//! runs a recovery step and subscribes again from a fresh baseline.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures::Stream;
use futures::future::BoxFuture;

use super::subscriber::{ChannelError, ChannelItem};
use crate::domain::channel::ChannelMessage;

/// A private channel skipped or repeated a sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("sequence gap: expected {expected}, got {actual}")]
pub struct GapDetected {
    /// The only acceptable next value.
    pub expected: u64,
    /// The value that arrived.
    pub actual: u64,
}

/// Strict `previous + 1` check starting from a baseline of 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceGuard {
    last: u64,
}

impl SequenceGuard {
    /// Guard expecting sequence 1 next.
    #[must_use]
    pub const fn new() -> Self {
        Self { last: 0 }
    }

    /// Last accepted sequence number (0 before the first).
    #[must_use]
    pub const fn last(&self) -> u64 {
        self.last
    }

    /// Accept `sequence` if it is the successor of the last accepted one.
    ///
    /// A rejected value does not advance the guard.
    ///
    /// # Errors
    ///
    /// Returns [`GapDetected`] for any other value.
    pub const fn check(&mut self, sequence: u64) -> Result<(), GapDetected> {
        let expected = self.last.saturating_add(1);
        if sequence == expected {
            self.last = sequence;
            Ok(())
        } else {
            Err(GapDetected {
                expected,
                actual: sequence,
            })
        }
    }
}

// =============================================================================
// In Sequence
// =============================================================================

/// Stream adapter returned by [`in_sequence`].
#[derive(Debug)]
pub struct InSequence<S> {
    inner: S,
    guard: SequenceGuard,
    failed: bool,
}

/// Enforce strict sequencing on a private channel stream.
///
/// The stream ends right after yielding a [`ChannelError::Gap`] or
/// [`ChannelError::MissingSequence`]; the offending frame is not yielded.
pub const fn in_sequence<S>(inner: S) -> InSequence<S>
where
    S: Stream<Item = ChannelItem> + Unpin,
{
    InSequence {
        inner,
        guard: SequenceGuard::new(),
        failed: false,
    }
}

impl<S> InSequence<S> {
    fn admit(&mut self, message: ChannelMessage) -> ChannelItem {
        let Some(sequence) = message.sequence else {
            self.failed = true;
            return Err(ChannelError::MissingSequence {
                channel: message.channel,
            });
        };
        match self.guard.check(sequence) {
            Ok(()) => Ok(message),
            Err(gap) => {
                self.failed = true;
                Err(gap.into())
            }
        }
    }
}

impl<S> Stream for InSequence<S>
where
    S: Stream<Item = ChannelItem> + Unpin,
{
    type Item = ChannelItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ChannelItem>> {
        let this = &mut *self;
        if this.failed {
            return Poll::Ready(None);
        }
        let item = ready!(Pin::new(&mut this.inner).poll_next(cx));
        Poll::Ready(item.map(|result| result.and_then(|message| this.admit(message))))
    }
}

// =============================================================================
// Recover On Gap
// =============================================================================

enum RecoverState<S> {
    Streaming(InSequence<S>),
    Recovering(BoxFuture<'static, ()>),
    Done,
}

/// Stream adapter returned by [`recover_on_gap`].
pub struct RecoverOnGap<F, S, R> {
    factory: F,
    recovery: R,
    state: RecoverState<S>,
    recoveries: u64,
}

impl<F, S, R> RecoverOnGap<F, S, R> {
    /// Number of gaps recovered so far.
    #[must_use]
    pub const fn recoveries(&self) -> u64 {
        self.recoveries
    }
}

impl<F, S, R> std::fmt::Debug for RecoverOnGap<F, S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            RecoverState::Streaming(_) => "streaming",
            RecoverState::Recovering(_) => "recovering",
            RecoverState::Done => "done",
        };
        f.debug_struct("RecoverOnGap")
            .field("state", &state)
            .field("recoveries", &self.recoveries)
            .finish_non_exhaustive()
    }
}

/// Sequence-guarded stream that resubscribes after a gap.
///
/// `factory` is called immediately and again after every gap. On a gap the
/// current upstream is dropped first, then `recovery` runs to completion,
/// then a new upstream is built with a fresh baseline. Errors other than
/// [`ChannelError::Gap`] are yielded and end the stream.
pub fn recover_on_gap<F, S, R>(mut factory: F, recovery: R) -> RecoverOnGap<F, S, R>
where
    F: FnMut() -> S,
    S: Stream<Item = ChannelItem> + Unpin,
    R: FnMut(GapDetected) -> BoxFuture<'static, ()>,
{
    let first = in_sequence(factory());
    RecoverOnGap {
        factory,
        recovery,
        state: RecoverState::Streaming(first),
        recoveries: 0,
    }
}

impl<F, S, R> Stream for RecoverOnGap<F, S, R>
where
    F: FnMut() -> S + Unpin,
    S: Stream<Item = ChannelItem> + Unpin,
    R: FnMut(GapDetected) -> BoxFuture<'static, ()> + Unpin,
{
    type Item = ChannelItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ChannelItem>> {
        let this = &mut *self;
        loop {
            match &mut this.state {
                RecoverState::Streaming(stream) => match ready!(Pin::new(stream).poll_next(cx)) {
                    Some(Err(ChannelError::Gap(gap))) => {
                        // upstream goes away before recovery starts
                        this.state = RecoverState::Done;
                        this.recoveries += 1;
                        this.state = RecoverState::Recovering((this.recovery)(gap));
                    }
                    Some(Err(error)) => {
                        this.state = RecoverState::Done;
                        return Poll::Ready(Some(Err(error)));
                    }
                    Some(Ok(message)) => return Poll::Ready(Some(Ok(message))),
                    None => {
                        this.state = RecoverState::Done;
                        return Poll::Ready(None);
                    }
                },
                RecoverState::Recovering(future) => {
                    ready!(future.as_mut().poll(cx));
                    this.state = RecoverState::Streaming(in_sequence((this.factory)()));
                }
                RecoverState::Done => return Poll::Ready(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::StreamExt;
    use futures::stream;
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn private(sequence: u64) -> ChannelItem {
        Ok(ChannelMessage::from_value(&json!([[], "openOrders", {"sequence": sequence}])).unwrap())
    }

    fn script(sequences: &[u64]) -> stream::Iter<std::vec::IntoIter<ChannelItem>> {
        stream::iter(sequences.iter().map(|s| private(*s)).collect::<Vec<_>>())
    }

    fn sequences(items: &[ChannelItem]) -> Vec<Option<u64>> {
        items
            .iter()
            .map(|item| item.as_ref().ok().and_then(|m| m.sequence))
            .collect()
    }

    #[test]
    fn guard_accepts_successor_only() {
        let mut guard = SequenceGuard::new();
        assert!(guard.check(1).is_ok());
        assert!(guard.check(2).is_ok());
        assert_eq!(
            guard.check(5),
            Err(GapDetected {
                expected: 3,
                actual: 5
            })
        );
        assert_eq!(guard.last(), 2);
        assert!(guard.check(3).is_ok());
    }

    #[test]
    fn guard_rejects_first_message_other_than_one() {
        let mut guard = SequenceGuard::new();
        assert_eq!(
            guard.check(4),
            Err(GapDetected {
                expected: 1,
                actual: 4
            })
        );
    }

    proptest! {
        #[test]
        fn consecutive_sequences_pass(len in 1_u64..500) {
            let mut guard = SequenceGuard::new();
            for sequence in 1..=len {
                prop_assert!(guard.check(sequence).is_ok());
            }
            prop_assert_eq!(guard.last(), len);
        }

        #[test]
        fn any_other_value_is_a_gap(prefix in 0_u64..200, next in 0_u64..1_000) {
            prop_assume!(next != prefix + 1);
            let mut guard = SequenceGuard::new();
            for sequence in 1..=prefix {
                guard.check(sequence).unwrap();
            }
            prop_assert_eq!(
                guard.check(next),
                Err(GapDetected { expected: prefix + 1, actual: next })
            );
            prop_assert_eq!(guard.last(), prefix);
        }
    }

    #[tokio::test]
    async fn in_sequence_stops_at_gap() {
        let items: Vec<_> = in_sequence(script(&[1, 2, 5, 6])).collect().await;

        assert_eq!(items.len(), 3);
        assert_eq!(sequences(&items[..2]), vec![Some(1), Some(2)]);
        assert!(matches!(
            items[2],
            Err(ChannelError::Gap(GapDetected {
                expected: 3,
                actual: 5
            }))
        ));
    }

    #[tokio::test]
    async fn missing_sequence_is_fatal() {
        let public = ChannelMessage::from_value(&json!([1, {}, "ticker", "XBT/USD"])).unwrap();
        let items: Vec<_> = in_sequence(stream::iter(vec![Ok(public)])).collect().await;

        assert!(matches!(
            &items[..],
            [Err(ChannelError::MissingSequence { channel })] if channel == "ticker"
        ));
    }

    #[tokio::test]
    async fn recover_resubscribes_with_fresh_baseline() {
        let scripts = [vec![1, 2, 5, 6], vec![1, 2]];
        let built = Arc::new(AtomicUsize::new(0));
        let recovered = Arc::new(AtomicUsize::new(0));

        let factory_count = Arc::clone(&built);
        let recovery_count = Arc::clone(&recovered);
        let stream = recover_on_gap(
            move || script(&scripts[factory_count.fetch_add(1, Ordering::SeqCst)]),
            move |gap| {
                assert_eq!(gap, GapDetected { expected: 3, actual: 5 });
                recovery_count.fetch_add(1, Ordering::SeqCst);
                Box::pin(async {})
            },
        );

        let items: Vec<_> = stream.collect().await;

        assert_eq!(sequences(&items), vec![Some(1), Some(2), Some(1), Some(2)]);
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_eq!(recovered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recover_propagates_other_errors() {
        let built = Arc::new(AtomicUsize::new(0));
        let factory_count = Arc::clone(&built);
        let stream = recover_on_gap(
            move || {
                factory_count.fetch_add(1, Ordering::SeqCst);
                stream::iter(vec![Err(ChannelError::MissingSequence {
                    channel: "openOrders".to_owned(),
                })])
            },
            |_| Box::pin(async {}),
        );

        let items: Vec<_> = stream.collect().await;

        assert_eq!(items.len(), 1);
        assert!(!items[0].as_ref().unwrap_err().is_retryable());
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }
}
