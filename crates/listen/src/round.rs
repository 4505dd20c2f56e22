//! One discovery round: the candidate being asked, those still to ask and
//! those whose time ran out.

use std::collections::VecDeque;

use herald_core::ConnectionId;
use tokio::task::JoinHandle;

use crate::provider::Provider;

struct Offer {
    provider: Provider,
    token: u64,
    timer: JoinHandle<()>,
}

/// What to do with an answer from a candidate that already timed out.
#[derive(Debug)]
pub enum LateResponse {
    /// The sender was never timed out in this round.
    Unknown,

    /// First late acceptance, kept in case the current candidate declines.
    Remembered,

    /// Someone already accepted late; this provider must be told to stand down.
    Superseded(Provider),

    /// A late rejection, nothing left to do.
    Forgotten,
}

pub struct Round {
    current: Option<Offer>,
    remaining: VecDeque<Provider>,
    timed_out: Vec<Provider>,
    late_acceptor: Option<Provider>,
}

impl Round {
    pub fn new(candidates: Vec<Provider>) -> Self {
        Self {
            current: None,
            remaining: candidates.into(),
            timed_out: Vec::new(),
            late_acceptor: None,
        }
    }

    /// Pops the next candidate, dropping those `skip` rejects.
    pub fn next_candidate<F>(&mut self, skip: F) -> Option<Provider>
    where
        F: Fn(&Provider) -> bool,
    {
        while let Some(candidate) = self.remaining.pop_front() {
            if !skip(&candidate) {
                return Some(candidate);
            }
        }

        None
    }

    /// Records that `provider` was asked, with its response timer.
    pub fn offer(&mut self, provider: Provider, token: u64, timer: JoinHandle<()>) {
        if let Some(previous) = self.current.replace(Offer {
            provider,
            token,
            timer,
        }) {
            previous.timer.abort();
        }
    }

    pub fn is_current(&self, connection: ConnectionId, pattern: &str) -> bool {
        self.current
            .as_ref()
            .is_some_and(|offer| offer.provider.is(connection, pattern))
    }

    /// Ends the current candidate's turn, cancelling its timer.
    pub fn take_current(&mut self) -> Option<Provider> {
        self.current.take().map(|offer| {
            offer.timer.abort();
            offer.provider
        })
    }

    /// Ends the current candidate's turn if `token` identifies its offer.
    pub fn time_out(&mut self, token: u64) -> Option<Provider> {
        if self.current.as_ref()?.token != token {
            return None;
        }

        let provider = self.current.take()?.provider;
        self.timed_out.push(provider.clone());
        Some(provider)
    }

    /// Queues a provider that started listening while the round runs.
    /// Returns `false` if it is already part of the round.
    pub fn enqueue(&mut self, provider: Provider) -> bool {
        let known = self
            .current
            .as_ref()
            .is_some_and(|offer| offer.provider.same(&provider))
            || self.remaining.iter().any(|queued| queued.same(&provider))
            || self.timed_out.iter().any(|late| late.same(&provider));

        if !known {
            self.remaining.push_back(provider);
        }

        !known
    }

    pub fn late_response(
        &mut self,
        connection: ConnectionId,
        pattern: &str,
        accepted: bool,
    ) -> LateResponse {
        let Some(index) = self
            .timed_out
            .iter()
            .position(|late| late.is(connection, pattern))
        else {
            return LateResponse::Unknown;
        };

        if !accepted {
            self.timed_out.remove(index);
            return LateResponse::Forgotten;
        }

        match &self.late_acceptor {
            None => {
                self.late_acceptor = Some(self.timed_out[index].clone());
                LateResponse::Remembered
            }
            Some(accepted) if accepted.is(connection, pattern) => LateResponse::Remembered,
            Some(_) => LateResponse::Superseded(self.timed_out[index].clone()),
        }
    }

    pub const fn take_late_acceptor(&mut self) -> Option<Provider> {
        self.late_acceptor.take()
    }

    /// Removes a provider from every part of the round. Returns `true` if it
    /// was the current candidate, whose turn is then over.
    pub fn remove_provider(&mut self, connection: ConnectionId, pattern: &str) -> bool {
        self.remaining
            .retain(|queued| !queued.is(connection, pattern));
        self.timed_out.retain(|late| !late.is(connection, pattern));

        if self
            .late_acceptor
            .as_ref()
            .is_some_and(|accepted| accepted.is(connection, pattern))
        {
            self.late_acceptor = None;
        }

        if self.is_current(connection, pattern) {
            self.take_current();
            return true;
        }

        false
    }

    /// Stops the round, returning the providers that were told about the name
    /// and have not been turned down yet.
    pub fn cancel(mut self) -> Vec<Provider> {
        self.take_current()
            .into_iter()
            .chain(self.late_acceptor.take())
            .collect()
    }
}

impl Drop for Round {
    fn drop(&mut self) {
        if let Some(offer) = &self.current {
            offer.timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use assert_matches::assert_matches;
    use herald_core::Connection;
    use herald_core::test_support::MockConnection;

    fn provider(connection: &Arc<MockConnection>, pattern: &str) -> Provider {
        Provider::new(connection.handle(), pattern)
    }

    fn idle_timer() -> JoinHandle<()> {
        tokio::spawn(std::future::pending())
    }

    #[tokio::test]
    async fn test_candidates_are_asked_in_order() {
        let (first, second) = (MockConnection::new(), MockConnection::new());
        let mut round = Round::new(vec![provider(&first, "a/.*"), provider(&second, "a/.*")]);

        let next = round.next_candidate(|_| false).unwrap();
        assert_eq!(next.connection.id(), first.id());
        round.offer(next, 1, idle_timer());
        assert!(round.is_current(first.id(), "a/.*"));
        assert!(!round.is_current(first.id(), "a/[0-9]"));

        round.take_current();
        let next = round.next_candidate(|_| false).unwrap();
        assert_eq!(next.connection.id(), second.id());
        assert!(round.next_candidate(|_| false).is_none());
    }

    #[tokio::test]
    async fn test_skipped_candidates_are_dropped() {
        let (first, second) = (MockConnection::new(), MockConnection::new());
        let mut round = Round::new(vec![provider(&first, "a/.*"), provider(&second, "a/.*")]);
        let skipped = first.id();

        let next = round
            .next_candidate(|candidate| candidate.connection.id() == skipped)
            .unwrap();

        assert_eq!(next.connection.id(), second.id());
    }

    #[tokio::test]
    async fn test_stale_timeout_is_ignored() {
        let connection = MockConnection::new();
        let mut round = Round::new(Vec::new());
        round.offer(provider(&connection, "a/.*"), 2, idle_timer());

        assert!(round.time_out(1).is_none());
        assert!(round.is_current(connection.id(), "a/.*"));

        assert!(round.time_out(2).is_some());
        assert!(!round.is_current(connection.id(), "a/.*"));
    }

    #[tokio::test]
    async fn test_late_responses() {
        let (first, second) = (MockConnection::new(), MockConnection::new());
        let mut round = Round::new(Vec::new());

        round.offer(provider(&first, "a/.*"), 1, idle_timer());
        round.time_out(1);
        round.offer(provider(&second, "a/.*"), 2, idle_timer());
        round.time_out(2);

        assert_matches!(
            round.late_response(first.id(), "b/.*", true),
            LateResponse::Unknown
        );
        assert_matches!(
            round.late_response(first.id(), "a/.*", true),
            LateResponse::Remembered
        );
        assert_matches!(
            round.late_response(second.id(), "a/.*", true),
            LateResponse::Superseded(late) if late.connection.id() == second.id()
        );

        let accepted = round.take_late_acceptor().unwrap();
        assert_eq!(accepted.connection.id(), first.id());
    }

    #[tokio::test]
    async fn test_late_reject_is_forgotten() {
        let connection = MockConnection::new();
        let mut round = Round::new(Vec::new());
        round.offer(provider(&connection, "a/.*"), 1, idle_timer());
        round.time_out(1);

        assert_matches!(
            round.late_response(connection.id(), "a/.*", false),
            LateResponse::Forgotten
        );
        assert_matches!(
            round.late_response(connection.id(), "a/.*", true),
            LateResponse::Unknown
        );
    }

    #[tokio::test]
    async fn test_enqueue_deduplicates() {
        let connection = MockConnection::new();
        let mut round = Round::new(vec![provider(&connection, "a/.*")]);

        assert!(!round.enqueue(provider(&connection, "a/.*")));
        assert!(round.enqueue(provider(&connection, "a/[0-9]")));
    }

    #[tokio::test]
    async fn test_removing_current_ends_its_turn() {
        let (first, second) = (MockConnection::new(), MockConnection::new());
        let mut round = Round::new(vec![provider(&second, "a/.*")]);
        round.offer(provider(&first, "a/.*"), 1, idle_timer());

        assert!(!round.remove_provider(second.id(), "a/.*"));
        assert!(round.remove_provider(first.id(), "a/.*"));
        assert!(round.next_candidate(|_| false).is_none());
    }

    #[tokio::test]
    async fn test_cancel_returns_notified_providers() {
        let (first, second) = (MockConnection::new(), MockConnection::new());
        let mut round = Round::new(Vec::new());
        round.offer(provider(&first, "a/.*"), 1, idle_timer());
        round.time_out(1);
        round.late_response(first.id(), "a/.*", true);
        round.offer(provider(&second, "a/.*"), 2, idle_timer());

        let notified: Vec<ConnectionId> = round
            .cancel()
            .iter()
            .map(|provider| provider.connection.id())
            .collect();

        assert_eq!(notified, vec![second.id(), first.id()]);
    }
}
