use std::sync::Arc;

use bytes::Bytes;

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct FeedOptions {
    /// wait for operator confirmation before each message
    pub step: bool,
    /// send the first message as soon as a client is connected, without waiting for data
    pub go_first: bool,
    /// close the connection after the last message was written
    pub close_at_end: bool,
    /// do not report triggers that arrive after the feed was exhausted
    pub squelch_exhausted: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FeedState {
    Idle,
    Playing,
    Exhausted,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FeedStep {
    /// The message at `position` is due. If `close_after` is set, it is the last message and
    ///  the connection should be closed once it is written.
    Send { position: usize, data: Bytes, close_after: bool },
    /// There is no message left; `notice` tells whether this should be reported.
    Exhausted { notice: bool },
}

/// Replays a fixed sequence of opaque messages, one per trigger.
///
/// The message sequence never changes once the engine is built, and the position only moves
///  forward: there is no wrap-around or restart. Triggers after the end are harmless and just
///  report exhaustion again.
#[derive(Debug, Clone)]
pub struct FeedEngine {
    messages: Arc<[Bytes]>,
    position: usize,
    state: FeedState,
    options: FeedOptions,
}

impl FeedEngine {
    pub fn new(messages: impl Into<Arc<[Bytes]>>, options: FeedOptions) -> FeedEngine {
        FeedEngine {
            messages: messages.into(),
            position: 0,
            state: FeedState::Idle,
            options,
        }
    }

    /// Builds a feed from several import sources, concatenated in the given order
    pub fn from_sources<S>(sources: impl IntoIterator<Item = S>, options: FeedOptions) -> FeedEngine
    where S: IntoIterator<Item = Bytes>
    {
        let messages = sources.into_iter()
            .flatten()
            .collect::<Vec<_>>();
        Self::new(messages, options)
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn state(&self) -> FeedState {
        self.state
    }

    pub fn options(&self) -> &FeedOptions {
        &self.options
    }

    pub fn messages(&self) -> &Arc<[Bytes]> {
        &self.messages
    }

    /// Returns true exactly once if the feed should initiate the conversation.
    pub fn take_go_first(&mut self) -> bool {
        std::mem::replace(&mut self.options.go_first, false)
    }

    /// Marks the initial message as sent without a `go_first` trigger, e.g. for UDP clients
    ///  which always initiate.
    pub fn clear_go_first(&mut self) {
        self.options.go_first = false;
    }

    /// Advances the feed by one trigger.
    pub fn next_step(&mut self) -> FeedStep {
        if self.state == FeedState::Idle {
            self.state = FeedState::Playing;
        }

        match self.messages.get(self.position) {
            None => {
                self.state = FeedState::Exhausted;
                FeedStep::Exhausted { notice: !self.options.squelch_exhausted }
            }
            Some(data) => {
                let data = data.clone();
                let position = self.position;
                self.position += 1;

                let at_end = self.position >= self.messages.len();
                if at_end {
                    self.state = FeedState::Exhausted;
                }

                FeedStep::Send {
                    position,
                    data,
                    close_after: at_end && self.options.close_at_end,
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    fn messages(msgs: &[&'static str]) -> Vec<Bytes> {
        msgs.iter()
            .map(|m| Bytes::from_static(m.as_bytes()))
            .collect()
    }

    #[rstest]
    #[case::empty(0)]
    #[case::one(1)]
    #[case::several(5)]
    fn test_exhausted_after_n_triggers(#[case] n: usize) {
        let msgs = (0..n).map(|i| Bytes::from(format!("m{}", i))).collect::<Vec<_>>();
        let mut feed = FeedEngine::new(msgs.clone(), FeedOptions::default());
        assert_eq!(feed.state(), FeedState::Idle);

        for i in 0..n {
            assert_eq!(feed.next_step(), FeedStep::Send { position: i, data: msgs[i].clone(), close_after: false });
        }
        if n > 0 {
            assert_eq!(feed.state(), FeedState::Exhausted);
        }

        for _ in 0..3 {
            assert_eq!(feed.next_step(), FeedStep::Exhausted { notice: true });
            assert_eq!(feed.state(), FeedState::Exhausted);
            assert_eq!(feed.position(), n);
        }
    }

    #[test]
    fn test_state_transitions() {
        let mut feed = FeedEngine::new(messages(&["a", "b"]), FeedOptions::default());
        assert_eq!(feed.state(), FeedState::Idle);
        feed.next_step();
        assert_eq!(feed.state(), FeedState::Playing);
        feed.next_step();
        assert_eq!(feed.state(), FeedState::Exhausted);
    }

    #[test]
    fn test_squelch_exhausted() {
        let mut feed = FeedEngine::new(messages(&["a"]), FeedOptions { squelch_exhausted: true, ..FeedOptions::default() });
        feed.next_step();
        assert_eq!(feed.next_step(), FeedStep::Exhausted { notice: false });
    }

    #[rstest]
    #[case::close_at_end(true, vec![false, false, true])]
    #[case::keep_open(false, vec![false, false, false])]
    fn test_close_at_end(#[case] close_at_end: bool, #[case] expected: Vec<bool>) {
        let mut feed = FeedEngine::new(messages(&["a", "b", "c"]), FeedOptions { close_at_end, ..FeedOptions::default() });

        let actual = (0..3)
            .map(|_| match feed.next_step() {
                FeedStep::Send { close_after, .. } => close_after,
                FeedStep::Exhausted { .. } => panic!("exhausted too early"),
            })
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_go_first_is_taken_once() {
        let mut feed = FeedEngine::new(messages(&["a"]), FeedOptions { go_first: true, ..FeedOptions::default() });
        assert!(feed.take_go_first());
        assert!(!feed.take_go_first());
        assert!(!feed.options().go_first);
    }

    #[test]
    fn test_from_sources_concatenates_in_order() {
        let feed = FeedEngine::from_sources(vec![messages(&["a", "b"]), messages(&[]), messages(&["c"])], FeedOptions::default());
        assert_eq!(feed.messages().as_ref(), messages(&["a", "b", "c"]).as_slice());
        assert_eq!(feed.len(), 3);
    }
}
