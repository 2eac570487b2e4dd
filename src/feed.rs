//! Durable change feed subscription.
//!
//! Owns the connection lifecycle (CONNECTING -> LIVE -> DISCONNECTED ->
//! RECONNECTING) and retries forever with capped exponential backoff. The
//! feed has no replay or offset capability, so every re-entry into LIVE is
//! announced with a possible-gap notice; the consumer must respond with a
//! full resynchronization fetch. No business logic runs on event contents.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::config::FeedConfig;
use crate::error::Result;
use crate::model::ChangeEvent;

const NOTICE_CHANNEL_CAPACITY: usize = 256;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    Connecting,
    Live,
    Disconnected,
    Reconnecting,
}

impl fmt::Display for FeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FeedState::Connecting => "connecting",
            FeedState::Live => "live",
            FeedState::Disconnected => "disconnected",
            FeedState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// What the feed client delivers to its consumer.
#[derive(Debug, Clone)]
pub enum FeedNotice {
    StateChanged(FeedState),
    /// Events may have been missed; a full resync is required.
    PossibleGap,
    Event(ChangeEvent),
}

/// One live connection to the remote change stream.
#[async_trait]
pub trait FeedConnection: Send {
    /// Next event in feed order. `Ok(None)` means the transport dropped.
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>>;
}

/// Factory for feed connections; called once per (re)connect attempt.
#[async_trait]
pub trait ChangeFeedTransport: Send {
    async fn connect(&mut self) -> Result<Box<dyn FeedConnection>>;
}

/// Capped exponential backoff that resets on a successful reconnect.
#[derive(Debug)]
pub struct Backoff {
    initial_ms: f64,
    max_ms: f64,
    multiplier: f64,
    current_ms: f64,
}

impl Backoff {
    pub fn from_config(config: &FeedConfig) -> Self {
        Self {
            initial_ms: config.initial_backoff_ms as f64,
            max_ms: config.max_backoff_ms as f64,
            multiplier: config.backoff_multiplier,
            current_ms: config.initial_backoff_ms as f64,
        }
    }

    /// Delay for the next attempt; grows afterwards, up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = Duration::from_millis(self.current_ms as u64);
        self.current_ms = (self.current_ms * self.multiplier).min(self.max_ms);
        delay
    }

    pub fn reset(&mut self) {
        self.current_ms = self.initial_ms;
    }
}

/// Handle to the background subscription task. Aborts the task on drop.
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct ChangeFeedClient;

impl ChangeFeedClient {
    /// Subscribe to the change feed. The background task retries transport
    /// failures indefinitely while the subscription is held.
    pub fn subscribe<T>(
        transport: T,
        config: FeedConfig,
    ) -> (Subscription, mpsc::Receiver<FeedNotice>)
    where
        T: ChangeFeedTransport + 'static,
    {
        let (tx, rx) = mpsc::channel(NOTICE_CHANNEL_CAPACITY);
        let handle = tokio::spawn(run(transport, config, tx));
        (Subscription { handle }, rx)
    }
}

async fn run<T: ChangeFeedTransport>(
    mut transport: T,
    config: FeedConfig,
    tx: mpsc::Sender<FeedNotice>,
) {
    let mut backoff = Backoff::from_config(&config);
    let mut first_attempt = true;

    loop {
        let attempt_state = if first_attempt {
            FeedState::Connecting
        } else {
            FeedState::Reconnecting
        };
        if tx.send(FeedNotice::StateChanged(attempt_state)).await.is_err() {
            return;
        }

        match transport.connect().await {
            Ok(mut connection) => {
                backoff.reset();
                if tx
                    .send(FeedNotice::StateChanged(FeedState::Live))
                    .await
                    .is_err()
                {
                    return;
                }
                if !first_attempt {
                    // Any event missed while away is permanently lost.
                    if tx.send(FeedNotice::PossibleGap).await.is_err() {
                        return;
                    }
                }
                first_attempt = false;

                loop {
                    match connection.next_event().await {
                        Ok(Some(event)) => {
                            if tx.send(FeedNotice::Event(event)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {
                            debug!("change feed transport closed");
                            break;
                        }
                        Err(err) => {
                            warn!(error = %err, "change feed read failed");
                            break;
                        }
                    }
                }

                if tx
                    .send(FeedNotice::StateChanged(FeedState::Disconnected))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(err) => {
                warn!(error = %err, "change feed connect failed");
                first_attempt = false;
            }
        }

        sleep(backoff.next_delay()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use crate::error::Error;
    use crate::model::{Entity, Team};

    #[test]
    fn backoff_grows_and_caps() {
        let config = FeedConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
            backoff_multiplier: 2.0,
        };
        let mut backoff = Backoff::from_config(&config);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn backoff_resets_to_initial() {
        let config = FeedConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
        };
        let mut backoff = Backoff::from_config(&config);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    enum Session {
        Deliver(Vec<ChangeEvent>),
        Refuse,
    }

    struct ScriptedTransport {
        sessions: VecDeque<Session>,
    }

    struct ScriptedConnection {
        events: VecDeque<ChangeEvent>,
    }

    #[async_trait]
    impl FeedConnection for ScriptedConnection {
        async fn next_event(&mut self) -> Result<Option<ChangeEvent>> {
            Ok(self.events.pop_front())
        }
    }

    #[async_trait]
    impl ChangeFeedTransport for ScriptedTransport {
        async fn connect(&mut self) -> Result<Box<dyn FeedConnection>> {
            match self.sessions.pop_front() {
                Some(Session::Deliver(events)) => Ok(Box::new(ScriptedConnection {
                    events: events.into(),
                })),
                Some(Session::Refuse) | None => {
                    Err(Error::Transport("connection refused".to_string()))
                }
            }
        }
    }

    fn fast_config() -> FeedConfig {
        FeedConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            backoff_multiplier: 2.0,
        }
    }

    async fn collect(rx: &mut mpsc::Receiver<FeedNotice>, count: usize) -> Vec<FeedNotice> {
        let mut notices = Vec::with_capacity(count);
        while notices.len() < count {
            match rx.recv().await {
                Some(notice) => notices.push(notice),
                None => break,
            }
        }
        notices
    }

    #[tokio::test]
    async fn delivers_events_and_signals_gap_on_reconnect() {
        let event = ChangeEvent::insert(Entity::new(Team::Platform, "todo", "a"));
        let transport = ScriptedTransport {
            sessions: VecDeque::from([
                Session::Deliver(vec![event.clone()]),
                Session::Deliver(vec![]),
            ]),
        };

        let (_subscription, mut rx) = ChangeFeedClient::subscribe(transport, fast_config());
        let notices = collect(&mut rx, 7).await;

        assert!(matches!(
            notices[0],
            FeedNotice::StateChanged(FeedState::Connecting)
        ));
        assert!(matches!(
            notices[1],
            FeedNotice::StateChanged(FeedState::Live)
        ));
        match &notices[2] {
            FeedNotice::Event(received) => assert_eq!(received.entity_id, event.entity_id),
            other => panic!("expected event, got {other:?}"),
        }
        assert!(matches!(
            notices[3],
            FeedNotice::StateChanged(FeedState::Disconnected)
        ));
        assert!(matches!(
            notices[4],
            FeedNotice::StateChanged(FeedState::Reconnecting)
        ));
        assert!(matches!(
            notices[5],
            FeedNotice::StateChanged(FeedState::Live)
        ));
        assert!(matches!(notices[6], FeedNotice::PossibleGap));
    }

    #[tokio::test]
    async fn no_gap_signal_on_first_live() {
        let transport = ScriptedTransport {
            sessions: VecDeque::from([Session::Deliver(vec![])]),
        };

        let (_subscription, mut rx) = ChangeFeedClient::subscribe(transport, fast_config());
        let notices = collect(&mut rx, 3).await;

        assert!(matches!(
            notices[1],
            FeedNotice::StateChanged(FeedState::Live)
        ));
        // straight to disconnected, no PossibleGap beforehand
        assert!(matches!(
            notices[2],
            FeedNotice::StateChanged(FeedState::Disconnected)
        ));
    }

    #[tokio::test]
    async fn connect_refusal_retries_with_reconnecting_state() {
        let transport = ScriptedTransport {
            sessions: VecDeque::from([Session::Refuse, Session::Deliver(vec![])]),
        };

        let (_subscription, mut rx) = ChangeFeedClient::subscribe(transport, fast_config());
        let notices = collect(&mut rx, 3).await;

        assert!(matches!(
            notices[0],
            FeedNotice::StateChanged(FeedState::Connecting)
        ));
        assert!(matches!(
            notices[1],
            FeedNotice::StateChanged(FeedState::Reconnecting)
        ));
        assert!(matches!(
            notices[2],
            FeedNotice::StateChanged(FeedState::Live)
        ));
    }
}
