//! Generic confirmed-block monitor. A [`BlockReader`] supplies the
//! chain-specific primitives; the monitor turns them into a lazy,
//! indefinite stream of per-block event envelopes that never skips a
//! block, never emits the same block twice within a run, and resumes from
//! a durable cursor after a restart.

use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::Stream;
use serde_json::json;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::notify::pager::{Pager, Severity};

/// How long a monitor may sit without yielding a block before the stall is
/// paged.
const STALL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Durable mark of the last fully processed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionLocation {
    pub block_hash: String,
    pub tx_id: String,
}

/// One block's worth of events, delivered to the observer atomically and
/// in on-chain order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope<E> {
    pub block_hash: String,
    pub events: Vec<E>,
}

pub trait ChainEvent {
    fn tx_id(&self) -> &str;
}

/// Chain-specific primitives behind a monitor. `tip_index` already
/// accounts for the confirmation depth, so everything the monitor sees is
/// final barring a reorg deeper than that depth.
#[async_trait]
pub trait BlockReader: Send + Sync + 'static {
    type Event: ChainEvent + Clone + Send + Sync + 'static;

    const NAME: &'static str;

    async fn tip_index(&self) -> anyhow::Result<u64>;

    async fn block_hash(&self, index: u64) -> anyhow::Result<String>;

    /// `None` when the block is not on the canonical chain.
    async fn block_index(&self, block_hash: &str) -> anyhow::Result<Option<u64>>;

    async fn events_in(&self, index: u64) -> anyhow::Result<Vec<Self::Event>>;

    /// Hook for readers that split one chain block into several
    /// processing steps. The default processes the block itself.
    fn triggered_blocks(&self, index: u64) -> Vec<u64> {
        vec![index]
    }
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("cursor block {block_hash} is no longer on the canonical chain")]
    ReorgedCursor { block_hash: String },
}

enum RemainsError {
    Reorged,
    Read(anyhow::Error),
}

pub struct HeadlessMonitor<R: BlockReader> {
    reader: Arc<R>,
    resume_from: Option<TransactionLocation>,
    poll_delay: Duration,
    pager: Arc<Pager>,
}

impl<R: BlockReader> HeadlessMonitor<R> {
    pub fn new(
        reader: Arc<R>,
        resume_from: Option<TransactionLocation>,
        poll_delay: Duration,
        pager: Arc<Pager>,
    ) -> Self {
        Self {
            reader,
            resume_from,
            poll_delay,
            pager,
        }
    }

    /// The long-lived pull. Transient reader failures are logged and
    /// retried on the next poll; the stream only fails terminally when the
    /// resume cursor turns out to be reorged away.
    pub fn into_stream(self) -> impl Stream<Item = Result<EventEnvelope<R::Event>, MonitorError>> {
        try_stream! {
            let mut latest = match self.resume_from.clone() {
                Some(location) => {
                    let (next_index, remained) = self.resume(&location).await?;
                    info!(
                        monitor = R::NAME,
                        next_index,
                        replayed_blocks = remained.len(),
                        "resumed from stored cursor"
                    );
                    for envelope in remained {
                        yield envelope;
                    }
                    next_index.saturating_sub(1)
                }
                None => {
                    let tip = self.initial_tip().await;
                    info!(monitor = R::NAME, tip, "no stored cursor, starting from tip");
                    tip
                }
            };

            let mut last_progress = Instant::now();
            loop {
                let tip = match self.reader.tip_index().await {
                    Ok(tip) => tip,
                    Err(error) => {
                        error!(monitor = R::NAME, ?error, "could not read tip");
                        sleep(self.poll_delay).await;
                        continue;
                    }
                };

                if latest + 1 > tip {
                    if last_progress.elapsed() >= STALL_TIMEOUT {
                        warn!(monitor = R::NAME, latest, tip, "monitor is not advancing");
                        self.pager
                            .page(
                                Severity::Error,
                                &format!("{} monitor stalled at block {latest}", R::NAME),
                                json!({ "monitor": R::NAME, "latest": latest, "tip": tip }),
                            )
                            .await;
                        last_progress = Instant::now();
                    }
                    sleep(self.poll_delay).await;
                    continue;
                }

                let next = latest + 1;
                match self.fetch_envelopes(next).await {
                    Ok(envelopes) => {
                        for envelope in envelopes {
                            yield envelope;
                        }
                    }
                    Err(error) => {
                        error!(monitor = R::NAME, index = next, ?error, "could not fetch block");
                        sleep(self.poll_delay).await;
                        continue;
                    }
                }
                latest = next;
                last_progress = Instant::now();
            }
        }
    }

    /// Replays whatever the stored cursor has not seen yet. Transient
    /// failures retry indefinitely; a cursor that fell off the canonical
    /// chain is fatal and paged before the error surfaces.
    async fn resume(
        &self,
        location: &TransactionLocation,
    ) -> Result<(u64, Vec<EventEnvelope<R::Event>>), MonitorError> {
        loop {
            match process_remains(self.reader.as_ref(), location).await {
                Ok(resumed) => return Ok(resumed),
                Err(RemainsError::Reorged) => {
                    self.pager
                        .page(
                            Severity::Critical,
                            &format!(
                                "{} cursor block is no longer canonical, bridge halted",
                                R::NAME
                            ),
                            json!({ "monitor": R::NAME, "block_hash": location.block_hash }),
                        )
                        .await;
                    return Err(MonitorError::ReorgedCursor {
                        block_hash: location.block_hash.clone(),
                    });
                }
                Err(RemainsError::Read(error)) => {
                    error!(monitor = R::NAME, ?error, "could not resume from cursor");
                    sleep(self.poll_delay).await;
                }
            }
        }
    }

    async fn initial_tip(&self) -> u64 {
        loop {
            match self.reader.tip_index().await {
                Ok(tip) => return tip,
                Err(error) => {
                    error!(monitor = R::NAME, ?error, "could not read initial tip");
                    sleep(self.poll_delay).await;
                }
            }
        }
    }

    /// Fetches every envelope for the given block index before any of them
    /// is yielded, so a mid-block failure never leaves a half-emitted
    /// block behind an unadvanced counter.
    async fn fetch_envelopes(&self, index: u64) -> anyhow::Result<Vec<EventEnvelope<R::Event>>> {
        let mut envelopes = Vec::new();
        for triggered in self.reader.triggered_blocks(index) {
            let block_hash = self.reader.block_hash(triggered).await?;
            let events = self.reader.events_in(triggered).await?;
            envelopes.push(EventEnvelope { block_hash, events });
        }
        Ok(envelopes)
    }
}

/// Events strictly newer than the stored cursor, from the cursor's block
/// up to the confirmed tip, plus the index processing continues at.
async fn process_remains<R: BlockReader>(
    reader: &R,
    location: &TransactionLocation,
) -> Result<(u64, Vec<EventEnvelope<R::Event>>), RemainsError> {
    let index = reader
        .block_index(&location.block_hash)
        .await
        .map_err(RemainsError::Read)?
        .ok_or(RemainsError::Reorged)?;
    let tip = reader.tip_index().await.map_err(RemainsError::Read)?;

    let mut envelopes = Vec::new();
    let mut block = index;
    while block <= tip {
        let block_hash = reader.block_hash(block).await.map_err(RemainsError::Read)?;
        let mut events = reader.events_in(block).await.map_err(RemainsError::Read)?;
        if block == index {
            // Everything up to and including the stored transaction was
            // already handed to the observer before the crash.
            if let Some(position) = events
                .iter()
                .position(|event| event.tx_id() == location.tx_id)
            {
                events.drain(..=position);
            }
        }
        envelopes.push(EventEnvelope { block_hash, events });
        block += 1;
    }
    Ok((tip + 1, envelopes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{pin_mut, StreamExt};
    use std::sync::Mutex;
    use tokio::time::timeout;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct FakeEvent {
        tx_id: String,
    }

    impl FakeEvent {
        fn new(tx_id: &str) -> Self {
            Self {
                tx_id: tx_id.to_owned(),
            }
        }
    }

    impl ChainEvent for FakeEvent {
        fn tx_id(&self) -> &str {
            &self.tx_id
        }
    }

    struct FakeChain {
        blocks: Mutex<Vec<(String, Vec<FakeEvent>)>>,
        confirmations: u64,
    }

    impl FakeChain {
        fn new(confirmations: u64) -> Self {
            Self {
                blocks: Mutex::new(Vec::new()),
                confirmations,
            }
        }

        fn push(&self, hash: &str, tx_ids: &[&str]) {
            self.blocks.lock().unwrap().push((
                hash.to_owned(),
                tx_ids.iter().map(|tx_id| FakeEvent::new(tx_id)).collect(),
            ));
        }
    }

    #[async_trait]
    impl BlockReader for Arc<FakeChain> {
        type Event = FakeEvent;

        const NAME: &'static str = "fake";

        async fn tip_index(&self) -> anyhow::Result<u64> {
            let blocks = self.blocks.lock().unwrap();
            let tip = blocks
                .len()
                .checked_sub(1)
                .ok_or_else(|| anyhow::anyhow!("empty chain"))?;
            Ok((tip as u64).saturating_sub(self.confirmations))
        }

        async fn block_hash(&self, index: u64) -> anyhow::Result<String> {
            let blocks = self.blocks.lock().unwrap();
            blocks
                .get(index as usize)
                .map(|(hash, _)| hash.clone())
                .ok_or_else(|| anyhow::anyhow!("no block {index}"))
        }

        async fn block_index(&self, block_hash: &str) -> anyhow::Result<Option<u64>> {
            let blocks = self.blocks.lock().unwrap();
            Ok(blocks
                .iter()
                .position(|(hash, _)| hash == block_hash)
                .map(|position| position as u64))
        }

        async fn events_in(&self, index: u64) -> anyhow::Result<Vec<FakeEvent>> {
            let blocks = self.blocks.lock().unwrap();
            blocks
                .get(index as usize)
                .map(|(_, events)| events.clone())
                .ok_or_else(|| anyhow::anyhow!("no block {index}"))
        }
    }

    fn monitor(
        chain: Arc<FakeChain>,
        resume_from: Option<TransactionLocation>,
    ) -> HeadlessMonitor<Arc<FakeChain>> {
        HeadlessMonitor::new(
            Arc::new(chain),
            resume_from,
            Duration::from_millis(10),
            Arc::new(Pager::disabled()),
        )
    }

    #[tokio::test]
    async fn replays_remains_after_stored_transaction() {
        let chain = Arc::new(FakeChain::new(0));
        chain.push("b0", &["t0"]);
        chain.push("b1", &["t1a", "t1b", "t1c"]);
        chain.push("b2", &["t2"]);

        let location = TransactionLocation {
            block_hash: "b1".into(),
            tx_id: "t1a".into(),
        };
        let (next, envelopes) = process_remains(&chain, &location).await.map_err(|_| ()).unwrap();

        assert_eq!(next, 3);
        assert_eq!(envelopes.len(), 2);
        assert_eq!(
            envelopes[0].events,
            vec![FakeEvent::new("t1b"), FakeEvent::new("t1c")]
        );
        assert_eq!(envelopes[1].events, vec![FakeEvent::new("t2")]);
    }

    #[tokio::test]
    async fn remains_respect_confirmation_depth() {
        let chain = Arc::new(FakeChain::new(1));
        chain.push("b0", &["t0"]);
        chain.push("b1", &["t1"]);
        chain.push("b2", &["t2"]);

        let location = TransactionLocation {
            block_hash: "b0".into(),
            tx_id: "t0".into(),
        };
        let (next, envelopes) = process_remains(&chain, &location).await.map_err(|_| ()).unwrap();

        // Block 2 is inside the confirmation window and must not be
        // replayed yet.
        assert_eq!(next, 2);
        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[1].events, vec![FakeEvent::new("t1")]);
    }

    #[tokio::test]
    async fn unknown_cursor_block_is_reorged() {
        let chain = Arc::new(FakeChain::new(0));
        chain.push("b0", &["t0"]);

        let location = TransactionLocation {
            block_hash: "gone".into(),
            tx_id: "t0".into(),
        };
        assert!(matches!(
            process_remains(&chain, &location).await,
            Err(RemainsError::Reorged)
        ));
    }

    #[tokio::test]
    async fn fresh_start_yields_only_new_blocks() {
        let chain = Arc::new(FakeChain::new(0));
        chain.push("b0", &["t0"]);
        chain.push("b1", &["t1"]);

        let stream = monitor(chain.clone(), None).into_stream();
        pin_mut!(stream);

        // Let the monitor pick up its starting tip before extending the
        // chain; nothing is due yet, so the first poll times out.
        assert!(timeout(Duration::from_millis(50), stream.next())
            .await
            .is_err());

        chain.push("b2", &["t2a", "t2b"]);
        let envelope = timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("stream produced nothing")
            .unwrap()
            .unwrap();
        assert_eq!(envelope.block_hash, "b2");
        assert_eq!(
            envelope.events,
            vec![FakeEvent::new("t2a"), FakeEvent::new("t2b")]
        );
    }

    #[tokio::test]
    async fn resumed_stream_continues_in_order() {
        let chain = Arc::new(FakeChain::new(0));
        chain.push("b0", &["t0"]);
        chain.push("b1", &["t1a", "t1b"]);

        let location = TransactionLocation {
            block_hash: "b1".into(),
            tx_id: "t1a".into(),
        };
        let stream = monitor(chain.clone(), Some(location)).into_stream();
        pin_mut!(stream);

        let replayed = timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(replayed.block_hash, "b1");
        assert_eq!(replayed.events, vec![FakeEvent::new("t1b")]);

        chain.push("b2", &["t2"]);
        let envelope = timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(envelope.block_hash, "b2");
    }

    #[tokio::test]
    async fn reorged_cursor_ends_the_stream() {
        let chain = Arc::new(FakeChain::new(0));
        chain.push("b0", &["t0"]);

        let location = TransactionLocation {
            block_hash: "orphaned".into(),
            tx_id: "t0".into(),
        };
        let stream = monitor(chain, Some(location)).into_stream();
        pin_mut!(stream);

        let result = timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(MonitorError::ReorgedCursor { .. })));
    }
}
