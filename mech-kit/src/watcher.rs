//! Watching the marketplace for deliveries.
//!
//! A watch starts idle, polls until every request id is delivered, the deadline passes or
//! the caller cancels, and always hands back whatever was delivered so far. Ids that are
//! already delivered are never polled again. Each tick polls the outstanding ids
//! concurrently and records every delivery as soon as its own poll finishes.

use std::time::Duration;

use alloy_core::sol_types::SolEvent;
use alloy_primitives::{Address, B256};
use bon::Builder;
use futures_util::stream::{FuturesUnordered, StreamExt};
use mech_core::{
    errors::{Error, LedgerError, Result, Stage},
    ledger::{LedgerGateway, LogQuery},
    types::{ContentId, DeliveryPayload, DeliveryRecord, RequestId},
};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::{
    contracts::{IMech, IMechMarketplace, read_call},
    retry::ReadRetry,
};

/// Per-watch polling options.
#[derive(Builder, Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    #[builder(default = WatchOptions::DEFAULT_POLL_INTERVAL)]
    pub poll_interval: Duration,
    /// First block to search for delivery events, usually the request's block.
    pub from_block: Option<u64>,
}

impl WatchOptions {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
    /// Shorter intervals are raised to this.
    pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
}

impl Default for WatchOptions {
    fn default() -> Self {
        WatchOptions {
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            from_block: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchState {
    Idle,
    Polling,
    /// Every id was delivered.
    Complete,
    /// The deadline passed first.
    TimedOut,
    /// The caller cancelled first.
    Cancelled,
}

impl WatchState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WatchState::Complete | WatchState::TimedOut | WatchState::Cancelled
        )
    }
}

/// How a watch ended and what it collected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOutcome {
    pub state: WatchState,
    pub record: DeliveryRecord,
}

impl WatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.state == WatchState::Complete
    }

    /// Ids still undelivered when the watch ended.
    pub fn outstanding(&self) -> Vec<RequestId> {
        self.record.outstanding()
    }
}

/// Polls the marketplace, then the delivering mech's logs, for each outstanding request.
#[derive(Debug)]
pub struct DeliveryWatcher<'a, L> {
    ledger: &'a L,
    marketplace: Address,
    retry: ReadRetry,
    state: WatchState,
}

impl<'a, L: LedgerGateway> DeliveryWatcher<'a, L> {
    pub fn new(ledger: &'a L, marketplace: Address) -> Self {
        DeliveryWatcher {
            ledger,
            marketplace,
            retry: ReadRetry::default(),
            state: WatchState::Idle,
        }
    }

    pub fn with_retry(mut self, retry: ReadRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    fn transition(&mut self, next: WatchState) {
        #[cfg(feature = "tracing")]
        tracing::debug!(from = ?self.state, to = ?next, "Delivery watch state change");
        self.state = next;
    }

    /// Watch `ids` until all are delivered, `deadline` passes or `cancel` fires.
    ///
    /// Timing out and cancelling are not errors: the outcome carries the partial record,
    /// including every delivery observed before the watch ended. Transient poll failures
    /// leave the id outstanding for the next tick; any other read failure aborts the watch.
    pub async fn watch(
        mut self,
        ids: &[RequestId],
        deadline: Instant,
        options: WatchOptions,
        cancel: CancellationToken,
    ) -> Result<WatchOutcome> {
        if ids.is_empty() {
            return Err(Error::invalid_input("no request ids to watch"));
        }
        let poll_interval = options.poll_interval.max(WatchOptions::MIN_POLL_INTERVAL);
        let mut record = DeliveryRecord::pending(ids.iter().copied());
        self.transition(WatchState::Polling);

        let end = loop {
            if let Some(end) = self.tick(&mut record, deadline, options.from_block, &cancel).await? {
                break end;
            }
            if record.is_complete() {
                break WatchState::Complete;
            }

            let next_tick = Instant::now() + poll_interval;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break WatchState::Cancelled,
                _ = sleep_until(deadline) => break WatchState::TimedOut,
                _ = sleep_until(next_tick) => {}
            }
        };
        self.transition(end);

        Ok(WatchOutcome {
            state: self.state,
            record,
        })
    }

    /// Poll every outstanding id once, resolving each as its poll finishes.
    ///
    /// Returns the terminal state if the deadline or cancellation cut the tick short;
    /// polls still in flight are dropped, finished ones are already in `record`.
    async fn tick(
        &self,
        record: &mut DeliveryRecord,
        deadline: Instant,
        from_block: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Option<WatchState>> {
        let mut polls: FuturesUnordered<_> = record
            .outstanding()
            .into_iter()
            .map(|id| async move { (id, self.poll_one(id, from_block).await) })
            .collect();

        loop {
            let (id, result) = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Some(WatchState::Cancelled)),
                _ = sleep_until(deadline) => return Ok(Some(WatchState::TimedOut)),
                next = polls.next() => match next {
                    Some(polled) => polled,
                    None => return Ok(None),
                },
            };

            match result {
                Ok(Some(payload)) => {
                    #[cfg(feature = "tracing")]
                    tracing::info!(request_id = %id, mech = %payload.delivery_mech, "Request delivered");
                    record.resolve(id, payload);
                }
                Ok(None) => {}
                Err(err) if err.is_transient() => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(request_id = %id, "Delivery poll failed, will retry: {err}");
                }
                Err(err) => return Err(Error::read(Stage::Delivery, err)),
            }
        }
    }

    /// One delivery check for `id`: `None` while the marketplace has no delivering mech
    /// for it or the mech's delivery event is not visible yet.
    async fn poll_one(
        &self,
        id: RequestId,
        from_block: Option<u64>,
    ) -> std::result::Result<Option<DeliveryPayload>, LedgerError> {
        let info = read_call(
            self.ledger,
            &self.retry,
            self.marketplace,
            &IMechMarketplace::mapRequestIdInfosCall { requestId: id.0 },
        )
        .await?;
        if info.deliveryMech == Address::ZERO {
            return Ok(None);
        }

        let query = LogQuery::builder()
            .address(info.deliveryMech)
            .topic0(IMech::Deliver::SIGNATURE_HASH)
            .maybe_from_block(from_block)
            .build();
        let query = &query;
        let logs = self.retry.run(|| self.ledger.logs(query)).await?;

        for log in logs {
            let Ok(event) = IMech::Deliver::decode_raw_log(log.topics.iter().copied(), &log.data)
            else {
                continue;
            };
            if event.requestId != id.0 {
                continue;
            }
            let content_id = (event.data.len() == 32)
                .then(|| ContentId::from_digest(B256::from_slice(&event.data)));
            return Ok(Some(DeliveryPayload {
                delivery_mech: info.deliveryMech,
                data: event.data,
                content_id,
                tx_hash: log.tx_hash,
            }));
        }
        Ok(None)
    }
}
