//! Per-device ingest session: one agent connection, many subscribers.
//!
//! The broadcast task pulls chunks from the agent stream, reframes them into
//! NAL units, updates the GOP cache, and fans every unit out to the
//! subscriber queues. Enqueueing never blocks: a slow subscriber loses its
//! newest units instead of stalling everybody else.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::{Error, GopCache, MediaStream, Result, SourceFactory, StreamConfig, UnitExtractor};

/// Base capacity of a subscriber queue; a late joiner gets its prefill on
/// top of this.
const QUEUE_CAPACITY: usize = 200;

/// Counters exposed over the sessions API.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SessionStats {
	pub bytes: u64,
	pub chunks: u64,
	pub subscribers: usize,
}

struct SubscriberSlot {
	id: u64,
	tx: mpsc::Sender<Bytes>,
}

#[derive(Default)]
struct State {
	running: bool,

	// Bumped on every start so a finished broadcast task from a previous run
	// cannot clobber the current one.
	epoch: u64,

	subscribers: Vec<SubscriberSlot>,
	next_id: u64,

	gop: GopCache,
	bytes: u64,
	chunks: u64,

	broadcast: Option<JoinHandle<()>>,
	shutdown: Option<watch::Sender<bool>>,
	idle_stop: Option<JoinHandle<()>>,
}

/// A per-device streaming session.
///
/// `start` and `stop` are idempotent; `subscribe` hands out [Subscriber]s
/// with late-join prefill. Owned by the [crate::SessionManager].
pub struct IngestSession {
	serial: String,
	factory: Arc<dyn SourceFactory>,
	idle_timeout: Duration,

	config: Mutex<StreamConfig>,
	state: Mutex<State>,

	// Serializes start/stop/subscribe; the subscribe protocol must observe a
	// settled session. Never held while the state lock is taken for long.
	lifecycle: AsyncMutex<()>,
}

impl IngestSession {
	pub fn new(
		serial: &str,
		factory: Arc<dyn SourceFactory>,
		config: StreamConfig,
		idle_timeout: Duration,
	) -> Self {
		Self {
			serial: serial.to_string(),
			factory,
			idle_timeout,
			config: Mutex::new(config),
			state: Mutex::new(State::default()),
			lifecycle: AsyncMutex::new(()),
		}
	}

	pub fn serial(&self) -> &str {
		&self.serial
	}

	pub fn is_running(&self) -> bool {
		self.state.lock().running
	}

	pub fn config(&self) -> StreamConfig {
		self.config.lock().clone()
	}

	pub fn stats(&self) -> SessionStats {
		let state = self.state.lock();
		SessionStats {
			bytes: state.bytes,
			chunks: state.chunks,
			subscribers: state.subscribers.len(),
		}
	}

	pub async fn start(self: &Arc<Self>) -> Result<()> {
		let _lifecycle = self.lifecycle.lock().await;
		self.start_inner().await
	}

	pub async fn stop(self: &Arc<Self>) {
		let _lifecycle = self.lifecycle.lock().await;
		self.stop_inner().await;
	}

	/// Swap the encoder settings, restarting the agent if it is live.
	pub async fn update_config(self: &Arc<Self>, config: StreamConfig) -> Result<()> {
		let _lifecycle = self.lifecycle.lock().await;

		tracing::info!(serial = %self.serial, ?config, "updating session config");
		*self.config.lock() = config;

		if self.state.lock().running {
			self.stop_inner().await;
			self.start_inner().await?;
		}

		Ok(())
	}

	/// Subscribe to the NAL stream.
	///
	/// A joiner that arrives after an IDR was broadcast is prefilled with the
	/// current GOP snapshot, so the first VCL unit it sees is an IDR. If the
	/// stream already ran but nobody is listening, the session restarts so
	/// the new subscriber gets a fresh stream head instead of an undecodable
	/// tail.
	pub async fn subscribe(self: &Arc<Self>) -> Result<Subscriber> {
		let _lifecycle = self.lifecycle.lock().await;

		if let Some(pending) = self.state.lock().idle_stop.take() {
			pending.abort();
		}

		let stale = {
			let state = self.state.lock();
			state.running && state.subscribers.is_empty() && state.chunks > 0
		};
		if stale {
			tracing::info!(serial = %self.serial, "restarting session for a fresh stream head");
			self.stop_inner().await;
		}

		if !self.state.lock().running {
			self.start_inner().await?;
		}

		let mut state = self.state.lock();

		let prefill = if !state.subscribers.is_empty() && state.gop.has_idr() {
			state.gop.snapshot()
		} else {
			Vec::new()
		};

		// max(200, snapshot + 200): the live queue budget survives on top of
		// the prefill.
		let (tx, rx) = mpsc::channel(QUEUE_CAPACITY + prefill.len());
		let prefilled = prefill.len();
		for nal in prefill {
			if tx.try_send(nal).is_err() {
				return Err(Error::SubscriberOverflow);
			}
		}

		let id = state.next_id;
		state.next_id += 1;
		state.subscribers.push(SubscriberSlot { id, tx });
		let total = state.subscribers.len();
		drop(state);

		tracing::info!(serial = %self.serial, subscribers = total, prefilled, "subscriber added");

		Ok(Subscriber {
			rx,
			session: self.clone(),
			id,
		})
	}

	async fn start_inner(self: &Arc<Self>) -> Result<()> {
		if self.state.lock().running {
			return Ok(());
		}

		tracing::info!(serial = %self.serial, "starting ingest session");

		let config = self.config.lock().clone();
		let source = self.factory.create(&self.serial, &config);
		let stream = source.open().await?;

		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		let mut state = self.state.lock();
		state.running = true;
		state.epoch += 1;
		state.bytes = 0;
		state.chunks = 0;
		state.gop.clear();

		let epoch = state.epoch;
		let session = self.clone();
		state.broadcast = Some(tokio::spawn(async move {
			session.run_broadcast(stream, shutdown_rx, epoch).await;
		}));
		state.shutdown = Some(shutdown_tx);

		Ok(())
	}

	async fn stop_inner(&self) {
		let (broadcast, shutdown) = {
			let mut state = self.state.lock();
			if !state.running && state.broadcast.is_none() {
				return;
			}
			state.running = false;
			(state.broadcast.take(), state.shutdown.take())
		};

		tracing::info!(serial = %self.serial, "stopping ingest session");

		if let Some(shutdown) = shutdown {
			let _ = shutdown.send(true);
		}
		if let Some(broadcast) = broadcast {
			let _ = broadcast.await;
		}

		self.finish_subscribers();

		if let Some(pending) = self.state.lock().idle_stop.take() {
			pending.abort();
		}
	}

	// Hand every subscriber the stop sentinel and forget them.
	fn finish_subscribers(&self) {
		let subscribers = std::mem::take(&mut self.state.lock().subscribers);
		for subscriber in subscribers {
			let _ = subscriber.tx.try_send(Bytes::new());
		}
	}

	async fn run_broadcast(
		self: Arc<Self>,
		mut stream: Box<dyn MediaStream>,
		mut shutdown: watch::Receiver<bool>,
		epoch: u64,
	) {
		let mut extractor = UnitExtractor::default();

		loop {
			let chunk = tokio::select! {
				chunk = stream.read_chunk() => chunk,
				_ = shutdown.changed() => break,
			};

			let chunk = match chunk {
				Ok(Some(chunk)) => chunk,
				Ok(None) => {
					tracing::info!(serial = %self.serial, "agent stream ended");
					break;
				}
				Err(err) => {
					tracing::error!(serial = %self.serial, %err, "broadcast error");
					break;
				}
			};

			let nals = extractor.push(&chunk);

			let mut state = self.state.lock();
			if !state.running || state.epoch != epoch {
				break;
			}

			state.bytes += chunk.len() as u64;
			state.chunks += 1;

			for nal in nals {
				state.gop.push(&nal);
				for subscriber in &state.subscribers {
					// Non-blocking: a full queue drops this unit for that
					// subscriber only.
					let _ = subscriber.tx.try_send(nal.clone());
				}
			}
		}

		stream.stop().await;

		// Only tear the session down if a newer run has not replaced us.
		let ours = {
			let mut state = self.state.lock();
			let ours = state.epoch == epoch;
			if ours {
				state.running = false;
			}
			ours
		};
		if ours {
			self.finish_subscribers();
		}
	}

	fn on_subscriber_dropped(self: &Arc<Self>, id: u64) {
		let mut state = self.state.lock();
		state.subscribers.retain(|s| s.id != id);

		let remaining = state.subscribers.len();
		tracing::info!(serial = %self.serial, subscribers = remaining, "subscriber removed");

		if remaining > 0 || !state.running {
			return;
		}

		// Last one out: give a reconnect a grace window, then stop.
		if let Some(pending) = state.idle_stop.take() {
			pending.abort();
		}
		let session = self.clone();
		state.idle_stop = Some(tokio::spawn(async move {
			tokio::time::sleep(session.idle_timeout).await;
			// Drop our own handle so stop() does not abort the task mid-stop.
			session.state.lock().idle_stop.take();
			if session.state.lock().subscribers.is_empty() {
				session.stop().await;
			}
		}));
	}
}

/// One subscriber's view of the NAL stream.
///
/// Dropping it unregisters the queue; when the last subscriber goes away the
/// session schedules its idle stop.
pub struct Subscriber {
	rx: mpsc::Receiver<Bytes>,
	session: Arc<IngestSession>,
	id: u64,
}

impl Subscriber {
	/// The next NAL unit, or `None` once the session stops.
	pub async fn next(&mut self) -> Option<Bytes> {
		match self.rx.recv().await {
			// The empty buffer is the stop sentinel.
			Some(nal) if nal.is_empty() => None,
			Some(nal) => Some(nal),
			None => None,
		}
	}
}

impl Drop for Subscriber {
	fn drop(&mut self) {
		self.session.on_subscriber_dropped(self.id);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{MediaSource, START_CODE};
	use std::collections::VecDeque;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use tokio::time::{timeout, Duration};

	fn nal(nal_type: u8, payload: &[u8]) -> Bytes {
		let mut data = START_CODE.to_vec();
		data.push((3 << 5) | (nal_type & 0x1f));
		data.extend_from_slice(payload);
		Bytes::from(data)
	}

	fn nal_type_of(nal: &Bytes) -> u8 {
		nal[4] & 0x1f
	}

	struct FakeStream {
		chunks: VecDeque<Bytes>,
		eof: bool,
	}

	#[async_trait::async_trait]
	impl MediaStream for FakeStream {
		async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
			match self.chunks.pop_front() {
				Some(chunk) => {
					// Give subscribers a chance to drain between chunks.
					tokio::task::yield_now().await;
					Ok(Some(chunk))
				}
				None if self.eof => Ok(None),
				None => {
					futures::future::pending::<()>().await;
					unreachable!()
				}
			}
		}

		async fn stop(&mut self) {}
	}

	struct FakeSource {
		chunks: Vec<Bytes>,
		eof: bool,
		opens: AtomicUsize,
	}

	impl FakeSource {
		fn new(chunks: Vec<Bytes>, eof: bool) -> Arc<Self> {
			Arc::new(Self {
				chunks,
				eof,
				opens: AtomicUsize::new(0),
			})
		}

		fn opens(&self) -> usize {
			self.opens.load(Ordering::SeqCst)
		}
	}

	#[async_trait::async_trait]
	impl MediaSource for FakeSource {
		async fn open(&self) -> Result<Box<dyn MediaStream>> {
			self.opens.fetch_add(1, Ordering::SeqCst);
			Ok(Box::new(FakeStream {
				chunks: self.chunks.iter().cloned().collect(),
				eof: self.eof,
			}))
		}
	}

	struct FakeFactory(Arc<FakeSource>);

	impl SourceFactory for FakeFactory {
		fn create(&self, _serial: &str, _config: &StreamConfig) -> Arc<dyn MediaSource> {
			self.0.clone()
		}
	}

	fn session_with(source: &Arc<FakeSource>, idle_timeout: Duration) -> Arc<IngestSession> {
		Arc::new(IngestSession::new(
			"dummy",
			Arc::new(FakeFactory(source.clone())),
			StreamConfig::default(),
			idle_timeout,
		))
	}

	fn gop_chunks() -> Vec<Bytes> {
		let stream: Vec<u8> = [
			nal(7, b"S"),
			nal(8, b"P"),
			nal(9, b"A"),
			nal(5, b"I"),
			nal(1, b"1"),
			nal(1, b"2"),
			nal(1, b"3"),
		]
		.iter()
		.flat_map(|n| n.to_vec())
		.collect();

		// Arbitrary split points that straddle NAL boundaries.
		[&stream[..7], &stream[7..19], &stream[19..33], &stream[33..]]
			.iter()
			.map(|c| Bytes::copy_from_slice(c))
			.collect()
	}

	#[tokio::test]
	async fn test_late_joiner_receives_sps_pps_idr_first() {
		let source = FakeSource::new(gop_chunks(), false);
		let session = session_with(&source, Duration::from_secs(5));
		session.start().await.unwrap();

		// The early subscriber consumes until the IDR so the GOP cache is
		// known to be primed.
		let mut early = session.subscribe().await.unwrap();
		let mut saw_idr = false;
		for _ in 0..20 {
			let nal = timeout(Duration::from_secs(1), early.next())
				.await
				.expect("timed out")
				.expect("stream ended");
			if nal_type_of(&nal) == 5 {
				saw_idr = true;
				break;
			}
		}
		assert!(saw_idr);

		let mut late = session.subscribe().await.unwrap();

		let mut types = Vec::new();
		while types.len() < 6 {
			match timeout(Duration::from_millis(500), late.next()).await {
				Ok(Some(nal)) => types.push(nal_type_of(&nal)),
				_ => break,
			}
		}

		// SPS then PPS lead, and no non-IDR slice precedes the IDR.
		assert_eq!(types[0], 7);
		assert_eq!(types[1], 8);
		let idr = types.iter().position(|&t| t == 5).expect("no IDR");
		assert!(!types[..idr].contains(&1));

		drop(early);
		drop(late);
		session.stop().await;
	}

	#[tokio::test]
	async fn test_stale_subscriber_restart() {
		let source = FakeSource::new(gop_chunks(), false);
		let session = session_with(&source, Duration::from_secs(5));

		let mut sub = session.subscribe().await.unwrap();
		assert!(timeout(Duration::from_secs(1), sub.next()).await.unwrap().is_some());
		drop(sub);

		// The next subscriber cannot decode from mid-stream, so the session
		// is rebuilt from a fresh agent connection.
		let _sub = session.subscribe().await.unwrap();
		assert_eq!(source.opens(), 2);
		assert!(session.is_running());

		session.stop().await;
	}

	#[tokio::test(start_paused = true)]
	async fn test_idle_stop_after_last_subscriber() {
		let source = FakeSource::new(Vec::new(), false);
		let session = session_with(&source, Duration::from_millis(100));
		session.start().await.unwrap();

		let sub = session.subscribe().await.unwrap();
		drop(sub);

		tokio::time::sleep(Duration::from_millis(250)).await;
		assert!(!session.is_running());
	}

	#[tokio::test(start_paused = true)]
	async fn test_resubscribe_cancels_idle_stop() {
		let source = FakeSource::new(Vec::new(), false);
		let session = session_with(&source, Duration::from_millis(100));
		session.start().await.unwrap();

		let sub = session.subscribe().await.unwrap();
		drop(sub);

		tokio::time::sleep(Duration::from_millis(50)).await;
		let _sub = session.subscribe().await.unwrap();

		tokio::time::sleep(Duration::from_millis(250)).await;
		assert!(session.is_running());

		session.stop().await;
	}

	#[tokio::test]
	async fn test_stop_is_idempotent() {
		let source = FakeSource::new(Vec::new(), false);
		let session = session_with(&source, Duration::from_secs(5));
		session.start().await.unwrap();

		let mut sub = session.subscribe().await.unwrap();

		session.stop().await;
		session.stop().await;

		assert!(!session.is_running());
		assert!(sub.next().await.is_none());
		assert_eq!(source.opens(), 1);
	}

	#[tokio::test]
	async fn test_slow_subscriber_does_not_block_others() {
		let total = QUEUE_CAPACITY + 50;
		let mut chunks: Vec<Bytes> = (0..total).map(|i| nal(1, &[(i % 256) as u8])).collect();
		// A trailing start code flushes the held final unit.
		chunks.push(Bytes::copy_from_slice(&START_CODE));
		let source = FakeSource::new(chunks, true);
		let session = session_with(&source, Duration::from_secs(5));

		// One subscriber never drains its queue...
		let mut slow = session.subscribe().await.unwrap();

		// ...while the other consumes everything as it arrives.
		let mut fast = session.subscribe().await.unwrap();
		let collector = tokio::spawn(async move {
			let mut seen = Vec::new();
			while let Some(nal) = fast.next().await {
				seen.push(nal);
			}
			seen
		});

		let seen = timeout(Duration::from_secs(5), collector).await.unwrap().unwrap();
		assert_eq!(seen.len(), total);
		for (i, nal) in seen.iter().enumerate() {
			assert_eq!(nal[5], (i % 256) as u8);
		}

		// The slow queue kept the oldest units and dropped the overflow.
		let mut kept = 0;
		while let Some(nal) = slow.next().await {
			assert_eq!(nal[5], (kept % 256) as u8);
			kept += 1;
		}
		assert_eq!(kept, QUEUE_CAPACITY);
	}

	#[tokio::test]
	async fn test_update_config_restarts() {
		let source = FakeSource::new(Vec::new(), false);
		let session = session_with(&source, Duration::from_secs(5));
		session.start().await.unwrap();

		session.update_config(StreamConfig::high_quality()).await.unwrap();

		assert!(session.is_running());
		assert_eq!(session.config().max_fps, 60);
		assert_eq!(source.opens(), 2);

		session.stop().await;
	}
}
