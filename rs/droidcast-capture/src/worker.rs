//! The per-device capture worker.
//!
//! While acquired, a supervisor task keeps a decoder child fed from the
//! ingest session: the feeder writes NAL units into the decoder, a reader
//! cuts its raw output into frames and publishes the newest one, and a
//! stderr task tracks the reported resolution. Screen rotation changes the
//! SPS; the feeder notices and restarts the decoder on the new parameters.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::sync::{watch, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;

use droidcast_stream::{nal_type, NalType, Subscribe};

use crate::decoder::Decoder;
use crate::encode::{encode_jpeg, qscale_for_quality};
use crate::frame::{parse_video_line, FrameAssembler, FrameCell, RawFrame};
use crate::{Error, Result};

/// Read size off the decoder stdout.
const READ_SIZE: usize = 256 * 1024;

/// Bounded retry policy for subscribing to the ingest session.
const MAX_SUBSCRIBE_ATTEMPTS: u32 = 5;
const SUBSCRIBE_BACKOFF: Duration = Duration::from_millis(500);
const MAX_SUBSCRIBE_BACKOFF: Duration = Duration::from_secs(10);

pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Metadata for a single capture.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CaptureResult {
	pub capture_id: String,
	pub captured_at: DateTime<Utc>,
	pub serial: String,
	pub width: u32,
	pub height: u32,
	pub bytes: usize,
	pub path: Option<String>,
}

struct PipelineHandle {
	task: JoinHandle<()>,
	shutdown: watch::Sender<bool>,
}

/// Reference-counted decoder pipeline plus on-demand JPEG encoding.
///
/// The decoder starts on the 0 to 1 transition of [CaptureWorker::acquire]
/// and stops on the 1 to 0 transition of [CaptureWorker::release].
pub struct CaptureWorker {
	serial: String,
	source: Arc<dyn Subscribe>,
	output_dir: PathBuf,
	default_quality: u8,
	frame_timeout: Duration,

	refcount: AsyncMutex<usize>,
	pipeline: Mutex<Option<PipelineHandle>>,
	latest: watch::Sender<FrameCell>,

	// At most one JPEG encode in flight per worker.
	encode_gate: Semaphore,
}

impl CaptureWorker {
	pub fn new(
		serial: &str,
		source: Arc<dyn Subscribe>,
		output_dir: impl Into<PathBuf>,
		default_quality: u8,
		frame_timeout: Duration,
	) -> Self {
		Self {
			serial: serial.to_string(),
			source,
			output_dir: output_dir.into(),
			default_quality,
			frame_timeout,
			refcount: AsyncMutex::new(0),
			pipeline: Mutex::new(None),
			latest: watch::Sender::new(FrameCell::default()),
			encode_gate: Semaphore::new(1),
		}
	}

	pub fn serial(&self) -> &str {
		&self.serial
	}

	pub async fn refcount(&self) -> usize {
		*self.refcount.lock().await
	}

	pub async fn acquire(self: &Arc<Self>) -> usize {
		let mut refcount = self.refcount.lock().await;
		*refcount += 1;
		if *refcount == 1 {
			self.start_pipeline();
		}
		*refcount
	}

	pub async fn release(self: &Arc<Self>) -> usize {
		let mut refcount = self.refcount.lock().await;
		*refcount = refcount.saturating_sub(1);
		if *refcount == 0 {
			self.stop_pipeline().await;
		}
		*refcount
	}

	/// Force the refcount to zero and stop the pipeline.
	pub async fn shutdown(self: &Arc<Self>) {
		let mut refcount = self.refcount.lock().await;
		*refcount = 0;
		self.stop_pipeline().await;
	}

	/// Capture the screen as it is at or after this call.
	///
	/// Waits for a frame strictly newer than the request; on timeout an
	/// already-decoded frame is returned as a fallback, and without any
	/// frame at all the capture fails.
	pub async fn capture_jpeg(&self, quality: Option<u8>, save: bool) -> Result<(CaptureResult, Vec<u8>)> {
		let _permit = self.encode_gate.acquire().await.expect("encode gate closed");

		let frame = self.wait_for_frame().await?;

		let quality = quality.unwrap_or(self.default_quality);
		let jpeg = encode_jpeg(&frame, qscale_for_quality(quality)).await?;

		let capture_id = uuid::Uuid::new_v4().to_string();
		let captured_at = Utc::now();

		let path = if save {
			Some(self.save_jpeg(&capture_id, captured_at, &jpeg).await?)
		} else {
			None
		};

		Ok((
			CaptureResult {
				capture_id,
				captured_at,
				serial: self.serial.clone(),
				width: frame.width,
				height: frame.height,
				bytes: jpeg.len(),
				path,
			},
			jpeg,
		))
	}

	fn start_pipeline(self: &Arc<Self>) {
		tracing::info!(serial = %self.serial, "starting capture pipeline");

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let worker = self.clone();
		let task = tokio::spawn(async move {
			run_pipeline(worker, shutdown_rx).await;
		});

		*self.pipeline.lock() = Some(PipelineHandle {
			task,
			shutdown: shutdown_tx,
		});
	}

	async fn stop_pipeline(&self) {
		let handle = self.pipeline.lock().take();
		if let Some(handle) = handle {
			tracing::info!(serial = %self.serial, "stopping capture pipeline");
			let _ = handle.shutdown.send(true);
			let _ = handle.task.await;
		}
	}

	async fn wait_for_frame(&self) -> Result<Arc<RawFrame>> {
		let mut watcher = self.latest.subscribe();
		let seen = watcher.borrow().seq;

		// Clone the frame out before the borrow on `watcher` ends so the
		// timeout fallback below can inspect it again.
		let newer = {
			match tokio::time::timeout(self.frame_timeout, watcher.wait_for(|cell| cell.seq > seen)).await {
				Ok(Ok(cell)) => Some(Ok(cell.frame.clone().expect("sequence advanced without a frame"))),
				Ok(Err(_)) => Some(Err(Error::DecoderUnavailable("frame channel closed".to_string()))),
				Err(_) => None,
			}
		};

		match newer {
			Some(result) => result,
			None => match watcher.borrow().frame.clone() {
				Some(frame) => {
					tracing::warn!(serial = %self.serial, "no fresh frame within deadline, returning the last one");
					Ok(frame)
				}
				None => Err(Error::CaptureTimeout),
			},
		}
	}

	async fn save_jpeg(&self, capture_id: &str, captured_at: DateTime<Utc>, jpeg: &[u8]) -> Result<String> {
		let dir = self.output_dir.join(&self.serial);
		tokio::fs::create_dir_all(&dir).await?;

		let path = dir.join(format!("{}_{}.jpg", sanitize_timestamp(captured_at), capture_id));
		tokio::fs::write(&path, jpeg).await?;

		tracing::info!(serial = %self.serial, path = %path.display(), "capture saved");
		Ok(path.to_string_lossy().into_owned())
	}
}

/// A filesystem-friendly UTC timestamp.
fn sanitize_timestamp(at: DateTime<Utc>) -> String {
	at.to_rfc3339_opts(SecondsFormat::Micros, true)
		.replace([':', '+'], "")
		.trim_end_matches('Z')
		.to_string()
}

enum FeedExit {
	Restart,
	StreamEnded,
	BrokenPipe,
	Shutdown,
}

async fn run_pipeline(worker: Arc<CaptureWorker>, mut shutdown: watch::Receiver<bool>) {
	let serial = worker.serial.clone();
	let mut attempts = 0;
	let mut backoff = SUBSCRIBE_BACKOFF;

	'subscribe: loop {
		let mut subscriber = match worker.source.subscribe(&serial).await {
			Ok(subscriber) => {
				attempts = 0;
				backoff = SUBSCRIBE_BACKOFF;
				subscriber
			}
			Err(err) => {
				attempts += 1;
				if attempts >= MAX_SUBSCRIBE_ATTEMPTS {
					tracing::error!(serial, %err, "giving up on the ingest session");
					return;
				}
				tracing::warn!(serial, %err, attempts, "subscribe failed, retrying");
				tokio::select! {
					_ = tokio::time::sleep(backoff) => {}
					_ = shutdown.changed() => return,
				}
				backoff = (backoff * 2).min(MAX_SUBSCRIBE_BACKOFF);
				continue 'subscribe;
			}
		};

		// The last SPS survives decoder restarts; only a *changed* SPS
		// forces another restart.
		let mut last_sps: Option<Bytes> = None;
		let mut pending: Option<Bytes> = None;

		loop {
			let mut decoder = match Decoder::spawn(&serial) {
				Ok(decoder) => decoder,
				Err(err) => {
					tracing::error!(serial, %err, "decoder unavailable");
					return;
				}
			};

			let (res_tx, res_rx) = watch::channel(None);
			let reader = decoder
				.stdout
				.take()
				.map(|stdout| tokio::spawn(read_frames(stdout, worker.latest.clone(), res_rx, serial.clone())));
			let stderr = decoder
				.stderr
				.take()
				.map(|stderr| tokio::spawn(parse_stderr(stderr, res_tx, serial.clone())));

			let mut stdin = match decoder.stdin.take() {
				Some(stdin) => stdin,
				None => {
					tracing::error!(serial, "decoder has no stdin");
					return;
				}
			};

			let exit = loop {
				let nal = match pending.take() {
					Some(nal) => Some(nal),
					None => tokio::select! {
						nal = subscriber.next() => nal,
						_ = shutdown.changed() => break FeedExit::Shutdown,
					},
				};

				let nal = match nal {
					Some(nal) => nal,
					None => break FeedExit::StreamEnded,
				};

				// Screen rotation shows up as a changed SPS; the decoder
				// cannot follow mid-stream, so restart it on the fresh
				// parameters and re-feed this unit.
				if nal_type(&nal) == Some(NalType::Sps) {
					match &last_sps {
						Some(previous) if *previous != nal => {
							tracing::info!(serial, "SPS changed, restarting decoder");
							last_sps = Some(nal.clone());
							pending = Some(nal);
							break FeedExit::Restart;
						}
						_ => last_sps = Some(nal.clone()),
					}
				}

				if let Err(err) = stdin.write_all(&nal).await {
					tracing::warn!(serial, %err, "decoder stdin closed");
					break FeedExit::BrokenPipe;
				}
			};

			drop(stdin);
			decoder.stop(&serial).await;
			if let Some(reader) = reader {
				reader.abort();
			}
			if let Some(stderr) = stderr {
				stderr.abort();
			}

			match exit {
				FeedExit::Restart => continue,
				FeedExit::StreamEnded => {
					attempts += 1;
					if attempts >= MAX_SUBSCRIBE_ATTEMPTS {
						tracing::error!(serial, "ingest session keeps ending, giving up");
						return;
					}
					tracing::warn!(serial, "ingest session ended, resubscribing");
					tokio::select! {
						_ = tokio::time::sleep(backoff) => {}
						_ = shutdown.changed() => return,
					}
					backoff = (backoff * 2).min(MAX_SUBSCRIBE_BACKOFF);
					continue 'subscribe;
				}
				FeedExit::BrokenPipe | FeedExit::Shutdown => return,
			}
		}
	}
}

/// Cut raw decoder output into frames, publishing only the newest.
async fn read_frames(
	mut stdout: ChildStdout,
	latest: watch::Sender<FrameCell>,
	mut resolution: watch::Receiver<Option<(u32, u32)>>,
	serial: String,
) {
	let mut assembler = FrameAssembler::default();
	let mut buf = vec![0u8; READ_SIZE];

	loop {
		let n = match stdout.read(&mut buf).await {
			Ok(0) => break,
			Ok(n) => n,
			Err(err) => {
				tracing::warn!(serial, %err, "decoder stdout error");
				break;
			}
		};

		// Adopt a reported resolution (or a rotation) before cutting.
		if resolution.has_changed().unwrap_or(false) {
			if let Some((width, height)) = *resolution.borrow_and_update() {
				assembler.set_resolution(width, height);
			}
		}

		if let Some(frame) = assembler.push(&buf[..n]) {
			latest.send_modify(|cell| {
				cell.seq += 1;
				cell.frame = Some(Arc::new(frame));
			});
		}
	}

	tracing::debug!(serial, "decoder reader ended");
}

/// Drain decoder stderr, watching stream-info lines for the resolution.
async fn parse_stderr(stderr: ChildStderr, resolution: watch::Sender<Option<(u32, u32)>>, serial: String) {
	let mut lines = BufReader::new(stderr).lines();

	while let Ok(Some(line)) = lines.next_line().await {
		if let Some((width, height)) = parse_video_line(&line) {
			let changed = resolution.send_if_modified(|current| {
				if *current != Some((width, height)) {
					*current = Some((width, height));
					true
				} else {
					false
				}
			});
			if changed {
				tracing::info!(serial, width, height, "decoder reports resolution");
			}
		} else {
			tracing::trace!(serial, decoder = %line, "decoder output");
		}
	}
}
