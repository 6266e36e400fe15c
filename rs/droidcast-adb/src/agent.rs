//! Launches the on-device capture agent and exposes its H.264 stream.
//!
//! Start order: push the agent jar, install an adb forward from a free host
//! port to the agent's abstract socket, launch the agent over `adb shell`,
//! then connect to the tunneled port with a bounded retry window. Any
//! failure unwinds the partial state (kill agent, drop forwards) before it
//! propagates.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use droidcast_stream::{Error, MediaSource, MediaStream, Result, SourceFactory, StreamConfig};

use crate::bridge;

/// Where the agent jar lands on the device.
const DEVICE_JAR_PATH: &str = "/data/local/tmp/scrcpy-server.jar";

/// Entry point inside the jar, invoked through app_process.
const AGENT_CLASS: &str = "com.genymobile.scrcpy.Server";
const AGENT_VERSION: &str = "3.3.4";

/// The abstract socket the agent listens on once started.
const AGENT_SOCKET: &str = "localabstract:scrcpy";

/// Read size off the tunneled socket.
const READ_SIZE: usize = 64 * 1024;

/// The agent needs a moment to boot before it accepts connections.
const STARTUP_DELAY: Duration = Duration::from_millis(1500);
const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_RETRY: Duration = Duration::from_millis(500);

/// Grace period for the agent to exit after its socket closes.
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Builds an [AgentSource] per device; this is the [SourceFactory] the
/// gateway hands to the session manager.
pub struct AgentFactory {
	jar_path: PathBuf,
}

impl AgentFactory {
	pub fn new(jar_path: impl Into<PathBuf>) -> Self {
		Self {
			jar_path: jar_path.into(),
		}
	}
}

impl SourceFactory for AgentFactory {
	fn create(&self, serial: &str, config: &StreamConfig) -> Arc<dyn MediaSource> {
		Arc::new(AgentSource {
			serial: serial.to_string(),
			jar_path: self.jar_path.clone(),
			config: config.clone(),
		})
	}
}

/// One device's capture agent; each [MediaSource::open] pushes, tunnels,
/// launches and connects from scratch.
pub struct AgentSource {
	serial: String,
	jar_path: PathBuf,
	config: StreamConfig,
}

impl AgentSource {
	async fn push_agent(&self) -> Result<()> {
		let jar = self.jar_path.to_string_lossy().to_string();
		tracing::info!(serial = %self.serial, jar = %jar, "pushing agent to device");

		bridge::run_adb_checked(&self.serial, &["push", &jar, DEVICE_JAR_PATH])
			.await
			.map(|_| ())
			.map_err(Error::AgentLaunchFailed)
	}

	async fn install_forward(&self, port: u16) -> Result<()> {
		// Stale forwards from a previous run would shadow the new one.
		bridge::run_adb_checked(&self.serial, &["forward", "--remove-all"])
			.await
			.map_err(Error::TunnelSetupFailed)?;

		let local = format!("tcp:{port}");
		bridge::run_adb_checked(&self.serial, &["forward", &local, AGENT_SOCKET])
			.await
			.map_err(Error::TunnelSetupFailed)?;

		tracing::info!(serial = %self.serial, port, "tunnel established");
		Ok(())
	}

	fn launch_args(&self) -> Vec<String> {
		let mut args = vec![
			"-s".to_string(),
			self.serial.clone(),
			"shell".to_string(),
			format!("CLASSPATH={DEVICE_JAR_PATH}"),
			"app_process".to_string(),
			"/".to_string(),
			AGENT_CLASS.to_string(),
			AGENT_VERSION.to_string(),
			"tunnel_forward=true".to_string(),
			"audio=false".to_string(),
			"control=false".to_string(),
			"cleanup=false".to_string(),
			"raw_stream=true".to_string(),
		];
		args.extend(self.config.to_agent_args());
		args
	}

	async fn launch_agent(&self) -> Result<Child> {
		let args = self.launch_args();
		tracing::info!(serial = %self.serial, "starting capture agent");

		let mut child = Command::new("adb")
			.args(&args)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.spawn()
			.map_err(|err| Error::AgentLaunchFailed(err.to_string()))?;

		// The agent must not block on a full pipe; its chatter goes to logs.
		let drain = spawn_output_drain(&self.serial, &mut child);

		tokio::time::sleep(STARTUP_DELAY).await;

		if let Ok(Some(status)) = child.try_wait() {
			drain.abort();
			return Err(Error::AgentLaunchFailed(format!(
				"agent exited during startup: {status}"
			)));
		}

		Ok(child)
	}

	async fn connect(&self, port: u16) -> Result<TcpStream> {
		for attempt in 0..CONNECT_ATTEMPTS {
			match TcpStream::connect(("127.0.0.1", port)).await {
				Ok(socket) => {
					tracing::info!(serial = %self.serial, port, "connected to agent");
					return Ok(socket);
				}
				Err(err) => {
					tracing::debug!(serial = %self.serial, port, attempt, %err, "agent not accepting yet");
					if attempt + 1 < CONNECT_ATTEMPTS {
						tokio::time::sleep(CONNECT_RETRY).await;
					}
				}
			}
		}
		Err(Error::ConnectTimeout)
	}

	async fn remove_forwards(&self) {
		if let Err(err) = bridge::run_adb_checked(&self.serial, &["forward", "--remove-all"]).await {
			tracing::debug!(serial = %self.serial, %err, "failed to remove forwards");
		}
	}
}

#[async_trait::async_trait]
impl MediaSource for AgentSource {
	async fn open(&self) -> Result<Box<dyn MediaStream>> {
		self.push_agent().await?;

		let port = free_port()?;

		if let Err(err) = self.install_forward(port).await {
			self.remove_forwards().await;
			return Err(err);
		}

		let mut agent = match self.launch_agent().await {
			Ok(agent) => agent,
			Err(err) => {
				self.remove_forwards().await;
				return Err(err);
			}
		};

		match self.connect(port).await {
			Ok(socket) => Ok(Box::new(AgentStream {
				serial: self.serial.clone(),
				socket: Some(socket),
				agent: Some(agent),
				stopped: false,
			})),
			Err(err) => {
				let _ = agent.start_kill();
				let _ = agent.wait().await;
				self.remove_forwards().await;
				Err(err)
			}
		}
	}
}

/// The live tunneled connection to a running agent.
pub struct AgentStream {
	serial: String,
	socket: Option<TcpStream>,
	agent: Option<Child>,
	stopped: bool,
}

#[async_trait::async_trait]
impl MediaStream for AgentStream {
	async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
		let socket = match self.socket.as_mut() {
			Some(socket) => socket,
			None => return Ok(None),
		};

		let mut buf = vec![0u8; READ_SIZE];
		let n = socket.read(&mut buf).await?;
		if n == 0 {
			tracing::info!(serial = %self.serial, "agent closed the stream");
			return Ok(None);
		}

		buf.truncate(n);
		Ok(Some(Bytes::from(buf)))
	}

	async fn stop(&mut self) {
		if self.stopped {
			return;
		}
		self.stopped = true;

		// Closing the socket asks the agent to exit on its own.
		self.socket.take();

		if let Some(mut agent) = self.agent.take() {
			if tokio::time::timeout(STOP_TIMEOUT, agent.wait()).await.is_err() {
				tracing::warn!(serial = %self.serial, "agent did not exit, killing");
				let _ = agent.start_kill();
				let _ = agent.wait().await;
			}
		}

		if let Err(err) = bridge::run_adb_checked(&self.serial, &["forward", "--remove-all"]).await {
			tracing::debug!(serial = %self.serial, %err, "failed to remove forwards");
		}

		tracing::info!(serial = %self.serial, "agent stopped");
	}
}

fn spawn_output_drain(serial: &str, child: &mut Child) -> JoinHandle<()> {
	let stdout = child.stdout.take();
	let stderr = child.stderr.take();
	let serial = serial.to_string();

	tokio::spawn(async move {
		let out = async {
			if let Some(stdout) = stdout {
				let mut lines = BufReader::new(stdout).lines();
				while let Ok(Some(line)) = lines.next_line().await {
					tracing::debug!(serial = %serial, agent = %line, "agent output");
				}
			}
		};
		let err = async {
			if let Some(stderr) = stderr {
				let mut lines = BufReader::new(stderr).lines();
				while let Ok(Some(line)) = lines.next_line().await {
					tracing::debug!(serial = %serial, agent = %line, "agent output");
				}
			}
		};
		tokio::join!(out, err);
	})
}

fn free_port() -> Result<u16> {
	let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
	Ok(listener.local_addr()?.port())
}
