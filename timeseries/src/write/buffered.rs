use super::{immediate, LineBuilder, Status, LINE_PROTOCOL_BUFFER_LEN};
use bytes::{Bytes, BytesMut};
use core::fmt;
use std::{collections::VecDeque, time::Duration};
use tokio::{
	sync::{mpsc, watch},
	time::interval,
};

const DEFAULT_LINE_LIMIT: usize = 5000;

#[derive(Clone, Debug)]
pub struct Client {
	channel: mpsc::Sender<(Bytes, watch::Sender<Status>)>,
}

#[derive(Debug)]
pub struct Options {
	pub channel_len: usize,
	pub max_timeout: Duration,
	pub max_lines: usize,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			channel_len: 64,
			max_timeout: Duration::from_secs(30),
			max_lines: DEFAULT_LINE_LIMIT,
		}
	}
}

#[derive(Debug)]
pub struct BufferedWriteError;

impl fmt::Display for BufferedWriteError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{self:?}")
	}
}

impl std::error::Error for BufferedWriteError {}

impl Client {
	pub(crate) fn new(channel: mpsc::Sender<(Bytes, watch::Sender<Status>)>) -> Self {
		Self { channel }
	}

	pub async fn write_with<F>(&self, f: F) -> Result<watch::Receiver<Status>, BufferedWriteError>
	where
		F: FnOnce(LineBuilder) -> LineBuilder,
	{
		let buf = BytesMut::with_capacity(LINE_PROTOCOL_BUFFER_LEN);
		let builder = LineBuilder::new_with(buf);
		let buf = f(builder).build().freeze();

		let (tx, rx) = watch::channel(Status::Init);
		self.channel
			.send((buf, tx))
			.await
			.map_err(|_| BufferedWriteError)?;

		Ok(rx)
	}

	/// Appends a pre-built batch of line-protocol lines atomically: either
	/// all lines land in the same flush, or none do (spec.md §4.2 "fails
	/// atomically per batch").
	pub async fn write_batch(&self, lines: Bytes) -> Result<watch::Receiver<Status>, BufferedWriteError> {
		let (tx, rx) = watch::channel(Status::Init);
		self.channel
			.send((lines, tx))
			.await
			.map_err(|_| BufferedWriteError)?;
		Ok(rx)
	}
}

impl Drop for Client {
	fn drop(&mut self) {
		self.channel.downgrade();
	}
}

pub async fn buffered_write_task(
	client: immediate::Client,
	mut channel: mpsc::Receiver<(Bytes, watch::Sender<Status>)>,
	mut shutdown_signal: watch::Receiver<bool>,
	options: Options,
) -> anyhow::Result<()> {
	let mut shutdown = false;

	let mut lines = 0;
	let mut buffers = VecDeque::new();

	let mut flush_interval = interval(options.max_timeout);

	while !shutdown {
		let flush = tokio::select! {
			biased;

			_ = shutdown_signal.changed() => {
				tracing::debug!("shutdown requested, flushing remaining buffers");
				shutdown = true;
				true
			}

			message = channel.recv() => {
				match message {
					Some((buffer, status)) => {
						// Calculate how many lines we've received.
						let new_lines = buffer.iter().filter(|&&x| x == b'\n').count();
						lines += new_lines;

						let len = buffer.len();
						status.send_replace(Status::Buffered);
						buffers.push_back((buffer, status));

						tracing::trace!(
							"buffering {new_lines} lines, {len} bytes of line-protocol; {} entries in buffers, {lines} lines",
							buffers.len()
						);

						// Flush the buffers immediately if we've already reached the limit.
						lines >= options.max_lines
					}
					None => {
						tracing::debug!("channel closed, shutting down task");
						shutdown = true;
						true
					}
				}
			}
			_ = flush_interval.tick() => {
				!buffers.is_empty()
			}
		};

		if flush {
			tracing::debug!("will send buffered line-protocol to time-series store");

			let mut in_progress = VecDeque::new();
			let mut body_buffer = BytesMut::new();
			let mut total_lines = 0;

			while let Some((buffer, status)) = buffers.pop_front() {
				let new_lines = buffer.iter().filter(|&&x| x == b'\n').count();
				total_lines += new_lines;

				body_buffer.extend_from_slice(&buffer);
				in_progress.push_back((buffer, status));
				if total_lines >= options.max_lines {
					break;
				}
			}

			if body_buffer.is_empty() {
				continue;
			}

			match with_retry(&client, body_buffer.freeze()).await {
				Ok(_) => {
					tracing::debug!(
						"wrote {} lines to bucket '{}'",
						total_lines,
						client.bucket()
					);
					lines -= total_lines;
					for (_, status) in in_progress {
						status.send_replace(Status::Accepted);
					}
				}
				Err(error) => {
					tracing::error!("error submitting line protocol: {error}");
					for value in in_progress {
						buffers.push_front(value);
					}
				}
			}
		}
	}

	tracing::debug!(
		"buffered client task for bucket '{}' stopped",
		client.bucket()
	);

	Ok(())
}

/// Retries a transient write failure up to 3 times with jittered backoff
/// (200ms -> 2s), per spec.md §4.7/§7. Permanent failures are not retried.
async fn with_retry(client: &immediate::Client, body: Bytes) -> Result<(), immediate::WriteError> {
	const MAX_ATTEMPTS: u32 = 3;
	let mut delay = Duration::from_millis(200);

	for attempt in 1..=MAX_ATTEMPTS {
		match client.write(body.clone()).await {
			Ok(()) => return Ok(()),
			Err(error) if error.is_transient() && attempt < MAX_ATTEMPTS => {
				tracing::warn!(attempt, "transient write error, retrying: {error}");
				tokio::time::sleep(delay).await;
				delay = (delay * 2).min(Duration::from_secs(2));
			}
			Err(error) => return Err(error),
		}
	}

	unreachable!("loop always returns on the final attempt")
}
