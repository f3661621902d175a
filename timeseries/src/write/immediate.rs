use std::{borrow, fmt};

use bytes::BytesMut;
use tokio::{
	sync::{mpsc, watch},
	task::JoinHandle,
};

use super::{buffered, LineBuilder, LINE_PROTOCOL_BUFFER_LEN};

#[derive(Debug, Clone)]
pub struct Client {
	client: reqwest::Client,
	url: url::Url,
}

impl Client {
	pub(crate) fn new(client: reqwest::Client, url: url::Url) -> Self {
		Self { client, url }
	}

	pub async fn write<B: bytes::Buf>(&self, line_protocol: B) -> Result<(), WriteError>
	where
		B: Into<reqwest::Body>,
	{
		let response = match self
			.client
			.post(self.url.clone())
			.body(line_protocol)
			.send()
			.await
		{
			Ok(response) => response,
			Err(error) => {
				tracing::error!("error sending data to time-series store: {error:?}");
				return Err(WriteError::transient(error.to_string()));
			}
		};

		let status = response.status();
		if status == 204 {
			Ok(())
		} else if status.is_server_error() || status == 429 {
			let body = response.text().await.unwrap_or_default();
			tracing::error!("time-series store transient response ({status}): {body}");
			Err(WriteError::transient(body))
		} else {
			let body = response.text().await.unwrap_or_default();
			tracing::error!("time-series store rejected write ({status}): {body}");
			Err(WriteError::permanent(body))
		}
	}

	pub async fn write_with<F>(&self, f: F) -> Result<(), WriteError>
	where
		F: FnOnce(LineBuilder) -> LineBuilder,
	{
		let buf = BytesMut::with_capacity(LINE_PROTOCOL_BUFFER_LEN);
		let builder = LineBuilder::new_with(buf);
		let buf = f(builder).build().freeze();

		self.write(buf).await
	}

	/// Returns the name of the bucket data is written to.
	pub fn bucket(&self) -> borrow::Cow<'_, str> {
		let (_, bucket) = self
			.url
			.query_pairs()
			.find(|(key, _)| key == "bucket")
			.expect("bucket query parameter should be set");

		bucket
	}

	pub fn url(&self) -> &url::Url {
		&self.url
	}

	pub fn http_client(&self) -> &reqwest::Client {
		&self.client
	}

	/// Creates a buffered client with the default options.
	pub fn buffered(
		self,
		shutdown_signal: watch::Receiver<bool>,
	) -> (buffered::Client, JoinHandle<anyhow::Result<()>>) {
		self.buffered_with(shutdown_signal, Default::default())
	}

	pub fn buffered_with(
		self,
		shutdown_signal: watch::Receiver<bool>,
		options: buffered::Options,
	) -> (buffered::Client, JoinHandle<anyhow::Result<()>>) {
		let (tx, rx) = mpsc::channel(options.channel_len);

		let handle = tokio::spawn(buffered::buffered_write_task(
			self,
			rx,
			shutdown_signal,
			options,
		));
		let client = buffered::Client::new(tx);

		(client, handle)
	}
}

/// Whether a write failure should be retried (§7: StoreTransient) or
/// surfaced immediately (§7: StorePermanent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteErrorKind {
	Transient,
	Permanent,
}

#[derive(Debug, Clone)]
pub struct WriteError {
	pub kind: WriteErrorKind,
	pub detail: String,
}

impl WriteError {
	fn transient(detail: String) -> Self {
		Self {
			kind: WriteErrorKind::Transient,
			detail,
		}
	}

	fn permanent(detail: String) -> Self {
		Self {
			kind: WriteErrorKind::Permanent,
			detail,
		}
	}

	pub fn is_transient(&self) -> bool {
		self.kind == WriteErrorKind::Transient
	}
}

impl fmt::Display for WriteError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?}: {}", self.kind, self.detail)
	}
}

impl std::error::Error for WriteError {}
