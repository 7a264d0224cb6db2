//! Pairing Offer Sources
//!
//! Whatever physically delivers a pairing offer (QR scanner, near-field
//! radio, vendor radio helper, a pipe from another process) is an
//! [`OfferSource`]. All of them produce the same [`DiscoveredOffer`], so the
//! handshake logic exists once.

use crate::manager::PairingHandle;
use crate::pairing::codec::{validate_channel, MAX_INPUT_LEN};
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::{debug, info, warn};

/// Sealed offer as delivered by a discovery transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredOffer {
    /// Sealed envelope JSON, not yet validated
    pub payload: String,

    /// Channel dictated by the discovery transport, overriding the offer
    pub channel: Option<u16>,

    /// Name of the source, for logging
    pub source: String,
}

impl DiscoveredOffer {
    pub fn new(payload: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            channel: None,
            source: source.into(),
        }
    }

    pub fn with_channel(mut self, channel: u16) -> Self {
        self.channel = Some(channel);
        self
    }
}

/// Producer of pairing offers
#[async_trait]
pub trait OfferSource: Send {
    /// Source name, for logging
    fn name(&self) -> &str;

    /// Wait for the next offer; `None` once the source is exhausted
    async fn next_offer(&mut self) -> Result<Option<DiscoveredOffer>>;
}

/// Reads one sealed envelope per line from an async reader
///
/// A line may be prefixed with a channel number and whitespace
/// (`"7 {...}"`) when the delivering transport assigns the channel.
/// Blank lines and lines starting with `#` are skipped. Lines that are not
/// UTF-8, exceed [`MAX_INPUT_LEN`] or carry an out-of-range channel are
/// dropped with a warning and reading continues.
pub struct LineOfferSource<R> {
    reader: R,
    name: String,
}

impl<R> LineOfferSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R, name: impl Into<String>) -> Self {
        Self {
            reader,
            name: name.into(),
        }
    }
}

#[async_trait]
impl<R> OfferSource for LineOfferSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_offer(&mut self) -> Result<Option<DiscoveredOffer>> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = (&mut self.reader)
                .take(MAX_INPUT_LEN as u64 + 1)
                .read_until(b'\n', &mut buf)
                .await
                .map_err(|e| ProtocolError::from_io_error(e, &format!("reading {}", self.name)))?;
            if read == 0 {
                return Ok(None);
            }

            if buf.len() > MAX_INPUT_LEN && buf.last() != Some(&b'\n') {
                warn!("Skipping line from {} longer than {} bytes", self.name, MAX_INPUT_LEN);
                self.skip_rest_of_line().await?;
                continue;
            }

            let Ok(line) = std::str::from_utf8(&buf) else {
                warn!("Skipping line from {} that is not UTF-8", self.name);
                continue;
            };
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            if let Some(offer) = parse_line(trimmed, &self.name) {
                return Ok(Some(offer));
            }
        }
    }
}

impl<R> LineOfferSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn skip_rest_of_line(&mut self) -> Result<()> {
        loop {
            let available = self
                .reader
                .fill_buf()
                .await
                .map_err(|e| ProtocolError::from_io_error(e, &format!("reading {}", self.name)))?;
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(end) => {
                    self.reader.consume(end + 1);
                    return Ok(());
                }
                None => {
                    let len = available.len();
                    self.reader.consume(len);
                }
            }
        }
    }
}

fn parse_line(line: &str, source: &str) -> Option<DiscoveredOffer> {
    if let Some((head, rest)) = line.split_once(char::is_whitespace) {
        if let Ok(channel) = head.parse::<i64>() {
            return match validate_channel(channel) {
                Ok(channel) => Some(DiscoveredOffer::new(rest.trim(), source).with_channel(channel)),
                Err(e) => {
                    warn!("Dropping offer from {}: {}", source, e);
                    None
                }
            };
        }
    }
    Some(DiscoveredOffer::new(line, source))
}

/// Forward every offer from `source` into the pairing manager
///
/// Returns the number of offers forwarded once the source is exhausted or
/// the manager stops.
pub async fn forward_offers<S: OfferSource>(mut source: S, handle: PairingHandle) -> Result<usize> {
    let mut forwarded = 0;

    loop {
        let offer = match source.next_offer().await {
            Ok(Some(offer)) => offer,
            Ok(None) => {
                info!("Offer source {} exhausted", source.name());
                return Ok(forwarded);
            }
            Err(e) => {
                warn!("Offer source {} failed: {}", source.name(), e);
                return Err(e);
            }
        };

        debug!("Forwarding offer from {}", offer.source);
        match handle.submit_offer(offer).await {
            Ok(()) => forwarded += 1,
            Err(ProtocolError::ManagerStopped) => return Ok(forwarded),
            Err(e) => return Err(e),
        }
    }
}
