//! Self-echo handling for half-duplex lines
//!
//! Some RS485 adapters read back everything they send. The transport probes
//! for this once at startup and, if the line echoes, remembers every sent
//! telegram so its echo can be swallowed instead of delivered.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{BusError, Result};
use crate::message::{hex_string, Esp2Message, TELEGRAM_LEN};

/// Probe written during calibration; contains no preamble
pub const ECHO_PROBE: [u8; 8] = [0x00, 0xFF, 0x55, 0xAA, 0x0F, 0xF0, 0x33, 0xCC];

/// Telegrams sent on an echoing line whose echo has not been seen yet
#[derive(Debug)]
pub struct EchoFilter {
    grace: Duration,
    sent: VecDeque<(Instant, [u8; TELEGRAM_LEN])>,
}

impl EchoFilter {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            sent: VecDeque::new(),
        }
    }

    /// Remember a telegram right before it is written
    pub fn record(&mut self, frame: [u8; TELEGRAM_LEN]) {
        self.sent.push_back((Instant::now(), frame));
    }

    /// Whether `message` is the echo of something we sent
    ///
    /// A match consumes that entry together with all older ones, whose echo
    /// evidently got lost.
    pub fn suppress(&mut self, message: &Esp2Message) -> bool {
        self.expire(Instant::now());

        let frame = message.serialize();
        let Some(index) = self.sent.iter().position(|(_, sent)| *sent == frame) else {
            return false;
        };

        if index > 0 {
            debug!(lost = index, "Echo of earlier telegrams never arrived");
        }
        self.sent.drain(..=index);
        true
    }

    /// Entries still waiting for their echo
    pub fn pending(&self) -> usize {
        self.sent.len()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((sent_at, frame)) = self.sent.front() {
            if now.duration_since(*sent_at) <= self.grace {
                break;
            }
            // most likely collided on the bus and never registered
            warn!(hex_data = %hex_string(frame), "No echo seen for sent telegram, dropping it");
            self.sent.pop_front();
        }
    }
}

/// Probe whether the line echoes what we write
///
/// Returns `true` when the probe comes back verbatim and `false` when nothing
/// comes back at all. Partial answers are retried up to `attempts` times.
pub async fn detect_echo<R, W>(
    reader: &mut R,
    writer: &mut W,
    timeout: Duration,
    attempts: u32,
) -> Result<bool>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    for attempt in 1..=attempts {
        writer.write_all(&ECHO_PROBE).await?;
        writer.flush().await?;

        let answer = read_probe_answer(reader, timeout).await?;
        if answer[..] == ECHO_PROBE[..] {
            info!("Echo calibration: line echoes, suppression enabled");
            return Ok(true);
        }
        if answer.is_empty() {
            info!("Echo calibration: no echo, suppression disabled");
            return Ok(false);
        }

        warn!(
            attempt,
            attempts,
            received = %hex_string(&answer),
            "Ambiguous echo calibration answer, retrying"
        );
    }

    Err(BusError::EchoCalibration(format!(
        "no clear answer to the echo probe after {attempts} attempts"
    )))
}

/// Read up to one probe length of bytes until `timeout` elapses
async fn read_probe_answer<R>(reader: &mut R, timeout: Duration) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let deadline = Instant::now() + timeout;
    let mut answer = Vec::with_capacity(ECHO_PROBE.len());
    let mut chunk = [0u8; ECHO_PROBE.len()];

    while answer.len() < ECHO_PROBE.len() {
        let wanted = ECHO_PROBE.len() - answer.len();
        match tokio::time::timeout_at(deadline, reader.read(&mut chunk[..wanted])).await {
            Err(_) => break,
            Ok(Ok(0)) => {
                return Err(BusError::connection("line closed during echo calibration"));
            },
            Ok(Ok(n)) => answer.extend_from_slice(&chunk[..n]),
            Ok(Err(err)) => return Err(err.into()),
        }
    }

    Ok(answer)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::message::{EltakoDiscoveryRequest, EltakoPoll, Message};

    // ========================================================================
    // Filter
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_suppress_exact_match() {
        let mut filter = EchoFilter::new(Duration::from_secs(3));
        let sent = EltakoPoll { address: 1 }.to_esp2();
        filter.record(sent.serialize());

        let other = EltakoPoll { address: 2 }.to_esp2();
        assert!(!filter.suppress(&other));
        assert!(filter.suppress(&sent));
        assert_eq!(filter.pending(), 0);
        // only once
        assert!(!filter.suppress(&sent));
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_discards_older_entries() {
        let mut filter = EchoFilter::new(Duration::from_secs(3));
        for address in 1..=3 {
            filter.record(EltakoPoll { address }.serialize());
        }

        assert!(filter.suppress(&EltakoPoll { address: 2 }.to_esp2()));
        assert_eq!(filter.pending(), 1);
        assert!(!filter.suppress(&EltakoPoll { address: 1 }.to_esp2()));
        assert!(filter.suppress(&EltakoPoll { address: 3 }.to_esp2()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entries_expire() {
        let mut filter = EchoFilter::new(Duration::from_secs(3));
        let sent = EltakoDiscoveryRequest { address: 4 }.to_esp2();
        filter.record(sent.serialize());

        tokio::time::advance(Duration::from_millis(3001)).await;
        assert!(!filter.suppress(&sent));
        assert_eq!(filter.pending(), 0);
    }

    // ========================================================================
    // Calibration
    // ========================================================================

    #[tokio::test]
    async fn test_detect_echoing_line() {
        let (mut ours, mut line) = tokio::io::duplex(64);
        let echo = tokio::spawn(async move {
            let mut probe = [0u8; ECHO_PROBE.len()];
            line.read_exact(&mut probe).await.unwrap();
            line.write_all(&probe).await.unwrap();
            line
        });

        let (mut reader, mut writer) = tokio::io::split(&mut ours);
        let echoes = detect_echo(&mut reader, &mut writer, Duration::from_millis(500), 3)
            .await
            .unwrap();
        assert!(echoes);
        echo.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_detect_quiet_line() {
        let (mut ours, _line) = tokio::io::duplex(64);
        let (mut reader, mut writer) = tokio::io::split(&mut ours);
        let echoes = detect_echo(&mut reader, &mut writer, Duration::from_millis(200), 3)
            .await
            .unwrap();
        assert!(!echoes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detect_gives_up_on_partial_answers() {
        let (mut ours, mut line) = tokio::io::duplex(256);
        let garbler = tokio::spawn(async move {
            for _ in 0..3 {
                let mut probe = [0u8; ECHO_PROBE.len()];
                line.read_exact(&mut probe).await.unwrap();
                line.write_all(&probe[..3]).await.unwrap();
            }
            line
        });

        let (mut reader, mut writer) = tokio::io::split(&mut ours);
        let result = detect_echo(&mut reader, &mut writer, Duration::from_millis(200), 3).await;
        assert!(matches!(result, Err(BusError::EchoCalibration(_))));
        garbler.await.unwrap();
    }
}
