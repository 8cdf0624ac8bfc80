//! Send-side backpressure.

use std::time::Duration;

use futures::StreamExt;

use crate::session::SessionError;
use crate::transport::{ChannelEvent, ChannelState, DataChannel};

/// Suspend until `channel` has at most `low_water_mark` bytes buffered.
///
/// Returns immediately when already below the mark. Otherwise waits for the
/// channel's drain event, giving up after `timeout`. A timed-out send is not
/// retried.
pub async fn wait_for_drain(
    channel: &dyn DataChannel,
    low_water_mark: usize,
    timeout: Duration,
) -> Result<(), SessionError> {
    if channel.buffered_amount() <= low_water_mark {
        return Ok(());
    }

    channel.set_buffered_amount_low_threshold(low_water_mark);
    let mut events = channel.events();
    // Drained between the first check and subscribing.
    if channel.buffered_amount() <= low_water_mark {
        return Ok(());
    }

    let buffered = channel.buffered_amount();
    tracing::trace!(channel = channel.label(), buffered, low_water_mark, "waiting for channel to drain");

    let drained = async {
        while let Some(event) = events.next().await {
            match event {
                ChannelEvent::BufferedAmountLow => return Ok(()),
                ChannelEvent::Closed => break,
                ChannelEvent::Open => {}
            }
        }
        Err(SessionError::ChannelNotOpen(channel.label().to_string()))
    };

    tokio::select! {
        result = drained => result,
        _ = tokio::time::sleep(timeout) => {
            if channel.state() == ChannelState::Open && channel.buffered_amount() <= low_water_mark {
                return Ok(());
            }
            tracing::warn!(
                channel = channel.label(),
                buffered = channel.buffered_amount(),
                timeout_ms = timeout.as_millis() as u64,
                "channel did not drain in time, abandoning send"
            );
            Err(SessionError::BackpressureTimeout {
                channel: channel.label().to_string(),
                waited: timeout,
            })
        }
    }
}
