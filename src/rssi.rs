use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{future, Stream, StreamExt};

use crate::platform::Platform;
use crate::Result;

pub type RssiStream = Pin<Box<dyn Stream<Item = i16> + Send>>;

/// Signal strength samples of one device, taken from an adapter scan.
///
/// This opens a scan of its own even when the adapter is already scanning for
/// someone else. Samples closer together than `sampling` are dropped.
pub(crate) async fn rssi_stream(
    platform: &Arc<dyn Platform>,
    identifier: String,
    sampling: Option<Duration>,
) -> Result<RssiStream> {
    log::debug!("Starting a scan for RSSI of {}", identifier);

    let advertisements = platform.scan_stream().await?;
    let mut last_sample: Option<Instant> = None;

    Ok(Box::pin(advertisements.filter_map(move |advertisement| {
        let sample = if advertisement.identifier != identifier {
            None
        } else {
            let now = Instant::now();
            let due = match (sampling, last_sample) {
                (Some(spacing), Some(last)) => now.duration_since(last) >= spacing,
                _ => true,
            };
            if due {
                last_sample = Some(now);
                Some(advertisement.rssi)
            } else {
                None
            }
        };

        future::ready(sample)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockPlatform;
    use tokio::time::timeout;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    async fn next(stream: &mut RssiStream) -> Option<i16> {
        timeout(Duration::from_millis(200), stream.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn only_this_device_is_sampled() {
        let platform = MockPlatform::new();
        let dyn_platform: Arc<dyn Platform> = platform.clone();
        let mut stream = rssi_stream(&dyn_platform, ADDRESS.to_string(), None)
            .await
            .unwrap();

        platform.advertise("11:22:33:44:55:66", -40);
        platform.advertise(ADDRESS, -61);
        platform.advertise(ADDRESS, -58);

        assert_eq!(next(&mut stream).await, Some(-61));
        assert_eq!(next(&mut stream).await, Some(-58));
        assert_eq!(platform.scans(), 1);
    }

    #[tokio::test]
    async fn sampling_hint_spaces_out_samples() {
        let platform = MockPlatform::new();
        let dyn_platform: Arc<dyn Platform> = platform.clone();
        let mut stream = rssi_stream(
            &dyn_platform,
            ADDRESS.to_string(),
            Some(Duration::from_secs(60)),
        )
        .await
        .unwrap();

        platform.advertise(ADDRESS, -70);
        platform.advertise(ADDRESS, -71);

        assert_eq!(next(&mut stream).await, Some(-70));
        assert_eq!(next(&mut stream).await, None);
    }

    #[tokio::test]
    async fn every_stream_opens_its_own_scan() {
        let platform = MockPlatform::new();
        let dyn_platform: Arc<dyn Platform> = platform.clone();

        let _first = rssi_stream(&dyn_platform, ADDRESS.to_string(), None).await.unwrap();
        let _second = rssi_stream(&dyn_platform, ADDRESS.to_string(), None).await.unwrap();

        assert_eq!(platform.scans(), 2);
    }
}
