//! Device-backed media acquisition through `cpal`.
//!
//! Only the default microphone is probed; there is no camera backend, so video
//! requests are answered with an audio-only source.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::media::{LocalMediaSource, MediaAcquirer, MediaConstraints};

#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceMediaAcquirer;

#[async_trait]
impl MediaAcquirer for DeviceMediaAcquirer {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaSource> {
        if !constraints.audio && !constraints.video {
            return Err(Error::MediaAccess("no media kinds requested".to_string()));
        }
        if constraints.video {
            warn!(
                target: "mesh.media",
                width = constraints.width.ideal,
                height = constraints.height.ideal,
                "No camera backend, continuing without video"
            );
        }
        if !constraints.audio {
            return Err(Error::MediaAccess("no camera device available".to_string()));
        }

        // Device enumeration can block on the audio server.
        let device = tokio::task::spawn_blocking(probe_microphone)
            .await
            .map_err(|e| Error::MediaAccess(format!("device probe aborted: {e}")))??;

        let source = LocalMediaSource::camera(
            format!("device-{:08x}", rand::random::<u32>()),
            true,
            false,
        );
        info!(target: "mesh.media", %device, source_id = source.id(), "Local media acquired");
        Ok(source)
    }
}

fn probe_microphone() -> Result<String> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::MediaAccess("no input device available".to_string()))?;
    let config = device
        .default_input_config()
        .map_err(|e| Error::MediaAccess(format!("input device unusable: {e}")))?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    debug!(
        target: "mesh.media",
        device = %name,
        sample_rate = config.sample_rate().0,
        channels = config.channels(),
        format = ?config.sample_format(),
        "Microphone available"
    );
    Ok(name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_nothing_requested_is_refused_without_probing() {
        let constraints = MediaConstraints {
            audio: false,
            video: false,
            ..MediaConstraints::default()
        };
        let err = DeviceMediaAcquirer.acquire(&constraints).await.unwrap_err();
        assert!(matches!(err, Error::MediaAccess(_)));
    }

    #[tokio::test]
    async fn test_video_only_is_unavailable() {
        let constraints = MediaConstraints {
            audio: false,
            ..MediaConstraints::default()
        };
        let err = DeviceMediaAcquirer.acquire(&constraints).await.unwrap_err();
        assert!(matches!(err, Error::MediaAccess(msg) if msg.contains("camera")));
    }
}
