//! Локальный медиапоток и его раздача.
//!
//! Контроллер хранит только локальное состояние; сигналинг и работу с
//! соединениями медиа-пиров делает оркестратор.

use crate::error::{CaptureError, PeerError};
use crate::peer::types::MediaStream;
use crate::utils::format_run_time;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

const VIDEO_FRAME_RATE: u32 = 30;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaMode {
    #[default]
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShareStatus {
    #[default]
    Stopped,
    Sending,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    AudioInput,
    AudioOutput,
    VideoInput,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub kind: DeviceKind,
    #[serde(default)]
    pub label: String,
}

/// Устройства, разложенные по видам
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceList {
    pub audio_input: Vec<DeviceInfo>,
    pub audio_output: Vec<DeviceInfo>,
    pub video_input: Vec<DeviceInfo>,
}

impl DeviceList {
    pub fn from_devices(devices: Vec<DeviceInfo>) -> Self {
        let mut list = DeviceList::default();
        for device in devices {
            match device.kind {
                DeviceKind::AudioInput => list.audio_input.push(device),
                DeviceKind::AudioOutput => list.audio_output.push(device),
                DeviceKind::VideoInput => list.video_input.push(device),
            }
        }
        list
    }

    /// Камера, следующая за `current`; неизвестная текущая считается первой
    pub fn next_video_device(&self, current: Option<&str>) -> Option<&DeviceInfo> {
        let devices = &self.video_input;
        if devices.is_empty() {
            return None;
        }
        let index = current
            .and_then(|id| devices.iter().position(|d| d.device_id == id))
            .unwrap_or(0);
        devices.get((index + 1) % devices.len())
    }
}

/// Запрос приложения на захват
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct MediaConstraints {
    pub media_mode: Option<MediaMode>,
    pub video_device_change: bool,
    pub aspect_ratio: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoConstraints {
    pub frame_rate: u32,
    pub device_id: Option<String>,
    pub aspect_ratio: Option<f64>,
}

/// Ограничения, с которыми вызывается устройство захвата
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConstraints {
    pub video: Option<VideoConstraints>,
    pub audio: bool,
}

impl CaptureConstraints {
    pub fn build(mode: MediaMode, device_id: Option<&str>, aspect_ratio: Option<f64>) -> Self {
        match mode {
            MediaMode::Audio => Self {
                video: None,
                audio: true,
            },
            MediaMode::Video => Self {
                video: Some(VideoConstraints {
                    frame_rate: VIDEO_FRAME_RATE,
                    device_id: device_id.map(str::to_string),
                    aspect_ratio,
                }),
                audio: true,
            },
        }
    }

    /// Форма getUserMedia: `{video: {...} | false, audio: true}`
    pub fn to_value(&self) -> Value {
        let video = match &self.video {
            None => Value::Bool(false),
            Some(v) => {
                let mut video = json!({ "frameRate": v.frame_rate });
                if let Some(id) = &v.device_id {
                    video["deviceId"] = json!({ "exact": id });
                }
                if let Some(ratio) = v.aspect_ratio {
                    video["aspectRatio"] = json!(ratio);
                }
                video
            }
        };
        json!({ "video": video, "audio": self.audio })
    }
}

/// Устройство захвата медиа (внешняя возможность)
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, CaptureError>;

    async fn capture(&self, constraints: &CaptureConstraints) -> Result<MediaStream, CaptureError>;

    async fn release(&self, stream: &MediaStream);
}

#[derive(Debug, Clone, Default)]
pub struct LocalMediaState {
    pub stream: Option<MediaStream>,
    pub status: ShareStatus,
    pub muted: bool,
    pub mode: MediaMode,
    pub room: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub video_device_id: Option<String>,
    pub devices: Option<DeviceList>,
}

impl LocalMediaState {
    pub fn is_sending(&self) -> bool {
        self.status == ShareStatus::Sending
    }

    /// Время раздачи в формате `HH:MM:SS`
    pub fn run_time(&self, now: DateTime<Utc>) -> String {
        match self.started_at {
            Some(start) => format_run_time(now - start),
            None => format_run_time(chrono::Duration::zero()),
        }
    }
}

pub struct MediaShareController {
    capture: Arc<dyn MediaCapture>,
    state: Mutex<LocalMediaState>,
}

impl MediaShareController {
    pub fn new(capture: Arc<dyn MediaCapture>) -> Self {
        Self {
            capture,
            state: Mutex::new(LocalMediaState::default()),
        }
    }

    pub fn snapshot(&self) -> LocalMediaState {
        self.state.lock().clone()
    }

    pub fn stream(&self) -> Option<MediaStream> {
        self.state.lock().stream.clone()
    }

    pub fn is_sending(&self) -> bool {
        self.state.lock().is_sending()
    }

    pub fn is_muted(&self) -> bool {
        self.state.lock().muted
    }

    /// Переход в Sending; возвращает поток, который надо раздавать
    pub fn begin_share(&self, room: &str) -> Result<MediaStream, PeerError> {
        let mut state = self.state.lock();
        let stream = state.stream.clone().ok_or(PeerError::MissingStream)?;
        if room.is_empty() {
            return Err(PeerError::MissingRoom);
        }
        state.status = ShareStatus::Sending;
        state.room = Some(room.to_string());
        state.started_at = Some(Utc::now());
        info!(room, stream = %stream.id, "Media share started");
        Ok(stream)
    }

    /// Переход в Stopped; true, если раздача шла
    pub fn end_share(&self) -> bool {
        let mut state = self.state.lock();
        let was_sending = state.is_sending();
        state.status = ShareStatus::Stopped;
        state.muted = false;
        state.started_at = None;
        state.room = None;
        was_sending
    }

    /// Возвращает поток, если флаг изменился: его треки надо снять или вернуть
    pub fn set_mute(&self, muted: bool) -> Option<MediaStream> {
        let mut state = self.state.lock();
        if state.muted == muted {
            return None;
        }
        state.muted = muted;
        state.stream.clone()
    }

    /// Собирает ограничения захвата; устройства перечисляются при первом вызове
    pub async fn resolve_constraints(&self, request: &MediaConstraints) -> CaptureConstraints {
        let need_devices = self.state.lock().devices.is_none();
        if need_devices {
            match self.capture.enumerate_devices().await {
                Ok(devices) => {
                    let list = DeviceList::from_devices(devices);
                    debug!(
                        "Devices: {} audio in, {} audio out, {} video in",
                        list.audio_input.len(),
                        list.audio_output.len(),
                        list.video_input.len()
                    );
                    self.state.lock().devices = Some(list);
                }
                Err(e) => warn!("Device enumeration failed: {e}"),
            }
        }

        let mut state = self.state.lock();
        if let Some(mode) = request.media_mode {
            state.mode = mode;
        }
        if request.video_device_change {
            let next = state.devices.as_ref().and_then(|d| {
                d.next_video_device(state.video_device_id.as_deref())
                    .map(|dev| dev.device_id.clone())
            });
            if let Some(id) = next {
                debug!("Switching video device to {id}");
                state.video_device_id = Some(id);
            }
        }
        CaptureConstraints::build(
            state.mode,
            state.video_device_id.as_deref(),
            request.aspect_ratio,
        )
    }

    pub async fn capture(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<MediaStream, CaptureError> {
        let stream = self.capture.capture(constraints).await?;
        self.state.lock().stream = Some(stream.clone());
        Ok(stream)
    }

    /// Освобождает текущий поток, если он был
    pub async fn release_stream(&self) {
        let stream = self.state.lock().stream.take();
        if let Some(stream) = stream {
            self.capture.release(&stream).await;
        }
    }
}
