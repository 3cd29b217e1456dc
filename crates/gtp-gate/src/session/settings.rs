//! Per-session delivery settings.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use gtp_core::config::SessionConfig;

use super::{Event, Session};

pub type DataHandler = Arc<dyn Fn(&Session, Bytes) + Send + Sync>;
pub type EventHandler = Arc<dyn Fn(&Session, Event) + Send + Sync>;

/// How inbound data and events reach the application.
///
/// Handlers are called inline by the session loop. A channel size of 0
/// disables that channel; `recv_data`/`recv_event` then return `None`.
/// Watchers are independent of both.
#[derive(Clone, Default)]
pub struct SessionSettings {
    pub recv_data_channel_size: usize,
    pub recv_event_channel_size: usize,
    pub data_handler: Option<DataHandler>,
    pub event_handler: Option<EventHandler>,
}

impl SessionSettings {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            recv_data_channel_size: config.recv_data_channel_size,
            recv_event_channel_size: config.recv_event_channel_size,
            data_handler: None,
            event_handler: None,
        }
    }

    pub fn on_data(mut self, handler: impl Fn(&Session, Bytes) + Send + Sync + 'static) -> Self {
        self.data_handler = Some(Arc::new(handler));
        self
    }

    pub fn on_event(mut self, handler: impl Fn(&Session, Event) + Send + Sync + 'static) -> Self {
        self.event_handler = Some(Arc::new(handler));
        self
    }
}

impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSettings")
            .field("recv_data_channel_size", &self.recv_data_channel_size)
            .field("recv_event_channel_size", &self.recv_event_channel_size)
            .field("data_handler", &self.data_handler.is_some())
            .field("event_handler", &self.event_handler.is_some())
            .finish()
    }
}
