use std::sync::Arc;

use crate::{
    config::Config,
    repositories::SessionStore,
    services::{PresenceBroadcaster, PresenceService, SocketAttachments},
};

#[derive(Clone)]
pub struct AppState {
    pub presence: PresenceService,
    pub attachments: SocketAttachments,
    pub config: Config,
}

impl AppState {
    pub fn new(store: Arc<dyn SessionStore>, config: Config) -> Self {
        let broadcaster = PresenceBroadcaster::new(config.presence_broadcast_capacity);
        Self {
            presence: PresenceService::new(store, broadcaster),
            attachments: SocketAttachments::new(),
            config,
        }
    }
}
