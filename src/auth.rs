use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    behavior::BehavioralEngine,
    completion::CompletionService,
    error::{AppError, Result},
    platform::{PlatformFactory, StoreContextProvider},
    store::{BehaviorLog, ConversationStore},
};

/// Credentials presented when the widget opens its socket.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    #[serde(default)]
    pub shop_id: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub visitor_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub shop_id: i64,
    pub platform: String,
    pub api_key: String,
}

impl Handshake {
    pub fn credentials(&self) -> Result<Credentials> {
        let present = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let (Some(shop_id), Some(platform), Some(api_key)) = (
            present(&self.shop_id),
            present(&self.platform),
            present(&self.api_key),
        ) else {
            return Err(AppError::unauthorized(
                "Authentication error - Missing required data",
            ));
        };
        let shop_id = shop_id
            .parse::<i64>()
            .map_err(|_| AppError::unauthorized("Authentication error - Invalid shop id"))?;
        Ok(Credentials {
            shop_id,
            platform,
            api_key,
        })
    }
}

/// Shop-scoped collaborators built once a connection is verified.
#[derive(Clone)]
pub struct ShopServices {
    pub shop_id: i64,
    pub platform: String,
    pub context: StoreContextProvider,
    pub engine: Arc<BehavioralEngine>,
}

pub struct ConnectionAuthenticator {
    store: Arc<dyn ConversationStore>,
    behavior_log: Arc<dyn BehaviorLog>,
    completion: Arc<dyn CompletionService>,
    platforms: Arc<dyn PlatformFactory>,
    api_key_prefix: String,
}

impl ConnectionAuthenticator {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        behavior_log: Arc<dyn BehaviorLog>,
        completion: Arc<dyn CompletionService>,
        platforms: Arc<dyn PlatformFactory>,
        api_key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            behavior_log,
            completion,
            platforms,
            api_key_prefix: api_key_prefix.into(),
        }
    }

    /// Succeeds only on an exact (shop, platform, key) match in the store configuration.
    pub async fn authenticate(&self, handshake: &Handshake) -> Result<ShopServices> {
        let credentials = handshake.credentials().inspect_err(|err| {
            warn!(
                has_shop_id = handshake.shop_id.is_some(),
                has_platform = handshake.platform.is_some(),
                has_api_key = handshake.api_key.is_some(),
                error = %err,
                "rejecting handshake"
            );
        })?;

        if !credentials.api_key.starts_with(&self.api_key_prefix) {
            warn!(shop_id = credentials.shop_id, "api key has the wrong format");
            return Err(AppError::unauthorized("Invalid API key format"));
        }

        let config = self
            .store
            .find_store_config(credentials.shop_id, &credentials.platform, &credentials.api_key)
            .await?
            .ok_or_else(|| {
                warn!(
                    shop_id = credentials.shop_id,
                    platform = %credentials.platform,
                    "no store configuration matches handshake"
                );
                AppError::unauthorized("Invalid store configuration or API key")
            })?;

        let platform = self.platforms.for_store(&config)?;
        let context = StoreContextProvider::new(config.shop_id, platform);
        let engine = Arc::new(BehavioralEngine::new(
            context.clone(),
            self.completion.clone(),
            self.behavior_log.clone(),
        ));

        info!(shop_id = config.shop_id, platform = %config.platform, "services initialized");
        Ok(ShopServices {
            shop_id: config.shop_id,
            platform: config.platform,
            context,
            engine,
        })
    }
}
