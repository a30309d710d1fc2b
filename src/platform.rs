use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, warn};

use crate::{
    error::{AppError, Outcome, Result},
    types::{Cart, Product, ProductVariant, StoreConfig, StoreSettings},
};

pub const CATALOG_LIMIT: usize = 20;

#[async_trait]
pub trait StorePlatform: Send + Sync {
    async fn store_settings(&self) -> Result<StoreSettings>;

    async fn products(&self, limit: usize) -> Result<Vec<Product>>;

    /// `Ok(None)` when the platform keeps no server-side cart for the visitor.
    async fn cart(&self, visitor_id: &str) -> Result<Option<Cart>>;
}

/// Picks the storefront integration for an authenticated store configuration.
pub trait PlatformFactory: Send + Sync {
    fn for_store(&self, config: &StoreConfig) -> Result<Arc<dyn StorePlatform>>;
}

/// Shop-scoped view over a platform. Outages degrade settings to defaults and
/// the catalog to an empty list; rejected credentials come back `Fatal`.
#[derive(Clone)]
pub struct StoreContextProvider {
    shop_id: i64,
    platform: Arc<dyn StorePlatform>,
}

impl StoreContextProvider {
    pub fn new(shop_id: i64, platform: Arc<dyn StorePlatform>) -> Self {
        Self { shop_id, platform }
    }

    pub fn platform(&self) -> Arc<dyn StorePlatform> {
        self.platform.clone()
    }

    pub async fn get_store_settings(&self) -> Outcome<StoreSettings> {
        let outcome = Outcome::or_degrade(self.platform.store_settings().await, StoreSettings::default);
        match &outcome {
            Outcome::Degraded { reason, .. } => {
                warn!(shop_id = self.shop_id, %reason, "store settings unavailable, using defaults")
            }
            Outcome::Fatal(err) => error!(shop_id = self.shop_id, error = %err, "store settings refused"),
            Outcome::Ok(_) => {}
        }
        outcome
    }

    pub async fn get_products(&self) -> Outcome<Vec<Product>> {
        let outcome = Outcome::or_degrade(self.platform.products(CATALOG_LIMIT).await, Vec::new);
        match &outcome {
            Outcome::Degraded { reason, .. } => {
                warn!(shop_id = self.shop_id, %reason, "product catalog unavailable")
            }
            Outcome::Fatal(err) => error!(shop_id = self.shop_id, error = %err, "product catalog refused"),
            Outcome::Ok(_) => {}
        }
        outcome
    }
}

pub struct DefaultPlatformFactory {
    client: reqwest::Client,
}

impl DefaultPlatformFactory {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl PlatformFactory for DefaultPlatformFactory {
    fn for_store(&self, config: &StoreConfig) -> Result<Arc<dyn StorePlatform>> {
        match config.platform.as_str() {
            "shopify" => Ok(Arc::new(ShopifyPlatform::new(self.client.clone(), config)?)),
            other => Err(AppError::unauthorized(format!("Unsupported platform: {other}"))),
        }
    }
}

pub struct ShopifyPlatform {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl ShopifyPlatform {
    pub fn new(client: reqwest::Client, config: &StoreConfig) -> Result<Self> {
        let store_name = config.credentials.store_name.trim();
        if store_name.is_empty() || config.credentials.access_token.trim().is_empty() {
            return Err(AppError::unauthorized(
                "Store configuration is missing platform credentials",
            ));
        }
        Ok(Self {
            client,
            base_url: format!("https://{store_name}/admin/api/2024-01"),
            access_token: config.credentials.access_token.clone(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .header("X-Shopify-Access-Token", &self.access_token)
            .query(query)
            .send()
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AppError::unauthorized(
                "Store platform credentials were rejected",
            ));
        }
        if !status.is_success() {
            return Err(AppError::upstream(format!(
                "shopify {path} returned {status}"
            )));
        }
        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl StorePlatform for ShopifyPlatform {
    async fn store_settings(&self) -> Result<StoreSettings> {
        let payload = self.get_json("/shop.json", &[]).await?;
        let shop = payload
            .get("shop")
            .ok_or_else(|| AppError::upstream("shopify /shop.json had no shop object"))?;
        Ok(normalize_store_settings(shop))
    }

    async fn products(&self, limit: usize) -> Result<Vec<Product>> {
        let payload = self
            .get_json("/products.json", &[("limit", limit.to_string())])
            .await?;
        Ok(payload
            .get("products")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(normalize_product).collect())
            .unwrap_or_default())
    }

    async fn cart(&self, _visitor_id: &str) -> Result<Option<Cart>> {
        // The Admin API has no cart endpoint; carts only exist client-side.
        Ok(None)
    }
}

fn text(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Shopify sends ids as numbers and prices as decimal strings.
fn id_text(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn price(value: &Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn normalize_store_settings(shop: &Value) -> StoreSettings {
    let defaults = StoreSettings::default();
    let or_default = |value: String, fallback: String| if value.is_empty() { fallback } else { value };
    StoreSettings {
        currency: or_default(text(shop, "currency"), defaults.currency),
        language: or_default(text(shop, "primary_locale"), defaults.language),
        name: or_default(text(shop, "name"), defaults.name),
        support_email: text(shop, "email"),
        custom_domain: shop
            .get("domain")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn normalize_product(product: &Value) -> Option<Product> {
    let variants: Vec<ProductVariant> = product
        .get("variants")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|variant| {
                    Some(ProductVariant {
                        id: id_text(variant)?,
                        title: text(variant, "title"),
                        price: price(variant, "price").unwrap_or(0.0),
                        sku: text(variant, "sku"),
                        available: variant
                            .get("available")
                            .and_then(Value::as_bool)
                            .unwrap_or(true),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let first_variant = product
        .get("variants")
        .and_then(Value::as_array)
        .and_then(|items| items.first());
    let tags = match product.get("tags") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(joined)) => joined
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };
    let handle = text(product, "handle");

    Some(Product {
        id: id_text(product)?,
        title: text(product, "title"),
        description: text(product, "body_html"),
        price: first_variant.and_then(|v| price(v, "price")).unwrap_or(0.0),
        compare_at_price: first_variant.and_then(|v| price(v, "compare_at_price")),
        tags,
        url: format!("/products/{handle}"),
        variants,
    })
}
