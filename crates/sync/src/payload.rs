//! Per-marketplace listing shapes.
//!
//! Each marketplace wants a different document for the same canonical draft.
//! Translation is a black box per platform: the only shared input is the
//! [`CategoryMap`] from canonical category paths to platform categories.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use forgelist_catalog::ListingDraft;
use forgelist_core::{Platform, Price};

use crate::adapter::{AdapterFailure, FailureReason};

const EBAY_TITLE_MAX: usize = 80;
const EBAY_PICTURES_MAX: usize = 24;
const ETSY_TITLE_MAX: usize = 140;
const ETSY_IMAGES_MAX: usize = 10;
const ETSY_TAGS_MAX: usize = 13;
const ETSY_TAG_LEN_MAX: usize = 20;
const POSHMARK_TITLE_MAX: usize = 80;
const POSHMARK_PHOTOS_MAX: usize = 16;

/// Canonical category path → platform category identifier.
///
/// Lookups fall back to parent paths: `cameras/compact` resolves through
/// `cameras` when only the parent is mapped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryMap {
    entries: HashMap<String, String>,
}

impl CategoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, canonical: impl Into<String>, platform: impl Into<String>) -> Self {
        self.entries.insert(canonical.into(), platform.into());
        self
    }

    pub fn resolve(&self, canonical: &str) -> Option<&str> {
        let mut path = canonical.trim_matches('/');
        loop {
            if let Some(found) = self.entries.get(path) {
                return Some(found.as_str());
            }
            match path.rfind('/') {
                Some(idx) => path = &path[..idx],
                None => return None,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EbayListing {
    pub sku: String,
    pub title: String,
    pub category_id: String,
    pub price: Price,
    pub quantity: u32,
    pub picture_urls: Vec<String>,
    pub item_specifics: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtsyListing {
    pub sku: String,
    pub title: String,
    pub taxonomy_id: u64,
    pub price: Price,
    pub quantity: u32,
    pub image_urls: Vec<String>,
    pub tags: Vec<String>,
    pub who_made: String,
    pub is_supply: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopifyVariant {
    pub sku: String,
    pub price: Price,
    pub inventory_quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopifyProduct {
    pub title: String,
    pub vendor: String,
    pub product_type: String,
    pub images: Vec<String>,
    pub variants: Vec<ShopifyVariant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoshmarkListing {
    pub sku: String,
    pub title: String,
    pub brand: String,
    pub category_path: Vec<String>,
    pub price: Price,
    pub quantity: u32,
    pub photos: Vec<String>,
}

/// A listing document in the shape its marketplace expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "platform", rename_all = "snake_case")]
pub enum PlatformListing {
    Ebay(EbayListing),
    Etsy(EtsyListing),
    Shopify(ShopifyProduct),
    Poshmark(PoshmarkListing),
}

impl PlatformListing {
    /// Build the platform document for `draft`.
    ///
    /// Failures are permanent: an unmapped category or an unlistable draft
    /// will not get better by retrying.
    pub fn translate(
        platform: Platform,
        draft: &ListingDraft,
        categories: &CategoryMap,
    ) -> Result<Self, AdapterFailure> {
        if draft.price.is_zero() {
            return Err(AdapterFailure::new(
                FailureReason::Validation,
                format!("{}: price must be positive", draft.sku),
            ));
        }
        let category = categories.resolve(&draft.category).ok_or_else(|| {
            AdapterFailure::new(
                FailureReason::CategoryMismatch,
                format!("no {platform} category for `{}`", draft.category),
            )
        })?;

        let listing = match platform {
            Platform::Ebay => PlatformListing::Ebay(EbayListing {
                sku: draft.sku.clone(),
                title: truncate_chars(&draft.title, EBAY_TITLE_MAX),
                category_id: category.to_string(),
                price: draft.price,
                quantity: draft.quantity,
                picture_urls: draft.media.iter().take(EBAY_PICTURES_MAX).cloned().collect(),
                item_specifics: vec![
                    ("Brand".to_string(), draft.brand.clone()),
                    ("Model".to_string(), draft.model.clone()),
                ],
            }),
            Platform::Etsy => {
                let taxonomy_id = category.parse::<u64>().map_err(|_| {
                    AdapterFailure::new(
                        FailureReason::CategoryMismatch,
                        format!("etsy taxonomy id must be numeric, got `{category}`"),
                    )
                })?;
                PlatformListing::Etsy(EtsyListing {
                    sku: draft.sku.clone(),
                    title: truncate_chars(&draft.title, ETSY_TITLE_MAX),
                    taxonomy_id,
                    price: draft.price,
                    quantity: draft.quantity,
                    image_urls: draft.media.iter().take(ETSY_IMAGES_MAX).cloned().collect(),
                    tags: etsy_tags(draft),
                    who_made: "someone_else".to_string(),
                    is_supply: false,
                })
            }
            Platform::Shopify => PlatformListing::Shopify(ShopifyProduct {
                title: draft.title.clone(),
                vendor: draft.brand.clone(),
                product_type: category.to_string(),
                images: draft.media.clone(),
                variants: vec![ShopifyVariant {
                    sku: draft.sku.clone(),
                    price: draft.price,
                    inventory_quantity: draft.quantity,
                }],
            }),
            Platform::Poshmark => {
                if draft.media.is_empty() {
                    return Err(AdapterFailure::new(
                        FailureReason::Validation,
                        format!("{}: poshmark requires at least one photo", draft.sku),
                    ));
                }
                PlatformListing::Poshmark(PoshmarkListing {
                    sku: draft.sku.clone(),
                    title: truncate_chars(&draft.title, POSHMARK_TITLE_MAX),
                    brand: draft.brand.clone(),
                    category_path: category.split('/').map(str::to_string).collect(),
                    price: draft.price,
                    quantity: draft.quantity,
                    photos: draft.media.iter().take(POSHMARK_PHOTOS_MAX).cloned().collect(),
                })
            }
        };
        Ok(listing)
    }

    pub fn platform(&self) -> Platform {
        match self {
            PlatformListing::Ebay(_) => Platform::Ebay,
            PlatformListing::Etsy(_) => Platform::Etsy,
            PlatformListing::Shopify(_) => Platform::Shopify,
            PlatformListing::Poshmark(_) => Platform::Poshmark,
        }
    }

    pub fn sku(&self) -> &str {
        match self {
            PlatformListing::Ebay(l) => &l.sku,
            PlatformListing::Etsy(l) => &l.sku,
            PlatformListing::Shopify(p) => p.variants.first().map_or("", |v| v.sku.as_str()),
            PlatformListing::Poshmark(l) => &l.sku,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            PlatformListing::Ebay(l) => &l.title,
            PlatformListing::Etsy(l) => &l.title,
            PlatformListing::Shopify(p) => &p.title,
            PlatformListing::Poshmark(l) => &l.title,
        }
    }
}

fn truncate_chars(value: &str, max: usize) -> String {
    value.trim().chars().take(max).collect()
}

fn etsy_tags(draft: &ListingDraft) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for candidate in [draft.brand.as_str(), draft.model.as_str()]
        .into_iter()
        .chain(draft.category.split('/'))
    {
        let tag = truncate_chars(&candidate.to_lowercase(), ETSY_TAG_LEN_MAX);
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags.truncate(ETSY_TAGS_MAX);
    tags
}
