use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgelist_core::{Aggregate, AggregateRoot, DomainError, Platform, Price, ProductId};
use forgelist_events::Event;

/// Canonical product lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductStatus {
    Draft,
    Active,
    Sold,
    Ended,
}

impl ProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductStatus::Draft => "draft",
            ProductStatus::Active => "active",
            ProductStatus::Sold => "sold",
            ProductStatus::Ended => "ended",
        }
    }
}

/// The marketplace-independent subset of a product needed to create a listing.
///
/// Carried inside `ListingRequested` so the listing reflects the product as it
/// was when the listing was requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingDraft {
    pub sku: String,
    pub title: String,
    pub brand: String,
    pub model: String,
    pub category: String,
    pub media: Vec<String>,
    pub price: Price,
    pub quantity: u32,
}

/// Aggregate root: Product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    id: ProductId,
    sku: String,
    title: String,
    brand: String,
    model: String,
    category: String,
    media: Vec<String>,
    price: Price,
    stock: u32,
    status: ProductStatus,
    sold_on: Option<Platform>,
    version: u64,
    created: bool,
}

impl Product {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: ProductId) -> Self {
        Self {
            id,
            sku: String::new(),
            title: String::new(),
            brand: String::new(),
            model: String::new(),
            category: String::new(),
            media: Vec::new(),
            price: Price::from_minor(0),
            stock: 0,
            status: ProductStatus::Draft,
            sold_on: None,
            version: 0,
            created: false,
        }
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn sku(&self) -> &str {
        &self.sku
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn brand(&self) -> &str {
        &self.brand
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn media(&self) -> &[String] {
        &self.media
    }

    pub fn price(&self) -> Price {
        self.price
    }

    pub fn stock(&self) -> u32 {
        self.stock
    }

    pub fn status(&self) -> ProductStatus {
        self.status
    }

    pub fn sold_on(&self) -> Option<Platform> {
        self.sold_on
    }

    pub fn listing_draft(&self) -> ListingDraft {
        ListingDraft {
            sku: self.sku.clone(),
            title: self.title.clone(),
            brand: self.brand.clone(),
            model: self.model.clone(),
            category: self.category.clone(),
            media: self.media.clone(),
            price: self.price,
            quantity: self.stock,
        }
    }
}

impl AggregateRoot for Product {
    type Id = ProductId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateProduct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateProduct {
    pub product_id: ProductId,
    pub sku: String,
    pub title: String,
    pub brand: String,
    pub model: String,
    pub category: String,
    pub media: Vec<String>,
    pub price: Price,
    pub stock: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ProductCommand {
    CreateProduct(CreateProduct),
    ActivateProduct {
        occurred_at: DateTime<Utc>,
    },
    /// Ask for the product to be listed on a marketplace.
    RequestListing {
        platform: Platform,
        occurred_at: DateTime<Utc>,
    },
    ChangePrice {
        price: Price,
        occurred_at: DateTime<Utc>,
    },
    AdjustStock {
        delta: i64,
        occurred_at: DateTime<Utc>,
    },
    /// `sold_on` is `None` for sales made outside any marketplace.
    MarkSold {
        sold_on: Option<Platform>,
        occurred_at: DateTime<Utc>,
    },
    ReattributeSale {
        platform: Platform,
        occurred_at: DateTime<Utc>,
    },
    EndProduct {
        occurred_at: DateTime<Utc>,
    },
    RelistProduct {
        occurred_at: DateTime<Utc>,
    },
}

/// Event: ProductCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductCreated {
    pub product_id: ProductId,
    pub sku: String,
    pub title: String,
    pub brand: String,
    pub model: String,
    pub category: String,
    pub media: Vec<String>,
    pub price: Price,
    pub stock: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProductEvent {
    ProductCreated(ProductCreated),
    ProductActivated {
        product_id: ProductId,
        occurred_at: DateTime<Utc>,
    },
    ListingRequested {
        product_id: ProductId,
        platform: Platform,
        draft: ListingDraft,
        occurred_at: DateTime<Utc>,
    },
    PriceChanged {
        product_id: ProductId,
        previous: Price,
        price: Price,
        occurred_at: DateTime<Utc>,
    },
    StockAdjusted {
        product_id: ProductId,
        delta: i64,
        stock: u32,
        occurred_at: DateTime<Utc>,
    },
    ProductSold {
        product_id: ProductId,
        sold_on: Option<Platform>,
        occurred_at: DateTime<Utc>,
    },
    SaleReattributed {
        product_id: ProductId,
        previous: Option<Platform>,
        platform: Platform,
        occurred_at: DateTime<Utc>,
    },
    ProductEnded {
        product_id: ProductId,
        occurred_at: DateTime<Utc>,
    },
    ProductRelisted {
        product_id: ProductId,
        occurred_at: DateTime<Utc>,
    },
}

impl ProductEvent {
    pub fn product_id(&self) -> ProductId {
        match self {
            ProductEvent::ProductCreated(e) => e.product_id,
            ProductEvent::ProductActivated { product_id, .. }
            | ProductEvent::ListingRequested { product_id, .. }
            | ProductEvent::PriceChanged { product_id, .. }
            | ProductEvent::StockAdjusted { product_id, .. }
            | ProductEvent::ProductSold { product_id, .. }
            | ProductEvent::SaleReattributed { product_id, .. }
            | ProductEvent::ProductEnded { product_id, .. }
            | ProductEvent::ProductRelisted { product_id, .. } => *product_id,
        }
    }
}

impl Event for ProductEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ProductEvent::ProductCreated(_) => "catalog.product.created",
            ProductEvent::ProductActivated { .. } => "catalog.product.activated",
            ProductEvent::ListingRequested { .. } => "catalog.product.listing_requested",
            ProductEvent::PriceChanged { .. } => "catalog.product.price_changed",
            ProductEvent::StockAdjusted { .. } => "catalog.product.stock_adjusted",
            ProductEvent::ProductSold { .. } => "catalog.product.sold",
            ProductEvent::SaleReattributed { .. } => "catalog.product.sale_reattributed",
            ProductEvent::ProductEnded { .. } => "catalog.product.ended",
            ProductEvent::ProductRelisted { .. } => "catalog.product.relisted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ProductEvent::ProductCreated(e) => e.occurred_at,
            ProductEvent::ProductActivated { occurred_at, .. }
            | ProductEvent::ListingRequested { occurred_at, .. }
            | ProductEvent::PriceChanged { occurred_at, .. }
            | ProductEvent::StockAdjusted { occurred_at, .. }
            | ProductEvent::ProductSold { occurred_at, .. }
            | ProductEvent::SaleReattributed { occurred_at, .. }
            | ProductEvent::ProductEnded { occurred_at, .. }
            | ProductEvent::ProductRelisted { occurred_at, .. } => *occurred_at,
        }
    }
}

impl Aggregate for Product {
    type Command = ProductCommand;
    type Event = ProductEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ProductEvent::ProductCreated(e) => {
                self.id = e.product_id;
                self.sku = e.sku.clone();
                self.title = e.title.clone();
                self.brand = e.brand.clone();
                self.model = e.model.clone();
                self.category = e.category.clone();
                self.media = e.media.clone();
                self.price = e.price;
                self.stock = e.stock;
                self.status = ProductStatus::Draft;
                self.created = true;
            }
            ProductEvent::ProductActivated { .. } => {
                self.status = ProductStatus::Active;
            }
            ProductEvent::ListingRequested { .. } => {}
            ProductEvent::PriceChanged { price, .. } => {
                self.price = *price;
            }
            ProductEvent::StockAdjusted { stock, .. } => {
                self.stock = *stock;
            }
            ProductEvent::ProductSold { sold_on, .. } => {
                self.status = ProductStatus::Sold;
                self.sold_on = *sold_on;
            }
            ProductEvent::SaleReattributed { platform, .. } => {
                self.sold_on = Some(*platform);
            }
            ProductEvent::ProductEnded { .. } => {
                self.status = ProductStatus::Ended;
            }
            ProductEvent::ProductRelisted { .. } => {
                self.status = ProductStatus::Active;
                self.sold_on = None;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if !self.created && !matches!(command, ProductCommand::CreateProduct(_)) {
            return Err(DomainError::not_found());
        }

        let product_id = self.id;
        match command {
            ProductCommand::CreateProduct(cmd) => self.handle_create(cmd),
            ProductCommand::ActivateProduct { occurred_at } => {
                match self.status {
                    ProductStatus::Draft => {}
                    ProductStatus::Active => {
                        return Err(DomainError::conflict("product is already active"));
                    }
                    ProductStatus::Sold | ProductStatus::Ended => {
                        return Err(DomainError::invariant(
                            "sold or ended products are relisted, not activated",
                        ));
                    }
                }
                Ok(vec![ProductEvent::ProductActivated {
                    product_id,
                    occurred_at: *occurred_at,
                }])
            }
            ProductCommand::RequestListing {
                platform,
                occurred_at,
            } => {
                self.ensure_status(ProductStatus::Active, "only active products can be listed")?;
                Ok(vec![ProductEvent::ListingRequested {
                    product_id,
                    platform: *platform,
                    draft: self.listing_draft(),
                    occurred_at: *occurred_at,
                }])
            }
            ProductCommand::ChangePrice { price, occurred_at } => {
                if price.is_zero() {
                    return Err(DomainError::validation("price must be positive"));
                }
                if *price == self.price {
                    return Ok(vec![]);
                }
                Ok(vec![ProductEvent::PriceChanged {
                    product_id,
                    previous: self.price,
                    price: *price,
                    occurred_at: *occurred_at,
                }])
            }
            ProductCommand::AdjustStock { delta, occurred_at } => {
                if *delta == 0 {
                    return Ok(vec![]);
                }
                let next = i64::from(self.stock) + delta;
                let stock = u32::try_from(next).map_err(|_| {
                    DomainError::invariant(format!(
                        "stock cannot become {next} (current {}, delta {delta})",
                        self.stock
                    ))
                })?;
                Ok(vec![ProductEvent::StockAdjusted {
                    product_id,
                    delta: *delta,
                    stock,
                    occurred_at: *occurred_at,
                }])
            }
            ProductCommand::MarkSold {
                sold_on,
                occurred_at,
            } => {
                if self.status == ProductStatus::Sold {
                    return Err(DomainError::conflict(format!(
                        "product already sold on {}",
                        self.sold_on.map(|p| p.as_str()).unwrap_or("an offline channel")
                    )));
                }
                self.ensure_status(ProductStatus::Active, "only active products can be sold")?;
                Ok(vec![ProductEvent::ProductSold {
                    product_id,
                    sold_on: *sold_on,
                    occurred_at: *occurred_at,
                }])
            }
            ProductCommand::ReattributeSale {
                platform,
                occurred_at,
            } => {
                self.ensure_status(ProductStatus::Sold, "only sold products can be re-attributed")?;
                if self.sold_on == Some(*platform) {
                    return Ok(vec![]);
                }
                Ok(vec![ProductEvent::SaleReattributed {
                    product_id,
                    previous: self.sold_on,
                    platform: *platform,
                    occurred_at: *occurred_at,
                }])
            }
            ProductCommand::EndProduct { occurred_at } => {
                self.ensure_status(ProductStatus::Active, "only active products can be ended")?;
                Ok(vec![ProductEvent::ProductEnded {
                    product_id,
                    occurred_at: *occurred_at,
                }])
            }
            ProductCommand::RelistProduct { occurred_at } => {
                if !matches!(self.status, ProductStatus::Ended | ProductStatus::Sold) {
                    return Err(DomainError::invariant(
                        "only ended or sold products can be relisted",
                    ));
                }
                Ok(vec![ProductEvent::ProductRelisted {
                    product_id,
                    occurred_at: *occurred_at,
                }])
            }
        }
    }
}

impl Product {
    fn ensure_status(&self, expected: ProductStatus, msg: &str) -> Result<(), DomainError> {
        if self.status != expected {
            return Err(DomainError::invariant(format!(
                "{msg} (status: {})",
                self.status.as_str()
            )));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateProduct) -> Result<Vec<ProductEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("product already exists"));
        }
        if cmd.product_id != self.id {
            return Err(DomainError::invariant("product_id mismatch"));
        }
        if cmd.title.trim().is_empty() {
            return Err(DomainError::validation("title cannot be empty"));
        }
        if cmd.sku.trim().is_empty() {
            return Err(DomainError::validation("SKU cannot be empty"));
        }
        if cmd.price.is_zero() {
            return Err(DomainError::validation("price must be positive"));
        }

        Ok(vec![ProductEvent::ProductCreated(ProductCreated {
            product_id: cmd.product_id,
            sku: cmd.sku.trim().to_string(),
            title: cmd.title.trim().to_string(),
            brand: cmd.brand.trim().to_string(),
            model: cmd.model.trim().to_string(),
            category: cmd.category.clone(),
            media: cmd.media.clone(),
            price: cmd.price,
            stock: cmd.stock,
            occurred_at: cmd.occurred_at,
        })])
    }
}
