pub mod baskets;
pub mod checkout;
pub mod orders;
pub mod refunds;
pub mod sdn;

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::{config::AppConfig, events::EventSender, payment::PaymentAuditLog, payment::PaymentProcessorRegistry};

pub use baskets::BasketService;
pub use checkout::CheckoutService;
pub use orders::OrderService;
pub use refunds::RefundService;
pub use sdn::SdnService;

/// Every service the HTTP layer needs, wired to one database and event channel.
#[derive(Clone)]
pub struct AppServices {
    pub baskets: BasketService,
    pub orders: OrderService,
    pub checkout: CheckoutService,
    pub refunds: RefundService,
    pub sdn: SdnService,
    pub audit: PaymentAuditLog,
    pub registry: Arc<PaymentProcessorRegistry>,
}

impl AppServices {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
        registry: Arc<PaymentProcessorRegistry>,
    ) -> Self {
        let sdn = SdnService::new(db.clone(), event_sender.clone(), config.clone());
        let baskets = BasketService::new(db.clone(), event_sender.clone(), config.clone());
        let orders = OrderService::new(db.clone(), config.clone());
        let audit = PaymentAuditLog::new(db.clone());
        let checkout = CheckoutService::new(
            config,
            event_sender.clone(),
            baskets.clone(),
            orders.clone(),
            sdn.clone(),
            registry.clone(),
            audit.clone(),
        );
        let refunds = RefundService::new(db, event_sender, orders.clone(), registry.clone());
        Self {
            baskets,
            orders,
            checkout,
            refunds,
            sdn,
            audit,
            registry,
        }
    }
}
