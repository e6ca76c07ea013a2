pub mod basket;
pub mod basket_line;
pub mod order;
pub mod order_line;
pub mod payment_event;
pub mod payment_processor_response;
pub mod payment_source;
pub mod refund;
pub mod refund_line;
pub mod sdn_check_failure;
pub mod sdn_fallback_record;

pub use basket::{BasketStatus, Entity as Basket};
pub use basket_line::Entity as BasketLine;
pub use order::{Entity as Order, OrderStatus};
pub use order_line::{Entity as OrderLine, OrderLineStatus};
pub use payment_event::{Entity as PaymentEvent, PaymentEventType};
pub use payment_processor_response::Entity as PaymentProcessorResponse;
pub use payment_source::Entity as PaymentSource;
pub use refund::{Entity as Refund, RefundStatus};
pub use refund_line::{Entity as RefundLine, RefundLineStatus};
pub use sdn_check_failure::Entity as SdnCheckFailure;
pub use sdn_fallback_record::Entity as SdnFallbackRecord;
