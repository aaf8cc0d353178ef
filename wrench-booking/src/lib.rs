pub mod engine;
pub mod gateway;
pub mod intent;
pub mod manager;

pub use engine::{Collaborators, ReconcileOutcome, Reconciler};
pub use gateway::{HttpPaymentGateway, StaticGateway};
pub use intent::{DirectBookingRequest, ReconciliationIntent};
pub use manager::{BookingManager, TransitionError};
