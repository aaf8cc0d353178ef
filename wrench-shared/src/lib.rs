pub mod models;
pub mod money;
pub mod pii;

pub use money::Pence;
pub use pii::Masked;
