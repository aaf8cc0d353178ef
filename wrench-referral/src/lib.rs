pub mod code;
pub mod ledger;

pub use code::CodeGenerator;
pub use ledger::{
    BonusOutcome, CodeValidation, ReferralError, ReferralLedger, ReferralSummary, Registration, RegistrationOutcome,
};
