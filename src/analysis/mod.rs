//! Decision pipeline: premium/FX, reference prices, cost modelling, the
//! gate itself and its enrichments.

pub mod cost_model;
pub mod gate;
pub mod listing_type;
pub mod premium;
pub mod reference_price;
pub mod scenario;
pub mod supply;

pub use cost_model::{CostModel, CostResult};
pub use gate::{GateChecker, GateInput, GateResult};
pub use premium::{FxSource, PremiumCalculator};
pub use reference_price::{ReferencePrice, ReferencePriceFetcher};
